//! Parameter codec.
//!
//! # Responsibilities
//! - Resolve dotted field paths against message descriptors
//! - Decode raw path/query strings into typed field values
//! - Apply captured params to a request message
//!
//! # Design Decisions
//! - Scalars go through JSON scalar parsing so `1`, `"1"`, `true` behave
//!   the same as they do in a JSON body
//! - Message-typed params are limited to well-known types that have a
//!   string JSON form
//! - For singular fields the first applied param wins, which gives path
//!   captures priority over query parameters. List fields accumulate.

use std::collections::HashSet;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, Value};
use serde::de::DeserializeOwned;
use tonic::Status;

/// Resolved chain of fields from the request message to a target field.
pub type FieldPath = Vec<FieldDescriptor>;

/// Well-known message types accepted as a single param value.
const WELL_KNOWN_PARAMS: [&str; 12] = [
    "google.protobuf.Timestamp",
    "google.protobuf.Duration",
    "google.protobuf.FieldMask",
    "google.protobuf.BoolValue",
    "google.protobuf.Int32Value",
    "google.protobuf.Int64Value",
    "google.protobuf.UInt32Value",
    "google.protobuf.UInt64Value",
    "google.protobuf.FloatValue",
    "google.protobuf.DoubleValue",
    "google.protobuf.StringValue",
    "google.protobuf.BytesValue",
];

/// Well-known types whose JSON form is a string literal.
const QUOTED_WELL_KNOWN: [&str; 5] = [
    "google.protobuf.Timestamp",
    "google.protobuf.Duration",
    "google.protobuf.FieldMask",
    "google.protobuf.StringValue",
    "google.protobuf.BytesValue",
];

/// A field path that did not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedField {
    pub path: String,
    pub message: String,
}

/// Resolve `names` field by field, by JSON name first and then declared name.
pub fn resolve_field_path<S: AsRef<str>>(
    desc: &MessageDescriptor,
    names: &[S],
) -> Result<FieldPath, UnresolvedField> {
    let unresolved = || UnresolvedField {
        path: names.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("."),
        message: desc.full_name().to_string(),
    };

    let mut current = Some(desc.clone());
    let mut path = Vec::with_capacity(names.len());
    for name in names {
        let msg = current.take().ok_or_else(unresolved)?;
        let name = name.as_ref();
        let field = msg
            .get_field_by_json_name(name)
            .or_else(|| msg.get_field_by_name(name))
            .ok_or_else(unresolved)?;
        if !field.is_list() && !field.is_map() {
            if let Kind::Message(next) = field.kind() {
                current = Some(next);
            }
        }
        path.push(field);
    }
    Ok(path)
}

/// One captured value bound to a field path.
#[derive(Debug, Clone)]
pub struct Param {
    pub path: FieldPath,
    pub value: Value,
}

/// Ordered params produced by matching a request.
#[derive(Debug, Clone, Default)]
pub struct Params(Vec<Param>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: FieldPath, value: Value) {
        self.0.push(Param { path, value });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

    /// Decode `raw` for the terminal field of `path` and append it.
    pub fn push_raw(&mut self, path: FieldPath, raw: &str) -> Result<(), Status> {
        let field = path
            .last()
            .ok_or_else(|| Status::internal("empty field path"))?;
        let value = parse_param(field, raw)?;
        self.push(path, value);
        Ok(())
    }

    /// Apply every param to `msg`, creating intermediate messages as needed.
    pub fn set(&self, msg: &mut DynamicMessage) -> Result<(), Status> {
        let mut seen: HashSet<Vec<u32>> = HashSet::new();
        for param in &self.0 {
            let Some((last, parents)) = param.path.split_last() else {
                continue;
            };

            let cur = message_at_mut(msg, parents)?;

            if last.is_list() {
                match cur.get_field_mut(last) {
                    Value::List(items) => items.push(param.value.clone()),
                    _ => {
                        return Err(Status::internal(format!(
                            "field {} is not a list",
                            last.full_name()
                        )))
                    }
                }
                continue;
            }

            let key = param.path.iter().map(FieldDescriptor::number).collect();
            if !seen.insert(key) {
                continue;
            }
            cur.try_set_field(last, param.value.clone())
                .map_err(|err| Status::invalid_argument(err.to_string()))?;
        }
        Ok(())
    }
}

/// The sub-message of `msg` at `path`, created if unset. An empty path is
/// `msg` itself.
pub fn message_at_mut<'a>(
    msg: &'a mut DynamicMessage,
    path: &[FieldDescriptor],
) -> Result<&'a mut DynamicMessage, Status> {
    let mut cur = msg;
    for field in path {
        cur = match cur.get_field_mut(field) {
            Value::Message(next) => next,
            _ => {
                return Err(Status::internal(format!(
                    "field {} is not a message",
                    field.full_name()
                )))
            }
        };
    }
    Ok(cur)
}

/// Flatten `key=value` query pairs into params for `desc`.
///
/// Keys are dotted field paths. Unknown keys are ignored.
pub fn parse_query(desc: &MessageDescriptor, query: &str, params: &mut Params) -> Result<(), Status> {
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let names: Vec<&str> = key.split('.').collect();
        let Ok(path) = resolve_field_path(desc, &names) else {
            tracing::trace!(key = %key, "Ignoring unknown query parameter");
            continue;
        };
        let intermediate_ok = path[..path.len() - 1]
            .iter()
            .all(|f| !f.is_list() && !f.is_map() && matches!(f.kind(), Kind::Message(_)));
        let Some(last) = path.last() else { continue };
        if !intermediate_ok || last.is_map() {
            continue;
        }
        params.push_raw(path, &value)?;
    }
    Ok(())
}

/// Decode a raw string into a value for `field`.
pub fn parse_param(field: &FieldDescriptor, raw: &str) -> Result<Value, Status> {
    let invalid = |err: &dyn std::fmt::Display| {
        Status::invalid_argument(format!(
            "invalid value {raw:?} for field {}: {err}",
            field.name()
        ))
    };

    match field.kind() {
        Kind::Bool => json_scalar(raw).map(Value::Bool).map_err(|e| invalid(&e)),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            json_scalar(raw).map(Value::I32).map_err(|e| invalid(&e))
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            json_scalar(raw).map(Value::I64).map_err(|e| invalid(&e))
        }
        Kind::Uint32 | Kind::Fixed32 => json_scalar(raw).map(Value::U32).map_err(|e| invalid(&e)),
        Kind::Uint64 | Kind::Fixed64 => json_scalar(raw).map(Value::U64).map_err(|e| invalid(&e)),
        Kind::Float => json_scalar(raw).map(Value::F32).map_err(|e| invalid(&e)),
        Kind::Double => json_scalar(raw).map(Value::F64).map_err(|e| invalid(&e)),
        Kind::String => Ok(Value::String(raw.to_string())),
        Kind::Bytes => decode_base64(raw)
            .map(|b| Value::Bytes(b.into()))
            .map_err(|e| invalid(&e)),
        Kind::Enum(desc) => {
            if desc.full_name() == "google.protobuf.NullValue" && raw == "null" {
                return Ok(Value::EnumNumber(0));
            }
            if let Ok(number) = raw.parse::<i32>() {
                return Ok(Value::EnumNumber(number));
            }
            desc.get_value_by_name(raw)
                .map(|v| Value::EnumNumber(v.number()))
                .ok_or_else(|| invalid(&format_args!("unknown enum value for {}", desc.full_name())))
        }
        Kind::Message(desc) => {
            if !WELL_KNOWN_PARAMS.contains(&desc.full_name()) {
                return Err(invalid(&format_args!(
                    "unsupported message type {}",
                    desc.full_name()
                )));
            }
            parse_well_known(&desc, raw)
                .map(Value::Message)
                .map_err(|e| invalid(&e))
        }
    }
}

fn json_scalar<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(raw);
    serde_json::from_str(unquoted)
}

fn decode_base64(raw: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let url = raw.contains(['-', '_']);
    let padded = raw.len() % 4 == 0;
    let engine = match (url, padded) {
        (false, true) => &STANDARD,
        (false, false) => &STANDARD_NO_PAD,
        (true, true) => &URL_SAFE,
        (true, false) => &URL_SAFE_NO_PAD,
    };
    engine.decode(raw)
}

fn parse_well_known(desc: &MessageDescriptor, raw: &str) -> Result<DynamicMessage, serde_json::Error> {
    let already_quoted = raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"');
    let json = if QUOTED_WELL_KNOWN.contains(&desc.full_name()) && !already_quoted {
        serde_json::to_string(raw)?
    } else {
        raw.to_string()
    };
    let mut de = serde_json::Deserializer::from_str(&json);
    let msg = DynamicMessage::deserialize(desc.clone(), &mut de)?;
    de.end()?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testpb;

    fn field_path(msg: &str, path: &str) -> FieldPath {
        let desc = testpb::pool().get_message_by_name(msg).unwrap();
        let names: Vec<&str> = path.split('.').collect();
        resolve_field_path(&desc, &names).unwrap()
    }

    #[test]
    fn test_resolve_json_then_declared_name() {
        let by_json = field_path("gateway.testpb.Message", "messageId");
        let by_name = field_path("gateway.testpb.Message", "message_id");
        assert_eq!(by_json, by_name);

        let nested = field_path("gateway.testpb.Message", "sub.subfield");
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[1].name(), "subfield");

        let desc = testpb::pool()
            .get_message_by_name("gateway.testpb.Message")
            .unwrap();
        let err = resolve_field_path(&desc, &["text", "missing"]).unwrap_err();
        assert_eq!(err.path, "text.missing");
    }

    #[test]
    fn test_parse_scalars() {
        let desc = testpb::pool()
            .get_message_by_name("gateway.testpb.Scalars")
            .unwrap();
        let get = |name: &str| desc.get_field_by_name(name).unwrap();

        assert_eq!(parse_param(&get("bool_value"), "true").unwrap(), Value::Bool(true));
        assert_eq!(parse_param(&get("int32_value"), "-3").unwrap(), Value::I32(-3));
        assert_eq!(parse_param(&get("int64_value"), "\"64\"").unwrap(), Value::I64(64));
        assert_eq!(parse_param(&get("uint32_value"), "7").unwrap(), Value::U32(7));
        assert_eq!(parse_param(&get("double_value"), "2.5").unwrap(), Value::F64(2.5));
        assert_eq!(
            parse_param(&get("string_value"), "a b").unwrap(),
            Value::String("a b".into())
        );
        assert!(parse_param(&get("int32_value"), "nope").is_err());
    }

    #[test]
    fn test_parse_bytes_alphabets() {
        let desc = testpb::pool()
            .get_message_by_name("gateway.testpb.Scalars")
            .unwrap();
        let bytes = desc.get_field_by_name("bytes_value").unwrap();
        let hello = Value::Bytes(b"hello".to_vec().into());
        assert_eq!(parse_param(&bytes, "aGVsbG8").unwrap(), hello);
        assert_eq!(parse_param(&bytes, "aGVsbG8=").unwrap(), hello);
        let odd = Value::Bytes(vec![0xfb, 0xff].into());
        assert_eq!(parse_param(&bytes, "-_8").unwrap(), odd);
        assert_eq!(parse_param(&bytes, "+/8=").unwrap(), odd);
    }

    #[test]
    fn test_parse_enum_and_well_known() {
        let desc = testpb::pool()
            .get_message_by_name("gateway.testpb.Complex")
            .unwrap();
        let get = |name: &str| desc.get_field_by_name(name).unwrap();

        assert_eq!(parse_param(&get("enum_value"), "ENUM_VALUE_TWO").unwrap(), Value::EnumNumber(2));
        assert_eq!(parse_param(&get("enum_value"), "1").unwrap(), Value::EnumNumber(1));
        assert!(parse_param(&get("enum_value"), "ENUM_NOPE").is_err());

        let ts = parse_param(&get("timestamp"), "2017-01-15T01:30:15.01Z").unwrap();
        let ts = ts.as_message().unwrap();
        assert_eq!(ts.get_field_by_name("seconds").unwrap().as_i64(), Some(1484443815));

        let d = parse_param(&get("duration"), "1.5s").unwrap();
        assert_eq!(
            d.as_message().unwrap().get_field_by_name("nanos").unwrap().as_i32(),
            Some(500_000_000)
        );

        let wrapped = parse_param(&get("string_wrapper"), "hi").unwrap();
        assert_eq!(
            wrapped.as_message().unwrap().get_field_by_name("value").unwrap().as_str(),
            Some("hi")
        );

        assert!(parse_param(&get("nested"), "{}").is_err());
    }

    #[test]
    fn test_set_creates_nested_and_first_wins() {
        let desc = testpb::pool()
            .get_message_by_name("gateway.testpb.Message")
            .unwrap();
        let mut params = Params::new();
        params.push_raw(field_path("gateway.testpb.Message", "message_id"), "path").unwrap();
        params.push_raw(field_path("gateway.testpb.Message", "message_id"), "query").unwrap();
        params.push_raw(field_path("gateway.testpb.Message", "sub.subfield"), "deep").unwrap();

        let mut msg = DynamicMessage::new(desc);
        params.set(&mut msg).unwrap();
        assert_eq!(msg.get_field_by_name("message_id").unwrap().as_str(), Some("path"));
        let sub = msg.get_field_by_name("sub").unwrap();
        assert_eq!(
            sub.as_message().unwrap().get_field_by_name("subfield").unwrap().as_str(),
            Some("deep")
        );
    }

    #[test]
    fn test_query_lists_accumulate() {
        let desc = testpb::pool()
            .get_message_by_name("gateway.testpb.Complex")
            .unwrap();
        let mut params = Params::new();
        parse_query(
            &desc,
            "int32_list=1&int32_list=2&stringList=a&unknown=x&nested.string_value=n",
            &mut params,
        )
        .unwrap();
        assert_eq!(params.len(), 4);

        let mut msg = DynamicMessage::new(desc);
        params.set(&mut msg).unwrap();
        assert_eq!(
            msg.get_field_by_name("int32_list").unwrap().as_list().unwrap(),
            &[Value::I32(1), Value::I32(2)]
        );
        assert_eq!(
            msg.get_field_by_name("string_list").unwrap().as_list().unwrap(),
            &[Value::String("a".into())]
        );
    }
}
