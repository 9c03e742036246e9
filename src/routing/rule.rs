//! `google.api.http` rule types and descriptors.
//!
//! # Responsibilities
//! - Typed `HttpRule` / `CustomHttpPattern` messages
//! - Build the `google/api/{http,annotations,httpbody}.proto` descriptors
//! - Read the `google.api.http` method option from a descriptor
//!
//! # Design Decisions
//! - Descriptors are built in code so the crate has no build script
//! - Options are read through the method's own pool, so the extension
//!   resolves against whatever `google.api` files that pool carries

use prost::Message;
use prost_reflect::{DescriptorPool, MethodDescriptor, Value};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileOptions, OneofDescriptorProto,
};

/// Field number of the `google.api.http` extension on `MethodOptions`.
pub const HTTP_EXTENSION_NUMBER: u32 = 72295728;

/// Full name of the `google.api.http` extension.
pub const HTTP_EXTENSION: &str = "google.api.http";

/// Full name of the raw HTTP body message.
pub const HTTP_BODY: &str = "google.api.HttpBody";

/// Full name of the status message used for error bodies.
pub const RPC_STATUS: &str = "google.rpc.Status";

/// Maps an RPC method to one or more HTTP REST endpoints.
#[derive(Clone, PartialEq, Message)]
pub struct HttpRule {
    /// Method full name this rule applies to (service config only).
    #[prost(string, tag = "1")]
    pub selector: String,
    /// Request field mapped to the HTTP body, `*` for the whole message.
    #[prost(string, tag = "7")]
    pub body: String,
    /// Response field mapped to the HTTP body, empty for the whole message.
    #[prost(string, tag = "12")]
    pub response_body: String,
    /// Extra bindings for the same method. May not nest.
    #[prost(message, repeated, tag = "11")]
    pub additional_bindings: Vec<HttpRule>,
    #[prost(oneof = "Pattern", tags = "2, 3, 4, 5, 6, 8")]
    pub pattern: Option<Pattern>,
}

/// Verb and template of an [`HttpRule`].
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Pattern {
    #[prost(string, tag = "2")]
    Get(String),
    #[prost(string, tag = "3")]
    Put(String),
    #[prost(string, tag = "4")]
    Post(String),
    #[prost(string, tag = "5")]
    Delete(String),
    #[prost(string, tag = "6")]
    Patch(String),
    #[prost(message, tag = "8")]
    Custom(CustomHttpPattern),
}

/// Custom verb pattern. A kind of `*` matches any verb.
#[derive(Clone, PartialEq, Message)]
pub struct CustomHttpPattern {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

impl HttpRule {
    /// Rule bound to `template` with the given verb.
    pub fn new(verb: &str, template: impl Into<String>) -> Self {
        let template = template.into();
        let pattern = match verb {
            "GET" => Pattern::Get(template),
            "PUT" => Pattern::Put(template),
            "POST" => Pattern::Post(template),
            "DELETE" => Pattern::Delete(template),
            "PATCH" => Pattern::Patch(template),
            kind => Pattern::Custom(CustomHttpPattern {
                kind: kind.to_string(),
                path: template,
            }),
        };
        Self {
            pattern: Some(pattern),
            ..Default::default()
        }
    }

    /// Set the body field path.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the response body field path.
    pub fn with_response_body(mut self, response_body: impl Into<String>) -> Self {
        self.response_body = response_body.into();
        self
    }

    /// Append an additional binding.
    pub fn with_binding(mut self, binding: HttpRule) -> Self {
        self.additional_bindings.push(binding);
        self
    }

    /// HTTP verb and path template, `None` if no pattern is set.
    pub fn verb_and_template(&self) -> Option<(&str, &str)> {
        match self.pattern.as_ref()? {
            Pattern::Get(t) => Some(("GET", t)),
            Pattern::Put(t) => Some(("PUT", t)),
            Pattern::Post(t) => Some(("POST", t)),
            Pattern::Delete(t) => Some(("DELETE", t)),
            Pattern::Patch(t) => Some(("PATCH", t)),
            Pattern::Custom(c) => Some((c.kind.as_str(), c.path.as_str())),
        }
    }

    /// The implicit rule every method gets: any verb on the gRPC path.
    pub fn implicit(method_name: &str) -> Self {
        Self::new("*", method_name).with_body("*")
    }
}

impl std::fmt::Display for HttpRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.verb_and_template() {
            Some((verb, template)) => write!(f, "{} {:?}", verb.to_lowercase(), template)?,
            None => write!(f, "<no pattern>")?,
        }
        if !self.body.is_empty() {
            write!(f, " body:{:?}", self.body)?;
        }
        if !self.response_body.is_empty() {
            write!(f, " response_body:{:?}", self.response_body)?;
        }
        Ok(())
    }
}

/// Read the `google.api.http` annotation of a method, if any.
pub fn http_rule(method: &MethodDescriptor) -> Option<HttpRule> {
    let extension = method.parent_pool().get_extension_by_name(HTTP_EXTENSION)?;
    let options = method.options();
    if !options.has_extension(&extension) {
        return None;
    }
    match options.get_extension(&extension).as_ref() {
        Value::Message(msg) => msg.transcode_to::<HttpRule>().ok(),
        _ => None,
    }
}

/// Descriptor pool with the well-known types and the `google.api` files.
pub fn base_pool() -> Result<DescriptorPool, prost_reflect::DescriptorError> {
    let mut pool = DescriptorPool::global();
    pool.add_file_descriptor_protos(google_api_files())?;
    Ok(pool)
}

/// Names of the `google` files the resolver knows without asking.
pub const GOOGLE_API_FILES: [&str; 4] = [
    "google/api/http.proto",
    "google/api/annotations.proto",
    "google/api/httpbody.proto",
    "google/rpc/status.proto",
];

/// `google/api/{http,annotations,httpbody}.proto` and `google/rpc/status.proto`.
pub fn google_api_files() -> Vec<FileDescriptorProto> {
    let http_rule = DescriptorProto {
        name: Some("HttpRule".into()),
        field: vec![
            field("selector", 1, Type::String, Label::Optional, None),
            oneof_field("get", 2, Type::String, None),
            oneof_field("put", 3, Type::String, None),
            oneof_field("post", 4, Type::String, None),
            oneof_field("delete", 5, Type::String, None),
            oneof_field("patch", 6, Type::String, None),
            field("body", 7, Type::String, Label::Optional, None),
            oneof_field("custom", 8, Type::Message, Some(".google.api.CustomHttpPattern")),
            field(
                "additional_bindings",
                11,
                Type::Message,
                Label::Repeated,
                Some(".google.api.HttpRule"),
            ),
            field("response_body", 12, Type::String, Label::Optional, None),
        ],
        oneof_decl: vec![OneofDescriptorProto {
            name: Some("pattern".into()),
            options: None,
        }],
        ..Default::default()
    };
    let http = FileDescriptorProto {
        name: Some(GOOGLE_API_FILES[0].into()),
        package: Some("google.api".into()),
        message_type: vec![
            DescriptorProto {
                name: Some("Http".into()),
                field: vec![
                    field("rules", 1, Type::Message, Label::Repeated, Some(".google.api.HttpRule")),
                    field(
                        "fully_decode_reserved_expansion",
                        2,
                        Type::Bool,
                        Label::Optional,
                        None,
                    ),
                ],
                ..Default::default()
            },
            http_rule,
            DescriptorProto {
                name: Some("CustomHttpPattern".into()),
                field: vec![
                    field("kind", 1, Type::String, Label::Optional, None),
                    field("path", 2, Type::String, Label::Optional, None),
                ],
                ..Default::default()
            },
        ],
        options: Some(go_package("google.golang.org/genproto/googleapis/api/annotations")),
        syntax: Some("proto3".into()),
        ..Default::default()
    };

    let mut extension = field("http", HTTP_EXTENSION_NUMBER as i32, Type::Message, Label::Optional, Some(".google.api.HttpRule"));
    extension.extendee = Some(".google.protobuf.MethodOptions".into());
    let annotations = FileDescriptorProto {
        name: Some(GOOGLE_API_FILES[1].into()),
        package: Some("google.api".into()),
        dependency: vec![
            GOOGLE_API_FILES[0].into(),
            "google/protobuf/descriptor.proto".into(),
        ],
        extension: vec![extension],
        options: Some(go_package("google.golang.org/genproto/googleapis/api/annotations")),
        syntax: Some("proto3".into()),
        ..Default::default()
    };

    let httpbody = FileDescriptorProto {
        name: Some(GOOGLE_API_FILES[2].into()),
        package: Some("google.api".into()),
        dependency: vec!["google/protobuf/any.proto".into()],
        message_type: vec![DescriptorProto {
            name: Some("HttpBody".into()),
            field: vec![
                field("content_type", 1, Type::String, Label::Optional, None),
                field("data", 2, Type::Bytes, Label::Optional, None),
                field(
                    "extensions",
                    3,
                    Type::Message,
                    Label::Repeated,
                    Some(".google.protobuf.Any"),
                ),
            ],
            ..Default::default()
        }],
        options: Some(go_package("google.golang.org/genproto/googleapis/api/httpbody")),
        syntax: Some("proto3".into()),
        ..Default::default()
    };

    let status = FileDescriptorProto {
        name: Some(GOOGLE_API_FILES[3].into()),
        package: Some("google.rpc".into()),
        dependency: vec!["google/protobuf/any.proto".into()],
        message_type: vec![DescriptorProto {
            name: Some("Status".into()),
            field: vec![
                field("code", 1, Type::Int32, Label::Optional, None),
                field("message", 2, Type::String, Label::Optional, None),
                field(
                    "details",
                    3,
                    Type::Message,
                    Label::Repeated,
                    Some(".google.protobuf.Any"),
                ),
            ],
            ..Default::default()
        }],
        options: Some(go_package("google.golang.org/genproto/googleapis/rpc/status")),
        syntax: Some("proto3".into()),
        ..Default::default()
    };

    vec![http, annotations, httpbody, status]
}

fn go_package(pkg: &str) -> FileOptions {
    FileOptions {
        go_package: Some(pkg.into()),
        ..Default::default()
    }
}

pub(crate) fn field(
    name: &str,
    number: i32,
    ty: Type,
    label: Label,
    type_name: Option<&str>,
) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.into()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(ty as i32),
        type_name: type_name.map(Into::into),
        json_name: Some(json_name(name)),
        ..Default::default()
    }
}

pub(crate) fn oneof_field(name: &str, number: i32, ty: Type, type_name: Option<&str>) -> FieldDescriptorProto {
    FieldDescriptorProto {
        oneof_index: Some(0),
        ..field(name, number, ty, Label::Optional, type_name)
    }
}

/// protoc's lowerCamelCase json name.
pub(crate) fn json_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
