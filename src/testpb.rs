//! Descriptor fixtures for tests.
//!
//! A small `gateway.testpb` package with a library service, a messaging
//! service and a few messages covering the parameter kinds. Methods carry
//! `google.api.http` annotations encoded into the method options, exactly
//! as `protoc` would emit them.

use std::collections::HashMap;
use std::sync::OnceLock;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, Value};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FileDescriptorProto,
    MethodDescriptorProto, ServiceDescriptorProto,
};

use crate::routing::rule::{base_pool, field, HttpRule, HTTP_EXTENSION};

pub const FILE: &str = "gateway/testpb/library.proto";
pub const LIBRARY: &str = "gateway.testpb.Library";
pub const MESSAGING: &str = "gateway.testpb.Messaging";

pub const GET_SHELF: &str = "gateway.testpb.Library.GetShelf";
pub const GET_BOOK: &str = "gateway.testpb.Library.GetBook";
pub const CREATE_BOOK: &str = "gateway.testpb.Library.CreateBook";
pub const UPDATE_BOOK: &str = "gateway.testpb.Library.UpdateBook";
pub const WATCH_BOOKS: &str = "gateway.testpb.Library.WatchBooks";
pub const IMPORT_BOOKS: &str = "gateway.testpb.Library.ImportBooks";
pub const CHAT: &str = "gateway.testpb.Library.Chat";
pub const UPLOAD_FILE: &str = "gateway.testpb.Library.UploadFile";
pub const DOWNLOAD_FILE: &str = "gateway.testpb.Library.DownloadFile";
pub const ECHO: &str = "gateway.testpb.Messaging.Echo";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

static POOL: OnceLock<DescriptorPool> = OnceLock::new();

/// Pool with the well-known types, the `google.api` files and `testpb`.
///
/// A pool that fails to build is logged and left empty, so lookups in the
/// calling test fail loudly.
pub fn pool() -> DescriptorPool {
    POOL.get_or_init(|| {
        build().unwrap_or_else(|err| {
            tracing::error!(error = %err, "testpb descriptors failed to build");
            DescriptorPool::new()
        })
    })
    .clone()
}

/// The annotated `library.proto` as `protoc` would serialize it.
pub fn file_bytes() -> Vec<u8> {
    pool()
        .get_file_by_name(FILE)
        .map(|file| file.encode_to_vec())
        .unwrap_or_default()
}

/// Routes carried by the fixture's method options.
pub fn http_rules() -> HashMap<&'static str, HttpRule> {
    HashMap::from([
        (GET_SHELF, HttpRule::new("GET", "/v1/{name=shelves/*}")),
        (GET_BOOK, HttpRule::new("GET", "/v1/{name=shelves/*/books/*}")),
        (
            CREATE_BOOK,
            HttpRule::new("POST", "/v1/{parent=shelves/*}/books").with_body("book"),
        ),
        (
            UPDATE_BOOK,
            HttpRule::new("PATCH", "/v1/{book.name=shelves/*/books/*}").with_body("book"),
        ),
        (
            WATCH_BOOKS,
            HttpRule::new("GET", "/v1/{parent=shelves/*}/books:watch").with_binding(
                HttpRule::new("WEBSOCKET", "/v1/{parent=shelves/*}/books:watch"),
            ),
        ),
        (
            IMPORT_BOOKS,
            HttpRule::new("POST", "/v1/books:import").with_body("*"),
        ),
        (
            CHAT,
            HttpRule::new("WEBSOCKET", "/v1/{room=rooms/*}:chat").with_body("*"),
        ),
        (
            UPLOAD_FILE,
            HttpRule::new("POST", "/files/{filename=**}").with_body("file"),
        ),
        (DOWNLOAD_FILE, HttpRule::new("GET", "/files/{filename=**}")),
        (
            ECHO,
            HttpRule::new("GET", "/v1/messages/{message_id}")
                .with_binding(HttpRule::new("POST", "/v1/messages").with_body("*")),
        ),
    ])
}

fn build() -> Result<DescriptorPool, BoxError> {
    let mut pool = base_pool()?;
    let file_desc = pool
        .get_message_by_name("google.protobuf.FileDescriptorProto")
        .ok_or("missing FileDescriptorProto")?;
    let rule_desc = pool
        .get_message_by_name("google.api.HttpRule")
        .ok_or("missing google.api.HttpRule")?;
    let extension = pool
        .get_extension_by_name(HTTP_EXTENSION)
        .ok_or("missing google.api.http")?;

    let rules = http_rules();
    let mut file = DynamicMessage::decode(file_desc, library_file().encode_to_vec().as_slice())?;
    let services = file
        .get_field_by_name_mut("service")
        .and_then(Value::as_list_mut)
        .ok_or("missing services")?;
    for service in services.iter_mut().filter_map(Value::as_message_mut) {
        let service_name = service
            .get_field_by_name("name")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let Some(methods) = service
            .get_field_by_name_mut("method")
            .and_then(Value::as_list_mut)
        else {
            continue;
        };
        for method in methods.iter_mut().filter_map(Value::as_message_mut) {
            let method_name = method
                .get_field_by_name("name")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let full_name = format!("gateway.testpb.{service_name}.{method_name}");
            let Some(rule) = rules.get(full_name.as_str()) else {
                continue;
            };
            let mut annotation = DynamicMessage::new(rule_desc.clone());
            annotation.transcode_from(rule)?;
            if let Some(options) = method
                .get_field_by_name_mut("options")
                .and_then(Value::as_message_mut)
            {
                options.set_extension(&extension, Value::Message(annotation));
            }
        }
    }

    pool.decode_file_descriptor_proto(file.encode_to_vec().as_slice())?;
    Ok(pool)
}

fn message(name: &str, fields: Vec<prost_types::FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.into()),
        field: fields,
        ..Default::default()
    }
}

fn string(name: &str, number: i32) -> prost_types::FieldDescriptorProto {
    field(name, number, Type::String, Label::Optional, None)
}

fn msg_field(name: &str, number: i32, type_name: &str) -> prost_types::FieldDescriptorProto {
    field(name, number, Type::Message, Label::Optional, Some(type_name))
}

fn rpc(name: &str, input: &str, output: &str, client: bool, server: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.into()),
        input_type: Some(input.into()),
        output_type: Some(output.into()),
        client_streaming: Some(client),
        server_streaming: Some(server),
        ..Default::default()
    }
}

fn library_file() -> FileDescriptorProto {
    let messages = vec![
        message(
            "Book",
            vec![
                string("name", 1),
                string("title", 2),
                string("author", 3),
                field("pages", 4, Type::Int32, Label::Optional, None),
            ],
        ),
        message("Shelf", vec![string("name", 1), string("theme", 2)]),
        message("GetShelfRequest", vec![string("name", 1)]),
        message("GetBookRequest", vec![string("name", 1)]),
        message(
            "CreateBookRequest",
            vec![
                string("parent", 1),
                msg_field("book", 2, ".gateway.testpb.Book"),
                string("book_id", 3),
            ],
        ),
        message(
            "UpdateBookRequest",
            vec![
                msg_field("book", 1, ".gateway.testpb.Book"),
                msg_field("update_mask", 2, ".google.protobuf.FieldMask"),
            ],
        ),
        message(
            "WatchBooksRequest",
            vec![
                string("parent", 1),
                field("limit", 2, Type::Int32, Label::Optional, None),
            ],
        ),
        message(
            "ImportBooksResponse",
            vec![
                field("count", 1, Type::Int32, Label::Optional, None),
                field("names", 2, Type::String, Label::Repeated, None),
            ],
        ),
        message(
            "ChatMessage",
            vec![string("room", 1), string("text", 2), string("from", 3)],
        ),
        message(
            "UploadFileRequest",
            vec![
                string("filename", 1),
                msg_field("file", 2, ".google.api.HttpBody"),
            ],
        ),
        message("DownloadFileRequest", vec![string("filename", 1)]),
        message("Sub", vec![string("subfield", 1)]),
        message(
            "Message",
            vec![
                string("message_id", 1),
                string("text", 2),
                string("user_id", 3),
                msg_field("sub", 4, ".gateway.testpb.Sub"),
            ],
        ),
        message(
            "Scalars",
            vec![
                field("bool_value", 1, Type::Bool, Label::Optional, None),
                field("int32_value", 2, Type::Int32, Label::Optional, None),
                field("int64_value", 3, Type::Int64, Label::Optional, None),
                field("uint32_value", 4, Type::Uint32, Label::Optional, None),
                field("uint64_value", 5, Type::Uint64, Label::Optional, None),
                field("float_value", 6, Type::Float, Label::Optional, None),
                field("double_value", 7, Type::Double, Label::Optional, None),
                string("string_value", 8),
                field("bytes_value", 9, Type::Bytes, Label::Optional, None),
            ],
        ),
        message(
            "Complex",
            vec![
                field(
                    "enum_value",
                    1,
                    Type::Enum,
                    Label::Optional,
                    Some(".gateway.testpb.Enum"),
                ),
                msg_field("timestamp", 2, ".google.protobuf.Timestamp"),
                msg_field("duration", 3, ".google.protobuf.Duration"),
                msg_field("string_wrapper", 4, ".google.protobuf.StringValue"),
                msg_field("nested", 5, ".gateway.testpb.Scalars"),
                field("int32_list", 6, Type::Int32, Label::Repeated, None),
                field("string_list", 7, Type::String, Label::Repeated, None),
                field("double_value", 8, Type::Double, Label::Optional, None),
            ],
        ),
    ];

    let enum_value = |name: &str, number: i32| EnumValueDescriptorProto {
        name: Some(name.into()),
        number: Some(number),
        options: None,
    };

    let library = ServiceDescriptorProto {
        name: Some("Library".into()),
        method: vec![
            rpc("GetShelf", ".gateway.testpb.GetShelfRequest", ".gateway.testpb.Shelf", false, false),
            rpc("GetBook", ".gateway.testpb.GetBookRequest", ".gateway.testpb.Book", false, false),
            rpc("CreateBook", ".gateway.testpb.CreateBookRequest", ".gateway.testpb.Book", false, false),
            rpc("UpdateBook", ".gateway.testpb.UpdateBookRequest", ".gateway.testpb.Book", false, false),
            rpc("WatchBooks", ".gateway.testpb.WatchBooksRequest", ".gateway.testpb.Book", false, true),
            rpc("ImportBooks", ".gateway.testpb.Book", ".gateway.testpb.ImportBooksResponse", true, false),
            rpc("Chat", ".gateway.testpb.ChatMessage", ".gateway.testpb.ChatMessage", true, true),
            rpc("UploadFile", ".gateway.testpb.UploadFileRequest", ".google.protobuf.Empty", false, false),
            rpc("DownloadFile", ".gateway.testpb.DownloadFileRequest", ".google.api.HttpBody", false, false),
        ],
        options: None,
    };
    let messaging = ServiceDescriptorProto {
        name: Some("Messaging".into()),
        method: vec![rpc(
            "Echo",
            ".gateway.testpb.Message",
            ".gateway.testpb.Message",
            false,
            false,
        )],
        options: None,
    };

    FileDescriptorProto {
        name: Some(FILE.into()),
        package: Some("gateway.testpb".into()),
        dependency: vec![
            "google/api/annotations.proto".into(),
            "google/api/httpbody.proto".into(),
            "google/protobuf/duration.proto".into(),
            "google/protobuf/empty.proto".into(),
            "google/protobuf/field_mask.proto".into(),
            "google/protobuf/timestamp.proto".into(),
            "google/protobuf/wrappers.proto".into(),
        ],
        message_type: messages,
        enum_type: vec![EnumDescriptorProto {
            name: Some("Enum".into()),
            value: vec![
                enum_value("ENUM_VALUE_UNSPECIFIED", 0),
                enum_value("ENUM_VALUE_ONE", 1),
                enum_value("ENUM_VALUE_TWO", 2),
            ],
            ..Default::default()
        }],
        service: vec![library, messaging],
        syntax: Some("proto3".into()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::rule::http_rule;

    #[test]
    fn test_annotations_survive_encoding() {
        let pool = pool();
        let service = pool.get_service_by_name(LIBRARY).unwrap();
        let get_book = service.methods().find(|m| m.name() == "GetBook").unwrap();
        assert_eq!(
            http_rule(&get_book).unwrap(),
            HttpRule::new("GET", "/v1/{name=shelves/*/books/*}")
        );

        let mut copy = base_pool().unwrap();
        copy.decode_file_descriptor_proto(file_bytes().as_slice())
            .unwrap();
        let echo = copy
            .get_service_by_name(MESSAGING)
            .unwrap()
            .methods()
            .next()
            .unwrap();
        assert_eq!(http_rule(&echo).unwrap().additional_bindings.len(), 1);
    }
}
