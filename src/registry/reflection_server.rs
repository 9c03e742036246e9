//! Server reflection over a descriptor pool.
//!
//! Files are served from their serialized form in the pool, so method
//! options such as `google.api.http` reach the client intact. Each file
//! is answered together with its transitive dependencies.

use std::collections::HashSet;
use std::sync::Arc;

use prost_reflect::{DescriptorPool, FileDescriptor};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming};
use tonic_reflection::pb::v1alpha::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1alpha::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1alpha::server_reflection_server::{
    ServerReflection, ServerReflectionServer,
};
use tonic_reflection::pb::v1alpha::{
    ErrorResponse, ExtensionNumberResponse, FileDescriptorResponse, ListServiceResponse,
    ServerReflectionRequest, ServerReflectionResponse, ServiceResponse,
};

/// Path prefix the reflection service is mounted on.
pub const REFLECTION_SERVICE: &str = "grpc.reflection.v1alpha.ServerReflection";

/// Reflection service answering from a [`DescriptorPool`].
#[derive(Debug, Clone)]
pub struct DescriptorReflection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pool: DescriptorPool,
    services: Vec<String>,
}

impl DescriptorReflection {
    /// Serve every service in `pool`.
    pub fn new(pool: DescriptorPool) -> Self {
        let services = pool.services().map(|s| s.full_name().to_string()).collect();
        Self::with_services(pool, services)
    }

    /// Serve `pool`, listing only `services`.
    pub fn with_services(pool: DescriptorPool, services: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner { pool, services }),
        }
    }

    pub fn into_server(self) -> ServerReflectionServer<Self> {
        ServerReflectionServer::new(self)
    }

    fn respond(&self, request: MessageRequest) -> MessageResponse {
        let pool = &self.inner.pool;
        let file = match request {
            MessageRequest::ListServices(_) => {
                return MessageResponse::ListServicesResponse(ListServiceResponse {
                    service: self
                        .inner
                        .services
                        .iter()
                        .map(|name| ServiceResponse { name: name.clone() })
                        .collect(),
                });
            }
            MessageRequest::FileByFilename(name) => {
                pool.get_file_by_name(&name).ok_or_else(|| not_found("file", &name))
            }
            MessageRequest::FileContainingSymbol(symbol) => {
                symbol_file(pool, &symbol).ok_or_else(|| not_found("symbol", &symbol))
            }
            MessageRequest::FileContainingExtension(ext) => pool
                .get_message_by_name(&ext.containing_type)
                .and_then(|message| message.get_extension(ext.extension_number as u32))
                .map(|extension| extension.parent_file())
                .ok_or_else(|| {
                    not_found(
                        "extension",
                        &format!("{}({})", ext.containing_type, ext.extension_number),
                    )
                }),
            MessageRequest::AllExtensionNumbersOfType(name) => {
                return match pool.get_message_by_name(&name) {
                    Some(message) => {
                        MessageResponse::AllExtensionNumbersResponse(ExtensionNumberResponse {
                            base_type_name: name,
                            extension_number: message
                                .extensions()
                                .map(|ext| ext.number() as i32)
                                .collect(),
                        })
                    }
                    None => not_found("type", &name),
                };
            }
        };
        match file {
            Ok(file) => MessageResponse::FileDescriptorResponse(FileDescriptorResponse {
                file_descriptor_proto: with_dependencies(file),
            }),
            Err(response) => response,
        }
    }
}

fn not_found(kind: &str, name: &str) -> MessageResponse {
    MessageResponse::ErrorResponse(ErrorResponse {
        error_code: Code::NotFound as i32,
        error_message: format!("{kind} not found: {name}"),
    })
}

fn symbol_file(pool: &DescriptorPool, symbol: &str) -> Option<FileDescriptor> {
    if let Some(service) = pool.get_service_by_name(symbol) {
        return Some(service.parent_file());
    }
    if let Some(message) = pool.get_message_by_name(symbol) {
        return Some(message.parent_file());
    }
    if let Some(enum_desc) = pool.get_enum_by_name(symbol) {
        return Some(enum_desc.parent_file());
    }
    if let Some(extension) = pool.get_extension_by_name(symbol) {
        return Some(extension.parent_file());
    }
    // `pkg.Service.Method`
    let (service, method) = symbol.rsplit_once('.')?;
    let service = pool.get_service_by_name(service)?;
    service.methods().find(|m| m.name() == method)?;
    Some(service.parent_file())
}

/// `file` followed by every file it depends on, each once.
fn with_dependencies(file: FileDescriptor) -> Vec<Vec<u8>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut stack = vec![file];
    while let Some(file) = stack.pop() {
        if !seen.insert(file.name().to_string()) {
            continue;
        }
        stack.extend(file.dependencies());
        out.push(file.encode_to_vec());
    }
    out
}

#[tonic::async_trait]
impl ServerReflection for DescriptorReflection {
    type ServerReflectionInfoStream = ReceiverStream<Result<ServerReflectionResponse, Status>>;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(4);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let response = match requests.message().await {
                    Ok(Some(request)) => {
                        let message_response = request
                            .message_request
                            .clone()
                            .map(|msg| this.respond(msg))
                            .unwrap_or_else(|| MessageResponse::ErrorResponse(ErrorResponse {
                                error_code: Code::InvalidArgument as i32,
                                error_message: "empty reflection request".to_string(),
                            }));
                        Ok(ServerReflectionResponse {
                            valid_host: request.host.clone(),
                            original_request: Some(request),
                            message_response: Some(message_response),
                        })
                    }
                    Ok(None) => break,
                    Err(status) => Err(status),
                };
                let failed = response.is_err();
                if tx.send(response).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
