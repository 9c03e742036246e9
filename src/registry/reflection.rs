//! Server reflection client.
//!
//! # Responsibilities
//! - List a backend's services over one reflection stream
//! - Fetch the files defining them plus any dependency the gateway does
//!   not already know
//! - Hash the fetched set so unchanged backends can be skipped
//!
//! # Design Decisions
//! - Files are added to the pool from their serialized bytes, which keeps
//!   the `google.api.http` options on methods intact
//! - The hash covers files sorted by name, so listing order does not matter

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use prost_reflect::{DescriptorPool, ServiceDescriptor};
use prost_types::FileDescriptorProto;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::Streaming;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1alpha::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1alpha::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1alpha::{ServerReflectionRequest, ServerReflectionResponse};

use crate::error::GatewayError;
use crate::routing::rule::base_pool;

/// Descriptors fetched from one backend.
#[derive(Debug, Clone)]
pub struct Reflected {
    /// Listed service names, in listing order.
    pub services: Vec<String>,
    /// Serialized files keyed by file name.
    pub files: BTreeMap<String, Bytes>,
    /// SHA-256 over every file name and its bytes.
    pub hash: Vec<u8>,
}

impl Reflected {
    /// Build a descriptor pool with the fetched files on top of the base pool.
    pub fn pool(&self) -> Result<DescriptorPool, GatewayError> {
        let mut pool = base_pool()?;
        let mut parsed = BTreeMap::new();
        for (name, bytes) in &self.files {
            let file = FileDescriptorProto::decode(bytes.as_ref())
                .map_err(|err| Status::internal(format!("invalid descriptor {name}: {err}")))?;
            parsed.insert(name.as_str(), file.dependency);
        }

        let mut added = HashSet::new();
        for name in parsed.keys() {
            self.add_file(&mut pool, *name, &parsed, &mut added)?;
        }
        Ok(pool)
    }

    fn add_file<'a>(
        &'a self,
        pool: &mut DescriptorPool,
        name: &'a str,
        parsed: &BTreeMap<&'a str, Vec<String>>,
        added: &mut HashSet<&'a str>,
    ) -> Result<(), GatewayError> {
        if !added.insert(name) || pool.get_file_by_name(name).is_some() {
            return Ok(());
        }
        if let Some(deps) = parsed.get(name) {
            for dep in deps {
                if let Some((dep, _)) = parsed.get_key_value(dep.as_str()) {
                    self.add_file(pool, *dep, parsed, added)?;
                }
            }
        }
        if let Some(bytes) = self.files.get(name) {
            pool.decode_file_descriptor_proto(bytes.clone())?;
        }
        Ok(())
    }

    /// The listed services that resolve in `pool`.
    pub fn service_descriptors(&self, pool: &DescriptorPool) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .filter_map(|name| {
                let service = pool.get_service_by_name(name);
                if service.is_none() {
                    tracing::warn!(service = %name, "Listed service has no descriptor");
                }
                service
            })
            .collect()
    }
}

/// One reflection stream, used request by request.
struct Session {
    tx: mpsc::Sender<ServerReflectionRequest>,
    responses: Streaming<ServerReflectionResponse>,
}

impl Session {
    async fn open(channel: Channel, first: MessageRequest) -> Result<(Self, MessageResponse), Status> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(request(first))
            .await
            .map_err(|_| Status::internal("reflection request dropped"))?;
        let mut client = ServerReflectionClient::new(channel);
        let responses = client
            .server_reflection_info(ReceiverStream::new(rx))
            .await?
            .into_inner();
        let mut session = Session { tx, responses };
        let response = session.next().await?;
        Ok((session, response))
    }

    async fn call(&mut self, msg: MessageRequest) -> Result<MessageResponse, Status> {
        self.tx
            .send(request(msg))
            .await
            .map_err(|_| Status::unavailable("reflection stream closed"))?;
        self.next().await
    }

    async fn next(&mut self) -> Result<MessageResponse, Status> {
        let response = self
            .responses
            .message()
            .await?
            .ok_or_else(|| Status::unavailable("reflection stream closed"))?;
        match response.message_response {
            Some(MessageResponse::ErrorResponse(err)) => {
                Err(Status::new(Code::from(err.error_code), err.error_message))
            }
            Some(msg) => Ok(msg),
            None => Err(Status::internal("empty reflection response")),
        }
    }

    async fn files(&mut self, msg: MessageRequest) -> Result<Vec<Bytes>, Status> {
        match self.call(msg).await? {
            MessageResponse::FileDescriptorResponse(files) => Ok(files
                .file_descriptor_proto
                .into_iter()
                .map(Bytes::from)
                .collect()),
            _ => Err(Status::internal("unexpected reflection response")),
        }
    }
}

fn request(msg: MessageRequest) -> ServerReflectionRequest {
    ServerReflectionRequest {
        host: String::new(),
        message_request: Some(msg),
    }
}

/// Fetch every service and its descriptors from the backend behind `channel`.
pub async fn fetch(channel: Channel, timeout: Duration) -> Result<Reflected, GatewayError> {
    match tokio::time::timeout(timeout, fetch_inner(channel)).await {
        Ok(result) => result,
        Err(_) => Err(Status::deadline_exceeded("reflection timed out").into()),
    }
}

async fn fetch_inner(channel: Channel) -> Result<Reflected, GatewayError> {
    let (mut session, listed) = Session::open(channel, MessageRequest::ListServices(String::new())).await?;
    let MessageResponse::ListServicesResponse(listed) = listed else {
        return Err(Status::internal("unexpected reflection response").into());
    };
    let services: Vec<String> = listed.service.into_iter().map(|s| s.name).collect();

    let known = base_pool()?;
    let mut files = BTreeMap::new();
    let mut wanted = Vec::new();
    for service in &services {
        for bytes in session
            .files(MessageRequest::FileContainingSymbol(service.clone()))
            .await?
        {
            wanted.extend(collect(&mut files, bytes)?);
        }
    }

    while let Some(dep) = wanted.pop() {
        if files.contains_key(&dep) || known.get_file_by_name(&dep).is_some() {
            continue;
        }
        tracing::debug!(file = %dep, "Fetching dependency");
        for bytes in session.files(MessageRequest::FileByFilename(dep)).await? {
            wanted.extend(collect(&mut files, bytes)?);
        }
    }

    let hash = hash_files(&files);
    Ok(Reflected {
        services,
        files,
        hash,
    })
}

/// Record a serialized file and return its dependencies.
fn collect(files: &mut BTreeMap<String, Bytes>, bytes: Bytes) -> Result<Vec<String>, Status> {
    let file = FileDescriptorProto::decode(bytes.as_ref())
        .map_err(|err| Status::internal(format!("invalid file descriptor: {err}")))?;
    let name = file.name.unwrap_or_default();
    files.insert(name, bytes);
    Ok(file.dependency)
}

fn hash_files(files: &BTreeMap<String, Bytes>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for (name, bytes) in files {
        hasher.update(name.as_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().to_vec()
}
