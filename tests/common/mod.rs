//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor, Value};
use serde_json::{json, Value as Json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::client::Grpc;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use rpc_gateway::net::listener::Listener;
use rpc_gateway::registry::{method_name, DynamicCodec};
use rpc_gateway::stream::ServerStream;
use rpc_gateway::{testpb, GatewayServer, Mux, MuxOptions, Service};

/// In-memory implementation of the `testpb` library and messaging services.
pub struct Library;

fn field_str(msg: &DynamicMessage, name: &str) -> String {
    msg.get_field_by_name(name)
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

async fn recv(stream: &mut dyn ServerStream) -> Result<DynamicMessage, Status> {
    stream
        .recv_msg()
        .await?
        .ok_or_else(|| Status::invalid_argument("missing request"))
}

#[async_trait]
impl Service for Library {
    async fn call(&self, method: &MethodDescriptor, stream: &mut dyn ServerStream) -> Result<(), Status> {
        let output = method.output();
        match method.name() {
            "GetShelf" => {
                let name = field_str(&recv(stream).await?, "name");
                if name == "shelves/missing" {
                    return Err(Status::not_found(format!("shelf {name} not found")));
                }
                stream
                    .send_msg(&from_json(output, json!({"name": name, "theme": "fiction"})))
                    .await
            }
            "GetBook" => {
                let name = field_str(&recv(stream).await?, "name");
                stream
                    .send_msg(&from_json(output, json!({"name": name, "title": "Dune"})))
                    .await
            }
            "CreateBook" => {
                let request = recv(stream).await?;
                let mut book = request
                    .get_field_by_name("book")
                    .and_then(|v| v.as_message().cloned())
                    .unwrap_or_else(|| DynamicMessage::new(output));
                let name = format!(
                    "{}/books/{}",
                    field_str(&request, "parent"),
                    field_str(&request, "book_id")
                );
                book.set_field_by_name("name", Value::String(name));
                stream.send_msg(&book).await
            }
            "UpdateBook" => {
                let request = recv(stream).await?;
                let book = request
                    .get_field_by_name("book")
                    .and_then(|v| v.as_message().cloned())
                    .unwrap_or_else(|| DynamicMessage::new(output));
                stream.send_msg(&book).await
            }
            "WatchBooks" => {
                let request = recv(stream).await?;
                let parent = field_str(&request, "parent");
                let limit = request
                    .get_field_by_name("limit")
                    .and_then(|v| v.as_i32())
                    .filter(|n| *n > 0)
                    .unwrap_or(3);
                for i in 0..limit {
                    let book = from_json(output.clone(), json!({"name": format!("{parent}/books/{i}")}));
                    stream.send_msg(&book).await?;
                }
                Ok(())
            }
            "ImportBooks" => {
                let mut names = Vec::new();
                while let Some(book) = stream.recv_msg().await? {
                    names.push(field_str(&book, "name"));
                }
                let reply = from_json(output, json!({"count": names.len(), "names": names}));
                stream.send_msg(&reply).await
            }
            "Chat" => {
                while let Some(msg) = stream.recv_msg().await? {
                    let text = field_str(&msg, "text");
                    if text == "fail" {
                        return Err(Status::aborted("chat aborted"));
                    }
                    let reply = from_json(
                        output.clone(),
                        json!({"room": field_str(&msg, "room"), "text": text, "from": "echo"}),
                    );
                    stream.send_msg(&reply).await?;
                }
                Ok(())
            }
            "UploadFile" => {
                let request = recv(stream).await?;
                let size = request
                    .get_field_by_name("file")
                    .and_then(|v| v.as_message().cloned())
                    .and_then(|body| body.get_field_by_name("data").and_then(|d| d.as_bytes().map(Bytes::len)))
                    .unwrap_or_default();
                let mut md = MetadataMap::new();
                md.insert("x-upload-size", MetadataValue::from(size as u64));
                md.insert(
                    "x-upload-name",
                    field_str(&request, "filename")
                        .parse()
                        .map_err(|_| Status::invalid_argument("bad filename"))?,
                );
                stream.send_header(md).await?;
                stream.send_msg(&DynamicMessage::new(output)).await
            }
            "DownloadFile" => {
                let filename = field_str(&recv(stream).await?, "filename");
                let mut body = DynamicMessage::new(output);
                body.set_field_by_name("content_type", Value::String("text/plain".into()));
                body.set_field_by_name(
                    "data",
                    Value::Bytes(Bytes::from(format!("contents of {filename}"))),
                );
                stream.send_msg(&body).await
            }
            "Echo" => {
                let request = recv(stream).await?;
                if field_str(&request, "text") == "slow" {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                if let Some(echo) = stream.context().metadata.get("x-echo").cloned() {
                    let mut header = MetadataMap::new();
                    header.insert("x-echo", echo);
                    stream.set_header(header)?;
                    let mut trailer = MetadataMap::new();
                    trailer.insert("x-trailer", MetadataValue::from_static("done"));
                    stream.set_trailer(trailer);
                }
                stream.send_msg(&request).await
            }
            other => Err(Status::unimplemented(format!("{other} not implemented"))),
        }
    }
}

pub fn message_desc(name: &str) -> MessageDescriptor {
    testpb::pool()
        .get_message_by_name(name)
        .unwrap_or_else(|| panic!("unknown message {name}"))
}

pub fn method_desc(full_name: &str) -> MethodDescriptor {
    let (service, method) = full_name.rsplit_once('.').unwrap();
    testpb::pool()
        .get_service_by_name(service)
        .and_then(|s| s.methods().find(|m| m.name() == method))
        .unwrap_or_else(|| panic!("unknown method {full_name}"))
}

pub fn from_json(desc: MessageDescriptor, value: Json) -> DynamicMessage {
    DynamicMessage::deserialize(desc, value).unwrap()
}

/// A `testpb` message of type `name` built from JSON.
pub fn msg(name: &str, value: Json) -> DynamicMessage {
    from_json(message_desc(name), value)
}

pub fn to_json(msg: &DynamicMessage) -> Json {
    serde_json::to_value(msg).unwrap()
}

/// Mux serving both `testpb` services in process.
pub fn library_mux(opts: MuxOptions) -> Mux {
    let mux = Mux::new(opts);
    let pool = testpb::pool();
    for name in [testpb::LIBRARY, testpb::MESSAGING] {
        let service = pool.get_service_by_name(name).unwrap();
        mux.register_service(&service, Arc::new(Library)).unwrap();
    }
    mux
}

/// A gateway running on an ephemeral port.
pub struct Gateway {
    pub addr: SocketAddr,
    pub mux: Mux,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Stop accepting and wait for the server to drain.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub async fn start_gateway(server: GatewayServer) -> Gateway {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let listener = Listener::from_tcp(tcp, 64).unwrap();
    let mux = server.mux().clone();
    let server = server.with_shutdown_grace(Duration::from_millis(200));
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    Gateway {
        addr,
        mux,
        stop: Some(tx),
        task: Some(task),
    }
}

/// Gateway serving the library in process.
pub async fn start_library() -> Gateway {
    start_gateway(GatewayServer::new(library_mux(MuxOptions::default()))).await
}

/// Gateway serving the library in process plus server reflection.
pub async fn start_library_backend() -> Gateway {
    let server = GatewayServer::new(library_mux(MuxOptions::default())).with_reflection(testpb::pool());
    start_gateway(server).await
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Client speaking HTTP/2 prior knowledge.
pub fn h2c_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .http2_prior_knowledge()
        .build()
        .unwrap()
}

pub async fn channel(addr: SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

/// gRPC client over dynamic messages.
pub struct DynamicClient {
    grpc: Grpc<Channel>,
}

impl DynamicClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::from_channel(channel(addr).await)
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            grpc: Grpc::new(channel),
        }
    }

    async fn prepare(&mut self, method: &str) -> (PathAndQuery, DynamicCodec) {
        let desc = method_desc(method);
        self.grpc.ready().await.unwrap();
        let path = PathAndQuery::from_str(&method_name(&desc)).unwrap();
        (path, DynamicCodec::new(desc.output()))
    }

    pub async fn unary(
        &mut self,
        method: &str,
        request: tonic::Request<DynamicMessage>,
    ) -> Result<tonic::Response<DynamicMessage>, Status> {
        let (path, codec) = self.prepare(method).await;
        self.grpc.unary(request, path, codec).await
    }

    pub async fn server_streaming(
        &mut self,
        method: &str,
        request: DynamicMessage,
    ) -> Result<Vec<DynamicMessage>, Status> {
        let (path, codec) = self.prepare(method).await;
        let mut replies = self
            .grpc
            .server_streaming(tonic::Request::new(request), path, codec)
            .await?
            .into_inner();
        let mut out = Vec::new();
        while let Some(reply) = replies.message().await? {
            out.push(reply);
        }
        Ok(out)
    }

    pub async fn client_streaming(
        &mut self,
        method: &str,
        requests: Vec<DynamicMessage>,
    ) -> Result<DynamicMessage, Status> {
        let (path, codec) = self.prepare(method).await;
        let request = tonic::Request::new(tokio_stream::iter(requests));
        Ok(self.grpc.client_streaming(request, path, codec).await?.into_inner())
    }

    pub async fn streaming(
        &mut self,
        method: &str,
        requests: Vec<DynamicMessage>,
    ) -> Result<Vec<DynamicMessage>, Status> {
        let (path, codec) = self.prepare(method).await;
        let request = tonic::Request::new(tokio_stream::iter(requests));
        let mut replies = self.grpc.streaming(request, path, codec).await?.into_inner();
        let mut out = Vec::new();
        while let Some(reply) = replies.message().await? {
            out.push(reply);
        }
        Ok(out)
    }
}

/// Wait until `check` passes, polling for up to two seconds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
