//! Streaming responses.
//!
//! # Responsibilities
//! - Hand the response head to the HTTP layer as soon as an adapter
//!   commits to it, then stream body frames and trailers behind it
//! - Turn outgoing metadata and call status into headers
//!
//! # Design Decisions
//! - The head travels over a oneshot, body frames over a bounded channel;
//!   a slow client applies backpressure to the handler
//! - Dropping the writer without a head still answers, with whatever
//!   status and headers were set
//! - A dropped body receiver means the client went away

use std::convert::Infallible;
use std::future::Future;

use axum::body::Body;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::http::request::is_reserved_header;

const BODY_BUFFER: usize = 16;

struct Head {
    status: StatusCode,
    headers: HeaderMap,
}

/// Write side of a streamed response.
pub struct ResponseWriter {
    head: Option<oneshot::Sender<Head>>,
    status: StatusCode,
    headers: HeaderMap,
    body: mpsc::Sender<Frame<Bytes>>,
}

/// Read side, resolved into a response once the head is written.
pub struct PendingResponse {
    head: oneshot::Receiver<Head>,
    body: mpsc::Receiver<Frame<Bytes>>,
}

impl ResponseWriter {
    pub fn channel() -> (ResponseWriter, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
        let writer = ResponseWriter {
            head: Some(head_tx),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body_tx,
        };
        let pending = PendingResponse {
            head: head_rx,
            body: body_rx,
        };
        (writer, pending)
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Headers of the response head. Changes after the head is sent are lost.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn head_sent(&self) -> bool {
        self.head.is_none()
    }

    /// Commit the status and headers.
    pub fn send_head(&mut self) {
        if let Some(tx) = self.head.take() {
            let head = Head {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
            };
            // The receiver is gone only if the request was abandoned.
            let _ = tx.send(head);
        }
    }

    /// Write a body chunk, sending the head first if needed.
    pub async fn write(&mut self, data: Bytes) -> Result<(), Status> {
        self.send_head();
        if data.is_empty() {
            return Ok(());
        }
        self.body
            .send(Frame::data(data))
            .await
            .map_err(|_| Status::cancelled("context canceled"))
    }

    /// End the body with HTTP trailers.
    pub async fn write_trailers(&mut self, trailers: HeaderMap) -> Result<(), Status> {
        self.send_head();
        self.body
            .send(Frame::trailers(trailers))
            .await
            .map_err(|_| Status::cancelled("context canceled"))
    }

    /// Resolves once the client stops reading the response.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let body = self.body.clone();
        async move { body.closed().await }
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        self.send_head();
    }
}

impl PendingResponse {
    /// Wait for the head and build the streaming response.
    pub async fn into_response(self) -> Response {
        let Ok(head) = self.head.await else {
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        };
        let frames = ReceiverStream::new(self.body).map(Ok::<_, Infallible>);
        let mut response = Response::new(Body::new(StreamBody::new(frames)));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        response
    }
}

/// A bodiless response.
pub fn empty(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Copy outgoing metadata into `dst`, skipping transport-owned headers.
pub fn set_outgoing_metadata(dst: &mut HeaderMap, md: &HeaderMap) {
    for (name, value) in md {
        if is_reserved_header(name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Percent-encode a `grpc-message` value.
///
/// Bytes outside printable ASCII and `%` itself are escaped.
pub fn encode_grpc_message(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    for &b in msg.as_bytes() {
        if b < b' ' || b > b'~' || b == b'%' {
            out.push_str(&format!("%{b:02x}"));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// `grpc-status`, `grpc-message` and `grpc-status-details-bin` for `status`,
/// plus any metadata the status carries.
pub fn status_headers(status: &Status) -> HeaderMap {
    let mut headers = HeaderMap::new();
    set_outgoing_metadata(&mut headers, status.metadata().as_ref());
    headers.insert(
        HeaderName::from_static("grpc-status"),
        HeaderValue::from(status.code() as i32),
    );
    if !status.message().is_empty() {
        if let Ok(value) = HeaderValue::from_str(&encode_grpc_message(status.message())) {
            headers.insert(HeaderName::from_static("grpc-message"), value);
        }
    }
    if !status.details().is_empty() {
        if let Ok(value) = HeaderValue::from_str(&STANDARD_NO_PAD.encode(status.details())) {
            headers.insert(HeaderName::from_static("grpc-status-details-bin"), value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tonic::Code;

    #[test]
    fn test_encode_grpc_message() {
        assert_eq!(encode_grpc_message("plain text"), "plain text");
        assert_eq!(encode_grpc_message("100%"), "100%25");
        assert_eq!(encode_grpc_message("a\nb"), "a%0ab");
        assert_eq!(encode_grpc_message("é"), "%c3%a9");
    }

    #[test]
    fn test_status_headers() {
        let status = Status::with_details(Code::NotFound, "no 100%", Bytes::from_static(&[1, 2, 3]));
        let headers = status_headers(&status);
        assert_eq!(headers["grpc-status"], "5");
        assert_eq!(headers["grpc-message"], "no 100%25");
        assert_eq!(headers["grpc-status-details-bin"], "AQID");

        let headers = status_headers(&Status::new(Code::Ok, ""));
        assert_eq!(headers["grpc-status"], "0");
        assert!(headers.get("grpc-message").is_none());
    }

    #[test]
    fn test_outgoing_metadata_filter() {
        let mut md = HeaderMap::new();
        md.insert("content-type", "text/plain".parse().unwrap());
        md.insert("grpc-status", "0".parse().unwrap());
        md.insert("x-custom", "1".parse().unwrap());
        let mut dst = HeaderMap::new();
        set_outgoing_metadata(&mut dst, &md);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst["x-custom"], "1");
    }

    #[tokio::test]
    async fn test_stream_head_body_trailers() {
        let (mut writer, pending) = ResponseWriter::channel();
        let task = tokio::spawn(async move {
            writer.set_status(StatusCode::CREATED);
            writer.headers_mut().insert("x-a", "1".parse().unwrap());
            writer.write(Bytes::from_static(b"hello ")).await.unwrap();
            writer.write(Bytes::from_static(b"world")).await.unwrap();
            let mut trailers = HeaderMap::new();
            trailers.insert("x-t", "2".parse().unwrap());
            writer.write_trailers(trailers).await.unwrap();
        });

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-a"], "1");
        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-t"], "2");
        assert_eq!(&collected.to_bytes()[..], b"hello world");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_sends_head() {
        let (mut writer, pending) = ResponseWriter::channel();
        writer.set_status(StatusCode::NOT_FOUND);
        drop(writer);
        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_closed_when_client_goes_away() {
        let (mut writer, pending) = ResponseWriter::channel();
        writer.send_head();
        let closed = writer.closed();
        drop(pending.into_response().await);
        closed.await;
        assert!(writer.write(Bytes::from_static(b"x")).await.is_err());
    }
}
