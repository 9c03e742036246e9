//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper auto builder, Axum router, middleware)
//!     → mux.rs (classify: gRPC, gRPC-Web, WebSocket, REST)
//!     → request.rs (metadata, timeouts, content types)
//!     → registry picks a handler; a stream adapter runs the call
//!     → response.rs (streamed head, body, trailers)
//!     → status.rs (status code tables and error bodies)
//! ```

pub mod mux;
pub mod request;
pub mod response;
pub mod server;
pub mod status;

pub use mux::{Mux, MuxOptions};
pub use request::X_REQUEST_ID;
pub use server::GatewayServer;
