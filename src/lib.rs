//! Multi-protocol RPC gateway.
//!
//! One port serves every registered gRPC method over native gRPC,
//! gRPC-Web (binary and text), REST/JSON transcoded with
//! `google.api.http` rules, and WebSocket JSON streams. Methods are
//! implemented in process or discovered on remote gRPC servers through
//! server reflection and proxied with dynamic messages.

// Core subsystems
pub mod codec;
pub mod http;
pub mod registry;
pub mod routing;
pub mod stream;

// Remote backends
pub mod backend;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;

#[doc(hidden)]
pub mod testpb;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use http::{GatewayServer, Mux, MuxOptions};
pub use lifecycle::Shutdown;
pub use registry::{Registry, Service};
pub use stream::ServerStream;
