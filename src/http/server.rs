//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the catch-all dispatch into the [`Mux`]
//! - Serve HTTP/1.1 and h2c on every connection, with upgrades for
//!   WebSocket
//! - Wire up middleware (tracing, timeout, request ID)
//! - Stop accepting on shutdown and drain open connections

use std::future::Future;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    response::Response,
    routing::any,
    Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use prost_reflect::DescriptorPool;
use tokio::sync::watch;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::GatewayConfig;
use crate::http::mux::Mux;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::registry::reflection_server::{DescriptorReflection, REFLECTION_SERVICE};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// HTTP server for the gateway.
pub struct GatewayServer {
    mux: Mux,
    reflection: Option<DescriptorReflection>,
    request_timeout: Duration,
    shutdown_grace: Duration,
}

impl GatewayServer {
    pub fn new(mux: Mux) -> Self {
        Self {
            mux,
            reflection: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Take timeouts from the configuration.
    pub fn with_config(mut self, config: &GatewayConfig) -> Self {
        self.request_timeout = Duration::from_secs(config.timeouts.request_secs);
        self.shutdown_grace = Duration::from_secs(config.timeouts.shutdown_grace_secs);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Serve gRPC server reflection for every service in `pool`.
    pub fn with_reflection(mut self, pool: DescriptorPool) -> Self {
        self.reflection = Some(DescriptorReflection::new(pool));
        self
    }

    pub fn mux(&self) -> &Mux {
        &self.mux
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/{*path}", any(dispatch))
            .route("/", any(dispatch))
            .with_state(self.mux.clone());
        if let Some(reflection) = &self.reflection {
            router = router.route_service(
                &format!("/{REFLECTION_SERVICE}/{{*method}}"),
                reflection.clone().into_server(),
            );
        }
        router
            .layer(TimeoutLayer::new(self.request_timeout))
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer())
            .layer(TraceLayer::new_for_http())
    }

    /// Accept connections until `shutdown` resolves, then drain them.
    pub async fn run(
        self,
        listener: Listener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), ListenerError> {
        let addr = listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(address = %addr, "Gateway server starting");

        let router = self.router();
        let tracker = ConnectionTracker::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer, permit) = match accepted {
                Ok(conn) => conn,
                Err(ListenerError::Closed) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "Accept failed");
                    continue;
                }
            };

            let guard = tracker.track();
            let service = TowerToHyperService::new(router.clone());
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let builder = auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                tokio::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = stop.changed() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(err) = result {
                    tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %err, "Connection error");
                }
            });
        }

        drop(listener);
        tracing::info!(active = tracker.active_count(), "Stopped accepting, draining connections");
        // Receivers are held by connection tasks; none left means none to stop.
        let _ = stop_tx.send(true);
        let remaining = tracker.drain(self.shutdown_grace).await;
        tracing::info!(remaining, "Gateway server stopped");
        Ok(())
    }
}

async fn dispatch(State(mux): State<Mux>, request: Request) -> Response {
    mux.serve(request).await
}
