//! RPC gateway binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────┐
//!                         │                  GATEWAY                      │
//!   gRPC / gRPC-Web       │  ┌─────────┐   ┌─────────┐   ┌──────────┐    │
//!   REST / WebSocket ─────┼─▶│   net   │──▶│  http   │──▶│ registry │    │
//!                         │  │listener │   │  mux    │   │  router  │    │
//!                         │  └─────────┘   └─────────┘   └────┬─────┘    │
//!                         │                                   ▼          │
//!                         │                ┌─────────┐   ┌──────────┐    │
//!                         │                │ stream  │◀──│ handler  │────┼──▶ gRPC backend
//!                         │                │adapters │   │ (proxy)  │    │   (reflection)
//!                         │                └─────────┘   └──────────┘    │
//!                         └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use rpc_gateway::backend::{ReflectionMonitor, RemoteConn};
use rpc_gateway::config::validation::validate_config;
use rpc_gateway::config::{load_config, ConfigError, GatewayConfig, HttpRuleConfig};
use rpc_gateway::lifecycle::{shutdown_signal, Shutdown};
use rpc_gateway::net::listener::Listener;
use rpc_gateway::observability::{logging, metrics};
use rpc_gateway::{GatewayServer, Mux, MuxOptions};

/// Serve gRPC services over gRPC, gRPC-Web, REST and WebSocket.
#[derive(Debug, Parser)]
#[command(name = "rpc-gateway", version)]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rpc-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        backends = config.backends.len(),
        http_rules = config.http_rules.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let mux = Mux::new(MuxOptions {
        limits: (&config.limits).into(),
        http_rules: config.http_rules.iter().map(HttpRuleConfig::to_rule).collect(),
        ..Default::default()
    });

    let shutdown = Shutdown::new();
    if config.reflection.enabled {
        let interval = Duration::from_secs(config.reflection.refresh_interval_secs);
        for backend in &config.backends {
            let conn = RemoteConn::from_config(backend, &config)?;
            let monitor = ReflectionMonitor::new(Arc::clone(mux.registry()), conn, interval);
            tokio::spawn(monitor.run(shutdown.subscribe()));
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    GatewayServer::new(mux)
        .with_config(&config)
        .run(listener, shutdown_signal())
        .await?;

    shutdown.trigger();
    tracing::info!("Shutdown complete");
    Ok(())
}
