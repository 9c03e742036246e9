//! Reflection refresh.
//!
//! # Responsibilities
//! - Register a backend at startup and re-register it on every tick
//! - Unregister a backend whose reflection fails, so its methods answer
//!   `Unimplemented` instead of waiting on a dead connection

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::backend::RemoteConn;
use crate::observability::metrics;
use crate::registry::Registry;

/// Result of one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    Unchanged,
    Failed,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Updated => "updated",
            RefreshOutcome::Unchanged => "unchanged",
            RefreshOutcome::Failed => "failed",
        }
    }
}

pub struct ReflectionMonitor {
    registry: Arc<Registry>,
    conn: RemoteConn,
    interval: Duration,
}

impl ReflectionMonitor {
    pub fn new(registry: Arc<Registry>, conn: RemoteConn, interval: Duration) -> Self {
        Self {
            registry,
            conn,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            conn = %self.conn.name(),
            address = %self.conn.address(),
            interval = ?self.interval,
            "Reflection monitor starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(conn = %self.conn.name(), "Reflection monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Register the backend again, dropping it if reflection fails.
    pub async fn refresh(&self) -> RefreshOutcome {
        let outcome = match self.registry.register_conn(&self.conn).await {
            Ok(true) => RefreshOutcome::Updated,
            Ok(false) => RefreshOutcome::Unchanged,
            Err(err) => {
                tracing::warn!(conn = %self.conn.name(), error = %err, "Reflection refresh failed");
                if self.registry.drop_conn(&self.conn) {
                    tracing::warn!(conn = %self.conn.name(), "Backend unregistered until it answers reflection");
                }
                RefreshOutcome::Failed
            }
        };
        metrics::record_refresh(self.conn.name(), outcome.as_str());
        outcome
    }
}
