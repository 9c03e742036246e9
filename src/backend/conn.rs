//! Remote gRPC connections.
//!
//! # Responsibilities
//! - Give every backend a process-unique identity
//! - Hold a lazily connected tonic channel shared by every proxied call

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::Uri;
use tonic::transport::{Channel, Endpoint};

use crate::config::schema::{BackendConfig, GatewayConfig};
use crate::error::GatewayError;

static CONN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered remote connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new() -> Self {
        Self(CONN_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

const DEFAULT_REFLECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// A backend reached over gRPC.
///
/// Clones share the identity and the channel.
#[derive(Debug, Clone)]
pub struct RemoteConn {
    id: ConnId,
    name: String,
    address: String,
    channel: Channel,
    reflection_timeout: Duration,
}

impl RemoteConn {
    /// Prepare a connection to `address` without dialing it yet.
    pub fn connect_lazy(
        name: impl Into<String>,
        address: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let address = address.into();
        let endpoint = Endpoint::from_shared(address.clone())?.connect_timeout(connect_timeout);
        Ok(Self::from_channel(name, address, endpoint.connect_lazy()))
    }

    /// Build a connection from its configuration entry.
    pub fn from_config(backend: &BackendConfig, config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut endpoint = Endpoint::from_shared(backend.address.clone())?
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs));
        if let Some(authority) = &backend.authority {
            let origin: Uri = format!("http://{authority}")
                .parse()
                .map_err(|_| GatewayError::InvalidAuthority(authority.clone()))?;
            endpoint = endpoint.origin(origin);
        }
        Ok(Self::from_channel(&backend.name, &backend.address, endpoint.connect_lazy())
            .with_reflection_timeout(Duration::from_secs(config.reflection.timeout_secs)))
    }

    /// Wrap an existing channel.
    pub fn from_channel(name: impl Into<String>, address: impl Into<String>, channel: Channel) -> Self {
        Self {
            id: ConnId::new(),
            name: name.into(),
            address: address.into(),
            channel,
            reflection_timeout: DEFAULT_REFLECTION_TIMEOUT,
        }
    }

    pub fn with_reflection_timeout(mut self, timeout: Duration) -> Self {
        self.reflection_timeout = timeout;
        self
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn reflection_timeout(&self) -> Duration {
        self.reflection_timeout
    }
}
