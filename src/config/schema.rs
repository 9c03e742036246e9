//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::codec::{DEFAULT_MAX_RECEIVE_SIZE, DEFAULT_MAX_SEND_SIZE};
use crate::routing::rule::{CustomHttpPattern, HttpRule, Pattern};
use crate::stream::Limits;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Message size limits.
    pub limits: LimitsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Remote gRPC servers whose services are discovered by reflection.
    pub backends: Vec<BackendConfig>,

    /// Reflection discovery settings.
    pub reflection: ReflectionConfig,

    /// Service-config HTTP rules, applied on top of method annotations.
    pub http_rules: Vec<HttpRuleConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Message size limits in bytes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest message accepted, after decompression.
    pub max_receive_message_size: usize,

    /// Largest message sent.
    pub max_send_message_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_receive_message_size: DEFAULT_MAX_RECEIVE_SIZE,
            max_send_message_size: DEFAULT_MAX_SEND_SIZE,
        }
    }
}

impl From<&LimitsConfig> for Limits {
    fn from(config: &LimitsConfig) -> Self {
        Limits {
            max_receive: config.max_receive_message_size,
            max_send: config.max_send_message_size,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed until the response head, in seconds.
    pub request_secs: u64,

    /// Backend dial timeout in seconds.
    pub connect_secs: u64,

    /// How long shutdown waits for open connections, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 120,
            connect_secs: 5,
            shutdown_grace_secs: 30,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier, used in logs and metrics.
    pub name: String,

    /// Backend URL (e.g., "http://127.0.0.1:50051").
    pub address: String,

    /// Overrides the `:authority` sent to the backend.
    #[serde(default)]
    pub authority: Option<String>,
}

/// Reflection discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Register configured backends at startup.
    pub enabled: bool,

    /// Interval between descriptor refreshes in seconds.
    pub refresh_interval_secs: u64,

    /// Timeout for one reflection exchange in seconds.
    pub timeout_secs: u64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

/// One `google.api.http` rule in service-config form.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct HttpRuleConfig {
    /// Method full name, `pkg.Service.Method`.
    pub selector: String,
    pub get: Option<String>,
    pub put: Option<String>,
    pub post: Option<String>,
    pub delete: Option<String>,
    pub patch: Option<String>,
    pub custom: Option<CustomPatternConfig>,
    pub body: String,
    pub response_body: String,
    pub additional_bindings: Vec<HttpRuleConfig>,
}

/// A custom verb and its path template.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct CustomPatternConfig {
    pub kind: String,
    pub path: String,
}

impl HttpRuleConfig {
    /// Number of patterns set. A valid rule has exactly one.
    pub fn pattern_count(&self) -> usize {
        [&self.get, &self.put, &self.post, &self.delete, &self.patch]
            .iter()
            .filter(|p| p.is_some())
            .count()
            + usize::from(self.custom.is_some())
    }

    fn pattern(&self) -> Option<Pattern> {
        if let Some(t) = &self.get {
            return Some(Pattern::Get(t.clone()));
        }
        if let Some(t) = &self.put {
            return Some(Pattern::Put(t.clone()));
        }
        if let Some(t) = &self.post {
            return Some(Pattern::Post(t.clone()));
        }
        if let Some(t) = &self.delete {
            return Some(Pattern::Delete(t.clone()));
        }
        if let Some(t) = &self.patch {
            return Some(Pattern::Patch(t.clone()));
        }
        self.custom.as_ref().map(|c| {
            Pattern::Custom(CustomHttpPattern {
                kind: c.kind.clone(),
                path: c.path.clone(),
            })
        })
    }

    /// Convert to the rule the router compiles.
    pub fn to_rule(&self) -> HttpRule {
        HttpRule {
            selector: self.selector.clone(),
            body: self.body.clone(),
            response_body: self.response_body.clone(),
            additional_bindings: self.additional_bindings.iter().map(Self::to_rule).collect(),
            pattern: self.pattern(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
