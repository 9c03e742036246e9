//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits and intervals > 0, addresses parse)
//! - Check backend names are unique and URLs are usable
//! - Check HTTP rules compile before any service is registered
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{GatewayConfig, HttpRuleConfig};
use crate::routing::template;

/// One semantic problem in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid socket address {:?}", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.limits.max_receive_message_size == 0 {
        errors.push(ValidationError::new(
            "limits.max_receive_message_size",
            "must be greater than 0",
        ));
    }
    if config.limits.max_send_message_size == 0 {
        errors.push(ValidationError::new("limits.max_send_message_size", "must be greater than 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }
    if config.reflection.refresh_interval_secs == 0 {
        errors.push(ValidationError::new(
            "reflection.refresh_interval_secs",
            "must be greater than 0",
        ));
    }
    if config.reflection.timeout_secs == 0 {
        errors.push(ValidationError::new("reflection.timeout_secs", "must be greater than 0"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address {:?}", config.observability.metrics_address),
        ));
    }

    let mut names = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        let field = format!("backends[{i}]");
        if backend.name.is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        } else if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("duplicate backend name {:?}", backend.name),
            ));
        }
        match url::Url::parse(&backend.address) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {}
            Ok(url) => errors.push(ValidationError::new(
                format!("{field}.address"),
                format!("unsupported URL {:?}, want http or https", url.as_str()),
            )),
            Err(err) => errors.push(ValidationError::new(
                format!("{field}.address"),
                format!("invalid URL {:?}: {err}", backend.address),
            )),
        }
    }

    for (i, rule) in config.http_rules.iter().enumerate() {
        let field = format!("http_rules[{i}]");
        if rule.selector.is_empty() {
            errors.push(ValidationError::new(format!("{field}.selector"), "must not be empty"));
        }
        validate_rule(rule, &field, &mut errors);
        for (j, binding) in rule.additional_bindings.iter().enumerate() {
            let field = format!("{field}.additional_bindings[{j}]");
            if !binding.additional_bindings.is_empty() {
                errors.push(ValidationError::new(
                    field.clone(),
                    "nested additional bindings are not supported",
                ));
            }
            validate_rule(binding, &field, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_rule(rule: &HttpRuleConfig, field: &str, errors: &mut Vec<ValidationError>) {
    match rule.pattern_count() {
        1 => {}
        0 => {
            errors.push(ValidationError::new(field, "missing pattern"));
            return;
        }
        n => {
            errors.push(ValidationError::new(field, format!("{n} patterns set, want one")));
            return;
        }
    }
    if let Some((_, path)) = rule.to_rule().verb_and_template() {
        if let Err(err) = template::parse(path) {
            errors.push(ValidationError::new(field, err.to_string()));
        }
    }
}
