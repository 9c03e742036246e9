//! Registration-time error types.
//!
//! Request-time failures travel as [`tonic::Status`]; the types here only
//! describe what can go wrong while compiling routes and (un)registering
//! services.

use crate::routing::lexer::LexError;

/// Failure to register a service, a method or a remote connection.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A method's HTTP rule could not be compiled into the router.
    #[error("[{method}] invalid rule {rule}: {source}")]
    InvalidRule {
        method: String,
        rule: String,
        #[source]
        source: RuleError,
    },

    /// A descriptor set did not build into a pool.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// The remote reflection service failed or answered with an error.
    #[error("reflection failed: {0}")]
    Reflection(#[from] tonic::Status),

    /// Connecting to a remote backend failed.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A service named by the caller is not in the descriptor pool.
    #[error("service {0:?} not found")]
    UnknownService(String),

    /// A backend authority override is not a valid URI authority.
    #[error("invalid authority {0:?}")]
    InvalidAuthority(String),
}

/// Why a single HTTP rule was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    Template(#[from] LexError),

    #[error("field path {path:?} does not resolve on message {message}")]
    FieldPath { path: String, message: String },

    #[error("field {0} is not a singular message")]
    NotMessage(String),

    #[error("duplicate rule, already bound to {0}")]
    Duplicate(String),

    #[error("nested additional bindings are not supported")]
    NestedBindings,

    #[error("missing pattern")]
    MissingPattern,
}

impl From<crate::routing::params::UnresolvedField> for RuleError {
    fn from(err: crate::routing::params::UnresolvedField) -> Self {
        RuleError::FieldPath {
            path: err.path,
            message: err.message,
        }
    }
}
