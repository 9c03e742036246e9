//! Remote backends.
//!
//! # Data Flow
//! ```text
//! [[backends]] config
//!     → conn.rs     RemoteConn (identity + lazy tonic channel)
//!     → monitor.rs  ReflectionMonitor: register_conn on every tick,
//!                   drop_conn when reflection fails
//! ```

pub mod conn;
pub mod monitor;

pub use conn::{ConnId, RemoteConn};
pub use monitor::{RefreshOutcome, ReflectionMonitor};
