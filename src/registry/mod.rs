//! Handler registry.
//!
//! # Data Flow
//! ```text
//! register_service(descriptor, impl) ─┐
//! register_conn(remote)  ── reflection.rs fetch ─┤
//! drop_conn(remote) ──────────────────┤
//!                                     ▼
//!                  lock → clone State → mutate → ArcSwap::store
//!
//! request ── ArcSwap::load ──▶ State::find / State::pick ──▶ Handler
//! ```
//!
//! # Design Decisions
//! - One writer at a time behind a mutex; readers take a single atomic
//!   load and never block
//! - Reflection runs before the lock is taken, so a slow backend does not
//!   stall other registrations
//! - A connection whose descriptor hash is unchanged is left alone

pub mod handler;
pub mod proxy;
pub mod reflection;
pub mod reflection_server;
pub mod state;

pub use handler::{method_name, Handler, Service};
pub use proxy::{DynamicCodec, ProxyService};
pub use reflection_server::DescriptorReflection;
pub use state::State;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use prost_reflect::ServiceDescriptor;

use crate::backend::RemoteConn;
use crate::error::GatewayError;
use crate::observability::metrics;
use crate::routing::HttpRule;

/// Registered handlers and the compiled router.
pub struct Registry {
    state: ArcSwap<State>,
    write: Mutex<()>,
    /// Service-config rules keyed by method full name.
    rules: HashMap<String, Vec<HttpRule>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_http_rules(Vec::new())
    }

    /// A registry that also routes the given service-config rules.
    ///
    /// Each rule's `selector` names the method it applies to, as
    /// `pkg.Service.Method`.
    pub fn with_http_rules(rules: Vec<HttpRule>) -> Self {
        let mut by_selector: HashMap<String, Vec<HttpRule>> = HashMap::new();
        for rule in rules {
            by_selector.entry(rule.selector.clone()).or_default().push(rule);
        }
        Self {
            state: ArcSwap::from_pointee(State::new()),
            write: Mutex::new(()),
            rules: by_selector,
        }
    }

    /// The current snapshot.
    pub fn load(&self) -> Arc<State> {
        self.state.load_full()
    }

    fn config_rules(&self, full_name: &str) -> &[HttpRule] {
        self.rules.get(full_name).map_or(&[], Vec::as_slice)
    }

    /// Register an in-process implementation for every method of `service`.
    pub fn register_service(
        &self,
        service: &ServiceDescriptor,
        imp: Arc<dyn Service>,
    ) -> Result<(), GatewayError> {
        let _guard = self.write.lock();
        let mut next = State::clone(&self.state.load());
        for method in service.methods() {
            let handler = Arc::new(Handler::new(method.clone(), Arc::clone(&imp)));
            next.append_handler(handler, self.config_rules(method.full_name()))?;
        }
        self.state.store(Arc::new(next));
        tracing::info!(
            service = %service.full_name(),
            methods = service.methods().len(),
            "Service registered"
        );
        Ok(())
    }

    /// Discover the services behind `conn` and proxy every method to it.
    ///
    /// Returns `false` when the backend's descriptors are unchanged since
    /// the last registration.
    pub async fn register_conn(&self, conn: &RemoteConn) -> Result<bool, GatewayError> {
        let reflected = reflection::fetch(conn.channel(), conn.reflection_timeout()).await?;
        let pool = reflected.pool()?;
        let services = reflected.service_descriptors(&pool);

        let _guard = self.write.lock();
        let current = self.state.load();
        if current.conn_hash(conn.id()) == Some(reflected.hash.as_slice()) {
            tracing::debug!(conn = %conn.name(), "Descriptors unchanged");
            return Ok(false);
        }

        let mut next = State::clone(&current);
        next.remove_conn(conn.id());
        let imp: Arc<dyn Service> = Arc::new(ProxyService::new(conn.channel()));
        let mut handlers = Vec::new();
        for service in &services {
            for method in service.methods() {
                let handler = Arc::new(Handler::new(method.clone(), Arc::clone(&imp)).with_conn(conn.id()));
                next.append_handler(Arc::clone(&handler), self.config_rules(method.full_name()))?;
                handlers.push(handler);
            }
        }
        let count = handlers.len();
        next.set_conn(conn.id(), reflected.hash, handlers);
        self.state.store(Arc::new(next));

        metrics::record_registration(conn.name(), count);
        tracing::info!(
            conn = %conn.name(),
            services = ?reflected.services,
            handlers = count,
            "Connection registered"
        );
        Ok(true)
    }

    /// Remove every handler `conn` contributed. Returns whether it was registered.
    pub fn drop_conn(&self, conn: &RemoteConn) -> bool {
        let _guard = self.write.lock();
        let mut next = State::clone(&self.state.load());
        if !next.remove_conn(conn.id()) {
            return false;
        }
        self.state.store(Arc::new(next));
        metrics::record_registration(conn.name(), 0);
        tracing::info!(conn = %conn.name(), "Connection dropped");
        true
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load();
        f.debug_struct("Registry")
            .field("methods", &state.methods())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ServerStream;
    use crate::testpb;
    use async_trait::async_trait;
    use prost_reflect::MethodDescriptor;
    use tonic::Status;

    struct Noop;

    #[async_trait]
    impl Service for Noop {
        async fn call(&self, _: &MethodDescriptor, _: &mut dyn ServerStream) -> Result<(), Status> {
            Ok(())
        }
    }

    fn library() -> ServiceDescriptor {
        testpb::pool().get_service_by_name(testpb::LIBRARY).unwrap()
    }

    #[test]
    fn test_register_service_publishes_snapshot() {
        let registry = Registry::new();
        let before = registry.load();
        registry.register_service(&library(), Arc::new(Noop)).unwrap();

        assert!(before.methods().is_empty());
        let state = registry.load();
        assert!(state.methods().contains(&"/gateway.testpb.Library/GetBook"));
        assert!(state.find("/v1/shelves/1/books/1", "GET").is_ok());
    }

    #[test]
    fn test_register_twice_pools_handlers() {
        let registry = Registry::new();
        registry.register_service(&library(), Arc::new(Noop)).unwrap();
        registry.register_service(&library(), Arc::new(Noop)).unwrap();
        assert_eq!(registry.load().handlers("/gateway.testpb.Library/GetBook").len(), 2);
    }

    #[test]
    fn test_service_config_rule() {
        let mut rule = HttpRule::new("GET", "/v2/books/{name=**}");
        rule.selector = "gateway.testpb.Library.GetBook".to_string();
        let registry = Registry::with_http_rules(vec![rule]);
        registry.register_service(&library(), Arc::new(Noop)).unwrap();

        let m = registry.load().find("/v2/books/shelves/1/books/2", "GET").unwrap();
        assert_eq!(m.binding.name, "/gateway.testpb.Library/GetBook");
        assert_eq!(m.captures(), ["shelves/1/books/2"]);
    }

    #[test]
    fn test_invalid_config_rule_leaves_state() {
        let mut rule = HttpRule::new("GET", "/v2/{missing}");
        rule.selector = "gateway.testpb.Library.GetBook".to_string();
        let registry = Registry::with_http_rules(vec![rule]);
        let err = registry.register_service(&library(), Arc::new(Noop)).unwrap_err();
        assert!(err.to_string().contains("/gateway.testpb.Library/GetBook"), "{err}");
        assert!(registry.load().methods().is_empty());
    }
}
