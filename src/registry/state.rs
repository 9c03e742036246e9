//! Immutable registry snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tonic::Status;

use crate::backend::ConnId;
use crate::error::GatewayError;
use crate::registry::handler::Handler;
use crate::routing::rule::http_rule;
use crate::routing::{HttpRule, Path, RouteError, RouteMatch};

/// Handlers contributed by one remote connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnHandlers {
    pub(crate) hash: Vec<u8>,
    pub(crate) handlers: Vec<Arc<Handler>>,
}

/// Router and handler table at one point in time.
///
/// Writers clone the current snapshot, change the copy and publish it;
/// readers never see a partial update.
#[derive(Debug, Clone, Default)]
pub struct State {
    path: Path,
    handlers: HashMap<String, Vec<Arc<Handler>>>,
    conns: HashMap<ConnId, ConnHandlers>,
    /// Service-config rules routed for each method, kept to re-route it.
    config_rules: HashMap<String, Vec<HttpRule>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every rule of `handler` and add it to the pool for its method.
    ///
    /// Routes are the implicit rule on the gRPC path, the method's
    /// `google.api.http` annotation, then any service-config rules.
    pub(crate) fn append_handler(
        &mut self,
        handler: Arc<Handler>,
        config_rules: &[HttpRule],
    ) -> Result<(), GatewayError> {
        route_handler(&mut self.path, &handler, config_rules)?;
        tracing::debug!(method = %handler.name, conn = ?handler.conn(), "Handler appended");
        self.config_rules
            .insert(handler.name.clone(), config_rules.to_vec());
        self.handlers
            .entry(handler.name.clone())
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Drop `handler` from its method pool, unrouting the method once the
    /// pool is empty.
    ///
    /// Routes always carry the descriptor of the newest handler in the
    /// pool; when the removed handler's descriptor differs from that of
    /// the new newest, the method is routed again from the survivors.
    fn remove_handler(&mut self, handler: &Arc<Handler>) {
        let name = handler.name.as_str();
        let Some(pool) = self.handlers.get_mut(name) else {
            return;
        };
        pool.retain(|h| !Arc::ptr_eq(h, handler));
        let Some(newest) = pool.last() else {
            self.handlers.remove(name);
            self.config_rules.remove(name);
            self.path.del_rule(name);
            return;
        };
        if newest.desc == handler.desc {
            return;
        }

        let survivors = pool.clone();
        let config_rules = self.config_rules.get(name).cloned().unwrap_or_default();
        self.path.del_rule(name);
        for survivor in &survivors {
            if let Err(err) = route_handler(&mut self.path, survivor, &config_rules) {
                tracing::warn!(method = %name, error = %err, "Failed to re-route surviving handler");
            }
        }
        tracing::debug!(method = %name, remaining = survivors.len(), "Method re-routed");
    }

    pub(crate) fn conn_hash(&self, conn: ConnId) -> Option<&[u8]> {
        self.conns.get(&conn).map(|c| c.hash.as_slice())
    }

    pub(crate) fn set_conn(&mut self, conn: ConnId, hash: Vec<u8>, handlers: Vec<Arc<Handler>>) {
        self.conns.insert(conn, ConnHandlers { hash, handlers });
    }

    /// Remove everything `conn` contributed. Returns whether it was known.
    pub(crate) fn remove_conn(&mut self, conn: ConnId) -> bool {
        let Some(entry) = self.conns.remove(&conn) else {
            return false;
        };
        for handler in &entry.handlers {
            self.remove_handler(handler);
        }
        true
    }

    /// One handler for `name`, chosen uniformly at random.
    pub fn pick(&self, name: &str) -> Result<Arc<Handler>, Status> {
        self.handlers
            .get(name)
            .and_then(|pool| pool.choose(&mut rand::thread_rng()))
            .cloned()
            .ok_or_else(|| Status::unimplemented(format!("method {name} not implemented")))
    }

    pub fn find(&self, path: &str, verb: &str) -> Result<RouteMatch, RouteError> {
        self.path.find(path, verb)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handlers registered for `name`.
    pub fn handlers(&self, name: &str) -> &[Arc<Handler>] {
        self.handlers.get(name).map_or(&[], Vec::as_slice)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// Number of handlers `conn` contributed.
    pub fn conn_handler_count(&self, conn: ConnId) -> usize {
        self.conns.get(&conn).map_or(0, |c| c.handlers.len())
    }
}

/// Route the implicit rule, the method annotation and `config_rules`.
fn route_handler(path: &mut Path, handler: &Handler, config_rules: &[HttpRule]) -> Result<(), GatewayError> {
    let name = handler.name.as_str();
    path.add_rule(&HttpRule::implicit(name), &handler.desc, name)?;
    if let Some(rule) = http_rule(&handler.desc) {
        path.add_rule(&rule, &handler.desc, name)?;
    }
    for rule in config_rules {
        path.add_rule(rule, &handler.desc, name)?;
    }
    Ok(())
}

fn same_handlers(a: &[Arc<Handler>], b: &[Arc<Handler>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}

/// Structural equality: same trie, same handler instances per method,
/// same connections.
impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.handlers.len() == other.handlers.len()
            && self.handlers.iter().all(|(name, pool)| {
                other
                    .handlers
                    .get(name)
                    .is_some_and(|o| same_handlers(pool, o))
            })
            && self.conns.len() == other.conns.len()
            && self.conns.iter().all(|(id, entry)| {
                other.conns.get(id).is_some_and(|o| {
                    o.hash == entry.hash && same_handlers(&entry.handlers, &o.handlers)
                })
            })
    }
}
