//! Dispatch units.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use prost_reflect::MethodDescriptor;
use tonic::Status;

use crate::backend::ConnId;
use crate::stream::ServerStream;

/// An RPC implementation driven through a [`ServerStream`].
///
/// The same implementation serves every protocol: it receives request
/// messages with `recv_msg` and answers with `send_msg`. Returning `Err`
/// ends the call with that status.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, method: &MethodDescriptor, stream: &mut dyn ServerStream) -> Result<(), Status>;
}

/// One registered implementation of one method.
#[derive(Clone)]
pub struct Handler {
    /// Handler key, `/pkg.Service/Method`.
    pub name: String,
    pub desc: MethodDescriptor,
    service: Arc<dyn Service>,
    /// Remote connection the handler proxies to, if any.
    conn: Option<ConnId>,
}

impl Handler {
    pub fn new(desc: MethodDescriptor, service: Arc<dyn Service>) -> Self {
        Self {
            name: method_name(&desc),
            desc,
            service,
            conn: None,
        }
    }

    pub(crate) fn with_conn(mut self, conn: ConnId) -> Self {
        self.conn = Some(conn);
        self
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub async fn call(&self, stream: &mut dyn ServerStream) -> Result<(), Status> {
        self.service.call(&self.desc, stream).await
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

/// `/pkg.Service/Method` for a method descriptor.
pub fn method_name(desc: &MethodDescriptor) -> String {
    format!("/{}/{}", desc.parent_service().full_name(), desc.name())
}
