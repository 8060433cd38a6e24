use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::RwLock;

use super::{join_path, split_path, PathEdge, PathElManager, PathError, ROOT};
use crate::node::{rpc::RpcRequest, ReturnPath};
use crate::transport::{EdgeError, EdgeHandler, EdgeListener, EdgeRef, TransportAddress};

/// The edge listener of one path, backed by the manager's physical listener.
pub struct PathEdgeListener {
    path: String,
    manager: Weak<PathElManager>,
    started: AtomicBool,
    running: AtomicBool,
    edge_handler: RwLock<Option<EdgeHandler>>,
}

impl PathEdgeListener {
    pub(super) fn new(path: String, manager: Weak<PathElManager>) -> Self {
        Self {
            path,
            manager,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            edge_handler: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Hands a freshly bound path edge to the application.
    pub(super) fn announce(&self, edge: Arc<PathEdge>) -> Result<(), PathError> {
        if !self.is_started() {
            return Err(PathError::NotStarted(self.path.clone()));
        }
        let handler = self
            .edge_handler
            .read()
            .clone()
            .ok_or_else(|| PathError::NoEdgeHandler(self.path.clone()))?;
        tracing::debug!(path = %self.path, remote_path = %edge.remote_path(), "Path edge announced");
        handler(edge);
        Ok(())
    }

    fn manager(&self) -> Result<Arc<PathElManager>, EdgeError> {
        self.manager.upgrade().ok_or(EdgeError::CreationFailure {
            cause: "path manager is gone".into(),
        })
    }
}

impl EdgeListener for PathEdgeListener {
    fn start(&self) -> Result<(), EdgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EdgeError::AlreadyStarted);
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Some(manager) = self.manager.upgrade() {
                manager.remove_path(&self.path);
            }
        }
    }

    fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn local_addresses(&self) -> Vec<TransportAddress> {
        let Some(manager) = self.manager.upgrade() else {
            return Vec::new();
        };
        manager
            .underlying()
            .local_addresses()
            .iter()
            .map(|ta| join_path(ta, &self.path))
            .collect()
    }

    fn create_edge_to(
        &self,
        remote: &TransportAddress,
    ) -> BoxFuture<'static, Result<EdgeRef, EdgeError>> {
        if !self.is_started() {
            return async { Err(EdgeError::NotStarted) }.boxed();
        }
        let manager = match self.manager() {
            Ok(manager) => manager,
            Err(error) => return async move { Err(error) }.boxed(),
        };
        let (base, remote_path) = split_path(remote);
        if self.path == ROOT && remote_path == ROOT {
            return manager.underlying().create_edge_to(&base);
        }
        let local_path = self.path.clone();
        async move {
            let edge = manager.underlying().create_edge_to(&base).await?;
            // the handshake response comes back through the manager
            edge.subscribe(manager.clone());
            let via = ReturnPath::Edge(edge.clone());
            let request = RpcRequest::PathingCreate {
                remote_path: local_path.clone(),
                local_path: remote_path.clone(),
            };
            match manager.rpc().call(&via, request).await {
                Ok(_) => {
                    let path_edge = PathEdge::new(edge, &local_path, &remote_path);
                    path_edge.subscribe_underlying();
                    Ok(path_edge as EdgeRef)
                }
                Err(error) => {
                    tracing::debug!(%base, %remote_path, %error, "Path handshake failed");
                    edge.close();
                    Err(EdgeError::CreationFailure {
                        cause: format!("path handshake with {base} failed: {error}").into(),
                    })
                }
            }
        }
        .boxed()
    }

    fn set_edge_handler(&self, handler: EdgeHandler) {
        *self.edge_handler.write() = Some(handler);
    }
}
