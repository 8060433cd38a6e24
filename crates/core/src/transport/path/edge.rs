use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use bytes::Bytes;
use parking_lot::Mutex;

use super::join_path;
use crate::node::{DataHandler, ReturnPath};
use crate::transport::{
    CloseCallback, CloseListenerId, Edge, EdgeError, EdgeId, EdgeLifecycle, EdgeRef,
    TransportAddress,
};

/// A logical edge bound to one path on each side, carried by a physical edge.
///
/// Closing either one closes the other.
pub struct PathEdge {
    lifecycle: EdgeLifecycle,
    underlying: EdgeRef,
    local_path: String,
    remote_path: String,
    underlying_listener: Mutex<Option<CloseListenerId>>,
    this: Weak<PathEdge>,
}

impl PathEdge {
    pub(crate) fn new(underlying: EdgeRef, local_path: &str, remote_path: &str) -> Arc<Self> {
        let edge = Arc::new_cyclic(|this| PathEdge {
            lifecycle: EdgeLifecycle::new(),
            underlying: underlying.clone(),
            local_path: local_path.to_owned(),
            remote_path: remote_path.to_owned(),
            underlying_listener: Mutex::new(None),
            this: this.clone(),
        });
        let weak = Arc::downgrade(&edge);
        let listener = underlying.on_close(Box::new(move |_| {
            if let Some(edge) = weak.upgrade() {
                edge.close();
            }
        }));
        match listener {
            Some(listener) => *edge.underlying_listener.lock() = Some(listener),
            None => {
                edge.close();
            }
        }
        edge
    }

    pub fn local_path(&self) -> &str {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn underlying(&self) -> &EdgeRef {
        &self.underlying
    }

    /// Routes everything the physical edge receives into this edge.
    pub(crate) fn subscribe_underlying(self: &Arc<Self>) {
        self.underlying.subscribe(self.clone());
    }

    pub(crate) fn receive(&self, payload: Bytes) {
        if let Some(this) = self.this.upgrade() {
            self.lifecycle.deliver(payload, ReturnPath::Edge(this));
        }
    }
}

impl DataHandler for PathEdge {
    fn handle_data(&self, payload: Bytes, _from: &ReturnPath) -> anyhow::Result<()> {
        self.receive(payload);
        Ok(())
    }
}

impl Edge for PathEdge {
    fn id(&self) -> EdgeId {
        self.lifecycle.id()
    }

    fn send(&self, payload: Bytes) -> Result<(), EdgeError> {
        if self.lifecycle.is_closed() {
            return Err(EdgeError::Closed(self.id()));
        }
        self.underlying.send(payload)
    }

    fn close(&self) -> bool {
        let Some(callbacks) = self.lifecycle.begin_close() else {
            return false;
        };
        if let Some(listener) = self.underlying_listener.lock().take() {
            self.underlying.remove_close_listener(listener);
        }
        self.underlying.close();
        tracing::trace!(edge = %self.id(), path = %self.local_path, "Path edge closed");
        callbacks.fire();
        true
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    fn on_close(&self, callback: CloseCallback) -> Option<CloseListenerId> {
        self.lifecycle.on_close(callback)
    }

    fn remove_close_listener(&self, listener: CloseListenerId) -> bool {
        self.lifecycle.remove_close_listener(listener)
    }

    fn subscribe(&self, handler: Arc<dyn DataHandler>) {
        self.lifecycle.subscribe(handler)
    }

    fn unsubscribe(&self) {
        self.lifecycle.unsubscribe()
    }

    fn local_address(&self) -> TransportAddress {
        join_path(&self.underlying.local_address(), &self.local_path)
    }

    fn remote_address(&self) -> TransportAddress {
        join_path(&self.underlying.remote_address(), &self.remote_path)
    }

    fn is_inbound(&self) -> bool {
        self.underlying.is_inbound()
    }

    fn created_at(&self) -> Instant {
        self.lifecycle.created_at()
    }
}

impl std::fmt::Debug for PathEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathEdge")
            .field("id", &self.id())
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .field("underlying", &self.underlying.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::in_memory::MemoryEdge;

    fn pair() -> (Arc<MemoryEdge>, Arc<MemoryEdge>) {
        MemoryEdge::pair(
            TransportAddress::new("ringlink.mem", "a"),
            TransportAddress::new("ringlink.mem", "b"),
        )
    }

    #[test]
    fn close_propagates_both_ways() {
        let (near, _far) = pair();
        let path_edge = PathEdge::new(near.clone(), "/x", "/y");
        assert!(path_edge.close());
        assert!(near.is_closed());

        let (near, _far) = pair();
        let path_edge = PathEdge::new(near.clone(), "/x", "/y");
        assert!(near.close());
        assert!(path_edge.is_closed());
        assert!(!path_edge.close());
    }

    #[test]
    fn addresses_carry_paths() {
        let (near, _far) = pair();
        let path_edge = PathEdge::new(near, "/local", "/remote");
        assert_eq!(
            path_edge.local_address().to_string(),
            "ringlink.mem://a/local"
        );
        assert_eq!(
            path_edge.remote_address().to_string(),
            "ringlink.mem://b/remote"
        );
    }

    #[test]
    fn wrapping_a_closed_edge_yields_closed_edge() {
        let (near, _far) = pair();
        near.close();
        let path_edge = PathEdge::new(near, "/", "/");
        assert!(path_edge.is_closed());
    }
}
