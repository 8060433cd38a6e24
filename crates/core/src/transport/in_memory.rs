//! In-memory transport for tests and local simulations.
//!
//! Listeners register under their authority in a [`MemoryNetwork`]; networks
//! are independent of each other so concurrently running tests never see each
//! other's listeners. Sending on a [`MemoryEdge`] hands the payload straight to
//! the peer edge's handler on the calling thread.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Instant,
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use super::{
    CloseCallback, CloseListenerId, Edge, EdgeError, EdgeHandler, EdgeId, EdgeLifecycle,
    EdgeListener, EdgeRef, TransportAddress,
};
use crate::node::{DataHandler, ReturnPath};

pub const MEMORY_SCHEME: &str = "ringlink.mem";

/// A registry of in-memory listeners which can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, Weak<MemoryEdgeListener>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a listener reachable at `ringlink.mem://{authority}/` once started.
    pub fn listener(&self, authority: &str) -> Arc<MemoryEdgeListener> {
        Arc::new_cyclic(|this| MemoryEdgeListener {
            network: self.clone(),
            local: TransportAddress::new(MEMORY_SCHEME, authority),
            started: AtomicBool::new(false),
            edge_handler: RwLock::new(None),
            this: this.clone(),
        })
    }

    fn lookup(&self, authority: &str) -> Option<Arc<MemoryEdgeListener>> {
        self.listeners
            .get(authority)
            .and_then(|listener| listener.upgrade())
    }
}

pub struct MemoryEdgeListener {
    network: MemoryNetwork,
    local: TransportAddress,
    started: AtomicBool,
    edge_handler: RwLock<Option<EdgeHandler>>,
    this: Weak<MemoryEdgeListener>,
}

impl MemoryEdgeListener {
    pub fn address(&self) -> &TransportAddress {
        &self.local
    }

    fn accept(&self, edge: EdgeRef) -> Result<(), EdgeError> {
        let handler = self.edge_handler.read().clone();
        match handler {
            Some(handler) => {
                handler(edge);
                Ok(())
            }
            None => {
                edge.close();
                Err(EdgeError::Unreachable(self.local.clone()))
            }
        }
    }
}

impl EdgeListener for MemoryEdgeListener {
    fn start(&self) -> Result<(), EdgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EdgeError::AlreadyStarted);
        }
        self.network
            .listeners
            .insert(self.local.authority().to_owned(), self.this.clone());
        tracing::debug!(address = %self.local, "In-memory listener started");
        Ok(())
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.network.listeners.remove(self.local.authority());
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn local_addresses(&self) -> Vec<TransportAddress> {
        vec![self.local.clone()]
    }

    fn create_edge_to(
        &self,
        remote: &TransportAddress,
    ) -> BoxFuture<'static, Result<EdgeRef, EdgeError>> {
        let result = (|| {
            if !self.is_started() {
                return Err(EdgeError::NotStarted);
            }
            let target = self
                .network
                .lookup(remote.authority())
                .filter(|listener| listener.is_started())
                .ok_or_else(|| EdgeError::Unreachable(remote.clone()))?;
            let (outbound, inbound) =
                MemoryEdge::pair(self.local.clone(), target.local.clone());
            target.accept(inbound)?;
            tracing::trace!(from = %self.local, to = %remote, "In-memory edge established");
            Ok(outbound as EdgeRef)
        })();
        async move { result }.boxed()
    }

    fn set_edge_handler(&self, handler: EdgeHandler) {
        *self.edge_handler.write() = Some(handler);
    }
}

/// One side of an in-memory link.
pub struct MemoryEdge {
    lifecycle: EdgeLifecycle,
    local: TransportAddress,
    remote: TransportAddress,
    inbound: bool,
    peer: OnceLock<Weak<MemoryEdge>>,
    this: Weak<MemoryEdge>,
}

impl MemoryEdge {
    /// Returns a connected `(outbound, inbound)` pair of edges.
    pub fn pair(
        initiator: TransportAddress,
        acceptor: TransportAddress,
    ) -> (Arc<MemoryEdge>, Arc<MemoryEdge>) {
        let outbound = Self::new(initiator.clone(), acceptor.clone(), false);
        let inbound = Self::new(acceptor, initiator, true);
        let _ = outbound.peer.set(Arc::downgrade(&inbound));
        let _ = inbound.peer.set(Arc::downgrade(&outbound));
        (outbound, inbound)
    }

    fn new(local: TransportAddress, remote: TransportAddress, inbound: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| MemoryEdge {
            lifecycle: EdgeLifecycle::new(),
            local,
            remote,
            inbound,
            peer: OnceLock::new(),
            this: this.clone(),
        })
    }

    fn receive(&self, payload: Bytes) {
        if let Some(this) = self.this.upgrade() {
            self.lifecycle.deliver(payload, ReturnPath::Edge(this));
        }
    }

    fn peer(&self) -> Option<Arc<MemoryEdge>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

impl Edge for MemoryEdge {
    fn id(&self) -> EdgeId {
        self.lifecycle.id()
    }

    fn send(&self, payload: Bytes) -> Result<(), EdgeError> {
        if self.lifecycle.is_closed() {
            return Err(EdgeError::Closed(self.id()));
        }
        let peer = self
            .peer()
            .filter(|peer| !peer.is_closed())
            .ok_or(EdgeError::Closed(self.id()))?;
        peer.receive(payload);
        Ok(())
    }

    fn close(&self) -> bool {
        let Some(callbacks) = self.lifecycle.begin_close() else {
            return false;
        };
        if let Some(peer) = self.peer() {
            peer.close();
        }
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
        self.local.clone()
    }

    fn remote_address(&self) -> TransportAddress {
        self.remote.clone()
    }

    fn is_inbound(&self) -> bool {
        self.inbound
    }

    fn created_at(&self) -> Instant {
        self.lifecycle.created_at()
    }
}

impl std::fmt::Debug for MemoryEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEdge")
            .field("id", &self.id())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("inbound", &self.inbound)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::Mutex;

    use super::*;

    /// Records every payload delivered to it.
    #[derive(Default)]
    pub struct Recorder {
        pub received: Mutex<Vec<Bytes>>,
    }

    impl DataHandler for Recorder {
        fn handle_data(&self, payload: Bytes, _from: &ReturnPath) -> anyhow::Result<()> {
            self.received.lock().push(payload);
            Ok(())
        }
    }

    /// A started listener pair on a fresh network, with accepted edges
    /// collected in the returned vector.
    pub fn listener_pair() -> (
        Arc<MemoryEdgeListener>,
        Arc<MemoryEdgeListener>,
        Arc<Mutex<Vec<EdgeRef>>>,
    ) {
        let network = MemoryNetwork::new();
        let a = network.listener("a");
        let b = network.listener("b");
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        b.set_edge_handler(Arc::new(move |edge| sink.lock().push(edge)));
        a.start().unwrap();
        b.start().unwrap();
        (a, b, accepted)
    }
}
