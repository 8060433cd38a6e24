//! Multiplexing of several logical listeners over one physical listener.
//!
//! Every logical listener owns a `/`-rooted path. An initiator binds a fresh
//! physical edge to a path on the remote side with a `sys:pathing.create`
//! call; the responder keeps the resulting [`PathEdge`] unannounced until the
//! first data payload arrives, and only then hands it to the path's listener.
//! A physical edge that carries data without any handshake is bound to the
//! root path.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::GlobalExecutor;
use crate::node::{
    rpc::{RpcFault, RpcHandler, RpcManager, RpcRequest, RpcService, RpcValue, SERVER_ERROR},
    DataHandler, PayloadType, ReturnPath,
};

use super::{Edge, EdgeError, EdgeId, EdgeListener, EdgeRef, TransportAddress};

mod edge;
mod listener;

pub use self::edge::PathEdge;
pub use self::listener::PathEdgeListener;

pub const ROOT: &str = "/";

/// How long a handshaken edge may wait for its first payload.
pub const UNANNOUNCED_GRACE: Duration = Duration::from_secs(5 * 60);

/// Period of the rpc timeout check and the unannounced sweep.
pub const CHECK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("Path already exists: {0}")]
    PathExists(String),
    #[error("no listener for path {0}")]
    UnknownPath(String),
    #[error("PathEdgeListener({0}) is not started")]
    NotStarted(String),
    #[error("PathEdgeListener({0}) has no edge handler")]
    NoEdgeHandler(String),
    #[error("path manager already started")]
    AlreadyStarted,
    #[error("path manager is stopped")]
    Stopped,
    #[error("payload did not arrive over a physical edge")]
    NotAnEdge,
    #[error(transparent)]
    Edge(#[from] EdgeError),
}

/// Appends `path` to the path of `ta`.
pub fn join_path(ta: &TransportAddress, path: &str) -> TransportAddress {
    let base = ta.path().strip_suffix('/').unwrap_or(ta.path());
    let path = path.strip_prefix('/').unwrap_or(path);
    ta.with_path(&format!("{base}/{path}"))
}

/// Splits `ta` into the address with a root path and its path. Inverse of
/// [`join_path`].
pub fn split_path(ta: &TransportAddress) -> (TransportAddress, String) {
    (ta.with_path(ROOT), ta.path().to_owned())
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

struct Unannounced {
    edge: Arc<PathEdge>,
    since: Instant,
}

#[derive(Default)]
struct ManagerInner {
    listeners: HashMap<String, Arc<PathEdgeListener>>,
    unannounced: HashMap<EdgeId, Unannounced>,
    edges: HashMap<EdgeId, EdgeRef>,
    check_task: Option<JoinHandle<()>>,
}

/// Owns the physical listener and demultiplexes its edges to path listeners.
pub struct PathElManager {
    underlying: Arc<dyn EdgeListener>,
    rpc: RpcManager,
    inner: Mutex<ManagerInner>,
    running: AtomicBool,
    this: Weak<PathElManager>,
}

impl PathElManager {
    pub fn new(underlying: Arc<dyn EdgeListener>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this: &Weak<PathElManager>| PathElManager {
            underlying: underlying.clone(),
            rpc: RpcManager::new(PayloadType::Pathing),
            inner: Mutex::new(ManagerInner::default()),
            running: AtomicBool::new(false),
            this: this.clone(),
        });
        manager
            .rpc
            .add_handler(RpcService::Pathing, Arc::new(PathingService(manager.this.clone())));
        let weak = manager.this.clone();
        underlying.set_edge_handler(Arc::new(move |edge| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_edge(edge);
            }
        }));
        manager
    }

    pub fn underlying(&self) -> &Arc<dyn EdgeListener> {
        &self.underlying
    }

    pub(crate) fn rpc(&self) -> &RpcManager {
        &self.rpc
    }

    pub fn start(&self) -> Result<(), PathError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PathError::AlreadyStarted);
        }
        if let Err(error) = self.underlying.start() {
            self.running.store(false, Ordering::SeqCst);
            return Err(error.into());
        }
        let manager = self.this.clone();
        let task = GlobalExecutor::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.running.load(Ordering::SeqCst) {
                    break;
                }
                manager.timeout_check(Instant::now());
            }
        });
        self.inner.lock().check_task = Some(task);
        tracing::info!(addresses = ?self.underlying.local_addresses(), "Path manager started");
        Ok(())
    }

    /// Closes every edge still waiting for its first payload and stops the
    /// physical listener.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let (pending, task) = {
            let mut inner = self.inner.lock();
            let pending: Vec<_> = inner.unannounced.drain().map(|(_, u)| u.edge).collect();
            (pending, inner.check_task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        for edge in pending {
            if !edge.close() {
                tracing::warn!(edge = %edge.id(), "Unannounced edge was already closed on shutdown");
            }
        }
        self.underlying.stop();
        tracing::info!("Path manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn create_path(&self, path: &str) -> Result<Arc<PathEdgeListener>, PathError> {
        let path = normalize(path);
        let mut inner = self.inner.lock();
        if inner.listeners.contains_key(&path) {
            return Err(PathError::PathExists(path));
        }
        let listener = Arc::new(PathEdgeListener::new(path.clone(), self.this.clone()));
        inner.listeners.insert(path, listener.clone());
        Ok(listener)
    }

    pub fn create_root_path(&self) -> Result<Arc<PathEdgeListener>, PathError> {
        self.create_path(ROOT)
    }

    /// The root path if it is free, otherwise a random unused one.
    pub fn create_unique_path(&self) -> Arc<PathEdgeListener> {
        let mut inner = self.inner.lock();
        let mut path = ROOT.to_owned();
        let mut rng = rand::thread_rng();
        while inner.listeners.contains_key(&path) {
            path = format!("/{}", rng.gen::<u32>());
        }
        let listener = Arc::new(PathEdgeListener::new(path.clone(), self.this.clone()));
        inner.listeners.insert(path, listener.clone());
        listener
    }

    /// Forgets `path` and stops its listener. Returns whether it existed.
    pub fn remove_path(&self, path: &str) -> bool {
        let removed = self.inner.lock().listeners.remove(&normalize(path));
        match removed {
            Some(listener) => {
                listener.stop();
                true
            }
            None => false,
        }
    }

    pub fn listener(&self, path: &str) -> Option<Arc<PathEdgeListener>> {
        self.inner.lock().listeners.get(&normalize(path)).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.inner.lock().listeners.keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    pub fn unannounced_count(&self) -> usize {
        self.inner.lock().unannounced.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.lock().edges.len()
    }

    /// Expires overdue rpc calls and reaps stale unannounced edges.
    pub fn timeout_check(&self, now: Instant) {
        self.rpc.timeout_check(now);
        let reaped = self.sweep_unannounced(now);
        if reaped > 0 {
            tracing::debug!(reaped, "Closed unannounced path edges");
        }
    }

    /// Closes and forgets every edge unannounced for longer than
    /// [`UNANNOUNCED_GRACE`]. Edges are closed outside the lock.
    pub fn sweep_unannounced(&self, now: Instant) -> usize {
        let stale: Vec<(EdgeId, Arc<PathEdge>)> = self
            .inner
            .lock()
            .unannounced
            .iter()
            .filter(|(_, u)| now.saturating_duration_since(u.since) > UNANNOUNCED_GRACE)
            .map(|(id, u)| (*id, u.edge.clone()))
            .collect();
        for (_, edge) in &stale {
            if !edge.close() {
                tracing::warn!(edge = %edge.id(), "Stale unannounced edge was already closed");
            }
        }
        let mut inner = self.inner.lock();
        for (id, _) in &stale {
            inner.unannounced.remove(id);
        }
        stale.len()
    }

    fn handle_edge(&self, edge: EdgeRef) {
        let manager = self.this.clone();
        let watched = edge.on_close(Box::new(move |id| {
            if let Some(manager) = manager.upgrade() {
                manager.forget_edge(id);
            }
        }));
        if watched.is_none() {
            return;
        }
        self.inner.lock().edges.insert(edge.id(), edge.clone());
        if let Some(this) = self.this.upgrade() {
            edge.subscribe(this);
        }
    }

    fn forget_edge(&self, id: EdgeId) {
        let mut inner = self.inner.lock();
        inner.edges.remove(&id);
        inner.unannounced.remove(&id);
    }

    fn accept_path(
        &self,
        caller: &ReturnPath,
        remote_path: String,
        local_path: String,
    ) -> Result<RpcValue, RpcFault> {
        let edge = caller
            .as_edge()
            .ok_or_else(|| RpcFault::new(SERVER_ERROR, PathError::NotAnEdge.to_string()))?;
        if !self.is_running() {
            return Err(RpcFault::new(SERVER_ERROR, PathError::Stopped.to_string()));
        }
        let listener = self.inner.lock().listeners.get(&local_path).cloned();
        if !listener.is_some_and(|listener| listener.is_started()) {
            return Err(RpcFault::new(
                SERVER_ERROR,
                PathError::NotStarted(local_path).to_string(),
            ));
        }
        let path_edge = PathEdge::new(edge.clone(), &local_path, &remote_path);
        {
            // stop() clears the flag before it drains
            let mut inner = self.inner.lock();
            if !self.is_running() {
                return Err(RpcFault::new(SERVER_ERROR, PathError::Stopped.to_string()));
            }
            inner.unannounced.insert(
                edge.id(),
                Unannounced {
                    edge: path_edge,
                    since: Instant::now(),
                },
            );
        }
        tracing::debug!(edge = %edge.id(), %local_path, %remote_path, "Path edge awaiting first payload");
        Ok(RpcValue::Bool(true))
    }

    /// Binds the physical edge to its path edge and announces it. The path
    /// edge takes over the physical edge before the announcement, so payloads
    /// sent while the listener's handler runs queue up behind `payload`.
    fn promote(
        &self,
        edge: &EdgeRef,
        payload: Bytes,
        path_edge: &mut Option<Arc<PathEdge>>,
    ) -> Result<(), PathError> {
        let pending = self.inner.lock().unannounced.remove(&edge.id());
        let bound = match pending {
            Some(unannounced) => unannounced.edge,
            None => {
                tracing::debug!(edge = %edge.id(), "No path handshake, binding to the root path");
                PathEdge::new(edge.clone(), ROOT, ROOT)
            }
        };
        *path_edge = Some(bound.clone());
        let listener = self
            .inner
            .lock()
            .listeners
            .get(bound.local_path())
            .cloned()
            .ok_or_else(|| PathError::UnknownPath(bound.local_path().to_owned()))?;
        bound.receive(payload);
        bound.subscribe_underlying();
        listener.announce(bound)
    }
}

impl DataHandler for PathElManager {
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        let tag = payload.first().and_then(|tag| PayloadType::try_from(*tag).ok());
        if matches!(tag, Some(PayloadType::Pathing | PayloadType::Rpc)) {
            return Ok(self.rpc.receive(&payload[1..], from)?);
        }
        let edge = from.as_edge().ok_or(PathError::NotAnEdge)?;
        let mut path_edge = None;
        if let Err(error) = self.promote(edge, payload, &mut path_edge) {
            tracing::warn!(edge = %edge.id(), %error, "Failed announcing path edge");
            match path_edge {
                Some(path_edge) => path_edge.close(),
                None => edge.close(),
            };
        }
        Ok(())
    }
}

struct PathingService(Weak<PathElManager>);

impl RpcHandler for PathingService {
    fn handle_rpc(&self, caller: &ReturnPath, request: RpcRequest) -> Result<RpcValue, RpcFault> {
        let manager = self
            .0
            .upgrade()
            .ok_or_else(|| RpcFault::new(SERVER_ERROR, "path manager is gone"))?;
        match request {
            RpcRequest::PathingCreate {
                remote_path,
                local_path,
            } => manager.accept_path(caller, remote_path, local_path),
            other => Err(RpcFault::method_not_found(other.method())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::in_memory::{MemoryEdge, MemoryNetwork};

    #[test]
    fn join_and_split_round_trip() {
        for raw in [
            "ringlink.mem://host/",
            "ringlink.mem://host/a",
            "udp://10.0.0.1:1500/overlay/one",
            "udp://10.0.0.1:1500/trailing/",
            "udp://10.0.0.1:1500//double",
        ] {
            let ta: TransportAddress = raw.parse().unwrap();
            let (base, path) = split_path(&ta);
            assert_eq!(base.path(), ROOT);
            assert_eq!(join_path(&base, &path), ta, "round trip of {raw}");
        }
    }

    #[tokio::test]
    async fn stopped_manager_rejects_handshakes() {
        let network = MemoryNetwork::new();
        let manager = PathElManager::new(network.listener("b"));
        let listener = manager.create_path("/alpha").unwrap();
        listener.start().unwrap();
        manager.start().unwrap();
        manager.stop();

        let (_near, far) = MemoryEdge::pair(
            TransportAddress::new("ringlink.mem", "a"),
            TransportAddress::new("ringlink.mem", "b"),
        );
        let caller = ReturnPath::Edge(far.clone());
        let fault = manager
            .accept_path(&caller, "/alpha".into(), "/alpha".into())
            .unwrap_err();
        assert_eq!(fault.code, SERVER_ERROR);
        assert_eq!(fault.message, PathError::Stopped.to_string());
        assert_eq!(manager.unannounced_count(), 0);
        assert!(!far.is_closed());
    }

    #[test]
    fn join_handles_slashes() {
        let ta: TransportAddress = "udp://h:1/base/".parse().unwrap();
        assert_eq!(join_path(&ta, "/sub").to_string(), "udp://h:1/base/sub");
        assert_eq!(join_path(&ta, "sub").to_string(), "udp://h:1/base/sub");
    }
}
