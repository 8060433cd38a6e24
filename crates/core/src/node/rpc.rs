//! Minimal request/response layer used for the node's system services.
//!
//! Calls travel as bincode envelopes behind a single payload tag. Method names
//! stay textual on the wire (`sys:pathing.create`, `sys:link.Close`) and are
//! decoded into [`RpcRequest`] before reaching a handler, so handlers never
//! deal with untyped arguments.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{
    dispatch::{DataHandler, PayloadType},
    heartbeat::HeartbeatHandler,
    ReturnPath, SendError, Sender,
};

pub const PATHING_CREATE: &str = "sys:pathing.create";
pub const LINK_CLOSE: &str = "sys:link.Close";

/// Fault code for calls nobody can answer.
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
/// Fault code for handler side failures.
pub const SERVER_ERROR: i32 = -32000;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Str(String),
    Map(BTreeMap<String, String>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc fault {code}: {message}")]
pub struct RpcFault {
    pub code: i32,
    pub message: String,
}

impl RpcFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("No Handler for method: {method}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Fault(#[from] RpcFault),
    #[error("rpc call timed out")]
    Timeout,
    #[error("rpc call abandoned before a result arrived")]
    Cancelled,
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("rpc codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RpcService {
    Pathing,
    Link,
}

/// Every call the node knows how to make or answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcRequest {
    /// Asks the receiver to bind the calling edge to `local_path` on its side;
    /// `remote_path` is the caller's own path.
    PathingCreate {
        remote_path: String,
        local_path: String,
    },
    /// Tells the receiver the link is going away.
    LinkClose { reason: Option<String> },
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::PathingCreate { .. } => PATHING_CREATE,
            RpcRequest::LinkClose { .. } => LINK_CLOSE,
        }
    }

    pub fn service(&self) -> RpcService {
        match self {
            RpcRequest::PathingCreate { .. } => RpcService::Pathing,
            RpcRequest::LinkClose { .. } => RpcService::Link,
        }
    }

    fn into_args(self) -> Vec<RpcValue> {
        match self {
            RpcRequest::PathingCreate {
                remote_path,
                local_path,
            } => vec![RpcValue::Str(remote_path), RpcValue::Str(local_path)],
            RpcRequest::LinkClose { reason } => {
                let mut map = BTreeMap::new();
                if let Some(reason) = reason {
                    map.insert("reason".to_owned(), reason);
                }
                vec![RpcValue::Map(map)]
            }
        }
    }

    fn decode(method: &str, args: Vec<RpcValue>) -> Result<Self, RpcFault> {
        let invalid = || RpcFault::new(INVALID_PARAMS, format!("Invalid params for {method}"));
        match method {
            PATHING_CREATE => {
                let mut args = args.into_iter();
                match (args.next(), args.next()) {
                    (Some(RpcValue::Str(remote_path)), Some(RpcValue::Str(local_path))) => {
                        Ok(RpcRequest::PathingCreate {
                            remote_path,
                            local_path,
                        })
                    }
                    _ => Err(invalid()),
                }
            }
            LINK_CLOSE => match args.into_iter().next() {
                None | Some(RpcValue::Null) => Ok(RpcRequest::LinkClose { reason: None }),
                Some(RpcValue::Map(mut map)) => Ok(RpcRequest::LinkClose {
                    reason: map.remove("reason").filter(|r| !r.is_empty()),
                }),
                Some(_) => Err(invalid()),
            },
            other => Err(RpcFault::method_not_found(other)),
        }
    }
}

/// Serves the calls of one [`RpcService`].
pub trait RpcHandler: Send + Sync {
    fn handle_rpc(&self, caller: &ReturnPath, request: RpcRequest) -> Result<RpcValue, RpcFault>;
}

#[derive(Serialize, Deserialize, Debug)]
enum RpcEnvelope {
    Request {
        id: u32,
        method: String,
        args: Vec<RpcValue>,
    },
    Response {
        id: u32,
        result: Result<RpcValue, RpcFault>,
    },
}

struct PendingCall {
    deadline: Instant,
    method: &'static str,
    reply: oneshot::Sender<Result<RpcValue, RpcError>>,
}

/// Resolves with the outcome of one call, exactly once.
#[must_use]
pub struct PendingReply(oneshot::Receiver<Result<RpcValue, RpcError>>);

impl Future for PendingReply {
    type Output = Result<RpcValue, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(RpcError::Cancelled)))
    }
}

pub struct RpcManager {
    tag: PayloadType,
    timeout: Duration,
    next_id: AtomicU32,
    pending: DashMap<u32, PendingCall>,
    handlers: RwLock<HashMap<RpcService, Arc<dyn RpcHandler>>>,
}

impl RpcManager {
    /// A manager whose envelopes are prefixed with `tag`.
    pub fn new(tag: PayloadType) -> Self {
        Self::with_timeout(tag, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(tag: PayloadType, timeout: Duration) -> Self {
        Self {
            tag,
            timeout,
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn tag(&self) -> PayloadType {
        self.tag
    }

    pub fn add_handler(&self, service: RpcService, handler: Arc<dyn RpcHandler>) {
        self.handlers.write().insert(service, handler);
    }

    pub fn remove_handler(&self, service: RpcService) -> bool {
        self.handlers.write().remove(&service).is_some()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Sends `request` through `via`. Fails right away when the request
    /// cannot be written; otherwise the returned reply resolves with the
    /// response, a fault, or a timeout.
    pub fn invoke(&self, via: &dyn Sender, request: RpcRequest) -> Result<PendingReply, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = request.method();
        let envelope = RpcEnvelope::Request {
            id,
            method: method.to_owned(),
            args: request.into_args(),
        };
        let encoded = bincode::serialize(&envelope)?;
        let (reply, rx) = oneshot::channel();
        // registered before sending, the response may arrive on this thread
        self.pending.insert(
            id,
            PendingCall {
                deadline: Instant::now() + self.timeout,
                method,
                reply,
            },
        );
        if let Err(error) = via.send(self.tag.encode(&encoded)) {
            self.pending.remove(&id);
            return Err(error.into());
        }
        tracing::trace!(id, method, to = ?via, "Rpc call sent");
        Ok(PendingReply(rx))
    }

    pub async fn call(&self, via: &dyn Sender, request: RpcRequest) -> Result<RpcValue, RpcError> {
        self.invoke(via, request)?.await
    }

    /// Handles one envelope, `payload` being everything after the tag.
    pub fn receive(&self, payload: &[u8], from: &ReturnPath) -> Result<(), RpcError> {
        match bincode::deserialize::<RpcEnvelope>(payload)? {
            RpcEnvelope::Request { id, method, args } => {
                let result = self.serve(&method, args, from);
                if let Err(fault) = &result {
                    tracing::debug!(id, %method, %fault, "Rpc call faulted");
                }
                let response = bincode::serialize(&RpcEnvelope::Response { id, result })?;
                from.send(self.tag.encode(&response))?;
            }
            RpcEnvelope::Response { id, result } => match self.pending.remove(&id) {
                Some((_, call)) => {
                    let _ = call.reply.send(result.map_err(RpcError::Fault));
                }
                None => tracing::debug!(id, %from, "Response for unknown or expired rpc call"),
            },
        }
        Ok(())
    }

    fn serve(
        &self,
        method: &str,
        args: Vec<RpcValue>,
        from: &ReturnPath,
    ) -> Result<RpcValue, RpcFault> {
        let request = RpcRequest::decode(method, args)?;
        let handler = self
            .handlers
            .read()
            .get(&request.service())
            .cloned()
            .ok_or_else(|| RpcFault::method_not_found(method))?;
        handler.handle_rpc(from, request)
    }

    /// Fails every call whose deadline passed. Returns how many expired.
    pub fn timeout_check(&self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|call| call.deadline <= now)
            .map(|call| *call.key())
            .collect();
        let mut count = 0;
        for id in expired {
            if let Some((_, call)) = self.pending.remove(&id) {
                tracing::debug!(id, method = call.method, "Rpc call timed out");
                let _ = call.reply.send(Err(RpcError::Timeout));
                count += 1;
            }
        }
        count
    }
}

impl DataHandler for RpcManager {
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        Ok(self.receive(&payload, from)?)
    }
}

impl HeartbeatHandler for RpcManager {
    fn on_heartbeat(&self, now: Instant) {
        self.timeout_check(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::in_memory::MemoryEdge;
    use crate::transport::{Edge, EdgeRef, TransportAddress};

    struct Echo;

    impl RpcHandler for Echo {
        fn handle_rpc(&self, _caller: &ReturnPath, request: RpcRequest) -> Result<RpcValue, RpcFault> {
            match request {
                RpcRequest::LinkClose { reason } => Ok(RpcValue::Str(reason.unwrap_or_default())),
                other => Err(RpcFault::method_not_found(other.method())),
            }
        }
    }

    /// Two managers wired back to back over an in-memory edge pair.
    fn wired(timeout: Duration) -> (Arc<RpcManager>, Arc<RpcManager>, EdgeRef) {
        let (near, far) = MemoryEdge::pair(
            TransportAddress::new("ringlink.mem", "near"),
            TransportAddress::new("ringlink.mem", "far"),
        );
        let caller = Arc::new(RpcManager::with_timeout(PayloadType::Rpc, timeout));
        let callee = Arc::new(RpcManager::with_timeout(PayloadType::Rpc, timeout));
        near.subscribe(Arc::new(Untag(caller.clone())));
        far.subscribe(Arc::new(Untag(callee.clone())));
        (caller, callee, near as EdgeRef)
    }

    struct Untag(Arc<RpcManager>);

    impl DataHandler for Untag {
        fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
            Ok(self.0.receive(&payload[1..], from)?)
        }
    }

    #[tokio::test]
    async fn round_trip() -> testresult::TestResult {
        let (caller, callee, edge) = wired(DEFAULT_RPC_TIMEOUT);
        callee.add_handler(RpcService::Link, Arc::new(Echo));
        let result = caller
            .call(
                &ReturnPath::Edge(edge),
                RpcRequest::LinkClose {
                    reason: Some("bye".into()),
                },
            )
            .await?;
        assert_eq!(result, RpcValue::Str("bye".into()));
        assert_eq!(caller.pending_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_service_faults() {
        let (caller, _callee, edge) = wired(DEFAULT_RPC_TIMEOUT);
        let result = caller
            .call(
                &ReturnPath::Edge(edge),
                RpcRequest::PathingCreate {
                    remote_path: "/a".into(),
                    local_path: "/b".into(),
                },
            )
            .await;
        match result {
            Err(RpcError::Fault(fault)) => {
                assert_eq!(fault.code, METHOD_NOT_FOUND);
                assert_eq!(fault.message, "No Handler for method: sys:pathing.create");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_method_decodes_to_fault() {
        let fault = RpcRequest::decode("sys:pathing.destroy", vec![]).unwrap_err();
        assert_eq!(fault.code, METHOD_NOT_FOUND);
        assert!(fault.message.ends_with("sys:pathing.destroy"));
    }

    #[test]
    fn link_close_reason_is_optional() {
        let args = RpcRequest::LinkClose { reason: None }.into_args();
        assert_eq!(
            RpcRequest::decode(LINK_CLOSE, args).unwrap(),
            RpcRequest::LinkClose { reason: None }
        );
    }

    #[derive(Debug)]
    struct Blackhole;

    impl Sender for Blackhole {
        fn send(&self, _payload: Bytes) -> Result<(), SendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn expired_calls_time_out() {
        let manager = RpcManager::with_timeout(PayloadType::Rpc, Duration::from_millis(10));
        let reply = manager
            .invoke(&Blackhole, RpcRequest::LinkClose { reason: None })
            .unwrap();
        assert_eq!(manager.timeout_check(Instant::now()), 0);
        assert_eq!(
            manager.timeout_check(Instant::now() + Duration::from_secs(1)),
            1
        );
        assert!(matches!(reply.await, Err(RpcError::Timeout)));
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn send_failure_is_immediate() {
        let (caller, _callee, edge) = wired(DEFAULT_RPC_TIMEOUT);
        edge.close();
        let result = caller.invoke(
            &ReturnPath::Edge(edge),
            RpcRequest::LinkClose { reason: None },
        );
        assert!(matches!(result, Err(RpcError::Send(_))));
        assert_eq!(caller.pending_calls(), 0);
    }
}
