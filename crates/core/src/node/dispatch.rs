//! Demultiplexing of inbound payloads by their leading type tag.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use super::ReturnPath;

/// Tag carried in the first byte of every payload exchanged between nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum PayloadType {
    Connection = 1,
    Forwarding = 2,
    Pathing = 3,
    Rpc = 4,
    Data = 5,
}

impl PayloadType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// `payload` prefixed with this type's tag.
    pub fn encode(self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_u8(self.tag());
        buf.put_slice(payload);
        buf.freeze()
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = DispatchError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => PayloadType::Connection,
            2 => PayloadType::Forwarding,
            3 => PayloadType::Pathing,
            4 => PayloadType::Rpc,
            5 => PayloadType::Data,
            other => return Err(DispatchError::UnknownType(other)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("empty payload")]
    Empty,
    #[error("unknown payload type {0}")]
    UnknownType(u8),
    #[error("no handler subscribed for {0:?}")]
    NoHandler(PayloadType),
}

/// Receives payloads from an edge or from the [`Dispatcher`].
pub trait DataHandler: Send + Sync {
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(u64);

/// Routes each payload to every handler subscribed to its type, with the tag
/// stripped.
#[derive(Default)]
pub struct Dispatcher {
    handlers: DashMap<PayloadType, Vec<(SubscriptionId, Arc<dyn DataHandler>)>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, ptype: PayloadType, handler: Arc<dyn DataHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.entry(ptype).or_default().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, ptype: PayloadType, id: SubscriptionId) -> bool {
        let Some(mut handlers) = self.handlers.get_mut(&ptype) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self, ptype: PayloadType) -> usize {
        self.handlers.get(&ptype).map(|h| h.len()).unwrap_or(0)
    }

    pub fn announce(&self, payload: Bytes, from: &ReturnPath) -> Result<(), DispatchError> {
        let tag = *payload.first().ok_or(DispatchError::Empty)?;
        let ptype = PayloadType::try_from(tag)?;
        // snapshot so handlers may (un)subscribe while being called
        let handlers: Vec<_> = self
            .handlers
            .get(&ptype)
            .map(|h| h.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            return Err(DispatchError::NoHandler(ptype));
        }
        let body = payload.slice(1..);
        for handler in handlers {
            if let Err(error) = handler.handle_data(body.clone(), from) {
                tracing::debug!(?ptype, %from, %error, "Handler failed processing payload");
            }
        }
        Ok(())
    }
}

impl DataHandler for Dispatcher {
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        Ok(self.announce(payload, from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::in_memory::{test_support::Recorder, MemoryEdge};
    use crate::transport::TransportAddress;

    fn return_path() -> ReturnPath {
        let (edge, _peer) = MemoryEdge::pair(
            TransportAddress::new("ringlink.mem", "a"),
            TransportAddress::new("ringlink.mem", "b"),
        );
        ReturnPath::Edge(edge)
    }

    #[test]
    fn strips_tag_and_fans_out() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        dispatcher.subscribe(PayloadType::Connection, first.clone());
        dispatcher.subscribe(PayloadType::Connection, second.clone());

        let packet = PayloadType::Connection.encode(b"hello");
        dispatcher.announce(packet, &return_path()).unwrap();
        assert_eq!(first.received.lock()[0], Bytes::from_static(b"hello"));
        assert_eq!(second.received.lock().len(), 1);
    }

    #[test]
    fn unsubscribed_handler_is_skipped() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        let id = dispatcher.subscribe(PayloadType::Rpc, recorder.clone());
        assert!(dispatcher.unsubscribe(PayloadType::Rpc, id));
        assert!(matches!(
            dispatcher.announce(PayloadType::Rpc.encode(b"x"), &return_path()),
            Err(DispatchError::NoHandler(PayloadType::Rpc))
        ));
        assert!(recorder.received.lock().is_empty());
    }

    #[test]
    fn rejects_unknown_tags() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.announce(Bytes::from_static(&[0xEE, 1]), &return_path()),
            Err(DispatchError::UnknownType(0xEE))
        ));
        assert!(matches!(
            dispatcher.announce(Bytes::new(), &return_path()),
            Err(DispatchError::Empty)
        ));
    }
}
