//! Two hop relaying through an intermediate node.
//!
//! `A` asks `B` to relay a payload to `C` by routing `[FORWARDING][0][C][inner]`
//! to `B`. `B` routes `[FORWARDING][1][A][inner]` on to `C`, which dispatches
//! `inner` locally with a [`ForwardingSender`] as the return path, so whatever
//! `C` answers travels back through `B` the same way.

use std::{
    fmt::Display,
    hash::{Hash, Hasher},
    sync::Arc,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::node::{
    DataHandler, DispatchError, Dispatcher, PayloadType, ReturnPath, RoutedSender, Router,
    SendError, Sender,
};
use crate::ring::{Address, AddressError};

/// Leg from the origin to the relay.
pub const FIRST_LEG: u8 = 0;
/// Leg from the relay to the destination.
pub const SECOND_LEG: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("empty forwarding payload")]
    Empty,
    #[error("unknown forwarding leg {0}")]
    UnknownLeg(u8),
    #[error("forwarded payload arrived over {0}, which has no routed origin")]
    UnsupportedReturnPath(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

fn encode(leg: u8, address: &Address, inner: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + Address::MEM_SIZE + inner.len());
    buf.put_u8(PayloadType::Forwarding.tag());
    buf.put_u8(leg);
    buf.put_slice(address.as_bytes());
    buf.put_slice(inner);
    buf.freeze()
}

/// Sends through a relay to a fixed destination, wrapping every payload as a
/// first leg forward.
#[derive(Clone, Debug)]
pub struct ForwardingSender {
    via: RoutedSender,
    destination: Address,
}

impl ForwardingSender {
    /// `via` routes to the relay, `destination` is where the relay delivers.
    pub fn new(via: RoutedSender, destination: Address) -> Self {
        Self { via, destination }
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn relay(&self) -> &Address {
        self.via.destination()
    }
}

impl Sender for ForwardingSender {
    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        self.via
            .send(encode(FIRST_LEG, &self.destination, &payload))
    }
}

// interchangeable as long as they end up at the same node
impl PartialEq for ForwardingSender {
    fn eq(&self, other: &Self) -> bool {
        self.destination == other.destination
    }
}

impl Eq for ForwardingSender {}

impl Hash for ForwardingSender {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.destination.hash(state);
    }
}

impl Display for ForwardingSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ForwardingSender({} -> {})",
            self.via.destination(),
            self.destination
        )
    }
}

/// Handles payloads tagged [`PayloadType::Forwarding`].
pub struct PacketForwarder {
    local: Address,
    router: Arc<dyn Router>,
    dispatcher: Arc<Dispatcher>,
}

impl PacketForwarder {
    pub fn new(local: Address, router: Arc<dyn Router>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            local,
            router,
            dispatcher,
        }
    }

    /// A sender reaching `destination` through `relay`.
    pub fn sender_via(&self, relay: Address, destination: Address) -> ForwardingSender {
        ForwardingSender::new(
            RoutedSender::new(self.router.clone(), self.local, relay),
            destination,
        )
    }

    /// `body` is the payload with the forwarding tag already stripped.
    pub fn handle(&self, body: Bytes, from: &ReturnPath) -> Result<(), ForwardError> {
        let ReturnPath::Routed(routed) = from else {
            tracing::warn!(%from, "Forwarded packet did not arrive over a routed path");
            return Err(ForwardError::UnsupportedReturnPath(from.to_string()));
        };
        let (&leg, rest) = body.split_first().ok_or(ForwardError::Empty)?;
        let peer = Address::from_slice(rest)?;
        let inner = body.slice(1 + Address::MEM_SIZE..);
        match leg {
            FIRST_LEG => {
                // we are the relay, the origin is whoever routed this to us
                let origin = *routed.destination();
                tracing::debug!(%origin, destination = %peer, "Relaying forwarded packet");
                RoutedSender::new(self.router.clone(), self.local, peer)
                    .send(encode(SECOND_LEG, &origin, &inner))?;
            }
            SECOND_LEG => {
                let sender = ForwardingSender::new(routed.clone(), peer);
                tracing::debug!(%sender, "Delivering forwarded packet");
                self.dispatcher
                    .announce(inner, &ReturnPath::Forwarding(sender))?;
            }
            other => return Err(ForwardError::UnknownLeg(other)),
        }
        Ok(())
    }
}

impl DataHandler for PacketForwarder {
    fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
        Ok(self.handle(payload, from)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;

    use super::*;
    use crate::node::RoutedPacket;

    /// Records routed packets instead of delivering them.
    #[derive(Default)]
    pub(crate) struct RecordingRouter {
        pub sent: Mutex<Vec<RoutedPacket>>,
    }

    impl Router for RecordingRouter {
        fn route(&self, packet: RoutedPacket) -> Result<(), SendError> {
            self.sent.lock().push(packet);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Inbox {
        received: Mutex<Vec<(Bytes, ReturnPath)>>,
    }

    impl DataHandler for Inbox {
        fn handle_data(&self, payload: Bytes, from: &ReturnPath) -> anyhow::Result<()> {
            self.received.lock().push((payload, from.clone()));
            Ok(())
        }
    }

    fn node(address: Address, router: &Arc<RecordingRouter>) -> (PacketForwarder, Arc<Inbox>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let inbox = Arc::new(Inbox::default());
        dispatcher.subscribe(PayloadType::Data, inbox.clone());
        (
            PacketForwarder::new(address, router.clone(), dispatcher),
            inbox,
        )
    }

    /// Hands the last routed packet to `forwarder` as its destination would.
    fn deliver_last(router: &Arc<RecordingRouter>, forwarder: &PacketForwarder) -> RoutedPacket {
        let packet = router.sent.lock().pop().expect("a routed packet");
        assert_eq!(packet.destination, forwarder.local);
        assert_eq!(packet.payload[0], PayloadType::Forwarding.tag());
        let from = ReturnPath::Routed(RoutedSender::reply_to(
            router.clone(),
            forwarder.local,
            &packet,
        ));
        forwarder.handle(packet.payload.slice(1..), &from).unwrap();
        packet
    }

    #[test]
    fn round_trip_through_relay() {
        let router = Arc::new(RecordingRouter::default());
        let (a, b, c) = (Address::random(), Address::random(), Address::random());
        let (at_a, inbox_a) = node(a, &router);
        let (at_b, _) = node(b, &router);
        let (at_c, inbox_c) = node(c, &router);

        let inner = PayloadType::Data.encode(b"hello");
        at_a.sender_via(b, c).send(inner.clone()).unwrap();

        deliver_last(&router, &at_b);
        let second_leg = router.sent.lock().last().cloned().unwrap();
        assert_eq!(second_leg.source, b);
        assert_eq!(second_leg.destination, c);
        assert_eq!(second_leg.payload[1], SECOND_LEG);
        assert_eq!(&second_leg.payload[2..2 + Address::MEM_SIZE], a.as_bytes());
        assert_eq!(second_leg.payload.slice(2 + Address::MEM_SIZE..), inner);

        deliver_last(&router, &at_c);
        let (payload, reply_path) = inbox_c.received.lock().pop().unwrap();
        assert_eq!(payload, Bytes::from_static(b"hello"));
        let ReturnPath::Forwarding(reply) = &reply_path else {
            panic!("expected a forwarding return path, got {reply_path}");
        };
        assert_eq!(*reply.destination(), a);
        assert_eq!(*reply.relay(), b);

        reply_path
            .send(PayloadType::Data.encode(b"world"))
            .unwrap();
        let back = router.sent.lock().last().cloned().unwrap();
        assert_eq!(back.source, c);
        assert_eq!(back.destination, b);
        assert_eq!(back.payload[1], FIRST_LEG);
        assert_eq!(&back.payload[2..2 + Address::MEM_SIZE], a.as_bytes());

        deliver_last(&router, &at_b);
        let last_leg = router.sent.lock().last().cloned().unwrap();
        assert_eq!(&last_leg.payload[2..2 + Address::MEM_SIZE], c.as_bytes());
        deliver_last(&router, &at_a);
        let (payload, _) = inbox_a.received.lock().pop().unwrap();
        assert_eq!(payload, Bytes::from_static(b"world"));
    }

    #[test]
    fn rejects_direct_edges() {
        use crate::transport::{in_memory::MemoryEdge, TransportAddress};

        let router = Arc::new(RecordingRouter::default());
        let (forwarder, _) = node(Address::random(), &router);
        let (edge, _) = MemoryEdge::pair(
            TransportAddress::new("ringlink.mem", "a"),
            TransportAddress::new("ringlink.mem", "b"),
        );
        let mut body = vec![FIRST_LEG];
        body.extend_from_slice(Address::random().as_bytes());
        let result = forwarder.handle(Bytes::from(body), &ReturnPath::Edge(edge));
        assert!(matches!(result, Err(ForwardError::UnsupportedReturnPath(_))));
        assert!(router.sent.lock().is_empty());
    }

    #[test]
    fn equality_follows_destination() {
        let router: Arc<dyn Router> = Arc::new(RecordingRouter::default());
        let destination = Address::random();
        let one = ForwardingSender::new(
            RoutedSender::new(router.clone(), Address::random(), Address::random()),
            destination,
        );
        let other = ForwardingSender::new(
            RoutedSender::new(router, Address::random(), Address::random()),
            destination,
        );
        assert_eq!(one, other);
        let set: HashSet<_> = [one, other].into_iter().collect();
        assert_eq!(set.len(), 1);
    }
}
