//! A router for nodes living in the same process.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::{Node, RoutedPacket, Router, SendError};
use crate::ring::Address;

/// Delivers routed packets straight to the registered destination node.
///
/// Every hop is a direct call, so a packet relayed by a forwarder is handled
/// before the original `route` call returns.
#[derive(Default)]
pub struct MemoryRouter {
    nodes: DashMap<Address, Weak<Node>>,
}

impl MemoryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<Node>) {
        self.nodes.insert(*node.address(), Arc::downgrade(node));
    }

    pub fn unregister(&self, address: &Address) -> bool {
        self.nodes.remove(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Router for MemoryRouter {
    fn route(&self, mut packet: RoutedPacket) -> Result<(), SendError> {
        if packet.ttl == 0 {
            tracing::debug!(source = %packet.source, destination = %packet.destination, "Dropping packet, hop limit reached");
            return Err(SendError::NoRoute(packet.destination));
        }
        packet.ttl -= 1;
        // the map guard must be released before delivering, handlers route again
        let node = self
            .nodes
            .get(&packet.destination)
            .and_then(|node| node.upgrade());
        let Some(node) = node else {
            return Err(SendError::NoRoute(packet.destination));
        };
        tracing::trace!(source = %packet.source, destination = %packet.destination, "Routing packet");
        node.deliver_routed(packet)
            .map_err(|error| SendError::Routing(error.into()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::node::{PayloadType, Sender};

    #[test]
    fn unknown_destination_has_no_route() {
        let router = MemoryRouter::new();
        let node = Node::new(Address::random(), router.clone());
        router.register(&node);
        let missing = Address::random();
        let result = node
            .routed_sender(missing)
            .send(PayloadType::Data.encode(b"x"));
        assert!(matches!(result, Err(SendError::NoRoute(address)) if address == missing));
    }

    #[test]
    fn exhausted_ttl_is_dropped() {
        let router = MemoryRouter::new();
        let node = Node::new(Address::random(), router.clone());
        router.register(&node);
        let packet = RoutedPacket {
            source: *node.address(),
            destination: *node.address(),
            ttl: 0,
            payload: Bytes::from_static(&[5]),
        };
        assert!(router.route(packet).is_err());
    }

    #[test]
    fn dropped_nodes_are_unreachable() {
        let router = MemoryRouter::new();
        let node = Node::new(Address::random(), router.clone());
        router.register(&node);
        let address = *node.address();
        drop(node);
        let packet = RoutedPacket {
            source: address,
            destination: address,
            ttl: 4,
            payload: Bytes::from_static(&[5]),
        };
        assert!(matches!(router.route(packet), Err(SendError::NoRoute(_))));
    }
}
