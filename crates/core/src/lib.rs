//! Membership and connection establishment core of a structured overlay.
//!
//! Peers are identified by totally ordered [`ring::Address`]es. A node keeps
//! its live links in a [`ring::ConnectionTable`], multiplexes several logical
//! overlays over one physical listener with [`transport::path`], and
//! establishes links through [`operations::connect::Connector`], optionally
//! relaying through a third node with [`operations::forward`].

/// Node configuration and the global executor.
pub mod config;

/// Dispatch point, request-reply substrate, heartbeat and the node composite.
pub mod node;
pub use node::Node;

/// Connect handshake and packet forwarding.
pub mod operations;

/// Ring addresses, connections and the connection table.
pub mod ring;

/// Logging setup and connection event logs.
pub mod tracing;

/// Edges, listeners, the in-memory transport and path multiplexing.
pub mod transport;

pub mod util;
