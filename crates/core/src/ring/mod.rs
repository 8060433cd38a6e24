//! Ring membership: peer addresses, connections and the connection table.
//!
//! Connections of each type are kept sorted by [`Address`] so that ring
//! neighbour queries are a binary search away.

mod address;
mod connection;
mod connection_table;

pub use self::address::{Address, AddressError};
pub use self::connection::{
    Connection, ConnectionError, ConnectionInfo, ConnectionState, ConnectionType, LinkMessage,
    StateChange, StatusMessage,
};
pub use self::connection_table::{
    AddressLease, ConnectionEvent, ConnectionEventArgs, ConnectionTable, LockHolder, TableError,
};
