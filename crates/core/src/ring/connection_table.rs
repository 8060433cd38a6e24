//! Registry of the node's connections, kept sorted by address per type.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tokio::sync::broadcast;

use super::{Address, Connection, ConnectionError, ConnectionType, LinkMessage, StateChange};
use crate::transport::{CloseListenerId, EdgeId, EdgeRef};

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("{address} already has a {con_type} connection")]
    DuplicateAddress {
        address: Address,
        con_type: ConnectionType,
    },
    #[error("{0} is already registered to a connection")]
    EdgeInUse(EdgeId),
    #[error("{0} closed before it could be registered")]
    EdgeClosed(EdgeId),
    #[error("no {0} connections")]
    Empty(ConnectionType),
    #[error("{address} is already locked for {con_type} by another holder")]
    AlreadyLocked {
        address: Address,
        con_type: ConnectionType,
    },
    #[error("{address} is not locked for {con_type}")]
    NotLocked {
        address: Address,
        con_type: ConnectionType,
    },
    #[error("{address} is locked for {con_type} by another holder")]
    NotLockOwner {
        address: Address,
        con_type: ConnectionType,
    },
    #[error("{0} is not registered")]
    NotRegistered(Address),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Payload of a table notification.
#[derive(Clone, Debug)]
pub struct ConnectionEventArgs {
    pub address: Address,
    pub edge: EdgeRef,
    pub con_type: ConnectionType,
    /// Position the connection had (or got) in its type's sorted list.
    pub index: usize,
    pub connection: Arc<Connection>,
}

#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Connected(ConnectionEventArgs),
    Disconnected(ConnectionEventArgs),
}

/// Identity of whoever holds a per-address lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LockHolder(u64);

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

impl LockHolder {
    pub fn new() -> Self {
        LockHolder(NEXT_HOLDER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for LockHolder {
    fn default() -> Self {
        Self::new()
    }
}

struct Row {
    connection: Arc<Connection>,
    edge: EdgeRef,
}

#[derive(Default)]
struct TypeEntries {
    /// sorted by address, one row per peer
    rows: Vec<Row>,
    locks: HashMap<Address, LockHolder>,
}

impl TypeEntries {
    fn search(&self, address: &Address) -> Result<usize, usize> {
        self.rows
            .binary_search_by(|row| row.connection.address().cmp(address))
    }

    fn at(&self, con_type: ConnectionType, index: isize) -> Result<&Row, TableError> {
        if self.rows.is_empty() {
            return Err(TableError::Empty(con_type));
        }
        let len = self.rows.len() as isize;
        Ok(&self.rows[index.rem_euclid(len) as usize])
    }
}

#[derive(Default)]
struct TableInner {
    types: [TypeEntries; 4],
    edge_types: HashMap<EdgeId, ConnectionType>,
    unconnected: HashMap<EdgeId, EdgeRef>,
    close_listeners: HashMap<EdgeId, CloseListenerId>,
}

impl TableInner {
    fn entries(&self, con_type: ConnectionType) -> &TypeEntries {
        &self.types[con_type.index()]
    }

    fn entries_mut(&mut self, con_type: ConnectionType) -> &mut TypeEntries {
        &mut self.types[con_type.index()]
    }

    /// Takes the row of `edge` out, if it is connected.
    fn take_row(&mut self, edge: EdgeId) -> Option<(ConnectionType, usize, Row)> {
        let con_type = self.edge_types.remove(&edge)?;
        let entries = self.entries_mut(con_type);
        let index = entries.rows.iter().position(|row| row.edge.id() == edge)?;
        Some((con_type, index, entries.rows.remove(index)))
    }
}

struct TableShared {
    inner: Mutex<TableInner>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Thread safe registry of connections, cheap to clone.
///
/// All reads and writes of the sorted lists happen under one lock; events are
/// sent after it is released so subscribers can call back into the table.
#[derive(Clone)]
pub struct ConnectionTable {
    shared: Arc<TableShared>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(TableShared {
                inner: Mutex::new(TableInner::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Registers `connection` at its sorted position and returns that index.
    pub fn add(&self, connection: Arc<Connection>) -> Result<usize, TableError> {
        let address = *connection.address();
        let con_type = connection.main_type();
        let edge = connection.edge();
        let edge_id = edge.id();
        let index = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.edge_types.contains_key(&edge_id) {
                return Err(TableError::EdgeInUse(edge_id));
            }
            let index = match inner.entries(con_type).search(&address) {
                Ok(_) => return Err(TableError::DuplicateAddress { address, con_type }),
                Err(index) => index,
            };
            if inner.unconnected.remove(&edge_id).is_none() {
                let listener = self
                    .watch_close(&edge)
                    .ok_or(TableError::EdgeClosed(edge_id))?;
                inner.close_listeners.insert(edge_id, listener);
            }
            inner.entries_mut(con_type).rows.insert(
                index,
                Row {
                    connection: connection.clone(),
                    edge: edge.clone(),
                },
            );
            inner.edge_types.insert(edge_id, con_type);
            index
        };
        tracing::debug!(%address, %con_type, index, edge = %edge_id, "Connection added");
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::Connected(ConnectionEventArgs {
                address,
                edge,
                con_type,
                index,
                connection,
            }));
        Ok(index)
    }

    /// Demotes the connection on `edge` back to the unconnected set. Returns
    /// whether there was a connection to demote.
    pub fn disconnect(&self, edge: &EdgeRef) -> bool {
        let removed = {
            let mut inner = self.shared.inner.lock();
            let removed = inner.take_row(edge.id());
            if removed.is_some() {
                inner.unconnected.insert(edge.id(), edge.clone());
            }
            removed
        };
        self.notify_removed(removed, "Connection disconnected")
    }

    /// Moves a registered connection onto `edge`. The old edge stays known as
    /// unconnected until it closes.
    pub fn set_edge(
        &self,
        connection: &Connection,
        edge: EdgeRef,
        peer_link: Option<LinkMessage>,
    ) -> Result<StateChange, TableError> {
        let address = *connection.address();
        let new_id = edge.id();
        let change = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            let old_edge = connection.edge();
            let old_id = old_edge.id();
            let con_type = connection.main_type();
            let index = inner
                .entries(con_type)
                .search(&address)
                .ok()
                .filter(|index| inner.entries(con_type).rows[*index].edge.id() == old_id)
                .ok_or(TableError::NotRegistered(address))?;
            if new_id == old_id {
                return Ok(connection.set_edge(edge, peer_link)?);
            }
            if inner.edge_types.contains_key(&new_id) {
                return Err(TableError::EdgeInUse(new_id));
            }
            let listener = match inner.unconnected.remove(&new_id) {
                Some(_) => None,
                None => Some(
                    self.watch_close(&edge)
                        .ok_or(TableError::EdgeClosed(new_id))?,
                ),
            };
            let change = match connection.set_edge(edge.clone(), peer_link) {
                Ok(change) => change,
                Err(error) => {
                    match listener {
                        Some(listener) => {
                            edge.remove_close_listener(listener);
                        }
                        None => {
                            inner.unconnected.insert(new_id, edge);
                        }
                    }
                    return Err(error.into());
                }
            };
            if let Some(listener) = listener {
                inner.close_listeners.insert(new_id, listener);
            }
            inner.entries_mut(con_type).rows[index].edge = edge;
            inner.edge_types.remove(&old_id);
            inner.edge_types.insert(new_id, con_type);
            inner.unconnected.insert(old_id, old_edge);
            change
        };
        tracing::debug!(%address, edge = %new_id, "Connection moved to a new edge");
        Ok(change)
    }

    /// Forgets everything about an edge which has closed.
    fn remove(&self, edge: EdgeId) -> bool {
        let removed = {
            let mut inner = self.shared.inner.lock();
            inner.close_listeners.remove(&edge);
            let removed = inner.take_row(edge);
            if removed.is_none() {
                inner.unconnected.remove(&edge);
            }
            removed
        };
        self.notify_removed(removed, "Connection removed on edge close")
    }

    fn notify_removed(&self, removed: Option<(ConnectionType, usize, Row)>, msg: &str) -> bool {
        let Some((con_type, index, row)) = removed else {
            return false;
        };
        let address = *row.connection.address();
        tracing::debug!(%address, %con_type, index, edge = %row.edge.id(), "{msg}");
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::Disconnected(ConnectionEventArgs {
                address,
                edge: row.edge,
                con_type,
                index,
                connection: row.connection,
            }));
        true
    }

    fn watch_close(&self, edge: &EdgeRef) -> Option<CloseListenerId> {
        let table: Weak<TableShared> = Arc::downgrade(&self.shared);
        edge.on_close(Box::new(move |edge_id| {
            if let Some(shared) = table.upgrade() {
                ConnectionTable { shared }.remove(edge_id);
            }
        }))
    }

    /// Tracks an edge which is not (yet) a connection. Returns `false` if the
    /// table already knows the edge.
    pub fn add_unconnected(&self, edge: EdgeRef) -> Result<bool, TableError> {
        let mut inner = self.shared.inner.lock();
        let edge_id = edge.id();
        if inner.edge_types.contains_key(&edge_id) || inner.unconnected.contains_key(&edge_id) {
            return Ok(false);
        }
        let listener = self
            .watch_close(&edge)
            .ok_or(TableError::EdgeClosed(edge_id))?;
        inner.close_listeners.insert(edge_id, listener);
        inner.unconnected.insert(edge_id, edge);
        Ok(true)
    }

    pub fn is_unconnected(&self, edge: &EdgeRef) -> bool {
        self.shared.inner.lock().unconnected.contains_key(&edge.id())
    }

    pub fn unconnected_count(&self) -> usize {
        self.shared.inner.lock().unconnected.len()
    }

    pub fn unconnected_edges(&self) -> Vec<EdgeRef> {
        self.shared.inner.lock().unconnected.values().cloned().collect()
    }

    pub fn get_connection_by_edge(&self, edge: EdgeId) -> Option<Arc<Connection>> {
        let inner = self.shared.inner.lock();
        let con_type = inner.edge_types.get(&edge)?;
        inner
            .entries(*con_type)
            .rows
            .iter()
            .find(|row| row.edge.id() == edge)
            .map(|row| row.connection.clone())
    }

    /// Connection at `index`, wrapping around in both directions.
    pub fn get_connection_at(
        &self,
        con_type: ConnectionType,
        index: isize,
    ) -> Result<Arc<Connection>, TableError> {
        let inner = self.shared.inner.lock();
        inner
            .entries(con_type)
            .at(con_type, index)
            .map(|row| row.connection.clone())
    }

    pub fn get_connection(
        &self,
        con_type: ConnectionType,
        address: &Address,
    ) -> Option<Arc<Connection>> {
        let inner = self.shared.inner.lock();
        let entries = inner.entries(con_type);
        entries
            .search(address)
            .ok()
            .map(|index| entries.rows[index].connection.clone())
    }

    pub fn contains(&self, con_type: ConnectionType, address: &Address) -> bool {
        self.index_of(con_type, address) >= 0
    }

    /// Index of `address`, or the bitwise complement of where it would be
    /// inserted.
    pub fn index_of(&self, con_type: ConnectionType, address: &Address) -> isize {
        match self.shared.inner.lock().entries(con_type).search(address) {
            Ok(index) => index as isize,
            Err(insert_at) => !(insert_at as isize),
        }
    }

    /// First structured connection after `address` in ring order.
    pub fn get_right_structured_neighbor_of(
        &self,
        address: &Address,
    ) -> Result<Arc<Connection>, TableError> {
        let inner = self.shared.inner.lock();
        let entries = inner.entries(ConnectionType::Structured);
        let index = match entries.search(address) {
            Ok(found) => found as isize + 1,
            Err(insert_at) => insert_at as isize,
        };
        entries
            .at(ConnectionType::Structured, index)
            .map(|row| row.connection.clone())
    }

    /// Last structured connection before `address` in ring order.
    pub fn get_left_structured_neighbor_of(
        &self,
        address: &Address,
    ) -> Result<Arc<Connection>, TableError> {
        let inner = self.shared.inner.lock();
        let entries = inner.entries(ConnectionType::Structured);
        let index = match entries.search(address) {
            Ok(found) => found as isize - 1,
            Err(insert_at) => insert_at as isize - 1,
        };
        entries
            .at(ConnectionType::Structured, index)
            .map(|row| row.connection.clone())
    }

    pub fn count(&self, con_type: ConnectionType) -> usize {
        self.shared.inner.lock().entries(con_type).rows.len()
    }

    pub fn total_count(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner.types.iter().map(|entries| entries.rows.len()).sum()
    }

    pub fn edges_of_type(&self, con_type: ConnectionType) -> Vec<EdgeRef> {
        let inner = self.shared.inner.lock();
        inner
            .entries(con_type)
            .rows
            .iter()
            .map(|row| row.edge.clone())
            .collect()
    }

    /// Snapshot of every connection, by type then by address.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = self.shared.inner.lock();
        inner
            .types
            .iter()
            .flat_map(|entries| entries.rows.iter().map(|row| row.connection.clone()))
            .collect()
    }

    pub fn random_unstructured_edge(&self, except: Option<EdgeId>) -> Option<EdgeRef> {
        let inner = self.shared.inner.lock();
        inner
            .entries(ConnectionType::Unstructured)
            .rows
            .iter()
            .filter(|row| Some(row.edge.id()) != except)
            .choose(&mut rand::thread_rng())
            .map(|row| row.edge.clone())
    }

    /// Reserves `(con_type, address)` for `holder`. Locking again with the
    /// same holder succeeds.
    pub fn lock(
        &self,
        address: &Address,
        con_type: ConnectionType,
        holder: LockHolder,
    ) -> Result<(), TableError> {
        let mut inner = self.shared.inner.lock();
        match inner.entries_mut(con_type).locks.entry(*address) {
            Entry::Vacant(slot) => {
                slot.insert(holder);
                Ok(())
            }
            Entry::Occupied(current) if *current.get() == holder => Ok(()),
            Entry::Occupied(_) => Err(TableError::AlreadyLocked {
                address: *address,
                con_type,
            }),
        }
    }

    pub fn unlock(
        &self,
        address: &Address,
        con_type: ConnectionType,
        holder: LockHolder,
    ) -> Result<(), TableError> {
        let mut inner = self.shared.inner.lock();
        let locks = &mut inner.entries_mut(con_type).locks;
        match locks.get(address) {
            None => Err(TableError::NotLocked {
                address: *address,
                con_type,
            }),
            Some(current) if *current != holder => Err(TableError::NotLockOwner {
                address: *address,
                con_type,
            }),
            Some(_) => {
                locks.remove(address);
                Ok(())
            }
        }
    }

    pub fn is_locked(&self, address: &Address, con_type: ConnectionType) -> bool {
        self.shared
            .inner
            .lock()
            .entries(con_type)
            .locks
            .contains_key(address)
    }

    /// Locks `(con_type, address)` until the returned lease is dropped.
    pub fn lease(
        &self,
        address: &Address,
        con_type: ConnectionType,
    ) -> Result<AddressLease, TableError> {
        let holder = LockHolder::new();
        self.lock(address, con_type, holder)?;
        Ok(AddressLease {
            table: self.clone(),
            address: *address,
            con_type,
            holder,
        })
    }
}

impl Display for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        writeln!(f, "ConnectionTable")?;
        for con_type in ConnectionType::ALL {
            let entries = inner.entries(con_type);
            writeln!(f, "Type: {con_type} ({})", entries.rows.len())?;
            for (index, row) in entries.rows.iter().enumerate() {
                writeln!(
                    f,
                    "{index} -> {} via {} ({})",
                    row.connection.address(),
                    row.edge.to_uri(),
                    row.connection.con_type()
                )?;
            }
        }
        writeln!(f, "Unconnected edges: {}", inner.unconnected.len())?;
        for edge in inner.unconnected.values() {
            writeln!(f, "{} {}", edge.id(), edge.to_uri())?;
        }
        Ok(())
    }
}

/// Holds a per-address lock and releases it on drop.
pub struct AddressLease {
    table: ConnectionTable,
    address: Address,
    con_type: ConnectionType,
    holder: LockHolder,
}

impl AddressLease {
    pub fn holder(&self) -> LockHolder {
        self.holder
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        if let Err(error) = self.table.unlock(&self.address, self.con_type, self.holder) {
            tracing::warn!(%error, "Failed releasing address lease");
        }
    }
}
