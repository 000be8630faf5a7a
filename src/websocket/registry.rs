use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use log::{debug, info};

use crate::websocket::connection::{ClientConnection, ClientInfo, ConnectionId};

/// Registry handle shared between tasks of the I/O loop.
pub type SharedRegistry = Rc<RefCell<ClientRegistry>>;

/// The set of clients currently reachable by a broadcast.
///
/// Owned by the I/O loop thread; other threads reach it through the bridge.
/// A connection is present only while it is `Active`: `unregister` moves it
/// to `Closing` on the way out.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ConnectionId, Rc<ClientConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Adds `conn`. Returns false, leaving the registry unchanged, if the id is
    /// already present or the connection is no longer active.
    pub fn register(&mut self, conn: Rc<ClientConnection>) -> bool {
        if !conn.is_active() || self.clients.contains_key(&conn.id()) {
            debug!("Ignoring register for {} (state {:?})", conn.label(), conn.state());
            return false;
        }

        let label = conn.label();
        self.clients.insert(conn.id(), conn);
        info!("Client {} registered. Connected clients: {}", label, self.clients.len());
        true
    }

    /// Removes the connection if present. Safe to call repeatedly and for ids
    /// that were never registered.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<Rc<ClientConnection>> {
        let removed = self.clients.remove(id)?;
        removed.mark_closing();
        info!("Client {} unregistered. Connected clients: {}", removed.label(), self.clients.len());
        Some(removed)
    }

    /// Point-in-time copy of the members. Later membership changes do not
    /// affect a snapshot already taken.
    pub fn snapshot(&self) -> Vec<Rc<ClientConnection>> {
        self.clients.values().cloned().collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Details of every registered client, oldest connection first.
    pub fn infos(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self.clients.values().map(|conn| conn.info()).collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
