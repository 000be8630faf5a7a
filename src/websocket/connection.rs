use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use crate::data::ClientIdentity;
use crate::error::TransportError;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// Work for a connection's writer task. Frames are written in queue order.
#[derive(Debug)]
pub enum Outbound {
    Frame(OutboundFrame),
    Close {
        code: CloseCode,
        reason: Cow<'static, str>,
    },
}

/// One text frame plus the channel its write result is reported on.
#[derive(Debug)]
pub struct OutboundFrame {
    text: Arc<str>,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

impl OutboundFrame {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Reports the write result back to whoever queued the frame.
    pub fn complete(self, result: Result<(), TransportError>) {
        // The sender may have given up waiting; nothing to report to then.
        let _ = self.ack.send(result);
    }
}

/// Owned copy of a connection's details, safe to hand outside the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub peer_addr: String,
    pub connected_at: DateTime<Utc>,
    pub identity: Option<ClientIdentity>,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} since {}", self.id, self.peer_addr, self.connected_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        match &self.identity {
            Some(identity) => write!(f, " as {}", identity.describe()),
            None => f.write_str(" (unidentified)"),
        }
    }
}

/// Loop-owned handle of one accepted websocket client.
///
/// Only lives on the I/O loop thread (it is neither `Send` nor `Sync`). The
/// socket itself belongs to the connection's writer, which this handle feeds
/// through an unbounded FIFO queue.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    peer_addr: String,
    connected_at: DateTime<Utc>,
    state: Cell<ConnectionState>,
    identity: RefCell<Option<ClientIdentity>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ClientConnection {
    pub fn new(peer_addr: String, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            connected_at: Utc::now(),
            state: Cell::new(ConnectionState::Active),
            identity: RefCell::new(None),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.get() == ConnectionState::Active
    }

    pub fn identity(&self) -> Option<ClientIdentity> {
        self.identity.borrow().clone()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            peer_addr: self.peer_addr.clone(),
            connected_at: self.connected_at,
            identity: self.identity(),
        }
    }

    pub(crate) fn set_identity(&self, identity: ClientIdentity) {
        *self.identity.borrow_mut() = Some(identity);
    }

    pub(crate) fn mark_closing(&self) {
        if self.state.get() == ConnectionState::Active {
            self.state.set(ConnectionState::Closing);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state.set(ConnectionState::Closed);
    }

    /// Short form for log lines: id prefix, peer and reported client id.
    pub fn label(&self) -> String {
        let id = self.id.simple().to_string();
        match self.identity.borrow().as_ref().and_then(|i| i.client_id.clone()) {
            Some(client_id) => format!("{} ({}, {})", &id[..8], self.peer_addr, client_id),
            None => format!("{} ({})", &id[..8], self.peer_addr),
        }
    }

    /// Queues one text frame and waits until the writer has written it.
    pub async fn send(&self, text: Arc<str>) -> Result<(), TransportError> {
        let written = self.enqueue(text)?;
        written.await.map_err(|_| TransportError::Closed)?
    }

    /// Queues one text frame; the returned receiver resolves with the write
    /// result.
    pub(crate) fn enqueue(&self, text: Arc<str>) -> Result<oneshot::Receiver<Result<(), TransportError>>, TransportError> {
        if self.state.get() != ConnectionState::Active {
            return Err(TransportError::Closed);
        }

        let (ack, written) = oneshot::channel();
        self.outbound
            .send(Outbound::Frame(OutboundFrame { text, ack }))
            .map_err(|_| TransportError::Closed)?;
        Ok(written)
    }

    /// Asks the writer to send a close frame after any frames already queued.
    pub fn close(&self, code: CloseCode, reason: impl Into<Cow<'static, str>>) {
        self.mark_closing();
        let _ = self.outbound.send(Outbound::Close { code, reason: reason.into() });
    }
}
