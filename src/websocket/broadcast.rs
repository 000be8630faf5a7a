use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::data::Signal;
use crate::error::{BroadcastError, TransportError};
use crate::websocket::connection::{ClientConnection, ConnectionId};
use crate::websocket::registry::SharedRegistry;

/// Result of sending one broadcast to one client.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub connection_id: ConnectionId,
    pub peer_addr: String,
    pub result: Result<(), TransportError>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BroadcastReport {
    /// Nobody was connected, so nothing was attempted.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }

    pub fn is_partial(&self) -> bool {
        self.delivered > 0 && self.failed > 0
    }
}

impl fmt::Display for BroadcastReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noop() {
            return f.write_str("no clients connected");
        }
        write!(f, "delivered to {} of {} clients", self.delivered, self.attempted())?;
        if self.failed > 0 {
            write!(f, " ({} failed)", self.failed)?;
        }
        Ok(())
    }
}

/// Fans a signal out to every registered client.
///
/// Lives on the I/O loop. Each broadcast works on a registry snapshot, sends
/// to all clients concurrently, and drops clients whose send fails without
/// affecting the others.
#[derive(Clone)]
pub struct BroadcastEngine {
    registry: SharedRegistry,
    max_concurrent_sends: Option<usize>,
}

impl BroadcastEngine {
    pub fn new(registry: SharedRegistry, max_concurrent_sends: Option<usize>) -> Self {
        Self {
            registry,
            max_concurrent_sends: max_concurrent_sends.filter(|limit| *limit > 0),
        }
    }

    pub async fn broadcast(&self, signal: &Signal) -> Result<BroadcastReport, BroadcastError> {
        let frame: Arc<str> = Arc::from(signal.to_json()?);

        let snapshot = self
            .registry
            .try_borrow()
            .map_err(|_| BroadcastError::RegistryUnavailable)?
            .snapshot();

        if snapshot.is_empty() {
            warn!("Broadcast of {} skipped: no clients connected", signal);
            return Ok(BroadcastReport::noop());
        }

        info!("Broadcasting signal to {} clients: {}", snapshot.len(), frame);

        let sends = snapshot.iter().map(|conn| self.deliver(conn, frame.clone()));
        let outcomes: Vec<DeliveryOutcome> = match self.max_concurrent_sends {
            None => join_all(sends).await,
            Some(limit) => stream::iter(sends).buffer_unordered(limit).collect().await,
        };

        let mut report = BroadcastReport::default();
        for outcome in outcomes {
            if outcome.is_success() {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
            report.outcomes.push(outcome);
        }

        if report.failed > 0 {
            warn!("Signal {} {}", signal, report);
        } else {
            info!("Signal {} {}", signal, report);
        }
        Ok(report)
    }

    async fn deliver(&self, conn: &Rc<ClientConnection>, frame: Arc<str>) -> DeliveryOutcome {
        let result = conn.send(frame).await;

        if let Err(e) = &result {
            warn!("Failed to send signal to client {}: {}", conn.label(), e);
            self.drop_client(conn);
        }

        DeliveryOutcome {
            connection_id: conn.id(),
            peer_addr: conn.peer_addr().to_string(),
            result,
        }
    }

    fn drop_client(&self, conn: &Rc<ClientConnection>) {
        match self.registry.try_borrow_mut() {
            Ok(mut registry) => {
                registry.unregister(&conn.id());
            }
            Err(_) => warn!("Registry busy, client {} left for connection cleanup", conn.label()),
        }
        conn.close(CloseCode::Error, "send failed");
    }
}
