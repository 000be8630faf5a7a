//! Error types for the signal server, its bridge and the receiving client.
//!
//! Only [`StartupError`] is fatal. Transport and decode failures are handled
//! where they happen (logged, connection dropped or frame discarded), bridge
//! errors are surfaced to whoever submitted the work.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// A send or receive against a single client connection failed.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection's writer is gone: the peer disconnected or an earlier
    /// write already failed.
    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    Websocket(#[from] tungstenite::Error),
}

/// An inbound frame was not valid JSON.
#[derive(Error, Debug)]
#[error("invalid JSON frame: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),

    /// The registry was borrowed for mutation while a snapshot was requested.
    #[error("client registry unavailable")]
    RegistryUnavailable,
}

/// Failure of a call made through [`EventLoopBridge`](crate::bridge::EventLoopBridge).
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The task did not complete in time. It may still be running on the loop,
    /// so the outcome is unknown rather than aborted.
    #[error("task did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("event loop unavailable (not started or already stopped)")]
    LoopUnavailable,

    /// The task was dropped before producing a result, either by shutdown or
    /// because it panicked.
    #[error("task was cancelled before completing")]
    Cancelled,

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

impl BridgeError {
    /// Short stable label for log lines and console output.
    pub fn as_label(&self) -> &'static str {
        match self {
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::LoopUnavailable => "loop_unavailable",
            BridgeError::Cancelled => "cancelled",
            BridgeError::Broadcast(_) => "broadcast_failed",
        }
    }
}

/// The server could not reach a serving state.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("event loop already started")]
    AlreadyStarted,

    #[error("failed to build loop runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn loop thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("loop thread exited before reporting readiness")]
    WorkerExited,
}

/// The receiving client could not connect or lost its connection.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to build client runtime: {0}")]
    Runtime(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_labels() {
        let err = BridgeError::Timeout { timeout: Duration::from_millis(50) };
        assert_eq!(err.as_label(), "timeout");
        assert!(err.to_string().contains("50ms"));
        assert_eq!(BridgeError::LoopUnavailable.as_label(), "loop_unavailable");
    }

    #[test]
    fn test_broadcast_error_is_wrapped_by_bridge_error() {
        let err: BridgeError = BroadcastError::RegistryUnavailable.into();
        assert_eq!(err.as_label(), "broadcast_failed");
        assert_eq!(err.to_string(), "client registry unavailable");
    }
}
