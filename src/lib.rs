//! Trading-signal broadcast server.
//!
//! A single I/O loop thread owns every websocket connection and fans signals
//! out to all of them. Other threads reach the loop only through
//! [`EventLoopBridge`].

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod shutdown;
pub mod websocket;

pub use auth::{AcceptAll, AuthRejection, Authenticator};
pub use bridge::{EventLoopBridge, LoopContext};
pub use client::SignalReceiver;
pub use config::{ClientConfig, ServerConfig};
pub use control::{ControlSurface, StopHandle};
pub use data::{ClientIdentity, Signal, SignalAction};
pub use error::{BridgeError, BroadcastError, ClientError, DecodeError, StartupError, TransportError};
pub use websocket::{BroadcastEngine, BroadcastReport, DeliveryOutcome};
