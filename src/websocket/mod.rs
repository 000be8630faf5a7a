pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod registry;

pub use broadcast::{BroadcastEngine, BroadcastReport, DeliveryOutcome};
pub use connection::{ClientConnection, ClientInfo, ConnectionId, ConnectionState};
pub use handler::WebSocketHandler;
pub use registry::{ClientRegistry, SharedRegistry};
