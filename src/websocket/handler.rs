use std::rc::Rc;
use std::sync::Arc;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::auth::Authenticator;
use crate::data::ClientIdentity;
use crate::error::{DecodeError, TransportError};
use crate::websocket::connection::{ClientConnection, Outbound};
use crate::websocket::registry::SharedRegistry;

type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Serves one accepted TCP stream on the I/O loop: handshake, registration,
/// reading inbound frames and writing queued outbound frames until either
/// side closes.
pub struct WebSocketHandler {
    registry: SharedRegistry,
    authenticator: Arc<dyn Authenticator>,
    peer_addr: String,
}

impl WebSocketHandler {
    pub fn new(registry: SharedRegistry, authenticator: Arc<dyn Authenticator>, peer_addr: String) -> Self {
        Self {
            registry,
            authenticator,
            peer_addr,
        }
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {}", self.peer_addr, e);
                return;
            }
        };

        self.handle_websocket_connection(ws_stream).await;
    }

    async fn handle_websocket_connection(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let conn = Rc::new(ClientConnection::new(self.peer_addr.clone(), outbound_tx));
        if !self.register(&conn) {
            conn.close(CloseCode::Again, "server busy, try again");
            write_frames(write, outbound_rx, conn.label()).await;
            conn.mark_closed();
            return;
        }
        info!("WebSocket connection established - Client: {}", conn.label());

        let writer = write_frames(write, outbound_rx, conn.label());
        let reader = async {
            self.read_frames(read, &conn).await;
            self.release(&conn);
        };
        tokio::join!(writer, reader);

        conn.mark_closed();
        info!("WebSocket connection closed - Client: {}", conn.label());
    }

    async fn read_frames(&self, mut read: WsSource, conn: &ClientConnection) {
        let mut identified = false;

        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if !identified {
                        identified = true;
                        if !self.identify(conn, &text) {
                            break;
                        }
                        continue;
                    }
                    log_inbound(conn, &text);
                }
                Ok(Message::Binary(data)) => {
                    debug!("Ignoring {} byte binary frame from client {}", data.len(), conn.label());
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    debug!("Received ping/pong from client {}", conn.label());
                }
                Ok(Message::Close(close_frame)) => {
                    info!("Client {} sent close frame: {:?}", conn.label(), close_frame);
                    break;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!("Error reading from client {}: {}", conn.label(), TransportError::from(e));
                    break;
                }
            }
        }
    }

    /// Handles the first text frame. A frame carrying none of the
    /// identification fields is an ordinary message and the client stays
    /// unidentified. Returns false if the client was rejected.
    fn identify(&self, conn: &ClientConnection, text: &str) -> bool {
        let identity = match ClientIdentity::from_json(text) {
            Ok(identity) if !identity.is_empty() => {
                info!("Client {} identified as {}", conn.label(), identity.describe());
                conn.set_identity(identity.clone());
                Some(identity)
            }
            Ok(_) => {
                debug!("Client {} sent no identification", conn.label());
                log_inbound(conn, text);
                None
            }
            Err(e) => {
                warn!("Client {} sent an unreadable first frame: {}", conn.label(), e);
                None
            }
        };

        match self.authenticator.authenticate(identity.as_ref()) {
            Ok(()) => true,
            Err(rejection) => {
                warn!("Client {} {}", conn.label(), rejection);
                self.unregister(conn);
                conn.close(CloseCode::Policy, rejection.reason);
                false
            }
        }
    }

    fn register(&self, conn: &Rc<ClientConnection>) -> bool {
        match self.registry.try_borrow_mut() {
            Ok(mut registry) => registry.register(conn.clone()),
            Err(_) => {
                warn!("Registry busy, refusing client {}", conn.label());
                false
            }
        }
    }

    fn unregister(&self, conn: &ClientConnection) {
        match self.registry.try_borrow_mut() {
            Ok(mut registry) => {
                registry.unregister(&conn.id());
            }
            // The connection is Closing from here on, so the next broadcast
            // fails its send and removes it.
            Err(_) => warn!("Registry busy, client {} left for broadcast cleanup", conn.label()),
        }
    }

    fn release(&self, conn: &ClientConnection) {
        self.unregister(conn);
        conn.close(CloseCode::Normal, "connection closed");
    }
}

fn log_inbound(conn: &ClientConnection, text: &str) {
    match serde_json::from_str::<Value>(text).map_err(DecodeError::from) {
        Ok(value) => info!("Received message from client {}: {}", conn.label(), value),
        Err(e) => warn!("Discarding frame from client {}: {}", conn.label(), e),
    }
}

/// Drains the connection's outbound queue into the socket, one whole frame
/// at a time, acknowledging each write. Ends on a close request or the first
/// failed write.
async fn write_frames<S>(mut write: S, mut outbound: mpsc::UnboundedReceiver<Outbound>, label: String)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let result = write
                    .send(Message::Text(frame.text().to_string()))
                    .await
                    .map_err(TransportError::from);
                let failed = result.is_err();
                frame.complete(result);
                if failed {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                debug!("Sending close frame to client {}: {}", label, reason);
                if let Err(e) = write.send(Message::Close(Some(CloseFrame { code, reason }))).await {
                    debug!("Close frame to client {} not sent: {}", label, e);
                }
                break;
            }
        }
    }

    // Frames still queued behind a failure or close will never be written.
    outbound.close();
    while let Ok(item) = outbound.try_recv() {
        if let Outbound::Frame(frame) = item {
            frame.complete(Err(TransportError::Closed));
        }
    }
}
