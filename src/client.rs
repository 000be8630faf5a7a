//! Receiving side: connects to the signal server, identifies itself and hands
//! every decoded [`Signal`] to a handler.

use std::io;
use std::sync::Arc;
use std::thread;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{ClientConfig, CLIENT_VERSION};
use crate::data::{ClientIdentity, Signal};
use crate::error::{ClientError, TransportError};

pub type SignalHandler = Arc<dyn Fn(Signal) + Send + Sync>;

pub struct SignalReceiver {
    config: ClientConfig,
    handler: SignalHandler,
}

impl SignalReceiver {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            handler: Arc::new(log_signal),
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(&self.config.client_id, &self.config.client_type, CLIENT_VERSION)
    }

    /// Connects and processes signals until the server closes the connection.
    pub async fn run(&self) -> Result<(), ClientError> {
        let url = self.config.server_url.as_str();
        let (ws_stream, _) = connect_async(url).await.map_err(|source| ClientError::Connect {
            url: url.to_string(),
            source,
        })?;
        info!("Connected to signal server at {}", url);

        let (mut write, mut read) = ws_stream.split();

        let identity = self.identity();
        match identity.to_json() {
            Ok(frame) => {
                write.send(Message::Text(frame)).await.map_err(TransportError::from)?;
                info!("Sent identification as {}", identity.describe());
            }
            Err(e) => warn!("Could not encode identification frame, continuing without it: {}", e),
        }

        while let Some(msg_result) = read.next().await {
            match msg_result.map_err(TransportError::from)? {
                Message::Text(text) => self.handle_frame(&text),
                Message::Close(close_frame) => {
                    info!("Server closed the connection: {:?}", close_frame);
                    break;
                }
                other => debug!("Ignoring non-text frame: {:?}", other),
            }
        }

        info!("Disconnected from signal server");
        Ok(())
    }

    /// Runs the receiver on its own thread with a private runtime.
    pub fn spawn(self) -> io::Result<thread::JoinHandle<Result<(), ClientError>>> {
        thread::Builder::new().name("signal-receiver".to_string()).spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            runtime.block_on(self.run())
        })
    }

    fn handle_frame(&self, text: &str) {
        match Signal::from_json(text) {
            Ok(signal) => (self.handler)(signal),
            Err(e) => warn!("Skipping frame that is not a JSON object: {} ({})", text, e),
        }
    }
}

fn log_signal(signal: Signal) {
    info!("=== Trading signal received ===");
    info!("Action: {}", signal.action.as_ref().map_or("-", |a| a.as_str()));
    info!("Symbol: {}", signal.symbol.as_deref().unwrap_or("-"));
    info!("Price: {}", signal.price.map_or_else(|| "-".to_string(), |p| p.to_string()));
    info!("Volume: {}", signal.volume.map_or_else(|| "-".to_string(), |v| v.to_string()));
}
