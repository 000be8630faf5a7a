use std::sync::Arc;
use log::{error, info};

use signal_socket::config::ServerConfig;
use signal_socket::control::{ControlSurface, StopHandle, HELP_TEXT};
use signal_socket::shutdown::wait_for_shutdown_signal;
use signal_socket::EventLoopBridge;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let bridge = Arc::new(EventLoopBridge::new(config.clone()));
    let addr = match bridge.start() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to start signal server: {}", e);
            return Err(e.into());
        }
    };
    info!("Signal server ready at ws://{}", addr);

    let stop = StopHandle::new();
    if config.console_enabled {
        println!("{}", HELP_TEXT);
        ControlSurface::new(bridge.clone(), stop.clone())
            .with_timeout(config.broadcast_timeout)
            .spawn()?;
    }

    tokio::select! {
        _ = stop.wait() => info!("Stop requested from console"),
        result = wait_for_shutdown_signal() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!("Could not listen for OS signals: {}", e);
                stop.wait().await;
            }
        },
    }

    let stopping = bridge.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    info!("Signal server stopped");
    Ok(())
}
