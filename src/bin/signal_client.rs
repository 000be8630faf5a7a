use log::{error, info};

use signal_socket::config::ClientConfig;
use signal_socket::shutdown::wait_for_shutdown_signal;
use signal_socket::SignalReceiver;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::from_env();

    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let receiver = SignalReceiver::new(config);
    tokio::select! {
        result = receiver.run() => {
            if let Err(e) = result {
                error!("Signal receiver stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = wait_for_shutdown_signal() => info!("Interrupted, disconnecting"),
    }

    Ok(())
}
