use std::env;
use std::time::Duration;
use log::warn;

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8765";
pub const DEFAULT_BROADCAST_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Client Configuration
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8765";
pub const DEFAULT_CLIENT_ID: &str = "test_client_001";
pub const DEFAULT_CLIENT_TYPE: &str = "veighna_trader";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub broadcast_timeout: Duration,
    /// `None` fans out to every client at once.
    pub max_concurrent_sends: Option<usize>,
    pub console_enabled: bool,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            broadcast_timeout: Duration::from_millis(DEFAULT_BROADCAST_TIMEOUT_MS),
            max_concurrent_sends: None,
            console_enabled: true,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or(defaults.bind_address),
            broadcast_timeout: env::var("BROADCAST_TIMEOUT_MS")
                .ok()
                .and_then(|v| parse_or_warn::<u64>("BROADCAST_TIMEOUT_MS", &v))
                .map(Duration::from_millis)
                .unwrap_or(defaults.broadcast_timeout),
            max_concurrent_sends: env::var("MAX_CONCURRENT_SENDS")
                .ok()
                .and_then(|v| parse_or_warn::<usize>("MAX_CONCURRENT_SENDS", &v)),
            console_enabled: env::var("CONSOLE_ENABLED")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(defaults.console_enabled),
            log_level: env::var("RUST_LOG")
                .unwrap_or(defaults.log_level),
        }
    }

    /// Binds to loopback on an OS-assigned port, for tests and embedding.
    pub fn ephemeral() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            console_enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bind_address.trim().is_empty() {
            return Err("Bind address must not be empty".to_string());
        }

        if self.broadcast_timeout.is_zero() {
            return Err("Broadcast timeout must be greater than zero".to_string());
        }

        if self.max_concurrent_sends == Some(0) {
            return Err("MAX_CONCURRENT_SENDS must be at least 1 when set".to_string());
        }

        Ok(())
    }

    pub fn log_config(&self) {
        println!("Server Configuration:");
        println!("  Bind Address: {}", self.bind_address);
        println!("  Broadcast Timeout: {:?}", self.broadcast_timeout);
        match self.max_concurrent_sends {
            Some(limit) => println!("  Max Concurrent Sends: {}", limit),
            None => println!("  Max Concurrent Sends: unbounded"),
        }
        println!("  Console: {}", if self.console_enabled { "enabled" } else { "disabled" });
        println!("  Log Level: {}", self.log_level);
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub client_id: String,
    pub client_type: String,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env::var("SERVER_URL").unwrap_or(defaults.server_url),
            client_id: env::var("CLIENT_ID").unwrap_or(defaults.client_id),
            client_type: env::var("CLIENT_TYPE").unwrap_or(defaults.client_type),
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(format!("Server URL must start with ws:// or wss://: {}", self.server_url));
        }
        if self.client_id.trim().is_empty() {
            return Err("Client id must not be empty".to_string());
        }
        Ok(())
    }

    pub fn log_config(&self) {
        println!("Client Configuration:");
        println!("  Server URL: {}", self.server_url);
        println!("  Client ID: {}", self.client_id);
        println!("  Client Type: {}", self.client_type);
        println!("  Log Level: {}", self.log_level);
    }
}

fn parse_or_warn<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}, using default", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.broadcast_timeout, Duration::from_secs(5));
        assert!(config.max_concurrent_sends.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_validation() {
        let mut config = ServerConfig::ephemeral();
        assert!(config.validate().is_ok());

        config.max_concurrent_sends = Some(0);
        assert!(config.validate().is_err());

        config.max_concurrent_sends = Some(4);
        config.broadcast_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config.broadcast_timeout = Duration::from_millis(10);
        config.bind_address = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_config_validation() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.server_url = "http://127.0.0.1:8765".to_string();
        assert!(config.validate().unwrap_err().contains("ws://"));
    }

    #[test]
    fn test_parse_or_warn() {
        assert_eq!(parse_or_warn::<u64>("X", " 250 "), Some(250));
        assert_eq!(parse_or_warn::<u64>("X", "soon"), None);
    }
}
