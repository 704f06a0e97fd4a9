//! Configuration management

use crate::crypto::SecurityProvider;
use crate::proxy::Credentials;
use crate::tunnel::TunnelConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server (relay) configuration
    pub server: Option<ServerConfig>,
    /// Client (proxy front-end) configuration
    pub client: Option<ClientConfig>,
    /// Security provider selection; must match on both ends
    pub security: SecurityConfig,
    /// Tunnel timers
    pub tunnel: TunnelSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML text
    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject settings the tunnel cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.tunnel.disconnect_batch == 0 {
            return Err(crate::Error::Config(
                "tunnel.disconnect_batch must be at least 1".to_string(),
            ));
        }
        if self.tunnel.disconnect_interval_ms == 0 {
            return Err(crate::Error::Config(
                "tunnel.disconnect_interval_ms must be at least 1".to_string(),
            ));
        }
        // Building the provider checks the algorithm names
        self.security.provider()?;
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Maximum concurrent tunnel connections
    pub max_connections: usize,
    /// Timeout for outbound connections, in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            max_connections: 1000,
            connect_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay address
    pub server: String,
    /// Local SOCKS5 proxy address
    pub socks5_listen: Option<String>,
    /// Local HTTP proxy address
    pub http_listen: Option<String>,
    /// Maximum concurrent tunnels (0 = unbounded)
    pub max_tunnels: usize,
    /// Open the first stream of a new tunnel together with the handshake
    pub fast_connect: bool,
    /// Username required from local proxy clients
    pub proxy_username: Option<String>,
    /// Password required from local proxy clients
    pub proxy_password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8443".to_string(),
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            http_listen: Some("127.0.0.1:8080".to_string()),
            max_tunnels: 4,
            fast_connect: true,
            proxy_username: None,
            proxy_password: None,
        }
    }
}

impl ClientConfig {
    /// Credentials for the local proxies, if both parts are set
    pub fn proxy_credentials(&self) -> Option<Credentials> {
        match (&self.proxy_username, &self.proxy_password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Security provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Payload cipher: chacha20-poly1305, aes-256-gcm, plain
    pub cryptor: String,
    /// Key generator: hkdf-sha256, pbkdf2-sha256
    pub key_generator: String,
    /// Authenticator: hmac-sha256
    pub authenticator: String,
    /// Shared secret
    pub secret: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cryptor: "chacha20-poly1305".to_string(),
            key_generator: "hkdf-sha256".to_string(),
            authenticator: "hmac-sha256".to_string(),
            secret: String::new(),
        }
    }
}

impl SecurityConfig {
    /// Resolve the configured names
    pub fn provider(&self) -> Result<SecurityProvider, crate::Error> {
        Ok(SecurityProvider::from_names(
            &self.cryptor,
            &self.key_generator,
            &self.authenticator,
            self.secret.as_bytes(),
        )?)
    }
}

/// Tunnel timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Read/write idle timeout in seconds; build default when unset
    pub idle_timeout_secs: Option<u64>,
    /// Handshake (and connect) timeout in seconds
    pub handshake_timeout_secs: u64,
    /// Close tunnels carrying no streams after this many seconds
    pub idle_close_secs: u64,
    /// Disconnect batch flush period in milliseconds
    pub disconnect_interval_ms: u64,
    /// Maximum stream ids per disconnect batch
    pub disconnect_batch: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        let defaults = TunnelConfig::default();
        Self {
            idle_timeout_secs: None,
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            idle_close_secs: defaults.idle_close.as_secs(),
            disconnect_interval_ms: defaults.disconnect_interval.as_millis() as u64,
            disconnect_batch: defaults.disconnect_batch,
        }
    }
}

impl TunnelSettings {
    pub fn tunnel_config(&self) -> TunnelConfig {
        let defaults = TunnelConfig::default();
        TunnelConfig {
            idle_timeout: self
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            idle_close: Duration::from_secs(self.idle_close_secs),
            disconnect_interval: Duration::from_millis(self.disconnect_interval_ms),
            disconnect_batch: self.disconnect_batch,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error, `shroud=debug`)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    ///
    /// `RUST_LOG` wins over `level_override`, which wins over the configured level.
    pub fn init(&self, level_override: Option<&str>) -> Result<(), crate::Error> {
        use tracing_subscriber::EnvFilter;

        let level = level_override.unwrap_or(&self.level);
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| crate::Error::Config(format!("Invalid log level '{}': {}", level, e)))?;

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = match self.format.to_lowercase().as_str() {
            "json" => builder.json().try_init(),
            "compact" => builder.compact().try_init(),
            _ => builder.pretty().try_init(),
        };

        result.map_err(|e| crate::Error::Config(format!("Failed to set up logging: {}", e)))
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        security: SecurityConfig {
            secret: "change me".to_string(),
            ..SecurityConfig::default()
        },
        tunnel: TunnelSettings::default(),
        logging: LoggingConfig::default(),
    }
}
