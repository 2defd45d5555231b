//! Client configuration.

use rill_protocol::deliver::CompressionRegistry;
use rill_protocol::DEFAULT_PORT;
use std::path::PathBuf;
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for broker verification.
    /// If None, webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS / EXTERNAL auth).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key.
    pub client_key_path: Option<PathBuf>,
    /// Skip broker certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the configured host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// SASL username; PLAIN is attempted only when set.
    pub username: Option<String>,
    /// SASL password.
    pub password: String,
    /// Virtual host opened after the handshake.
    pub vhost: String,
    /// Optional connection name advertised in peer properties.
    pub connection_name: Option<String>,
    /// Requested heartbeat interval in seconds; 0 leaves it to the broker.
    pub heartbeat: u32,
    /// Requested maximum frame size in bytes; 0 leaves it to the broker.
    pub frame_max: u32,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Correlated-request timeout.
    pub request_timeout: Duration,
    /// Timeout waiting for the broker's Tune push.
    pub tune_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Validate the CRC of delivered chunks.
    pub check_crc: bool,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
    /// Sub-batch decompression table; gzip is pre-registered.
    pub compression: CompressionRegistry,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: None,
            password: String::new(),
            vhost: "/".to_string(),
            connection_name: None,
            heartbeat: 0,
            frame_max: 0,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            tune_timeout: Duration::from_secs(10),
            no_delay: true,
            check_crc: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: None,
            compression: CompressionRegistry::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_heartbeat(mut self, seconds: u32) -> Self {
        self.heartbeat = seconds;
        self
    }

    pub fn with_frame_max(mut self, bytes: u32) -> Self {
        self.frame_max = bytes;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tune_timeout(mut self, timeout: Duration) -> Self {
        self.tune_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_crc_check_disabled(mut self) -> Self {
        self.check_crc = false;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_compression(mut self, registry: CompressionRegistry) -> Self {
        self.compression = registry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("localhost");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.vhost, "/");
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.check_crc);
        assert!(config.username.is_none());
    }

    #[test]
    fn buffer_size_is_clamped() {
        let config = ClientConfig::new("localhost").with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ClientConfig::new("localhost").with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn credentials_builder() {
        let config = ClientConfig::new("localhost").with_credentials("guest", "guest");
        assert_eq!(config.username.as_deref(), Some("guest"));
        assert_eq!(config.password, "guest");
    }
}
