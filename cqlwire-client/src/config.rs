//! Connection configuration.
//!
//! [`ConnectionConfig`] is the in-process builder handed to `dial`.
//! [`ClientConfig`] is its file form, loaded in the following order (later
//! overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CQLWIRE_CONFIG or `--config`)
//! 3. Environment variables

use crate::auth::{Authenticator, PasswordAuthenticator};
use cqlwire_protocol::{Compressor, EventType, ProtocolVersion, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default connect and handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(11);

/// Default write coalescing window.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_micros(200);

/// Heartbeat interval until the first heartbeat succeeds.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Heartbeat interval once the connection has proven healthy.
pub const DEFAULT_HEARTBEAT_STEADY_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive heartbeat failures tolerated before closing.
pub const DEFAULT_HEARTBEAT_FAILURE_THRESHOLD: u32 = 5;

/// Smallest accepted frame size limit (64 KiB).
pub const MIN_FRAME_SIZE_LIMIT: usize = 64 * 1024;

/// Default CQL version sent in STARTUP.
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled web PKI roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the IP of the dialed address).
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

    fn apply_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = env("CQLWIRE_TLS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Some(path) = env("CQLWIRE_TLS_CA") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env("CQLWIRE_TLS_CERT") {
            self.client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env("CQLWIRE_TLS_KEY") {
            self.client_key_path = Some(PathBuf::from(path));
        }
        if let Some(insecure) = env("CQLWIRE_TLS_INSECURE") {
            self.insecure = parse_bool(&insecure);
        }
        if let Some(name) = env("CQLWIRE_TLS_SERVER_NAME") {
            self.server_name = Some(name);
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol version to speak; the server must accept it.
    pub protocol_version: ProtocolVersion,
    /// CQL version sent in STARTUP.
    pub cql_version: String,
    /// Bound on TCP connect, TLS and the protocol handshake.
    pub connect_timeout: Duration,
    /// Default deadline for each request.
    pub request_timeout: Duration,
    /// Deadline for a single socket write; falls back to `request_timeout`.
    pub write_timeout: Option<Duration>,
    /// Write coalescing window; `None` writes each frame directly.
    pub coalesce_window: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub heartbeat_steady_interval: Duration,
    /// Consecutive heartbeat failures tolerated; one more closes the connection.
    pub heartbeat_failure_threshold: u32,
    /// Largest response body accepted before draining it.
    pub max_frame_size: usize,
    /// Close the connection once this many requests have timed out.
    pub timeout_limit: Option<u64>,
    /// Keyspace to `USE` once the handshake completes.
    pub keyspace: Option<String>,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub tls: Option<TlsClientConfig>,
    /// Events to REGISTER for after the handshake.
    pub events: Vec<EventType>,
    pub driver_name: String,
    pub driver_version: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V4,
            cql_version: DEFAULT_CQL_VERSION.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            write_timeout: None,
            coalesce_window: Some(DEFAULT_COALESCE_WINDOW),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_steady_interval: DEFAULT_HEARTBEAT_STEADY_INTERVAL,
            heartbeat_failure_threshold: DEFAULT_HEARTBEAT_FAILURE_THRESHOLD,
            max_frame_size: MAX_FRAME_SIZE,
            timeout_limit: None,
            keyspace: None,
            compressor: None,
            authenticator: None,
            tls: None,
            events: Vec::new(),
            driver_name: env!("CARGO_PKG_NAME").to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_cql_version(mut self, version: impl Into<String>) -> Self {
        self.cql_version = version.into();
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

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_coalesce_window(mut self, window: Option<Duration>) -> Self {
        self.coalesce_window = window.filter(|w| !w.is_zero());
        self
    }

    pub fn with_heartbeat(mut self, initial: Duration, steady: Duration) -> Self {
        self.heartbeat_interval = initial;
        self.heartbeat_steady_interval = steady;
        self
    }

    /// Sets how many consecutive heartbeat failures are tolerated.
    ///
    /// The count is exclusive: the connection closes on failure
    /// `threshold + 1`, so a threshold of 0 closes on the first failure.
    pub fn with_heartbeat_failure_threshold(mut self, threshold: u32) -> Self {
        self.heartbeat_failure_threshold = threshold;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.clamp(MIN_FRAME_SIZE_LIMIT, MAX_FRAME_SIZE);
        self
    }

    pub fn with_timeout_limit(mut self, limit: u64) -> Self {
        self.timeout_limit = Some(limit);
        self
    }

    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_events(mut self, events: Vec<EventType>) -> Self {
        self.events = events;
        self
    }

    /// Timeout applied to individual socket writes.
    pub fn effective_write_timeout(&self) -> Duration {
        self.write_timeout.unwrap_or(self.request_timeout)
    }

    pub(crate) fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }
}

/// Authentication section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Accepted server authenticator classes; empty means the built-in list.
    pub approved_authenticators: Vec<String>,
}

/// Client configuration file model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Protocol version (1-5).
    pub protocol_version: u8,
    pub cql_version: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub write_timeout_ms: Option<u64>,
    /// Write coalescing window in microseconds; 0 disables coalescing.
    pub coalesce_window_us: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_steady_interval_ms: u64,
    pub heartbeat_failure_threshold: u32,
    pub max_frame_size: usize,
    pub timeout_limit: Option<u64>,
    pub keyspace: Option<String>,
    pub events: Vec<EventType>,
    pub auth: AuthConfig,
    pub tls: TlsClientConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V4.as_u8(),
            cql_version: DEFAULT_CQL_VERSION.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            write_timeout_ms: None,
            coalesce_window_us: DEFAULT_COALESCE_WINDOW.as_micros() as u64,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            heartbeat_steady_interval_ms: DEFAULT_HEARTBEAT_STEADY_INTERVAL.as_millis() as u64,
            heartbeat_failure_threshold: DEFAULT_HEARTBEAT_FAILURE_THRESHOLD,
            max_frame_size: MAX_FRAME_SIZE,
            timeout_limit: None,
            keyspace: None,
            events: Vec::new(),
            auth: AuthConfig::default(),
            tls: TlsClientConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CQLWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CQLWIRE_PROTOCOL_VERSION").and_then(|v| v.parse().ok()) {
            self.protocol_version = v;
        }
        if let Some(v) = env("CQLWIRE_CQL_VERSION") {
            self.cql_version = v;
        }
        if let Some(ms) = env("CQLWIRE_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = env("CQLWIRE_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.request_timeout_ms = ms;
        }
        if let Some(us) = env("CQLWIRE_COALESCE_WINDOW_US").and_then(|v| v.parse().ok()) {
            self.coalesce_window_us = us;
        }
        if let Some(ms) = env("CQLWIRE_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat_interval_ms = ms;
        }
        if let Some(ks) = env("CQLWIRE_KEYSPACE") {
            self.keyspace = Some(ks);
        }
        if let Some(user) = env("CQLWIRE_USERNAME") {
            self.auth.username = Some(user);
        }
        if let Some(pass) = env("CQLWIRE_PASSWORD") {
            self.auth.password = Some(pass);
        }
        self.tls.apply_overrides(env);
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ProtocolVersion::from_u8(self.protocol_version).map_err(|_| {
            ConfigError::ValidationError(format!(
                "protocol_version must be between 1 and 5, got {}",
                self.protocol_version
            ))
        })?;

        if self.auth.username.is_some() != self.auth.password.is_some() {
            return Err(ConfigError::ValidationError(
                "auth.username and auth.password must be set together".to_string(),
            ));
        }

        if self.tls.client_cert_path.is_some() != self.tls.client_key_path.is_some() {
            return Err(ConfigError::ValidationError(
                "tls.client_cert_path and tls.client_key_path must be set together".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves the file model into a [`ConnectionConfig`].
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        self.validate()?;
        let protocol_version = ProtocolVersion::from_u8(self.protocol_version)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let mut config = ConnectionConfig::new()
            .with_protocol_version(protocol_version)
            .with_cql_version(&self.cql_version)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_coalesce_window(Some(Duration::from_micros(self.coalesce_window_us)))
            .with_heartbeat(
                Duration::from_millis(self.heartbeat_interval_ms),
                Duration::from_millis(self.heartbeat_steady_interval_ms),
            )
            .with_heartbeat_failure_threshold(self.heartbeat_failure_threshold)
            .with_max_frame_size(self.max_frame_size)
            .with_events(self.events.clone());

        if let Some(ms) = self.write_timeout_ms {
            config = config.with_write_timeout(Duration::from_millis(ms));
        }
        if let Some(limit) = self.timeout_limit {
            config = config.with_timeout_limit(limit);
        }
        if let Some(ks) = &self.keyspace {
            config = config.with_keyspace(ks);
        }
        if let (Some(user), Some(pass)) = (&self.auth.username, &self.auth.password) {
            let auth = PasswordAuthenticator::new(user, pass)
                .with_approved_authenticators(self.auth.approved_authenticators.clone());
            config = config.with_authenticator(Arc::new(auth));
        }
        if self.tls.enabled {
            config = config.with_tls(self.tls.clone());
        }
        Ok(config)
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::ClientError {
    fn from(err: ConfigError) -> Self {
        crate::ClientError::Config(err.to_string())
    }
}
