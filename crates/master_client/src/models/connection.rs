//! Client configuration, credentials and pool status models.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MasterError;
use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;

/// Default master port.
pub const DEFAULT_PORT: u16 = 4582;

/// Default maximum number of pooled sessions.
pub const DEFAULT_POOL_SIZE: usize = 32;

/// Default maximum session age (1 hour).
pub const DEFAULT_MAX_CONNECTION_AGE_SECS: u64 = 60 * 60;

/// Default idle period before the invalidation listener stops.
pub const DEFAULT_LISTENER_IDLE_SECS: u64 = 60;

/// Default attempts made by the retry layer.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Credentials presented during the handshake.
///
/// `Debug` output never contains the password.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    /// Authenticating username.
    pub username: String,
    /// Password for `username`.
    pub password: String,
    /// Act as this user after authenticating, if set.
    pub switch_user: Option<String>,
    /// Restrict the session to one daemon server, if set.
    pub daemon_server: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            switch_user: None,
            daemon_server: None,
        }
    }

    /// Set the switch-user identity.
    pub fn with_switch_user(mut self, switch_user: impl Into<String>) -> Self {
        self.switch_user = Some(switch_user.into());
        self
    }

    /// Scope the session to a daemon server.
    pub fn with_daemon_server(mut self, server: impl Into<String>) -> Self {
        self.daemon_server = Some(server.into());
        self
    }

    /// The identity the master will act as.
    pub fn effective_user(&self) -> &str {
        self.switch_user.as_deref().unwrap_or(&self.username)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("switch_user", &self.switch_user)
            .field("daemon_server", &self.daemon_server)
            .finish()
    }
}

/// TLS settings for sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap sessions in TLS.
    pub enabled: bool,
    /// PEM file with an extra trusted root certificate.
    pub ca_cert_path: Option<PathBuf>,
    /// Skip certificate verification (testing only).
    pub accept_invalid_certs: bool,
}

/// Unit of the per-call timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert an amount of this unit to a duration.
    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            Self::Nanoseconds => Duration::from_nanos(amount),
            Self::Microseconds => Duration::from_micros(amount),
            Self::Milliseconds => Duration::from_millis(amount),
            Self::Seconds => Duration::from_secs(amount),
            Self::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            Self::Hours => Duration::from_secs(amount.saturating_mul(60 * 60)),
            Self::Days => Duration::from_secs(amount.saturating_mul(24 * 60 * 60)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nanoseconds => "nanoseconds",
            Self::Microseconds => "microseconds",
            Self::Milliseconds => "milliseconds",
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ns" | "nanos" | "nanoseconds" => Ok(Self::Nanoseconds),
            "us" | "micros" | "microseconds" => Ok(Self::Microseconds),
            "ms" | "millis" | "milliseconds" => Ok(Self::Milliseconds),
            "s" | "secs" | "seconds" => Ok(Self::Seconds),
            "m" | "mins" | "minutes" => Ok(Self::Minutes),
            "h" | "hours" => Ok(Self::Hours),
            "d" | "days" => Ok(Self::Days),
            other => Err(MasterError::config(format!("unknown time unit {other:?}"))),
        }
    }
}

/// Everything needed to build a connector.
///
/// Equal configurations share one memoized factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Transport registry key.
    pub transport: String,
    /// Master hostname or IP.
    pub host: String,
    /// Master port.
    pub port: u16,
    /// Source address for outgoing sessions.
    pub local_ip: Option<IpAddr>,
    /// TLS settings.
    pub tls: TlsConfig,
    /// Handshake credentials.
    pub credentials: Credentials,
    /// Maximum pooled sessions.
    pub pool_size: usize,
    /// Sessions older than this are retired instead of reused.
    pub max_connection_age_secs: u64,
    /// Session establishment timeout.
    pub connect_timeout_secs: u64,
    /// Per-call timeout amount (None = no timeout).
    pub timeout: Option<u64>,
    /// Unit of `timeout`.
    pub timeout_unit: TimeUnit,
    /// Attempts made by the retry layer, including the first.
    pub retry_attempts: u32,
    /// Log every call.
    pub trace: bool,
    /// Retry idempotent calls on transport failures.
    pub retry: bool,
    /// Cache whole tables.
    pub cache: bool,
    /// Refuse calls from threads marked as UI threads.
    pub disable_ui_affinity: bool,
    /// Idle period before the invalidation listener stops.
    pub listener_idle_secs: u64,
    /// Reload snapshots older than this even without invalidation.
    pub cache_ttl_secs: Option<u64>,
    /// Largest frame accepted on a session.
    pub max_frame_length: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            host: String::new(),
            port: DEFAULT_PORT,
            local_ip: None,
            tls: TlsConfig::default(),
            credentials: Credentials::default(),
            pool_size: DEFAULT_POOL_SIZE,
            max_connection_age_secs: DEFAULT_MAX_CONNECTION_AGE_SECS,
            connect_timeout_secs: 10,
            timeout: None,
            timeout_unit: TimeUnit::Seconds,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            trace: false,
            retry: true,
            cache: true,
            disable_ui_affinity: false,
            listener_idle_secs: DEFAULT_LISTENER_IDLE_SECS,
            cache_ttl_secs: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl MasterConfig {
    /// Create a configuration with the required fields.
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self { host: host.into(), credentials, ..Self::default() }
    }

    /// Create a builder for complex configurations.
    pub fn builder() -> MasterConfigBuilder {
        MasterConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MasterError> {
        if self.transport.is_empty() {
            return Err(MasterError::config("Transport name is required"));
        }
        if self.host.is_empty() {
            return Err(MasterError::config("Host is required"));
        }
        if self.port == 0 {
            return Err(MasterError::config("Port must be non-zero"));
        }
        if self.credentials.username.is_empty() {
            return Err(MasterError::config("Username is required"));
        }
        if self.pool_size == 0 {
            return Err(MasterError::config("Pool size must be at least 1"));
        }
        if self.max_connection_age_secs == 0 {
            return Err(MasterError::config("Max connection age must be non-zero"));
        }
        if self.retry && self.retry_attempts == 0 {
            return Err(MasterError::config("Retry attempts must be at least 1"));
        }
        if self.timeout == Some(0) {
            return Err(MasterError::config("Timeout must be non-zero when set"));
        }
        if self.max_frame_length < 64 {
            return Err(MasterError::config("Max frame length must be at least 64 bytes"));
        }
        if self.tls.ca_cert_path.is_some() && !self.tls.enabled {
            return Err(MasterError::config("A CA certificate was given but TLS is disabled"));
        }
        Ok(())
    }

    /// Read a resolved property set.
    ///
    /// Missing required keys and unparsable values are reported here, before
    /// any connection is attempted.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, MasterError> {
        let props = Properties(props);
        let defaults = Self::default();

        let credentials = Credentials {
            username: props.required("master.username")?.to_string(),
            password: props.required("master.password")?.to_string(),
            switch_user: props.get("master.switch_user").map(String::from),
            daemon_server: props.get("master.daemon_server").map(String::from),
        };

        let config = Self {
            transport: props.get("master.transport").unwrap_or(&defaults.transport).to_string(),
            host: props.required("master.host")?.to_string(),
            port: props.parse("master.port")?.unwrap_or(defaults.port),
            local_ip: props.parse("master.local_ip")?,
            tls: TlsConfig {
                enabled: props.parse("master.tls.enabled")?.unwrap_or(false),
                ca_cert_path: props.get("master.tls.ca_cert").map(PathBuf::from),
                accept_invalid_certs: props
                    .parse("master.tls.accept_invalid_certs")?
                    .unwrap_or(false),
            },
            credentials,
            pool_size: props.parse("master.pool.size")?.unwrap_or(defaults.pool_size),
            max_connection_age_secs: props
                .parse("master.pool.max_connection_age")?
                .unwrap_or(defaults.max_connection_age_secs),
            connect_timeout_secs: props
                .parse("master.connect_timeout")?
                .unwrap_or(defaults.connect_timeout_secs),
            timeout: props.parse("master.timeout")?,
            timeout_unit: props.parse("master.timeout.unit")?.unwrap_or(defaults.timeout_unit),
            retry_attempts: props
                .parse("master.retry.attempts")?
                .unwrap_or(defaults.retry_attempts),
            trace: props.parse("master.trace")?.unwrap_or(defaults.trace),
            retry: props.parse("master.retry")?.unwrap_or(defaults.retry),
            cache: props.parse("master.cache")?.unwrap_or(defaults.cache),
            disable_ui_affinity: props
                .parse("master.disable_ui_affinity")?
                .unwrap_or(defaults.disable_ui_affinity),
            listener_idle_secs: props
                .parse("master.listener.idle_secs")?
                .unwrap_or(defaults.listener_idle_secs),
            cache_ttl_secs: props.parse("master.cache.ttl_secs")?,
            max_frame_length: props
                .parse("master.max_frame_length")?
                .unwrap_or(defaults.max_frame_length),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON document.
    pub fn from_json(json: &str) -> Result<Self, MasterError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Per-call timeout, if configured.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout.map(|amount| self.timeout_unit.to_duration(amount))
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn listener_idle(&self) -> Duration {
        Duration::from_secs(self.listener_idle_secs)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    /// `host:port` of the master.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the display URL (without password).
    pub fn display_url(&self) -> String {
        let scheme = if self.tls.enabled { "masters" } else { "master" };
        format!("{scheme}://{}@{}:{}", self.credentials.username, self.host, self.port)
    }
}

/// Borrowed view over a property map.
struct Properties<'a>(&'a HashMap<String, String>);

impl<'a> Properties<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<&'a str, MasterError> {
        self.get(key)
            .ok_or_else(|| MasterError::config(format!("Missing required property {key}")))
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, MasterError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    MasterError::config(format!("Invalid value {raw:?} for {key}: {e}"))
                })
            })
            .transpose()
    }
}

/// Builder for MasterConfig.
#[derive(Debug, Default)]
pub struct MasterConfigBuilder {
    config: MasterConfig,
}

impl MasterConfigBuilder {
    /// Set the transport registry key.
    pub fn transport(mut self, transport: impl Into<String>) -> Self {
        self.config.transport = transport.into();
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Bind outgoing sessions to a source address.
    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.config.local_ip = Some(ip);
        self
    }

    /// Set the TLS settings.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = tls;
        self
    }

    /// Set the credentials.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = credentials;
        self
    }

    /// Set the pool size.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the maximum session age.
    pub fn max_connection_age_secs(mut self, secs: u64) -> Self {
        self.config.max_connection_age_secs = secs;
        self
    }

    /// Set the per-call timeout.
    pub fn timeout(mut self, amount: u64, unit: TimeUnit) -> Self {
        self.config.timeout = Some(amount);
        self.config.timeout_unit = unit;
        self
    }

    /// Set the retry attempts.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    /// Enable or disable the trace layer.
    pub fn trace(mut self, enabled: bool) -> Self {
        self.config.trace = enabled;
        self
    }

    /// Enable or disable the retry layer.
    pub fn retry(mut self, enabled: bool) -> Self {
        self.config.retry = enabled;
        self
    }

    /// Enable or disable the row cache layer.
    pub fn cache(mut self, enabled: bool) -> Self {
        self.config.cache = enabled;
        self
    }

    /// Enable or disable the UI-affinity guard.
    pub fn disable_ui_affinity(mut self, enabled: bool) -> Self {
        self.config.disable_ui_affinity = enabled;
        self
    }

    /// Set the listener idle period.
    pub fn listener_idle_secs(mut self, secs: u64) -> Self {
        self.config.listener_idle_secs = secs;
        self
    }

    /// Set the snapshot TTL.
    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache_ttl_secs = Some(secs);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<MasterConfig, MasterError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// State of the background invalidation listener.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ListenerStatus {
    /// Not running
    #[default]
    Stopped,
    /// Opening its dedicated session
    Connecting,
    /// Receiving pushes
    Listening,
    /// Failed; will retry after a backoff
    Backoff {
        /// Human-readable error message
        message: String,
        /// Consecutive failures so far
        failures: u32,
    },
}

impl ListenerStatus {
    /// Check if pushes are being received.
    pub fn is_listening(&self) -> bool {
        matches!(self, Self::Listening)
    }

    /// Check if the listener is stopped.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Session pool status.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Maximum pool capacity
    pub max_size: usize,
    /// Current sessions (idle + active)
    pub size: usize,
    /// Idle sessions
    pub available: usize,
    /// Tasks waiting for sessions
    pub waiting: usize,
}

impl PoolStatus {
    /// Check if the pool is healthy.
    pub fn is_healthy(&self) -> bool {
        self.waiting == 0
    }

    /// Get the number of active (in-use) sessions.
    pub fn active(&self) -> usize {
        self.size.saturating_sub(self.available)
    }

    /// Get pool utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.active() as f64 / self.max_size as f64) * 100.0
        }
    }
}
