//! Error types for the master client.
//!
//! Errors fall into a small taxonomy that the decorator layers branch on:
//! transport failures (the session is discarded and the call may be retried),
//! protocol failures reported by the master (never retried), cache invariant
//! violations (programming faults), configuration errors (raised before any
//! connection is attempted) and timeout/cancellation (never conflated with
//! transport failures).

use thiserror::Error;

use crate::models::TableId;
use crate::protocol::Command;

/// Main error type for the master client.
#[derive(Debug, Error)]
pub enum MasterError {
    /// Socket or stream failure. The session that produced it is never reused.
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed or truncated data on the wire.
    #[error("Decode error: {message}")]
    Decode {
        /// Human-readable error message.
        message: String,
    },

    /// The master answered with a non-DONE status.
    #[error("Server error {code} during {command}: {message}")]
    Protocol {
        /// Status code reported by the master.
        code: u32,
        /// Message reported by the master.
        message: String,
        /// Command that failed.
        command: Command,
        /// Table the command addressed, if any.
        table: Option<TableId>,
    },

    /// The master refused the session during the handshake.
    #[error("Handshake rejected with code {code}: {message}")]
    Handshake {
        /// Status code reported by the master.
        code: u32,
        /// Message reported by the master.
        message: String,
    },

    /// The call deadline elapsed.
    #[error("Timed out after {elapsed_ms}ms during {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// How long the call ran before the deadline fired.
        elapsed_ms: u64,
    },

    /// The caller cancelled the call.
    #[error("Call cancelled during {operation}")]
    Cancelled {
        /// What was being waited on.
        operation: String,
    },

    /// No session became available before the pool wait timeout.
    #[error("Pool timeout: {message}")]
    PoolTimeout {
        /// Human-readable error message.
        message: String,
        /// Number of tasks waiting for sessions.
        waiting: usize,
    },

    /// Missing or invalid configuration.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// The configured transport has no registered implementation.
    #[error("Unsupported transport: {name}")]
    UnsupportedTransport {
        /// Registry key that was requested.
        name: String,
        /// Keys that are registered.
        available: Vec<String>,
    },

    /// A cache invariant was violated (duplicate unique value, bad schema).
    #[error("Invariant violated on {table}: {message}")]
    Invariant {
        /// Table whose rows or schema broke the invariant.
        table: TableId,
        /// Human-readable error message.
        message: String,
    },

    /// The call was made from a thread that must not block on the master.
    #[error("Affinity error: {message}")]
    Affinity {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MasterError {
    // ========== Constructors ==========

    /// Create a new transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), source: None }
    }

    /// Create a new transport error with source.
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }

    /// Create a protocol error from a server status.
    pub fn protocol(
        code: u32,
        message: impl Into<String>,
        command: Command,
        table: Option<TableId>,
    ) -> Self {
        Self::Protocol { code, message: message.into(), command, table }
    }

    /// Create a handshake rejection error.
    pub fn handshake(code: u32, message: impl Into<String>) -> Self {
        Self::Handshake { code, message: message.into() }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), elapsed_ms }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    /// Create a new pool timeout error.
    pub fn pool_timeout(message: impl Into<String>, waiting: usize) -> Self {
        Self::PoolTimeout { message: message.into(), waiting }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create an unsupported transport error.
    pub fn unsupported_transport(name: impl Into<String>, available: Vec<String>) -> Self {
        Self::UnsupportedTransport { name: name.into(), available }
    }

    /// Create a cache invariant error.
    pub fn invariant(table: TableId, message: impl Into<String>) -> Self {
        Self::Invariant { table, message: message.into() }
    }

    /// Create an affinity error.
    pub fn affinity(message: impl Into<String>) -> Self {
        Self::Affinity { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    // ========== Methods ==========

    /// Whether the owning session must be discarded.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Decode { .. })
    }

    /// Whether a retry of an idempotent call may succeed.
    ///
    /// Timeouts and cancellations are excluded: the deadline already elapsed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Decode { .. } | Self::PoolTimeout { .. })
    }

    /// Check if this error represents an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error represents a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "Transport",
            Self::Decode { .. } => "Transport",
            Self::Protocol { .. } => "Protocol",
            Self::Handshake { .. } => "Protocol",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled { .. } => "Cancelled",
            Self::PoolTimeout { .. } => "Pool",
            Self::Config { .. } => "Config",
            Self::UnsupportedTransport { .. } => "Config",
            Self::Invariant { .. } => "Invariant",
            Self::Affinity { .. } => "Affinity",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Transport { .. } => Some("Check that the master is reachable"),
            Self::Decode { .. } => Some("Client and master may disagree on protocol version"),
            Self::Protocol { .. } => None,
            Self::Handshake { .. } => Some("Check the username, password and switch user"),
            Self::Timeout { .. } => Some("Increase the call timeout or retry later"),
            Self::Cancelled { .. } => None,
            Self::PoolTimeout { .. } => Some("Increase the pool size or release sessions sooner"),
            Self::Config { .. } => Some("Check the client configuration properties"),
            Self::UnsupportedTransport { .. } => Some("Register the transport before building"),
            Self::Invariant { .. } => Some("Please report this issue"),
            Self::Affinity { .. } => Some("Move the call off the restricted thread"),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Server status code (if applicable).
    pub fn server_code(&self) -> Option<u32> {
        match self {
            Self::Protocol { code, .. } | Self::Handshake { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Protocol { code, command, table, .. } => {
                let mut parts = vec![format!("Code: {code}"), format!("Command: {command}")];
                if let Some(table) = table {
                    parts.push(format!("Table: {table}"));
                }
                Some(parts.join("\n"))
            }
            Self::PoolTimeout { waiting, .. } => {
                Some(format!("{waiting} tasks waiting for sessions"))
            }
            Self::UnsupportedTransport { available, .. } => {
                Some(format!("Registered transports: {}", available.join(", ")))
            }
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Transport Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for expanded display.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from std::io::Error to MasterError.
impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        MasterError::Transport { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from serde_json::Error to MasterError.
impl From<serde_json::Error> for MasterError {
    fn from(err: serde_json::Error) -> Self {
        MasterError::Config { message: format!("JSON error: {err}") }
    }
}

/// Convert from native_tls::Error to MasterError.
impl From<native_tls::Error> for MasterError {
    fn from(err: native_tls::Error) -> Self {
        MasterError::Transport {
            message: format!("TLS error: {err}"),
            source: Some(Box::new(err)),
        }
    }
}
