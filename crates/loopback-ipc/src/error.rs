//! Error types for the loopback IPC layer.
//!
//! Connection-lifecycle failures get their own variants. Conditions met while
//! scanning ports, such as a busy port or a server of another revision, are
//! absorbed by the dialer and never reach the caller.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the IPC library.
#[derive(Debug, Error)]
pub enum IpcError {
    // Connection lifecycle
    #[error(
        "No server {name} with protocol revision {protocol_revision} found after probing {attempts} port(s)"
    )]
    ServerNotFound {
        name: String,
        protocol_revision: u32,
        attempts: u32,
    },

    #[error(
        "A server {name} with protocol revision {protocol_revision} is already running, please stop it"
    )]
    ServerAlreadyExists { name: String, protocol_revision: u32 },

    #[error("Client is already started")]
    ClientAlreadyStarted,

    #[error("Client is not available")]
    ClientNotAvailable,

    #[error("Protocol version mismatch: expected {expected}, server offered {actual}")]
    ProtocolVersionMismatch { expected: String, actual: String },

    #[error("Request {method} failed: {source}")]
    BadExecRequest {
        method: String,
        #[source]
        source: Box<IpcError>,
    },

    // Transport errors
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to bind a loopback port starting at {first_port} after {attempts} attempt(s)")]
    BindFailed {
        first_port: u16,
        attempts: u32,
        #[source]
        source: Option<std::io::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl IpcError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        IpcError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Wrap a failed remote call, keeping the original cause attached.
    ///
    /// Fail-fast availability errors are passed through untouched so callers
    /// can still match on `ClientNotAvailable`.
    pub fn bad_exec(method: &str, cause: IpcError) -> Self {
        match cause {
            IpcError::ClientNotAvailable | IpcError::BadExecRequest { .. } => cause,
            other => IpcError::BadExecRequest {
                method: method.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Connectivity (client not available, connection closed, timeout)
    /// - -32001: Request cancelled
    /// - -32002: Protocol version mismatch
    ///
    /// Remote errors keep the code the peer sent.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            IpcError::Json { .. } => -32700,
            IpcError::MethodNotFound(_) => -32601,
            IpcError::InvalidParams { .. } | IpcError::Validation { .. } => -32602,

            IpcError::ClientNotAvailable
            | IpcError::ConnectionClosed
            | IpcError::Timeout(_) => -32000,

            IpcError::Cancelled => -32001,

            IpcError::ProtocolVersionMismatch { .. } => -32002,

            IpcError::Remote { code, .. } => *code,

            IpcError::BadExecRequest { source, .. } => source.to_rpc_error_code(),

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Whether the error means the peer is gone rather than the request being bad.
    pub fn is_disconnect(&self) -> bool {
        match self {
            IpcError::ConnectionClosed | IpcError::ClientNotAvailable => true,
            IpcError::BadExecRequest { source, .. } => source.is_disconnect(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IpcError::ServerAlreadyExists {
            name: "T".into(),
            protocol_revision: 2,
        };
        assert_eq!(
            err.to_string(),
            "A server T with protocol revision 2 is already running, please stop it"
        );
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            IpcError::MethodNotFound("nope".into()).to_rpc_error_code(),
            -32601
        );
        assert_eq!(IpcError::ConnectionClosed.to_rpc_error_code(), -32000);
        assert_eq!(
            IpcError::Remote {
                code: -32050,
                message: "custom".into()
            }
            .to_rpc_error_code(),
            -32050
        );
    }

    #[test]
    fn test_bad_exec_keeps_cause() {
        let err = IpcError::bad_exec("add", IpcError::Timeout(Duration::from_millis(5)));
        match &err {
            IpcError::BadExecRequest { method, source } => {
                assert_eq!(method, "add");
                assert!(matches!(**source, IpcError::Timeout(_)));
            }
            other => panic!("Expected BadExecRequest, got: {:?}", other),
        }
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_bad_exec_passes_through_not_available() {
        let err = IpcError::bad_exec("add", IpcError::ClientNotAvailable);
        assert!(matches!(err, IpcError::ClientNotAvailable));
    }

    #[test]
    fn test_is_disconnect() {
        assert!(IpcError::bad_exec("x", IpcError::ConnectionClosed).is_disconnect());
        assert!(!IpcError::MethodNotFound("x".into()).is_disconnect());
    }
}
