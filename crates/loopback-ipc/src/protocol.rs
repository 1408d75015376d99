//! Wire format and built-in method names.
//!
//! Each message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON-RPC 2.0 payload. Both directions of a connection carry requests and
//! responses; a payload with a `method` field is a request (or a notification
//! when it has no `id`), anything else is a response.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::IpcConfig;
use crate::error::{IpcError, Result};

/// Returns the server `VersionInfo`. Answered by servers.
pub const HANDSHAKE: &str = "handshake";
/// Liveness probe, answered with `true` by both sides.
pub const IS_ALIVE: &str = "isAlive";
/// Fire-and-forget notice from a client that it is going away.
pub const CLIENT_IS_SHUTTING_DOWN: &str = "clientIsShuttingDown";
/// Fire-and-forget notice pushed from the server to each client on stop.
pub const SERVER_IS_SHUTTING_DOWN: &str = "serverIsShuttingDown";

const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request. Without an `id` it is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl IpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::Number(id.into())),
        }
    }

    /// Create a notification, which gets no response.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl IpcResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Error response carrying the code and message of a local failure.
    pub fn from_error(id: Option<Value>, err: &IpcError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }

    /// Numeric id, if the response has one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Turn the response into its result, or the remote error.
    ///
    /// A missing result is treated as `null`.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(IpcError::Remote {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message read from the wire.
#[derive(Debug, Clone)]
pub enum IpcMessage {
    Request(IpcRequest),
    Response(IpcResponse),
}

impl IpcMessage {
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        if value.get("method").is_some() {
            Ok(IpcMessage::Request(serde_json::from_value(value)?))
        } else {
            Ok(IpcMessage::Response(serde_json::from_value(value)?))
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(IpcError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(IpcError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                payload.len(),
                IpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
