//! Application services exposed over a connection.
//!
//! The server side implements `Service`; each call receives a typed
//! `RequestContext` naming the server version, the server-wide session, the
//! caller's per-client session and its connection. The client side may
//! implement `ClientService` to answer calls pushed from the server.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::connection::ClientConnection;
use crate::error::{IpcError, Result};
use crate::session::{ClientSession, ServerSession};
use crate::transport::RpcPeer;
use crate::version::Version;

/// Per-call context handed to a server `Service`.
pub struct RequestContext<'a, T: Service> {
    pub version: &'a Version,
    pub server_session: &'a Arc<ServerSession<T::ServerState>>,
    /// Present when the listener was built with a client session factory.
    pub client_session: Option<&'a Arc<ClientSession<T::ServerState, T::ClientState>>>,
    pub connection: &'a Arc<ClientConnection>,
}

impl<T: Service> RequestContext<'_, T> {
    pub fn server_state(&self) -> &T::ServerState {
        self.server_session.state()
    }

    pub fn client_state(&self) -> Option<&T::ClientState> {
        self.client_session.map(|session| session.state())
    }
}

/// Methods a server answers, beyond the built-in lifecycle methods.
#[async_trait]
pub trait Service: Sized + Send + Sync + 'static {
    /// State shared by all clients of one server run.
    type ServerState: Send + Sync + 'static;
    /// State kept per accepted client.
    type ClientState: Send + Sync + 'static;

    async fn call(
        &self,
        ctx: &RequestContext<'_, Self>,
        method: &str,
        params: Value,
    ) -> Result<Value>;
}

/// Per-call context handed to a `ClientService`.
pub struct ClientRequestContext<'a, T: ClientService> {
    /// Version the server reported during the handshake.
    pub version: &'a Version,
    pub session: Option<&'a Arc<T::Session>>,
    /// Connection to the server, for calling back.
    pub peer: &'a Arc<RpcPeer>,
}

/// Methods a client answers when the server calls it.
#[async_trait]
pub trait ClientService: Sized + Send + Sync + 'static {
    /// Per-connection client state produced by the dialer's session factory.
    type Session: Send + Sync + 'static;

    async fn call(
        &self,
        ctx: &ClientRequestContext<'_, Self>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let _ = (ctx, params);
        Err(IpcError::MethodNotFound(method.to_string()))
    }
}

/// A client that answers only the built-in methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl ClientService for NoCallbacks {
    type Session = ();
}

/// Decode request params, reporting failures as `InvalidParams`.
pub fn parse_params<P: DeserializeOwned>(params: Value) -> Result<P> {
    serde_json::from_value(params).map_err(|e| IpcError::InvalidParams {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_parse_params() {
        let params: AddParams = parse_params(json!({"a": 9, "b": 11})).unwrap();
        assert_eq!(params.a + params.b, 20);

        let tuple: (i64, i64) = parse_params(json!([3, 12])).unwrap();
        assert_eq!(tuple, (3, 12));
    }

    #[test]
    fn test_parse_params_invalid() {
        let result: Result<AddParams> = parse_params(json!({"a": "nine"}));
        match result {
            Err(e @ IpcError::InvalidParams { .. }) => assert_eq!(e.to_rpc_error_code(), -32602),
            other => panic!("Expected InvalidParams, got: {:?}", other),
        }
    }
}
