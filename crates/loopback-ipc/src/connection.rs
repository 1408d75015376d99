//! Server-side state for one accepted client.
//!
//! Liveness is polled: the server housekeeping loop calls `check_if_alive` on
//! every tick, which fires an `isAlive` probe once the keep-alive interval has
//! elapsed. A failed probe only flags the connection; the next housekeeping
//! tick removes and disposes it, so no probe ever tears down resources another
//! probe may still be using.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{IpcError, Result};
use crate::protocol::{IS_ALIVE, SERVER_IS_SHUTTING_DOWN};
use crate::transport::{lock, RpcPeer};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Schedule {
    last_alive: Instant,
    next_check: Instant,
}

/// One accepted client connection.
#[derive(Debug)]
pub struct ClientConnection {
    id: u64,
    peer: Arc<RpcPeer>,
    schedule: Mutex<Schedule>,
    connected_at: Instant,
    alive: AtomicBool,
    shutdown_requested: AtomicBool,
    disposed: AtomicBool,
    probe_in_flight: AtomicBool,
    keep_alive_interval: Duration,
    probe_timeout: Duration,
}

impl ClientConnection {
    pub(crate) fn new(
        peer: Arc<RpcPeer>,
        keep_alive_interval: Duration,
        probe_timeout: Duration,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            schedule: Mutex::new(Schedule {
                last_alive: now,
                next_check: now + keep_alive_interval,
            }),
            connected_at: now,
            alive: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            probe_in_flight: AtomicBool::new(false),
            keep_alive_interval,
            probe_timeout,
        })
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.peer_addr()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// When the client last answered a liveness probe (or connected).
    pub fn last_alive(&self) -> Instant {
        lock(&self.schedule).last_alive
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn is_probe_in_flight(&self) -> bool {
        self.probe_in_flight.load(Ordering::Acquire)
    }

    /// Whether calls to this client may be attempted at all.
    pub fn should_be_available(&self) -> bool {
        self.is_alive() && !self.is_disposed() && !self.peer.is_closed()
    }

    /// Whether the next housekeeping tick should drop this connection.
    pub(crate) fn should_remove(&self) -> bool {
        self.is_shutdown_requested() || self.is_disposed() || self.peer.is_closed()
    }

    /// Flag the connection for removal on the next housekeeping tick.
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            debug!("Client {} ({}) flagged for shutdown", self.id, self.peer_addr());
        }
    }

    /// Fire a liveness probe if one is due and none is running.
    ///
    /// Returns whether a probe was started.
    pub fn check_if_alive(self: &Arc<Self>) -> bool {
        if self.is_disposed() || self.is_shutdown_requested() {
            return false;
        }
        if Instant::now() < lock(&self.schedule).next_check {
            return false;
        }
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.probe().await });
        true
    }

    async fn probe(&self) {
        let outcome = self
            .peer
            .call_with_timeout(IS_ALIVE, Value::Null, self.probe_timeout)
            .await;
        let now = Instant::now();

        match outcome {
            Ok(Value::Bool(true)) => {
                self.alive.store(true, Ordering::Release);
                lock(&self.schedule).last_alive = now;
            }
            Ok(other) => {
                debug!("Client {} answered isAlive with {}", self.id, other);
                self.mark_not_alive();
            }
            Err(e) => {
                debug!("Client {} liveness probe failed: {}", self.id, e);
                self.mark_not_alive();
            }
        }

        lock(&self.schedule).next_check = now + self.keep_alive_interval;
        self.probe_in_flight.store(false, Ordering::Release);
    }

    fn mark_not_alive(&self) {
        self.alive.store(false, Ordering::Release);
        self.request_shutdown();
    }

    /// Push the server shutdown notice. Failures are ignored.
    pub async fn notify_server_shutdown(&self) {
        if self.is_disposed() {
            return;
        }
        self.peer
            .notify_best_effort(SERVER_IS_SHUTTING_DOWN, Value::Null)
            .await;
    }

    /// Call a method on the client.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if !self.should_be_available() {
            return Err(IpcError::ClientNotAvailable);
        }
        self.peer
            .call(method, params)
            .await
            .map_err(|e| IpcError::bad_exec(method, e))
    }

    /// Typed `request`.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.request(method, params).await?;
        serde_json::from_value(value).map_err(|e| IpcError::bad_exec(method, e.into()))
    }

    /// Send a notification to the client, ignoring failures.
    pub async fn notify_best_effort(&self, method: &str, params: Value) {
        if self.should_be_available() {
            self.peer.notify_best_effort(method, params).await;
        }
    }

    /// Close the connection. Only the first call has an effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.alive.store(false, Ordering::Release);
        self.peer.close().await;
        debug!("Client {} ({}) disposed", self.id, self.peer_addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundHandler;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    /// Client-side behavior for the probe.
    enum Reply {
        Alive,
        NotAlive,
        Hang,
    }

    #[async_trait]
    impl InboundHandler for Reply {
        async fn handle(&self, method: &str, params: Value) -> Result<Value> {
            match (method, self) {
                (IS_ALIVE, Reply::Alive) => Ok(json!(true)),
                (IS_ALIVE, Reply::NotAlive) => Ok(json!(false)),
                (IS_ALIVE, Reply::Hang) => {
                    std::future::pending::<()>().await;
                    Ok(json!(true))
                }
                ("echo", _) => Ok(params),
                _ => Err(IpcError::MethodNotFound(method.to_string())),
            }
        }
    }

    async fn connection(
        reply: Reply,
        keep_alive: Duration,
        probe_timeout: Duration,
    ) -> (Arc<ClientConnection>, Arc<RpcPeer>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let client = RpcPeer::new(client.unwrap(), Duration::from_secs(1)).unwrap();
        client.start(Some(Arc::new(reply)));

        let server = RpcPeer::new(accepted.unwrap().0, Duration::from_secs(1)).unwrap();
        server.start(None);
        (
            ClientConnection::new(server, keep_alive, probe_timeout),
            client,
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..40 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_probe_not_due() {
        let (conn, _client) =
            connection(Reply::Alive, Duration::from_secs(60), Duration::from_secs(1)).await;
        assert!(!conn.check_if_alive());
        assert!(conn.should_be_available());
    }

    #[tokio::test]
    async fn test_successful_probe_updates_last_alive() {
        let (conn, _client) =
            connection(Reply::Alive, Duration::ZERO, Duration::from_secs(1)).await;
        let before = conn.last_alive();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.check_if_alive());
        assert!(wait_for(|| !conn.is_probe_in_flight()).await);

        assert!(conn.last_alive() > before);
        assert!(conn.should_be_available());
        assert!(!conn.should_remove());
    }

    #[tokio::test]
    async fn test_false_reply_requests_shutdown() {
        let (conn, _client) =
            connection(Reply::NotAlive, Duration::ZERO, Duration::from_secs(1)).await;

        assert!(conn.check_if_alive());
        assert!(wait_for(|| conn.is_shutdown_requested()).await);
        assert!(!conn.should_be_available());
        assert!(conn.should_remove());
        assert!(!conn.is_disposed());
    }

    #[tokio::test]
    async fn test_one_probe_in_flight() {
        let (conn, _client) =
            connection(Reply::Hang, Duration::ZERO, Duration::from_millis(200)).await;

        assert!(conn.check_if_alive());
        assert!(!conn.check_if_alive());
        assert!(conn.is_probe_in_flight());

        assert!(wait_for(|| conn.is_shutdown_requested()).await);
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_request_and_fail_fast() {
        let (conn, _client) =
            connection(Reply::Alive, Duration::from_secs(60), Duration::from_secs(1)).await;

        let echoed: String = conn.call("echo", "hi").await.unwrap();
        assert_eq!(echoed, "hi");

        match conn.request("missing", Value::Null).await {
            Err(IpcError::BadExecRequest { method, source }) => {
                assert_eq!(method, "missing");
                assert!(matches!(*source, IpcError::Remote { code: -32601, .. }));
            }
            other => panic!("Expected BadExecRequest, got: {:?}", other),
        }

        conn.dispose().await;
        conn.dispose().await;
        assert!(conn.is_disposed());
        assert!(matches!(
            conn.request("echo", Value::Null).await,
            Err(IpcError::ClientNotAvailable)
        ));
        assert!(!conn.check_if_alive());
    }

    #[tokio::test]
    async fn test_client_disconnect_flags_removal() {
        let (conn, client) =
            connection(Reply::Alive, Duration::from_secs(60), Duration::from_secs(1)).await;

        client.close().await;
        assert!(wait_for(|| conn.should_remove()).await);
        assert!(!conn.should_be_available());
    }
}
