//! Duplex JSON-RPC peer over one TCP connection.
//!
//! Either side may issue calls and either side may answer them. A reader task
//! demultiplexes incoming frames: responses complete the matching pending call,
//! requests are handed to the installed `InboundHandler` on their own task so a
//! slow handler never blocks the connection.
//!
//! # Thread Safety
//!
//! Writes are serialized through a tokio `Mutex` around the write half. The
//! pending-call table and the handler slot use short-lived std mutexes that are
//! never held across an await point.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{IpcError, Result};
use crate::protocol::{read_frame, write_frame, IpcMessage, IpcRequest, IpcResponse};

/// Answers requests arriving from the remote side.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value) -> Result<Value>;
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type PendingMap = HashMap<u64, oneshot::Sender<IpcResponse>>;

/// One end of an RPC connection.
pub struct RpcPeer {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    closed: CancellationToken,
    peer_addr: SocketAddr,
    write_timeout: Duration,
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a pending entry when its call finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

impl RpcPeer {
    /// Wrap a connected stream. Nothing is read until `start` is called.
    pub fn new(stream: TcpStream, write_timeout: Duration) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Arc::new(Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            handler: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            peer_addr,
            write_timeout,
        }))
    }

    /// Spawn the reader task. Subsequent calls do nothing.
    pub fn start(self: &Arc<Self>, handler: Option<Arc<dyn InboundHandler>>) {
        if let Some(handler) = handler {
            self.set_handler(handler);
        }

        let Some(reader) = lock(&self.reader).take() else {
            warn!("RPC peer {} already started", self.peer_addr);
            return;
        };

        tokio::spawn(Self::read_loop(
            Arc::downgrade(self),
            reader,
            self.closed.clone(),
            self.peer_addr,
        ));
    }

    /// Install or replace the handler for inbound requests.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        if self.is_closed() {
            return;
        }
        *lock(&self.handler) = Some(handler);
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the connection is closed by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn read_loop(
        peer: Weak<Self>,
        mut reader: OwnedReadHalf,
        closed: CancellationToken,
        peer_addr: SocketAddr,
    ) {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                result = read_frame(&mut reader) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        debug!("RPC peer {} disconnected", peer_addr);
                        break;
                    }
                    Err(e) => {
                        debug!("RPC peer {} read failed: {}", peer_addr, e);
                        break;
                    }
                }
            };

            let Some(peer) = peer.upgrade() else {
                break;
            };
            peer.dispatch_frame(&frame);
        }

        if let Some(peer) = peer.upgrade() {
            peer.mark_closed();
        }
    }

    fn dispatch_frame(self: &Arc<Self>, frame: &[u8]) {
        match IpcMessage::from_slice(frame) {
            Ok(IpcMessage::Response(response)) => {
                let waiter = response
                    .numeric_id()
                    .and_then(|id| lock(&self.pending).remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(
                        "Dropping response {:?} from {} with no pending call",
                        response.id, self.peer_addr
                    ),
                }
            }
            Ok(IpcMessage::Request(request)) => {
                // Taken now: an EOF right behind this frame clears the slot
                // before the spawned task would get to read it.
                let handler = lock(&self.handler).clone();
                let peer = Arc::clone(self);
                tokio::spawn(async move { peer.handle_request(request, handler).await });
            }
            Err(e) => {
                warn!("Unparseable frame from {}: {}", self.peer_addr, e);
                let peer = Arc::clone(self);
                tokio::spawn(async move {
                    let response = IpcResponse::error(None, -32700, format!("Parse error: {}", e));
                    let _ = peer.send_message(&response).await;
                });
            }
        }
    }

    async fn handle_request(
        &self,
        request: IpcRequest,
        handler: Option<Arc<dyn InboundHandler>>,
    ) {
        let is_notification = request.is_notification();
        if request.jsonrpc != "2.0" {
            if !is_notification {
                let response = IpcResponse::error(
                    request.id,
                    -32600,
                    "Invalid Request: expected jsonrpc 2.0".to_string(),
                );
                let _ = self.send_message(&response).await;
            }
            return;
        }

        let params = request.params.unwrap_or(Value::Null);
        let result = match handler {
            Some(handler) => handler.handle(&request.method, params).await,
            None => Err(IpcError::MethodNotFound(request.method.clone())),
        };

        if is_notification {
            if let Err(e) = result {
                debug!(
                    "Notification {} from {} failed: {}",
                    request.method, self.peer_addr, e
                );
            }
            return;
        }

        let response = match result {
            Ok(value) => IpcResponse::success(request.id, value),
            Err(e) => IpcResponse::from_error(request.id, &e),
        };
        if let Err(e) = self.send_message(&response).await {
            debug!(
                "Failed to answer {} from {}: {}",
                request.method, self.peer_addr, e
            );
        }
    }

    async fn send_message<T: serde::Serialize>(&self, message: &T) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(IpcError::ConnectionClosed)?;
        let outcome = tokio::time::timeout(self.write_timeout, write_frame(writer, &bytes)).await;
        drop(guard);

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("RPC write to {} failed: {}", self.peer_addr, e);
                self.mark_closed();
                Err(IpcError::ConnectionClosed)
            }
            Err(_) => {
                // A partial frame may be on the wire; the stream is unusable.
                self.mark_closed();
                Err(IpcError::Timeout(self.write_timeout))
            }
        }
    }

    /// Call a remote method and wait for its result.
    ///
    /// Dropping the returned future abandons the call.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // Closing drains the table; re-check so an entry inserted after the
        // drain does not wait forever.
        if self.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }

        self.send_message(&IpcRequest::new(method, params, id))
            .await?;

        let response = rx.await.map_err(|_| IpcError::ConnectionClosed)?;
        response.into_result()
    }

    /// `call` bounded by `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        tokio::time::timeout(timeout, self.call(method, params))
            .await
            .map_err(|_| IpcError::Timeout(timeout))?
    }

    /// Send a notification. No response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }
        self.send_message(&IpcRequest::notification(method, params))
            .await
    }

    /// Send a notification and ignore any failure.
    ///
    /// Used for shutdown notices, where the peer may already be gone.
    pub async fn notify_best_effort(&self, method: &str, params: Value) {
        match self.notify(method, params).await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                debug!("Skipped {} notice, {} already gone", method, self.peer_addr);
            }
            Err(e) => warn!("Failed to send {} notice to {}: {}", method, self.peer_addr, e),
        }
    }

    /// Mark the connection closed: wake waiters, fail pending calls, drop the handler.
    fn mark_closed(&self) {
        self.closed.cancel();

        // Dropping the senders fails every waiting call with ConnectionClosed.
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        drop(drained);

        // The handler may hold references back to the owner of this peer.
        lock(&self.handler).take();

        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) {
        self.mark_closed();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
        }
    }
}

impl Drop for RpcPeer {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    struct TestHandler {
        notes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InboundHandler for TestHandler {
        async fn handle(&self, method: &str, params: Value) -> Result<Value> {
            match method {
                "add" => {
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params["b"].as_i64().unwrap_or(0);
                    Ok(json!(a + b))
                }
                "note" => {
                    self.notes.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
                "hang" => {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                }
                _ => Err(IpcError::MethodNotFound(method.to_string())),
            }
        }
    }

    async fn pair() -> (Arc<RpcPeer>, Arc<RpcPeer>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = RpcPeer::new(client.unwrap(), Duration::from_secs(1)).unwrap();
        let server = RpcPeer::new(accepted.unwrap().0, Duration::from_secs(1)).unwrap();
        (client, server)
    }

    fn handler() -> (Arc<dyn InboundHandler>, Arc<AtomicUsize>) {
        let notes = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(TestHandler {
                notes: notes.clone(),
            }),
            notes,
        )
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client, server) = pair().await;
        let (h, _) = handler();
        server.start(Some(h));
        client.start(None);

        let result = client.call("add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn test_calls_in_both_directions() {
        let (client, server) = pair().await;
        let (h1, _) = handler();
        let (h2, _) = handler();
        server.start(Some(h1));
        client.start(Some(h2));

        assert_eq!(
            server.call("add", json!({"a": 1, "b": 1})).await.unwrap(),
            json!(2)
        );
        assert_eq!(
            client.call("add", json!({"a": 4, "b": 1})).await.unwrap(),
            json!(5)
        );
    }

    #[tokio::test]
    async fn test_no_handler_is_method_not_found() {
        let (client, server) = pair().await;
        server.start(None);
        client.start(None);

        match client.call("anything", Value::Null).await {
            Err(IpcError::Remote { code, .. }) => assert_eq!(code, -32601),
            other => panic!("Expected method not found, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_reaches_handler() {
        let (client, server) = pair().await;
        let (h, notes) = handler();
        server.start(Some(h));
        client.start(None);

        client.notify("note", Value::Null).await.unwrap();

        for _ in 0..20 {
            if notes.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Notification was not delivered");
    }

    #[tokio::test]
    async fn test_notification_sent_just_before_close_is_handled() {
        let (client, server) = pair().await;
        let (h, notes) = handler();
        client.start(Some(h));
        server.start(None);

        server.notify("note", Value::Null).await.unwrap();
        server.close().await;

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .expect("client should observe the disconnect");
        for _ in 0..20 {
            if notes.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Notification followed by EOF was dropped");
    }

    #[tokio::test]
    async fn test_close_fails_pending_call() {
        let (client, server) = pair().await;
        let (h, _) = handler();
        server.start(Some(h));
        client.start(None);

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call("hang", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), caller)
            .await
            .expect("pending call should fail promptly")
            .unwrap();
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
        assert!(client.is_closed());
        assert!(lock(&client.pending).is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_is_observed() {
        let (client, server) = pair().await;
        server.start(None);
        client.start(None);

        server.close().await;

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .expect("client should observe the disconnect");
        assert!(matches!(
            client.call("add", Value::Null).await,
            Err(IpcError::ConnectionClosed)
        ));
        assert!(matches!(
            client.notify("note", Value::Null).await,
            Err(IpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_call_with_timeout() {
        let (client, server) = pair().await;
        let (h, _) = handler();
        server.start(Some(h));
        client.start(None);

        let result = client
            .call_with_timeout("hang", Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(IpcError::Timeout(_))));
        assert!(lock(&client.pending).is_empty());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (client, server) = pair().await;
        server.start(None);
        client.start(None);

        client.close().await;
        client.close().await;
        client.notify_best_effort("note", Value::Null).await;
        assert!(client.is_closed());
    }
}
