//! Client endpoint: locate a local server by port scanning and handshake.
//!
//! A server identity maps to a nominal port (`base_port + revision`), but a
//! server that found that port busy will have bound a higher one. The dialer
//! therefore walks ports upward from the nominal one; on each it opens a TCP
//! connection and retries the `handshake` call until it answers, gives up, or
//! reports the wrong protocol revision. Only running out of ports surfaces as
//! an error.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::config::DialerOptions;
use crate::error::{IpcError, Result};
use crate::identity::{port_sequence, ServerIdentity};
use crate::lock::InstanceLock;
use crate::protocol::{CLIENT_IS_SHUTTING_DOWN, HANDSHAKE, IS_ALIVE, SERVER_IS_SHUTTING_DOWN};
use crate::service::{ClientRequestContext, ClientService, NoCallbacks};
use crate::session::DisposeHooks;
use crate::transport::{lock, InboundHandler, RpcPeer};
use crate::version::{Version, VersionInfo};

type SessionFactory<S> = Box<dyn Fn() -> S + Send + Sync>;

/// An established connection.
struct Link<S> {
    peer: Arc<RpcPeer>,
    version: Version,
    session: Option<Arc<S>>,
    port: u16,
}

/// Client endpoint connecting to one local server.
pub struct ClientDialer<T: ClientService = NoCallbacks> {
    service: Arc<T>,
    session_factory: Option<SessionFactory<T::Session>>,
    options: DialerOptions,
    cancel: CancellationToken,
    connecting: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    disposed: AtomicBool,
    server_shutting_down: Arc<AtomicBool>,
    link: Mutex<Option<Link<T::Session>>>,
    session_hooks: DisposeHooks,
}

/// Builder for configuring a `ClientDialer`.
pub struct ClientDialerBuilder<T: ClientService> {
    service: T,
    session_factory: Option<SessionFactory<T::Session>>,
    options: DialerOptions,
}

impl<T: ClientService> ClientDialerBuilder<T> {
    /// Answer server-initiated calls with `service`.
    ///
    /// Replaces any session factory set so far, since the session type changes.
    pub fn with_service<U: ClientService>(self, service: U) -> ClientDialerBuilder<U> {
        ClientDialerBuilder {
            service,
            session_factory: None,
            options: self.options,
        }
    }

    /// Create a session object for each successful connection.
    pub fn session_factory(mut self, factory: impl Fn() -> T::Session + Send + Sync + 'static) -> Self {
        self.session_factory = Some(Box::new(factory));
        self
    }

    pub fn options(mut self, options: DialerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> ClientDialer<T> {
        ClientDialer {
            service: Arc::new(self.service),
            session_factory: self.session_factory,
            options: self.options,
            cancel: CancellationToken::new(),
            connecting: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            server_shutting_down: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(None),
            session_hooks: DisposeHooks::default(),
        }
    }
}

impl ClientDialer<NoCallbacks> {
    pub fn builder() -> ClientDialerBuilder<NoCallbacks> {
        ClientDialerBuilder {
            service: NoCallbacks,
            session_factory: None,
            options: DialerOptions::default(),
        }
    }
}

impl Default for ClientDialer<NoCallbacks> {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Clears the in-progress flag however `connect` ends.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: ClientService> ClientDialer<T> {
    /// Connect to the server `unique_name` speaking `protocol_revision`.
    ///
    /// Returns the version the server reported.
    pub async fn connect(
        &self,
        unique_name: &str,
        base_port: u16,
        protocol_revision: u32,
    ) -> Result<Version> {
        let never = CancellationToken::new();
        self.connect_with_cancel(unique_name, base_port, protocol_revision, &never)
            .await
    }

    /// `connect`, abandoned with `Cancelled` as soon as `cancel` fires.
    ///
    /// Any socket opened by the abandoned attempt is closed.
    pub async fn connect_with_cancel(
        &self,
        unique_name: &str,
        base_port: u16,
        protocol_revision: u32,
        cancel: &CancellationToken,
    ) -> Result<Version> {
        if self.is_disposed() || self.cancel.is_cancelled() {
            return Err(IpcError::ClientNotAvailable);
        }
        if self.is_started()
            || self
                .connecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(IpcError::ClientAlreadyStarted);
        }
        let _connecting = ConnectingGuard(&self.connecting);

        let identity = ServerIdentity::new(unique_name, protocol_revision);
        if let Some(lock_dir) = &self.options.lock_dir {
            if !InstanceLock::is_taken(lock_dir, &identity)? {
                debug!("No lock held for server {}, not dialing", identity);
                return Err(IpcError::ServerNotFound {
                    name: identity.unique_name,
                    protocol_revision,
                    attempts: 0,
                });
            }
        }

        let first_port = identity.nominal_port(base_port)?;
        let mut attempts = 0;
        for port in port_sequence(first_port, self.options.port_retry_count) {
            attempts += 1;
            cancel.check()?;
            self.cancel.check()?;

            debug!(
                "Trying port {} for server {} (attempt {})",
                port, identity, attempts
            );
            if let Some((peer, version)) = self.try_port(port, protocol_revision, cancel).await? {
                self.install(peer, version.clone(), port);
                if self.cancel.is_cancelled() {
                    // Stopped while the handshake was finishing.
                    self.release_link().await;
                    return Err(IpcError::Cancelled);
                }
                info!(
                    "Connected to server {} version {} on port {}",
                    identity, version, port
                );
                return Ok(version);
            }
        }

        Err(IpcError::ServerNotFound {
            name: identity.unique_name,
            protocol_revision,
            attempts,
        })
    }

    /// `connect`, then require the server version to equal `expected`.
    ///
    /// A server with the right protocol revision but a different version
    /// fails with `ProtocolVersionMismatch` and the connection is stopped.
    pub async fn connect_expecting(
        &self,
        unique_name: &str,
        base_port: u16,
        expected: &Version,
    ) -> Result<Version> {
        let version = self
            .connect(unique_name, base_port, expected.protocol_revision())
            .await?;
        if let Err(e) = version.ensure_matches(expected) {
            self.stop().await;
            return Err(e);
        }
        Ok(version)
    }

    /// Connect and handshake on one port.
    ///
    /// `Ok(None)` means "try the next port". Only cancellation is an error.
    async fn try_port(
        &self,
        port: u16,
        protocol_revision: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<(Arc<RpcPeer>, Version)>> {
        let connect = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
        );
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(IpcError::Cancelled),
            _ = self.cancel.cancelled() => return Err(IpcError::Cancelled),
            connected = connect => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Connect to port {} failed: {}", port, e);
                    return Ok(None);
                }
                Err(_) => {
                    debug!("Connect to port {} timed out", port);
                    return Ok(None);
                }
            }
        };
        let _ = stream.set_nodelay(true);

        let peer = match RpcPeer::new(stream, self.options.write_timeout) {
            Ok(peer) => peer,
            Err(e) => {
                debug!("Port {} connection unusable: {}", port, e);
                return Ok(None);
            }
        };
        peer.start(None);

        for attempt in 1..=self.options.handshake_attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    peer.close().await;
                    return Err(IpcError::Cancelled);
                }
                _ = self.cancel.cancelled() => {
                    peer.close().await;
                    return Err(IpcError::Cancelled);
                }
                reply = peer.call_with_timeout(
                    HANDSHAKE,
                    Value::Null,
                    self.options.handshake_attempt_timeout,
                ) => reply,
            };

            match outcome {
                Ok(value) => {
                    let accepted = serde_json::from_value::<VersionInfo>(value)
                        .map_err(IpcError::from)
                        .and_then(|info| {
                            if info.protocol_revision != protocol_revision {
                                return Err(IpcError::ProtocolVersionMismatch {
                                    expected: protocol_revision.to_string(),
                                    actual: info.protocol_revision.to_string(),
                                });
                            }
                            Version::try_from(info)
                        });
                    return match accepted {
                        Ok(version) => Ok(Some((peer, version))),
                        Err(e) => {
                            debug!("Rejecting server on port {}: {}", port, e);
                            peer.close().await;
                            Ok(None)
                        }
                    };
                }
                Err(IpcError::Timeout(_)) => {
                    debug!("Handshake attempt {} on port {} timed out", attempt, port);
                }
                Err(e) => {
                    debug!("Handshake on port {} failed: {}", port, e);
                    peer.close().await;
                    return Ok(None);
                }
            }
        }

        debug!("No handshake answer on port {}", port);
        peer.close().await;
        Ok(None)
    }

    fn install(&self, peer: Arc<RpcPeer>, version: Version, port: u16) {
        let session = self.session_factory.as_ref().map(|factory| Arc::new(factory()));
        let handler = CallbackHandler {
            service: self.service.clone(),
            version: version.clone(),
            session: session.clone(),
            peer: Arc::downgrade(&peer),
            server_shutting_down: self.server_shutting_down.clone(),
        };
        peer.set_handler(Arc::new(handler));

        *lock(&self.link) = Some(Link {
            peer,
            version,
            session,
            port,
        });
        self.started.store(true, Ordering::Release);
    }

    async fn available_peer(&self) -> Result<Arc<RpcPeer>> {
        if self.server_shutting_down.load(Ordering::Acquire) {
            self.stop().await;
            return Err(IpcError::ClientNotAvailable);
        }
        if !self.should_be_available() {
            return Err(IpcError::ClientNotAvailable);
        }
        lock(&self.link)
            .as_ref()
            .map(|link| link.peer.clone())
            .ok_or(IpcError::ClientNotAvailable)
    }

    /// Call a server method.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let peer = self.available_peer().await?;
        let result = match self.options.request_timeout {
            Some(timeout) => peer.call_with_timeout(method, params, timeout).await,
            None => peer.call(method, params).await,
        };
        result.map_err(|e| IpcError::bad_exec(method, e))
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

    /// Send a notification to the server, ignoring failures.
    pub async fn notify_best_effort(&self, method: &str, params: Value) {
        if let Ok(peer) = self.available_peer().await {
            peer.notify_best_effort(method, params).await;
        }
    }

    /// Tell the server we are leaving, then drop the connection.
    ///
    /// Safe to call more than once and before `connect`.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.release_link().await;
    }

    async fn release_link(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            link.peer
                .notify_best_effort(CLIENT_IS_SHUTTING_DOWN, Value::Null)
                .await;
            drop(link.session);
            self.session_hooks.fire();
            link.peer.close().await;
            info!("Disconnected from server on port {}", link.port);
        }
    }

    /// Run `callback` once when the connection's session is released by
    /// `stop` or `dispose`.
    ///
    /// Ignored once the session has been released. Never runs if no
    /// connection was made.
    pub fn on_session_dispose(&self, callback: impl FnOnce() + Send + 'static) {
        self.session_hooks.register(Box::new(callback));
    }

    /// `stop`, and refuse any further use. Calling it again does nothing.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop().await;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the server announced it is shutting down.
    pub fn is_server_shutting_down(&self) -> bool {
        self.server_shutting_down.load(Ordering::Acquire)
    }

    /// Whether requests may be attempted.
    pub fn should_be_available(&self) -> bool {
        self.is_started()
            && !self.is_disposed()
            && !self.cancel.is_cancelled()
            && !self.is_server_shutting_down()
            && lock(&self.link)
                .as_ref()
                .is_some_and(|link| !link.peer.is_closed())
    }

    /// Version the server reported during the handshake.
    pub fn server_version(&self) -> Option<Version> {
        lock(&self.link).as_ref().map(|link| link.version.clone())
    }

    /// Port of the server we connected to.
    pub fn port(&self) -> Option<u16> {
        lock(&self.link).as_ref().map(|link| link.port)
    }

    pub fn session(&self) -> Option<Arc<T::Session>> {
        lock(&self.link).as_ref().and_then(|link| link.session.clone())
    }
}

impl<T: ClientService> Drop for ClientDialer<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Answers calls the server makes on this connection.
struct CallbackHandler<T: ClientService> {
    service: Arc<T>,
    version: Version,
    session: Option<Arc<T::Session>>,
    peer: Weak<RpcPeer>,
    server_shutting_down: Arc<AtomicBool>,
}

#[async_trait]
impl<T: ClientService> InboundHandler for CallbackHandler<T> {
    async fn handle(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            IS_ALIVE => Ok(Value::Bool(true)),
            SERVER_IS_SHUTTING_DOWN => {
                info!("Server is shutting down");
                self.server_shutting_down.store(true, Ordering::Release);
                Ok(Value::Null)
            }
            _ => {
                let peer = self.peer.upgrade().ok_or(IpcError::ConnectionClosed)?;
                let ctx = ClientRequestContext {
                    version: &self.version,
                    session: self.session.as_ref(),
                    peer: &peer,
                };
                self.service.call(&ctx, method, params).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_no_lock_is_server_not_found() {
        let dir = TempDir::new().unwrap();
        let dialer = ClientDialer::builder()
            .options(DialerOptions::default().with_lock_dir(dir.path()))
            .build();

        match dialer.connect("absent", 40100, 0).await {
            Err(IpcError::ServerNotFound { attempts, .. }) => assert_eq!(attempts, 0),
            other => panic!("Expected ServerNotFound, got: {:?}", other),
        }
        assert!(!dialer.is_started());
    }

    #[tokio::test]
    async fn test_requests_fail_fast_before_connect() {
        let dialer: ClientDialer = ClientDialer::default();
        assert!(matches!(
            dialer.request("add", Value::Null).await,
            Err(IpcError::ClientNotAvailable)
        ));
        assert!(!dialer.should_be_available());
    }

    #[tokio::test]
    async fn test_stop_and_dispose_are_idempotent() {
        let dialer: ClientDialer = ClientDialer::default();
        dialer.stop().await;
        dialer.stop().await;
        dialer.dispose().await;
        dialer.dispose().await;

        assert!(dialer.is_disposed());
        assert!(matches!(
            dialer.connect("x", 40200, 0).await,
            Err(IpcError::ClientNotAvailable)
        ));
    }

    #[tokio::test]
    async fn test_nothing_listening_is_server_not_found() {
        // Find a port nobody listens on.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let dialer = ClientDialer::builder()
            .options(
                DialerOptions::default()
                    .without_lock_check()
                    .with_port_retry_count(1)
                    .with_connect_timeout(Duration::from_millis(200)),
            )
            .build();

        match dialer.connect("nobody", port, 0).await {
            Err(IpcError::ServerNotFound { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("Expected ServerNotFound, got: {:?}", other),
        }
    }
}
