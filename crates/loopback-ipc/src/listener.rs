//! Server endpoint: bind, single-instance guard, accept and housekeeping loop.
//!
//! `start` binds a loopback port (scanning upward from `base_port + revision`
//! on address-in-use), spawns the server loop and returns once the loop is
//! accepting. The loop is the only writer of the connection registry. Each tick
//! waits at most `accept_poll_interval` for a new client, then drops flagged
//! connections and fires due liveness probes.
//!
//! # State machine
//!
//! `NotStarted -> Starting -> Listening -> Stopping -> Stopped`. `Stopped` is
//! terminal; a listener runs at most once.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::ServerOptions;
use crate::connection::ClientConnection;
use crate::error::{IpcError, Result};
use crate::identity::{port_sequence, ServerIdentity};
use crate::lock::InstanceLock;
use crate::protocol::{CLIENT_IS_SHUTTING_DOWN, HANDSHAKE, IS_ALIVE};
use crate::service::{RequestContext, Service};
use crate::session::{ClientSession, ConnectionObserver, ServerSession};
use crate::transport::{lock, InboundHandler, RpcPeer};
use crate::version::{Version, VersionInfo};

/// Lifecycle of a `ServerListener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    NotStarted,
    Starting,
    Listening,
    Stopping,
    Stopped,
}

type ServerStateFactory<S> = Box<dyn Fn() -> S + Send + Sync>;
type ClientStateFactory<T> = Box<
    dyn Fn(
            &Arc<ServerSession<<T as Service>::ServerState>>,
            &Arc<ClientConnection>,
        ) -> <T as Service>::ClientState
        + Send
        + Sync,
>;
type ClientSessionOf<T> = ClientSession<<T as Service>::ServerState, <T as Service>::ClientState>;

/// A registry slot: the connection and its optional client session.
struct Entry<T: Service> {
    connection: Arc<ClientConnection>,
    session: Option<Arc<ClientSessionOf<T>>>,
}

struct Shared<T: Service> {
    service: T,
    options: ServerOptions,
    server_state: ServerStateFactory<T::ServerState>,
    client_state: Option<ClientStateFactory<T>>,
    connected_observers: std::sync::Mutex<Vec<ConnectionObserver>>,
    disconnected_observers: std::sync::Mutex<Vec<ConnectionObserver>>,
    state: watch::Sender<ListenerState>,
    clients: watch::Sender<Vec<Arc<ClientConnection>>>,
    session: OnceLock<Arc<ServerSession<T::ServerState>>>,
    port: OnceLock<u16>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

/// Server endpoint hosting a `Service` for local clients.
///
/// Dropping the listener stops it.
pub struct ServerListener<T: Service> {
    shared: Arc<Shared<T>>,
}

/// Builder for configuring a `ServerListener`.
///
/// # Example
///
/// ```rust,ignore
/// let server = ServerListener::builder(MathService)
///     .options(ServerOptions::default().with_lock_dir(dir))
///     .on_client_connected(|conn| println!("client {}", conn.id()))
///     .build();
/// let port = server.start("math", 30000, Version::parse("1.0.0.0")?).await?;
/// ```
pub struct ServerListenerBuilder<T: Service> {
    service: T,
    options: ServerOptions,
    server_state: ServerStateFactory<T::ServerState>,
    client_state: Option<ClientStateFactory<T>>,
    connected: Vec<ConnectionObserver>,
    disconnected: Vec<ConnectionObserver>,
}

impl<T: Service> ServerListenerBuilder<T> {
    fn new(service: T, server_state: ServerStateFactory<T::ServerState>) -> Self {
        Self {
            service,
            options: ServerOptions::default(),
            server_state,
            client_state: None,
            connected: Vec::new(),
            disconnected: Vec::new(),
        }
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Shortcut for setting only the lock directory.
    pub fn lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.options.lock_dir = lock_dir.into();
        self
    }

    /// Create a `ClientSession` with this state for every accepted client.
    pub fn client_session(
        mut self,
        factory: impl Fn(&Arc<ServerSession<T::ServerState>>, &Arc<ClientConnection>) -> T::ClientState
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.client_state = Some(Box::new(factory));
        self
    }

    pub fn on_client_connected(
        mut self,
        observer: impl Fn(&Arc<ClientConnection>) + Send + Sync + 'static,
    ) -> Self {
        self.connected.push(Arc::new(observer));
        self
    }

    pub fn on_client_disconnected(
        mut self,
        observer: impl Fn(&Arc<ClientConnection>) + Send + Sync + 'static,
    ) -> Self {
        self.disconnected.push(Arc::new(observer));
        self
    }

    pub fn build(self) -> ServerListener<T> {
        let (state, _) = watch::channel(ListenerState::NotStarted);
        let (clients, _) = watch::channel(Vec::new());
        ServerListener {
            shared: Arc::new(Shared {
                service: self.service,
                options: self.options,
                server_state: self.server_state,
                client_state: self.client_state,
                connected_observers: std::sync::Mutex::new(self.connected),
                disconnected_observers: std::sync::Mutex::new(self.disconnected),
                state,
                clients,
                session: OnceLock::new(),
                port: OnceLock::new(),
                cancel: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }
}

impl<T: Service> ServerListener<T>
where
    T::ServerState: Default,
{
    /// Builder whose server session state starts from `Default`.
    pub fn builder(service: T) -> ServerListenerBuilder<T> {
        ServerListenerBuilder::new(service, Box::new(T::ServerState::default))
    }
}

impl<T: Service> ServerListener<T> {
    /// Builder whose server session state comes from `factory`, called once at start.
    pub fn builder_with_state(
        service: T,
        factory: impl Fn() -> T::ServerState + Send + Sync + 'static,
    ) -> ServerListenerBuilder<T> {
        ServerListenerBuilder::new(service, Box::new(factory))
    }

    /// Bind, take the single-instance lock and start accepting clients.
    ///
    /// Returns the port actually bound, which is `base_port + revision` unless
    /// that port was busy.
    pub async fn start(&self, unique_name: &str, base_port: u16, version: Version) -> Result<u16> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(IpcError::InvalidState("server listener is disposed".to_string()));
        }

        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == ListenerState::NotStarted {
                *state = ListenerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(IpcError::InvalidState(format!(
                "server listener cannot start from state {:?}",
                self.state()
            )));
        }

        let identity = ServerIdentity::new(unique_name, version.protocol_revision());
        match self.start_inner(identity, base_port, version).await {
            Ok(port) => Ok(port),
            Err(e) => {
                self.shared.state.send_replace(ListenerState::Stopped);
                Err(e)
            }
        }
    }

    async fn start_inner(
        &self,
        identity: ServerIdentity,
        base_port: u16,
        version: Version,
    ) -> Result<u16> {
        let first_port = identity.nominal_port(base_port)?;
        let socket = bind_loopback(first_port, self.shared.options.bind_retry_count)?;
        let port = socket.local_addr()?.port();
        if port != first_port {
            info!(
                "Port {} busy, server {} bound to port {}",
                first_port, identity, port
            );
        }

        let session = ServerSession::new((self.shared.server_state)(), version);
        for observer in lock(&self.shared.connected_observers).drain(..) {
            session.register_connected(observer);
        }
        for observer in lock(&self.shared.disconnected_observers).drain(..) {
            session.register_disconnected(observer);
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Shared::serve(
            self.shared.clone(),
            socket,
            identity,
            session.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                let _ = self.shared.session.set(session);
                let _ = self.shared.port.set(port);
                Ok(port)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(IpcError::InvalidState(
                "server loop exited before listening".to_string(),
            )),
        }
    }

    /// Signal the server loop to stop and return immediately.
    ///
    /// Await `wait_until_stopped` for completion. Calling it again does nothing.
    pub fn stop(&self) {
        let never_started = self.shared.state.send_if_modified(|state| {
            if *state == ListenerState::NotStarted {
                *state = ListenerState::Stopped;
                true
            } else {
                false
            }
        });
        if !never_started && !self.shared.cancel.is_cancelled() {
            info!("Stopping server listener");
        }
        self.shared.cancel.cancel();
    }

    /// Stop and wait for the loop to finish. Calling it again does nothing.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.wait_until_stopped().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Resolves once the listener reaches `Stopped`.
    pub async fn wait_until_stopped(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ListenerState::Stopped)
            .await;
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    /// Port bound by `start`.
    pub fn port(&self) -> Option<u16> {
        self.shared.port.get().copied()
    }

    pub fn server_session(&self) -> Option<Arc<ServerSession<T::ServerState>>> {
        self.shared.session.get().cloned()
    }

    /// Connections in the registry as of the last housekeeping tick.
    pub fn clients(&self) -> Vec<Arc<ClientConnection>> {
        self.shared.clients.borrow().clone()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.borrow().len()
    }

    /// Registered connections that currently answer liveness probes.
    pub fn active_client_count(&self) -> usize {
        self.shared
            .clients
            .borrow()
            .iter()
            .filter(|conn| conn.should_be_available())
            .count()
    }
}

impl<T: Service> Drop for ServerListener<T> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Bind a loopback socket, moving to the next port while the current one is taken.
fn bind_loopback(first_port: u16, attempts: u32) -> Result<TcpSocket> {
    let mut last_error = None;
    let mut tried = 0;

    for port in port_sequence(first_port, attempts) {
        tried += 1;
        let socket = TcpSocket::new_v4()?;
        match socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))) {
            Ok(()) => return Ok(socket),
            Err(e)
                if e.kind() == std::io::ErrorKind::AddrInUse
                    || e.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                debug!("Port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(IpcError::BindFailed {
        first_port,
        attempts: tried,
        source: last_error,
    })
}

impl<T: Service> Shared<T> {
    async fn serve(
        self: Arc<Self>,
        socket: TcpSocket,
        identity: ServerIdentity,
        session: Arc<ServerSession<T::ServerState>>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let instance_lock = match InstanceLock::acquire(&self.options.lock_dir, &identity) {
            Ok(instance_lock) => instance_lock,
            Err(e) => {
                warn!("Server {} not started: {}", identity, e);
                let _ = ready.send(Err(e));
                session.dispose();
                self.state.send_replace(ListenerState::Stopped);
                return;
            }
        };

        let listener = match socket.listen(self.options.listen_backlog) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Server {} failed to listen: {}", identity, e);
                let _ = ready.send(Err(e.into()));
                session.dispose();
                instance_lock.release();
                self.state.send_replace(ListenerState::Stopped);
                return;
            }
        };

        self.state.send_replace(ListenerState::Listening);
        if let Ok(addr) = listener.local_addr() {
            info!("Server {} listening on {}", identity, addr);
        }
        let _ = ready.send(Ok(()));

        let mut entries: Vec<Entry<T>> = Vec::new();
        self.accept_loop(&listener, &session, &mut entries).await;

        self.state.send_replace(ListenerState::Stopping);
        drop(listener);
        self.shutdown_clients(&session, entries).await;

        session.dispose();
        instance_lock.release();
        self.state.send_replace(ListenerState::Stopped);
        info!("Server {} stopped", identity);
    }

    async fn accept_loop(
        self: &Arc<Self>,
        listener: &TcpListener,
        session: &Arc<ServerSession<T::ServerState>>,
        entries: &mut Vec<Entry<T>>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = tokio::time::timeout(self.options.accept_poll_interval, listener.accept()) => {
                    match accepted {
                        Ok(Ok((stream, addr))) => {
                            if let Some(entry) = self.connect_client(stream, addr, session) {
                                entries.push(entry);
                                self.publish(entries);
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("Accept error: {}", e);
                            tokio::time::sleep(self.options.accept_poll_interval).await;
                        }
                        // Poll interval elapsed with no new client.
                        Err(_) => {}
                    }
                }
            }

            self.housekeeping(entries, session);
        }
    }

    fn connect_client(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        session: &Arc<ServerSession<T::ServerState>>,
    ) -> Option<Entry<T>> {
        let _ = stream.set_nodelay(true);
        let peer = match RpcPeer::new(stream, self.options.write_timeout) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Dropping connection from {}: {}", addr, e);
                return None;
            }
        };

        let connection = ClientConnection::new(
            peer.clone(),
            self.options.keep_alive_interval,
            self.options.probe_timeout,
        );
        let client_session = self.client_state.as_ref().map(|factory| {
            ClientSession::new(
                factory(session, &connection),
                session.clone(),
                connection.clone(),
            )
        });

        let handler = ConnectionHandler {
            shared: Arc::downgrade(self),
            server_session: session.clone(),
            connection: Arc::downgrade(&connection),
            client_session: client_session.as_ref().map(Arc::downgrade),
        };
        peer.start(Some(Arc::new(handler)));

        info!("Client {} connected from {}", connection.id(), addr);
        session.notify_connected(&connection);

        Some(Entry {
            connection,
            session: client_session,
        })
    }

    fn housekeeping(
        &self,
        entries: &mut Vec<Entry<T>>,
        session: &Arc<ServerSession<T::ServerState>>,
    ) {
        let before = entries.len();
        entries.retain(|entry| {
            if entry.connection.should_remove() {
                Self::remove_client(entry, session);
                false
            } else {
                true
            }
        });

        for entry in entries.iter() {
            entry.connection.check_if_alive();
        }

        if entries.len() != before {
            self.publish(entries);
        }
    }

    fn remove_client(entry: &Entry<T>, session: &Arc<ServerSession<T::ServerState>>) {
        let connection = entry.connection.clone();
        info!("Client {} disconnected", connection.id());
        session.notify_disconnected(&connection);
        if let Some(client_session) = &entry.session {
            client_session.dispose();
        }
        tokio::spawn(async move { connection.dispose().await });
    }

    async fn shutdown_clients(
        &self,
        session: &Arc<ServerSession<T::ServerState>>,
        entries: Vec<Entry<T>>,
    ) {
        if !entries.is_empty() {
            info!("Notifying {} client(s) of shutdown", entries.len());
        }
        join_all(
            entries
                .iter()
                .map(|entry| entry.connection.notify_server_shutdown()),
        )
        .await;

        for entry in &entries {
            session.notify_disconnected(&entry.connection);
            if let Some(client_session) = &entry.session {
                client_session.dispose();
            }
        }
        join_all(entries.iter().map(|entry| entry.connection.dispose())).await;

        self.clients.send_replace(Vec::new());
    }

    fn publish(&self, entries: &[Entry<T>]) {
        self.clients
            .send_replace(entries.iter().map(|entry| entry.connection.clone()).collect());
    }
}

/// Answers requests arriving on one accepted connection.
///
/// Holds only weak references to the listener and connection so the peer's
/// handler slot never keeps them alive.
struct ConnectionHandler<T: Service> {
    shared: Weak<Shared<T>>,
    server_session: Arc<ServerSession<T::ServerState>>,
    connection: Weak<ClientConnection>,
    client_session: Option<Weak<ClientSessionOf<T>>>,
}

#[async_trait]
impl<T: Service> InboundHandler for ConnectionHandler<T> {
    async fn handle(&self, method: &str, params: Value) -> Result<Value> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(IpcError::ConnectionClosed)?;

        match method {
            HANDSHAKE => Ok(serde_json::to_value(VersionInfo::from(
                self.server_session.version(),
            ))?),
            IS_ALIVE => Ok(Value::Bool(true)),
            CLIENT_IS_SHUTTING_DOWN => {
                debug!("Client {} is shutting down", connection.id());
                connection.request_shutdown();
                Ok(Value::Null)
            }
            _ => {
                let shared = self.shared.upgrade().ok_or(IpcError::ConnectionClosed)?;
                let client_session = self.client_session.as_ref().and_then(Weak::upgrade);
                let ctx = RequestContext {
                    version: self.server_session.version(),
                    server_session: &self.server_session,
                    client_session: client_session.as_ref(),
                    connection: &connection,
                };
                shared.service.call(&ctx, method, params).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    #[tokio::test]
    async fn test_bind_gives_up_when_every_port_is_busy() {
        let busy = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        match bind_loopback(busy_port, 1) {
            Err(IpcError::BindFailed { attempts, .. }) => assert_eq!(attempts, 1),
            Err(other) => panic!("Expected BindFailed, got: {:?}", other),
            Ok(_) => panic!("Bound a port that is already listening"),
        }
    }

    #[tokio::test]
    async fn test_bind_returns_first_free_port() {
        let socket = bind_loopback(0, 4).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }
}
