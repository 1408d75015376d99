//! Server-wide and per-client session scopes.
//!
//! A `ServerSession` lives from server start until the listener loop ends. A
//! `ClientSession` lives as long as one accepted connection. Both are disposed
//! at most once; disposal runs the registered `on_dispose` callbacks and then
//! clears every observer list.
//!
//! The framework does not lock the user state held inside a session. State
//! touched from concurrent request handlers needs its own synchronization.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::connection::ClientConnection;
use crate::error::{IpcError, Result};
use crate::transport::lock;
use crate::version::Version;

/// Callback observing a client connection event.
pub type ConnectionObserver = Arc<dyn Fn(&Arc<ClientConnection>) + Send + Sync>;

type DisposeCallback = Box<dyn FnOnce() + Send>;

/// Observers invoked on each event until cleared.
pub struct ObserverList<A: ?Sized> {
    observers: Mutex<Vec<Arc<dyn Fn(&A) + Send + Sync>>>,
}

impl<A: ?Sized> Default for ObserverList<A> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<A: ?Sized> ObserverList<A> {
    pub fn register(&self, observer: Arc<dyn Fn(&A) + Send + Sync>) {
        lock(&self.observers).push(observer);
    }

    /// Invoke every observer. Observers may register more observers without deadlocking.
    pub fn notify(&self, arg: &A) {
        let snapshot = lock(&self.observers).clone();
        for observer in snapshot {
            observer(arg);
        }
    }

    pub fn clear(&self) {
        lock(&self.observers).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run-once callbacks fired on disposal.
#[derive(Default)]
pub(crate) struct DisposeHooks {
    disposed: AtomicBool,
    callbacks: Mutex<Vec<DisposeCallback>>,
}

impl DisposeHooks {
    pub(crate) fn register(&self, callback: DisposeCallback) {
        if self.disposed.load(Ordering::Acquire) {
            debug!("Ignoring on_dispose registration on a disposed session");
            return;
        }
        lock(&self.callbacks).push(callback);
    }

    /// Returns false if already fired.
    pub(crate) fn fire(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = std::mem::take(&mut *lock(&self.callbacks));
        for callback in callbacks {
            callback();
        }
        true
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// State shared by every client of one running server.
pub struct ServerSession<S> {
    state: S,
    version: Version,
    client_connected: ObserverList<Arc<ClientConnection>>,
    client_disconnected: ObserverList<Arc<ClientConnection>>,
    hooks: DisposeHooks,
}

impl<S> ServerSession<S> {
    pub(crate) fn new(state: S, version: Version) -> Arc<Self> {
        Arc::new(Self {
            state,
            version,
            client_connected: ObserverList::default(),
            client_disconnected: ObserverList::default(),
            hooks: DisposeHooks::default(),
        })
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// The version this server answers the handshake with.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Observe new connections. Fires once per accepted client.
    pub fn on_client_connected(&self, observer: impl Fn(&Arc<ClientConnection>) + Send + Sync + 'static) {
        self.client_connected.register(Arc::new(observer));
    }

    /// Observe removed connections. Fires once per client, when it leaves the registry.
    pub fn on_client_disconnected(
        &self,
        observer: impl Fn(&Arc<ClientConnection>) + Send + Sync + 'static,
    ) {
        self.client_disconnected.register(Arc::new(observer));
    }

    /// Run `callback` when the session is disposed.
    pub fn on_dispose(&self, callback: impl FnOnce() + Send + 'static) {
        self.hooks.register(Box::new(callback));
    }

    pub(crate) fn register_connected(&self, observer: ConnectionObserver) {
        self.client_connected.register(observer);
    }

    pub(crate) fn register_disconnected(&self, observer: ConnectionObserver) {
        self.client_disconnected.register(observer);
    }

    pub(crate) fn notify_connected(&self, connection: &Arc<ClientConnection>) {
        if !self.is_disposed() {
            self.client_connected.notify(connection);
        }
    }

    pub(crate) fn notify_disconnected(&self, connection: &Arc<ClientConnection>) {
        if !self.is_disposed() {
            self.client_disconnected.notify(connection);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.hooks.is_fired()
    }

    pub(crate) fn dispose(&self) {
        if self.hooks.fire() {
            self.client_connected.clear();
            self.client_disconnected.clear();
            debug!("Server session disposed");
        }
    }
}

impl<S> fmt::Debug for ServerSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("version", &self.version)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// State scoped to one accepted connection.
///
/// Bound at creation to its server session and its connection; the connection
/// doubles as the outbound handle for calling back into this client.
pub struct ClientSession<S, C> {
    state: C,
    server_session: Arc<ServerSession<S>>,
    connection: Arc<ClientConnection>,
    hooks: DisposeHooks,
}

impl<S, C> ClientSession<S, C> {
    pub(crate) fn new(
        state: C,
        server_session: Arc<ServerSession<S>>,
        connection: Arc<ClientConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            server_session,
            connection,
            hooks: DisposeHooks::default(),
        })
    }

    pub fn state(&self) -> &C {
        &self.state
    }

    pub fn server_session(&self) -> &Arc<ServerSession<S>> {
        &self.server_session
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    pub fn on_dispose(&self, callback: impl FnOnce() + Send + 'static) {
        self.hooks.register(Box::new(callback));
    }

    pub fn is_disposed(&self) -> bool {
        self.hooks.is_fired()
    }

    /// Call a method on this client.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_disposed() {
            return Err(IpcError::ClientNotAvailable);
        }
        self.connection.request(method, params).await
    }

    /// Typed `request`.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_disposed() {
            return Err(IpcError::ClientNotAvailable);
        }
        self.connection.call(method, params).await
    }

    pub(crate) fn dispose(&self) {
        if self.hooks.fire() {
            debug!("Client session for {} disposed", self.connection.id());
        }
    }
}

impl<S, C> fmt::Debug for ClientSession<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("connection", &self.connection.id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_observer_list_notifies_all() {
        let list: ObserverList<u32> = ObserverList::default();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = total.clone();
            list.register(Arc::new(move |n: &u32| {
                total.fetch_add(*n as usize, Ordering::SeqCst);
            }));
        }

        list.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);

        list.clear();
        list.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
        assert!(list.is_empty());
    }

    #[test]
    fn test_server_session_dispose_once() {
        let session = ServerSession::new(5u32, Version::new(1, 0, 0, 0));
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            session.on_dispose(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        session.on_client_connected(|_| {});

        assert_eq!(*session.state(), 5);
        session.dispose();
        session.dispose();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(session.is_disposed());
        assert!(session.client_connected.is_empty());
    }

    #[test]
    fn test_on_dispose_after_dispose_is_ignored() {
        let session = ServerSession::new((), Version::new(1, 0, 0, 0));
        session.dispose();

        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            session.on_dispose(move || fired.store(true, Ordering::SeqCst));
        }
        session.dispose();
        assert!(!fired.load(Ordering::SeqCst));
    }
}
