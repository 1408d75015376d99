//! Loopback IPC - connection and session lifecycle for local RPC services.
//!
//! One host process exposes a service to independently started client
//! processes on the same machine over loopback TCP. There is no registry:
//! a file lock per (server name, protocol revision) guarantees a single server
//! instance, and clients find it by scanning ports upward from
//! `base_port + revision` until a handshake reports the right revision.
//!
//! The server polls each client with keep-alive probes and drops the ones that
//! stop answering. Both endpoints announce their shutdown to the other side on
//! a best-effort basis.
//!
//! # Example
//!
//! ```rust,ignore
//! use loopback_ipc::{ClientDialer, ServerListener, Version};
//!
//! let server = ServerListener::builder(MathService).build();
//! server.start("math", 30000, Version::parse("1.0.0.0")?).await?;
//!
//! let client = ClientDialer::builder().build();
//! client.connect("math", 30000, 0).await?;
//! let sum: i64 = client.call("add", &(9, 11)).await?;
//!
//! client.stop().await;
//! server.stop();
//! server.wait_until_stopped().await;
//! ```

pub mod cancel;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod identity;
pub mod listener;
pub mod lock;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod version;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{default_lock_dir, DialerOptions, IpcConfig, ServerOptions};
pub use connection::ClientConnection;
pub use dialer::{ClientDialer, ClientDialerBuilder};
pub use error::{IpcError, Result};
pub use identity::ServerIdentity;
pub use listener::{ListenerState, ServerListener, ServerListenerBuilder};
pub use lock::InstanceLock;
pub use service::{
    parse_params, ClientRequestContext, ClientService, NoCallbacks, RequestContext, Service,
};
pub use session::{ClientSession, ConnectionObserver, ObserverList, ServerSession};
pub use transport::{InboundHandler, RpcPeer};
pub use version::{Version, VersionInfo};
