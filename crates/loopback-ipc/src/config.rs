//! Centralized configuration for the loopback IPC layer.
//!
//! `IpcConfig` holds the compiled-in defaults. `ServerOptions` and
//! `DialerOptions` start from those defaults and can override each of them.

use std::path::PathBuf;
use std::time::Duration;

/// Connection lifecycle defaults.
pub struct IpcConfig;

impl IpcConfig {
    // Port scanning
    pub const CLIENT_PORT_RETRY_COUNT: u32 = 16;
    pub const SERVER_BIND_RETRY_COUNT: u32 = 128;

    // Handshake
    pub const HANDSHAKE_ATTEMPTS: u32 = 50;
    pub const HANDSHAKE_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    // Server loop
    pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const LISTEN_BACKLOG: u32 = 128;

    // Liveness
    pub const KEEP_ALIVE_INTERVAL: Duration = if cfg!(debug_assertions) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(5)
    };
    pub const PROBE_TIMEOUT: Duration = if cfg!(debug_assertions) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(2)
    };

    // Transport
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    // Lock files
    pub const LOCK_FILE_EXTENSION: &'static str = "lock";
    pub const LOCK_DIR_NAME: &'static str = "loopback-ipc";
}

/// Shared directory for lock files when none is configured.
///
/// Prefers the per-user runtime directory, then the cache directory, then the
/// system temp directory.
pub fn default_lock_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(IpcConfig::LOCK_DIR_NAME)
}

/// Options for a `ServerListener`.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Directory holding the single-instance lock files.
    pub lock_dir: PathBuf,
    /// How many consecutive ports to try when the nominal one is in use.
    pub bind_retry_count: u32,
    /// Upper bound on a single accept wait before housekeeping runs.
    pub accept_poll_interval: Duration,
    pub listen_backlog: u32,
    /// Interval between liveness probes of one connection.
    pub keep_alive_interval: Duration,
    /// How long a liveness probe may wait for its reply.
    pub probe_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            bind_retry_count: IpcConfig::SERVER_BIND_RETRY_COUNT,
            accept_poll_interval: IpcConfig::ACCEPT_POLL_INTERVAL,
            listen_backlog: IpcConfig::LISTEN_BACKLOG,
            keep_alive_interval: IpcConfig::KEEP_ALIVE_INTERVAL,
            probe_timeout: IpcConfig::PROBE_TIMEOUT,
            write_timeout: IpcConfig::WRITE_TIMEOUT,
        }
    }
}

impl ServerOptions {
    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = lock_dir.into();
        self
    }

    pub fn with_bind_retry_count(mut self, count: u32) -> Self {
        self.bind_retry_count = count.max(1);
        self
    }

    pub fn with_accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval;
        self
    }

    pub fn with_listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Options for a `ClientDialer`.
#[derive(Debug, Clone)]
pub struct DialerOptions {
    /// Lock directory consulted before dialing.
    ///
    /// `None` skips the pre-check and goes straight to port scanning.
    pub lock_dir: Option<PathBuf>,
    /// How many consecutive ports to probe.
    pub port_retry_count: u32,
    /// Handshake attempts per port.
    pub handshake_attempts: u32,
    /// Timeout of a single handshake attempt.
    pub handshake_attempt_timeout: Duration,
    pub connect_timeout: Duration,
    /// Optional deadline applied to every `request`/`call`.
    pub request_timeout: Option<Duration>,
    pub write_timeout: Duration,
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self {
            lock_dir: Some(default_lock_dir()),
            port_retry_count: IpcConfig::CLIENT_PORT_RETRY_COUNT,
            handshake_attempts: IpcConfig::HANDSHAKE_ATTEMPTS,
            handshake_attempt_timeout: IpcConfig::HANDSHAKE_ATTEMPT_TIMEOUT,
            connect_timeout: IpcConfig::CONNECT_TIMEOUT,
            request_timeout: None,
            write_timeout: IpcConfig::WRITE_TIMEOUT,
        }
    }
}

impl DialerOptions {
    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(lock_dir.into());
        self
    }

    /// Skip the lock-file pre-check.
    pub fn without_lock_check(mut self) -> Self {
        self.lock_dir = None;
        self
    }

    pub fn with_port_retry_count(mut self, count: u32) -> Self {
        self.port_retry_count = count.max(1);
        self
    }

    pub fn with_handshake_attempts(mut self, attempts: u32) -> Self {
        self.handshake_attempts = attempts.max(1);
        self
    }

    pub fn with_handshake_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_attempt_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(IpcConfig::HANDSHAKE_ATTEMPT_TIMEOUT < IpcConfig::CONNECT_TIMEOUT);
        assert!(IpcConfig::ACCEPT_POLL_INTERVAL < IpcConfig::KEEP_ALIVE_INTERVAL);
        assert!(IpcConfig::PROBE_TIMEOUT <= IpcConfig::WRITE_TIMEOUT);
    }

    #[test]
    fn test_retry_budgets() {
        assert_eq!(IpcConfig::CLIENT_PORT_RETRY_COUNT, 16);
        assert_eq!(IpcConfig::SERVER_BIND_RETRY_COUNT, 128);
        assert_eq!(IpcConfig::HANDSHAKE_ATTEMPTS, 50);
    }

    #[test]
    fn test_default_lock_dir_is_namespaced() {
        let dir = default_lock_dir();
        assert!(dir.ends_with(IpcConfig::LOCK_DIR_NAME));
    }

    #[test]
    fn test_options_builders() {
        let options = DialerOptions::default()
            .without_lock_check()
            .with_port_retry_count(0)
            .with_handshake_attempts(3);
        assert!(options.lock_dir.is_none());
        assert_eq!(options.port_retry_count, 1);
        assert_eq!(options.handshake_attempts, 3);

        let server = ServerOptions::default()
            .with_lock_dir("/tmp/locks")
            .with_keep_alive_interval(Duration::from_millis(50));
        assert_eq!(server.lock_dir, PathBuf::from("/tmp/locks"));
        assert_eq!(server.keep_alive_interval, Duration::from_millis(50));
    }
}
