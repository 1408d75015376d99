//! Server identity: the (unique name, protocol revision) pair that picks the
//! lock file and the nominal port.

use std::fmt;

use crate::config::IpcConfig;
use crate::error::{IpcError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    pub unique_name: String,
    pub protocol_revision: u32,
}

impl ServerIdentity {
    pub fn new(unique_name: impl Into<String>, protocol_revision: u32) -> Self {
        Self {
            unique_name: unique_name.into(),
            protocol_revision,
        }
    }

    /// `{name}.{revision}.lock`
    pub fn lock_file_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.unique_name,
            self.protocol_revision,
            IpcConfig::LOCK_FILE_EXTENSION
        )
    }

    /// `base_port + protocol_revision`, the first port a server binds and a client dials.
    pub fn nominal_port(&self, base_port: u16) -> Result<u16> {
        u16::try_from(self.protocol_revision)
            .ok()
            .and_then(|revision| base_port.checked_add(revision))
            .ok_or_else(|| IpcError::Validation {
                field: "base_port".to_string(),
                message: format!(
                    "base port {} plus protocol revision {} exceeds the port range",
                    base_port, self.protocol_revision
                ),
            })
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.unique_name, self.protocol_revision)
    }
}

/// Ports to try starting at `first`, stopping at the top of the port range.
pub(crate) fn port_sequence(first: u16, count: u32) -> impl Iterator<Item = u16> {
    (0..count).map_while(move |offset| u16::try_from(offset).ok().and_then(|o| first.checked_add(o)))
}
