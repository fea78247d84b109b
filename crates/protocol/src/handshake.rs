//! Handshake messages sent at the start of every logical connection.
//!
//! A client opens with a [`ClientHello`]. If the server has no live session
//! for that client, the next frame is an [`InitialPayload`] describing the
//! terminal the shell should be started in.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::packet::TerminalInfo;

/// First message on a new connection: which registered client is connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Client id registered with the daemon.
    pub client_id: String,
    /// Passkey registered alongside the client id.
    pub passkey: String,
}

impl ClientHello {
    /// Serialize to MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Initial terminal geometry and environment for a new session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitialPayload {
    /// Starting window size.
    pub terminal: TerminalInfo,
    /// `NAME=VALUE` entries applied to the shell environment.
    pub environment: Vec<String>,
}

impl InitialPayload {
    /// Serialize to MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Split every environment entry at its first `=`.
    ///
    /// Any entry without `=`, or with an empty name, rejects the whole payload.
    pub fn parse_environment(&self) -> Result<Vec<(String, String)>> {
        self.environment
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((name, value)) if !name.is_empty() => {
                    Ok((name.to_string(), value.to_string()))
                }
                _ => Err(ProtocolError::MalformedEnvironment(entry.clone())),
            })
            .collect()
    }
}
