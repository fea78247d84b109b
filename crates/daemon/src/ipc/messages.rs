//! IPC message types for local control of the server.
//!
//! Requests and responses exchanged over the registration socket, one JSON
//! object per line.

use serde::{Deserialize, Serialize};

/// Requests a local process can send to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the server is alive.
    Ping,
    /// Bind a client id and passkey to the user on the other end of the socket.
    Register {
        /// Client id the remote terminal will present.
        client_id: String,
        /// Passkey the remote terminal will present.
        passkey: String,
    },
    /// Get the current status of the server.
    Status,
    /// Request the server to halt.
    Stop,
}

/// Responses sent back to the requesting process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// The client id is registered and may now connect.
    Registered {
        /// The registered client id.
        client_id: String,
    },
    /// Current server status.
    Status {
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Number of registered clients.
        client_count: usize,
    },
    /// Acknowledgment that the server is halting.
    Stopping,
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}
