//! Unix Domain Socket IPC for registering clients with a running server.
//!
//! The server listens on a local socket next to the TCP port. Local processes
//! use it to bind a client id and passkey to their own Unix user, check the
//! server status, or ask it to halt.
//!
//! ## Overview
//!
//! The IPC system uses a JSON newline-delimited protocol. Each message is a
//! single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! Unless configured otherwise the server binds the system-wide path
//! `/tmp/stayterm/server.sock`, so a server running as root and the users
//! registering with it agree without any configuration. An unprivileged server
//! that cannot claim that path falls back to a per-user one:
//! - `$XDG_RUNTIME_DIR/stayterm/server.sock`
//! - `/tmp/stayterm-$UID/server.sock` without `XDG_RUNTIME_DIR`
//!
//! Clients try the system-wide path first and the per-user path second.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     client.register("laptop", "correct horse").await?;
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;
mod service;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcError, IpcServer};
pub use service::RegistrationService;

use std::path::{Path, PathBuf};

use tracing::warn;

/// Well-known registration socket shared by every user.
pub const SYSTEM_SOCKET_PATH: &str = "/tmp/stayterm/server.sock";

/// Get the default socket path for IPC communication.
///
/// The same for every user.
pub fn get_socket_path() -> PathBuf {
    PathBuf::from(SYSTEM_SOCKET_PATH)
}

/// Per-user socket path, used when the system-wide one cannot be bound.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/stayterm/server.sock`
/// 2. Otherwise: `/tmp/stayterm-$UID/server.sock`
pub fn get_user_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("stayterm").join("server.sock")
    } else {
        let uid = nix::unistd::Uid::current().as_raw();
        PathBuf::from(format!("/tmp/stayterm-{}", uid)).join("server.sock")
    }
}

/// Refuse a socket directory that already exists and belongs to someone else.
fn check_socket_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let Some(parent) = path.parent() else {
        return Ok(());
    };
    match std::fs::metadata(parent) {
        Ok(meta) if meta.uid() != nix::unistd::geteuid().as_raw() => Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{} is owned by uid {}", parent.display(), meta.uid()),
        )),
        _ => Ok(()),
    }
}

/// Bind `primary`, or `fallback` if given and `primary` cannot be bound.
///
/// Returns the server together with the path it listens on.
pub async fn bind_with_fallback(
    primary: &Path,
    fallback: Option<&Path>,
) -> std::io::Result<(IpcServer, PathBuf)> {
    let bound = match check_socket_dir(primary) {
        Ok(()) => IpcServer::bind(primary).await,
        Err(e) => Err(e),
    };

    match bound {
        Ok(server) => Ok((server, primary.to_path_buf())),
        Err(e) => {
            let Some(fallback) = fallback else {
                return Err(e);
            };
            warn!(
                socket = %primary.display(),
                fallback = %fallback.display(),
                error = %e,
                "Cannot bind registration socket, using per-user path"
            );
            let server = IpcServer::bind(fallback).await?;
            Ok((server, fallback.to_path_buf()))
        }
    }
}

/// Connect to `primary`, or to `fallback` if given and `primary` is unreachable.
pub async fn connect_with_fallback(
    primary: &Path,
    fallback: Option<&Path>,
) -> Result<IpcClient, IpcError> {
    match IpcClient::connect(primary).await {
        Ok(client) => Ok(client),
        Err(e) => match fallback {
            Some(fallback) => IpcClient::connect(fallback).await.map_err(|_| e),
            None => Err(e),
        },
    }
}
