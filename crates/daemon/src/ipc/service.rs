//! Request handling for the registration socket.
//!
//! Runs beside the TCP dispatcher. A `Register` request binds a client id to
//! the local user who sent it, which is what later lets that client's shell
//! be spawned under the right identity.

use std::sync::Arc;
use std::time::Instant;

use nix::unistd::Uid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{IpcRequest, IpcResponse};
use super::server::{IpcConnection, IpcServer};
use crate::session::{SessionRegistry, SpawnCredential};

/// Serves registration and control requests until the stop token fires.
pub struct RegistrationService {
    server: IpcServer,
    state: Arc<ServiceState>,
}

struct ServiceState {
    registry: SessionRegistry,
    stop: CancellationToken,
    started_at: Instant,
}

impl RegistrationService {
    /// Service answering on `server`. A `Stop` request cancels `stop`.
    pub fn new(server: IpcServer, registry: SessionRegistry, stop: CancellationToken) -> Self {
        Self {
            server,
            state: Arc::new(ServiceState {
                registry,
                stop,
                started_at: Instant::now(),
            }),
        }
    }

    /// Accept connections until the stop token is cancelled.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.state.stop.cancelled() => break,
                accepted = self.server.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move { state.serve(conn).await });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept IPC connection"),
                },
            }
        }
        debug!("Registration service stopped");
    }
}

impl ServiceState {
    async fn serve(&self, mut conn: IpcConnection) {
        let peer_uid = conn.peer_uid();
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer_uid, error = %e, "Bad IPC request");
                    let _ = conn
                        .send_response(&IpcResponse::Error {
                            message: e.to_string(),
                        })
                        .await;
                    break;
                }
            };

            let response = self.handle(request, peer_uid);
            if let Err(e) = conn.send_response(&response).await {
                debug!(peer_uid, error = %e, "IPC client went away");
                break;
            }
        }
    }

    fn handle(&self, request: IpcRequest, peer_uid: u32) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Register { client_id, passkey } => {
                self.register(client_id, &passkey, peer_uid)
            }
            IpcRequest::Status => IpcResponse::Status {
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.registry.session_count(),
                client_count: self.registry.client_count(),
            },
            IpcRequest::Stop => {
                // Only root or the server's own user may halt it.
                let own_uid = Uid::current().as_raw();
                if peer_uid != 0 && peer_uid != own_uid {
                    warn!(peer_uid, "Rejected stop request");
                    return IpcResponse::Error {
                        message: "permission denied".to_string(),
                    };
                }
                info!(peer_uid, "Stop requested over IPC");
                self.stop.cancel();
                IpcResponse::Stopping
            }
        }
    }

    fn register(&self, client_id: String, passkey: &str, peer_uid: u32) -> IpcResponse {
        if client_id.is_empty() || passkey.is_empty() {
            return IpcResponse::Error {
                message: "client id and passkey must not be empty".to_string(),
            };
        }

        let credential = match SpawnCredential::from_uid(peer_uid) {
            Ok(credential) => credential,
            Err(e) => {
                return IpcResponse::Error {
                    message: e.to_string(),
                }
            }
        };

        match self.registry.register_client(client_id.clone(), passkey, credential) {
            Ok(()) => IpcResponse::Registered { client_id },
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        }
    }
}
