//! Process-wide table of registered clients and their live sessions.
//!
//! Two maps keyed by client id:
//! - client id → credential and passkey digest, written when a client
//!   registers and read when its shell is spawned
//! - client id → session entry, reserved when a session starts and removed
//!   when it ends
//!
//! The registry is an explicitly owned handle; clones share the same tables.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::credential::SpawnCredential;
use crate::network::Attachment;

/// Identifier of a logical client, stable across reconnects.
pub type ClientId = String;

/// Errors returned by registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The client id is already registered.
    #[error("client already registered: {0}")]
    AlreadyRegistered(ClientId),

    /// The client id has no registered credential.
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    /// A session is already running or starting for the client.
    #[error("session already active for client: {0}")]
    SessionActive(ClientId),

    /// The client has no live session to hand a transport to.
    #[error("no live session for client: {0}")]
    NoSession(ClientId),
}

/// What a live session exposes to the rest of the daemon.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Owning client.
    pub client_id: ClientId,
    /// Pid of the shell process.
    pub pid: Option<u32>,
    /// When the session was activated.
    pub started_at: Instant,
    reattach_tx: mpsc::Sender<Attachment>,
}

impl SessionHandle {
    /// Handle for a session that receives reconnecting transports on `reattach_tx`.
    pub fn new(
        client_id: ClientId,
        pid: Option<u32>,
        reattach_tx: mpsc::Sender<Attachment>,
    ) -> Self {
        Self {
            client_id,
            pid,
            started_at: Instant::now(),
            reattach_tx,
        }
    }
}

#[derive(Debug)]
struct ClientRecord {
    credential: SpawnCredential,
    passkey_digest: [u8; 32],
}

#[derive(Debug)]
enum SessionEntry {
    /// A handshake has claimed the client; the shell is being spawned.
    Reserved,
    Active(SessionHandle),
}

#[derive(Debug, Default)]
struct RegistryInner {
    clients: DashMap<ClientId, ClientRecord>,
    sessions: DashMap<ClientId, SessionEntry>,
}

/// Shared handle to the registry tables.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

/// Exclusive claim on starting a session for one client.
///
/// Dropping the slot without activating it releases the claim.
#[derive(Debug)]
pub struct SessionSlot {
    client_id: ClientId,
    registry: SessionRegistry,
    activated: bool,
}

impl SessionSlot {
    /// The client this slot was reserved for.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if !self.activated {
            self.registry
                .inner
                .sessions
                .remove_if(&self.client_id, |_, entry| matches!(entry, SessionEntry::Reserved));
            debug!(client_id = %self.client_id, "Released unused session slot");
        }
    }
}

fn digest_passkey(passkey: &str) -> [u8; 32] {
    Sha256::digest(passkey.as_bytes()).into()
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client id and passkey to a local user.
    pub fn register_client(
        &self,
        client_id: impl Into<ClientId>,
        passkey: &str,
        credential: SpawnCredential,
    ) -> Result<(), RegistryError> {
        let client_id = client_id.into();
        match self.inner.clients.entry(client_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(client_id)),
            Entry::Vacant(slot) => {
                info!(
                    client_id = %client_id,
                    user = %credential.username,
                    uid = credential.uid,
                    "Registered client"
                );
                slot.insert(ClientRecord {
                    credential,
                    passkey_digest: digest_passkey(passkey),
                });
                Ok(())
            }
        }
    }

    /// Credential registered for a client.
    pub fn credential(&self, client_id: &str) -> Option<SpawnCredential> {
        self.inner
            .clients
            .get(client_id)
            .map(|record| record.credential.clone())
    }

    /// Whether `passkey` matches the one registered for the client.
    pub fn verify_passkey(&self, client_id: &str, passkey: &str) -> bool {
        self.inner
            .clients
            .get(client_id)
            .is_some_and(|record| {
                let offered = digest_passkey(passkey);
                bool::from(record.passkey_digest[..].ct_eq(&offered[..]))
            })
    }

    /// Claim the right to start a session for a registered client.
    ///
    /// At most one slot or live session exists per client id at any time, so
    /// two handshakes racing for the same client cannot both spawn a shell.
    pub fn begin_session(&self, client_id: &str) -> Result<SessionSlot, RegistryError> {
        if !self.inner.clients.contains_key(client_id) {
            return Err(RegistryError::UnknownClient(client_id.to_string()));
        }

        match self.inner.sessions.entry(client_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::SessionActive(client_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry::Reserved);
                Ok(SessionSlot {
                    client_id: client_id.to_string(),
                    registry: self.clone(),
                    activated: false,
                })
            }
        }
    }

    /// Turn a reserved slot into a live session.
    pub fn activate(&self, mut slot: SessionSlot, handle: SessionHandle) {
        info!(client_id = %slot.client_id, pid = ?handle.pid, "Session active");
        self.inner
            .sessions
            .insert(slot.client_id.clone(), SessionEntry::Active(handle));
        slot.activated = true;
    }

    /// Hand a reconnecting client's transport to its live session.
    pub async fn reattach(
        &self,
        client_id: &str,
        attachment: Attachment,
    ) -> Result<(), RegistryError> {
        let sender = match self.inner.sessions.get(client_id).as_deref() {
            Some(SessionEntry::Active(handle)) => handle.reattach_tx.clone(),
            _ => return Err(RegistryError::NoSession(client_id.to_string())),
        };

        sender
            .send(attachment)
            .await
            .map_err(|_| RegistryError::NoSession(client_id.to_string()))
    }

    /// Forget a client's session and its credential.
    pub fn end_session(&self, client_id: &str) {
        let had_session = self.inner.sessions.remove(client_id).is_some();
        let had_client = self.inner.clients.remove(client_id).is_some();
        debug!(client_id = %client_id, had_session, had_client, "Session deregistered");
    }

    /// Live handle of a client's session, if active.
    pub fn session(&self, client_id: &str) -> Option<SessionHandle> {
        match self.inner.sessions.get(client_id).as_deref() {
            Some(SessionEntry::Active(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Whether the client has a reserved or live session.
    pub fn contains_session(&self, client_id: &str) -> bool {
        self.inner.sessions.contains_key(client_id)
    }

    /// Number of reserved or live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Ids of all registered clients.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.clients.iter().map(|e| e.key().clone()).collect()
    }
}
