//! Session management module.
//!
//! This module provides the client registry, PTY spawning under a client's
//! identity, and the per-session multiplexing loop.

pub mod credential;
pub mod multiplexer;
pub mod pty;
pub mod registry;

pub use credential::SpawnCredential;
pub use multiplexer::{
    MultiplexerOptions, SessionMultiplexer, SessionOutcome, SessionState, TerminationReason,
};
pub use pty::{ErrorKind, PtyOptions, PtySession, SessionError};
pub use registry::{ClientId, RegistryError, SessionHandle, SessionRegistry, SessionSlot};

use protocol::InitialPayload;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::network::Connection;

/// Pending reattach requests a session holds before the sender waits.
const REATTACH_CHANNEL_CAPACITY: usize = 4;

/// Settings for spawning and running a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Shell spawning settings.
    pub pty: PtyOptions,
    /// Loop tuning.
    pub multiplexer: MultiplexerOptions,
}

/// Start a session in a reserved slot.
///
/// The environment is validated before anything is allocated, so a malformed
/// entry never leaves a PTY or process behind. On any error the slot is
/// released.
pub fn start_session<C: Connection + 'static>(
    slot: SessionSlot,
    registry: &SessionRegistry,
    connection: C,
    payload: &InitialPayload,
    config: &SessionConfig,
) -> Result<JoinHandle<SessionOutcome>, SessionError> {
    let env = payload.parse_environment()?;
    let client_id = slot.client_id().to_string();

    let pty = PtySession::create(&client_id, registry, payload.terminal, &env, &config.pty)?;

    let (reattach_tx, reattach_rx) = mpsc::channel(REATTACH_CHANNEL_CAPACITY);
    registry.activate(slot, SessionHandle::new(client_id.clone(), pty.pid(), reattach_tx));

    let multiplexer = SessionMultiplexer::new(
        client_id,
        pty,
        connection,
        registry.clone(),
        reattach_rx,
        config.multiplexer.clone(),
    );
    Ok(multiplexer.spawn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FramedConnection;
    use protocol::{ProtocolError, TerminalInfo};

    fn payload(env: &[&str]) -> InitialPayload {
        InitialPayload {
            terminal: TerminalInfo::new(24, 80),
            environment: env.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_malformed_environment_aborts_before_spawn() {
        let registry = SessionRegistry::new();
        registry
            .register_client("laptop", "pw", SpawnCredential::current_user().unwrap())
            .unwrap();

        let (ours, _theirs) = tokio::io::duplex(1024);
        let slot = registry.begin_session("laptop").unwrap();
        let result = start_session(
            slot,
            &registry,
            FramedConnection::new("laptop", Box::new(ours)),
            &payload(&["TERM=xterm", "NOEQUALS"]),
            &SessionConfig::default(),
        );

        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::MalformedEnvironment(_)))
        ));
        assert!(!registry.contains_session("laptop"));
        // The credential stays so the client can retry with a valid payload.
        assert!(registry.credential("laptop").is_some());
    }

    #[tokio::test]
    async fn test_start_session_activates_entry() {
        let registry = SessionRegistry::new();
        let credential = SpawnCredential::current_user().unwrap().with_shell("/bin/cat");
        registry.register_client("laptop", "pw", credential).unwrap();

        let (ours, _theirs) = tokio::io::duplex(1024);
        let slot = registry.begin_session("laptop").unwrap();
        let task = start_session(
            slot,
            &registry,
            FramedConnection::new("laptop", Box::new(ours)),
            &payload(&["TERM=xterm"]),
            &SessionConfig::default(),
        )
        .unwrap();

        let handle = registry.session("laptop").unwrap();
        assert!(handle.pid.is_some());
        task.abort();
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_slot() {
        let registry = SessionRegistry::new();
        let credential = SpawnCredential::current_user()
            .unwrap()
            .with_shell("/nonexistent/shell");
        registry.register_client("laptop", "pw", credential).unwrap();

        let (ours, _theirs) = tokio::io::duplex(1024);
        let slot = registry.begin_session("laptop").unwrap();
        let result = start_session(
            slot,
            &registry,
            FramedConnection::new("laptop", Box::new(ours)),
            &payload(&[]),
            &SessionConfig::default(),
        );

        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert!(!registry.contains_session("laptop"));
    }
}
