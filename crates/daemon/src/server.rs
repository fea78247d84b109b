//! TCP acceptor and the halt sequence.
//!
//! Every accepted socket gets its own task that runs the handshake. A client
//! with a live session has its new transport handed to that session; any
//! other client gets a fresh shell. A failed handshake closes that socket
//! and nothing else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{ClientHello, InitialPayload, ProtocolError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::network::{BoxedTransport, ConnectionError, FramedConnection};
use crate::session::{
    start_session, RegistryError, SessionConfig, SessionError, SessionOutcome, SessionRegistry,
    TerminationReason,
};

/// Default deadline for each handshake message.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time the halt sequence leaves sessions to unwind.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Runtime settings of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Deadline for each of the handshake messages.
    pub handshake_timeout: Duration,
    /// Grace period of the halt sequence.
    pub shutdown_grace: Duration,
    /// Settings passed to every new session.
    pub session: SessionConfig,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            session: SessionConfig::default(),
        }
    }
}

impl DispatcherSettings {
    /// Settings taken from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.network.handshake_timeout(),
            shutdown_grace: config.session.shutdown_grace(),
            session: config.session.session_config(),
        }
    }
}

/// Why a handshake was abandoned.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid handshake message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("bad credentials for client: {0}")]
    Rejected(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to start session: {0}")]
    Session(#[from] SessionError),
}

/// What a successful handshake led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// A new shell was started for the client.
    Started(String),
    /// The transport was handed to the client's live session.
    Reattached(String),
}

/// Accepts client connections and starts or resumes their sessions.
pub struct Dispatcher {
    listener: TcpListener,
    registry: SessionRegistry,
    settings: Arc<DispatcherSettings>,
    stop: CancellationToken,
}

impl Dispatcher {
    /// Bind to the address and settings of a configuration.
    pub async fn bind(config: &Config, registry: SessionRegistry) -> Result<Self> {
        let addr = config.network.listen_addr()?;
        Self::bind_addr(addr, DispatcherSettings::from_config(config), registry).await
    }

    /// Bind to an explicit address.
    pub async fn bind_addr(
        addr: SocketAddr,
        settings: DispatcherSettings,
        registry: SessionRegistry,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            listener,
            registry,
            settings: Arc::new(settings),
            stop: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The shared "stop accepting" flag.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Accept connections until the stop token fires. The listener is
    /// closed when this returns.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "Accepting connections"),
            Err(_) => info!("Accepting connections"),
        }

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Stopped accepting connections");
    }

    /// Run the accept loop in its own task.
    pub fn spawn(self) -> DispatcherHandle {
        let stop = self.stop.clone();
        let registry = self.registry.clone();
        let grace = self.settings.shutdown_grace;
        DispatcherHandle {
            stop,
            registry,
            grace,
            task: tokio::spawn(self.run()),
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let registry = self.registry.clone();
        let settings = Arc::clone(&self.settings);
        tokio::spawn(async move {
            match handshake(Box::new(stream), &registry, &settings).await {
                Ok(Handoff::Started(client_id)) => {
                    debug!(%peer, client_id = %client_id, "Session started")
                }
                Ok(Handoff::Reattached(client_id)) => {
                    debug!(%peer, client_id = %client_id, "Connection reattached")
                }
                Err(e) => warn!(%peer, error = %e, "Handshake failed"),
            }
        });
    }
}

/// Handle to a running accept loop.
pub struct DispatcherHandle {
    stop: CancellationToken,
    registry: SessionRegistry,
    grace: Duration,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// The shared "stop accepting" flag.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Stop accepting, close the listener, then give live sessions the grace
    /// period to unwind. Shells are left running.
    pub async fn halt(self) {
        info!("Halting");
        self.stop.cancel();

        if let Err(e) = self.task.await {
            error!(error = %e, "Accept loop panicked");
        }

        let live = self.registry.session_count();
        if live > 0 {
            info!(sessions = live, grace = ?self.grace, "Waiting for sessions to unwind");
            tokio::time::sleep(self.grace).await;
        }
    }
}

/// Run the handshake on a fresh transport and hand the client off.
///
/// The first frame is a [`ClientHello`]. A client with a live session is
/// reattached; otherwise the second frame must be an [`InitialPayload`] and a
/// new session is started from it.
pub async fn handshake(
    transport: BoxedTransport,
    registry: &SessionRegistry,
    settings: &DispatcherSettings,
) -> Result<Handoff, HandshakeError> {
    let mut connection = FramedConnection::accept(transport);

    let hello = read_within(&mut connection, settings.handshake_timeout).await?;
    let hello = ClientHello::from_msgpack(&hello)?;
    if !registry.verify_passkey(&hello.client_id, &hello.passkey) {
        return Err(HandshakeError::Rejected(hello.client_id));
    }
    let client_id = hello.client_id;
    connection.identify(client_id.clone());

    if registry.session(&client_id).is_some() {
        let attachment = connection
            .into_attachment()
            .ok_or(ConnectionError::NotConnected)?;
        registry.reattach(&client_id, attachment).await?;
        info!(client_id = %client_id, "Handed connection to live session");
        return Ok(Handoff::Reattached(client_id));
    }

    // Reserve first so two racing handshakes cannot both spawn a shell.
    let slot = registry.begin_session(&client_id)?;
    let payload = read_within(&mut connection, settings.handshake_timeout).await?;
    let payload = InitialPayload::from_msgpack(&payload)?;
    debug!(
        client_id = %client_id,
        rows = payload.terminal.rows,
        columns = payload.terminal.columns,
        env = payload.environment.len(),
        "Initial payload received"
    );

    let task = start_session(slot, registry, connection, &payload, &settings.session)?;
    tokio::spawn(report_outcome(client_id.clone(), task));

    Ok(Handoff::Started(client_id))
}

async fn read_within(
    connection: &mut FramedConnection,
    deadline: Duration,
) -> Result<Vec<u8>, HandshakeError> {
    tokio::time::timeout(deadline, connection.next_message())
        .await
        .map_err(|_| HandshakeError::Timeout)?
        .map_err(HandshakeError::from)
}

async fn report_outcome(client_id: String, task: JoinHandle<SessionOutcome>) {
    match task.await {
        Ok(outcome) => match outcome.reason {
            TerminationReason::ShellExited => {
                info!(client_id = %outcome.client_id, "Session ended")
            }
            reason => warn!(client_id = %outcome.client_id, ?reason, "Session terminated"),
        },
        Err(e) => error!(client_id = %client_id, error = %e, "Session task failed"),
    }
}
