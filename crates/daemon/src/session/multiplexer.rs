//! Per-session I/O loop between a PTY and a client connection.
//!
//! Shell output becomes `TERMINAL_BUFFER` packets in read order; inbound
//! packets are applied to the PTY in arrival order. Input the shell is not
//! ready for waits in a queue, so the PTY keeps being read while a large paste
//! is written. Only the shell or a client that breaks the protocol ends a
//! session: a failing connection is closed and the loop keeps running until
//! the client reattaches or the shell exits.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, Bytes};
use protocol::{Packet, TerminalInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pty::{ErrorKind, PtySession, SessionError};
use super::registry::{ClientId, SessionRegistry};
use crate::network::{Attachment, Connection};

/// Default bound on a single readiness wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default size of a single PTY read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Queued input above which the connection is not read until the shell catches up.
const MAX_PENDING_INPUT: usize = 1024 * 1024;

/// Tuning for the session loop.
#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    /// Upper bound on how long one iteration waits for readiness.
    pub poll_interval: Duration,
    /// Maximum bytes read from the PTY per iteration.
    pub read_buffer_size: usize,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Lifecycle of a session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Moving bytes between PTY and connection.
    Running,
    /// Releasing the registry entry, connection and PTY.
    Closing,
    /// Cleanup finished; no further I/O.
    Terminated,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The shell exited or closed its terminal.
    ShellExited,
    /// The client sent something the protocol does not allow.
    ProtocolViolation(String),
    /// The PTY or another OS resource failed.
    Fault(String),
}

/// Result of a finished session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// The client the session belonged to.
    pub client_id: ClientId,
    /// Final state, always [`SessionState::Terminated`].
    pub state: SessionState,
    /// Why the loop stopped.
    pub reason: TerminationReason,
}

/// Input accepted from the client but not yet applied to the PTY.
#[derive(Debug)]
enum PendingInput {
    Bytes(Bytes),
    Resize(TerminalInfo),
}

/// Bytes at the head of the queue. Empty when the queue is.
fn next_input(pending: &VecDeque<PendingInput>) -> &[u8] {
    match pending.front() {
        Some(PendingInput::Bytes(bytes)) => bytes.as_ref(),
        _ => &[],
    }
}

/// Owns one PTY and one client connection for the lifetime of a session.
pub struct SessionMultiplexer<C> {
    client_id: ClientId,
    pty: PtySession,
    connection: C,
    registry: SessionRegistry,
    reattach_rx: mpsc::Receiver<Attachment>,
    options: MultiplexerOptions,
    state: SessionState,
    // Invariant: empty, or the head is `PendingInput::Bytes`.
    pending: VecDeque<PendingInput>,
    pending_bytes: usize,
}

impl<C: Connection + 'static> SessionMultiplexer<C> {
    /// Create a multiplexer in the running state.
    pub fn new(
        client_id: ClientId,
        pty: PtySession,
        connection: C,
        registry: SessionRegistry,
        reattach_rx: mpsc::Receiver<Attachment>,
        options: MultiplexerOptions,
    ) -> Self {
        Self {
            client_id,
            pty,
            connection,
            registry,
            reattach_rx,
            options,
            state: SessionState::Running,
            pending: VecDeque::new(),
            pending_bytes: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the loop in its own task.
    pub fn spawn(self) -> JoinHandle<SessionOutcome> {
        tokio::spawn(self.run())
    }

    /// Run the loop until the shell exits or a fatal error occurs, then clean up.
    pub async fn run(mut self) -> SessionOutcome {
        info!(client_id = %self.client_id, pid = ?self.pty.pid(), "Session loop started");
        let mut buf = vec![0u8; self.options.read_buffer_size.max(1)];

        let reason = loop {
            let err = match self.step(&mut buf).await {
                Ok(()) => continue,
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::RecoverableConnection => {
                    warn!(
                        client_id = %self.client_id,
                        error = %err,
                        "Connection lost, keeping shell alive"
                    );
                    self.connection.close();
                }
                ErrorKind::ShellExit => break TerminationReason::ShellExited,
                ErrorKind::FatalProtocol => {
                    warn!(client_id = %self.client_id, error = %err, "Protocol violation");
                    break TerminationReason::ProtocolViolation(err.to_string());
                }
                ErrorKind::FatalResource => {
                    error!(client_id = %self.client_id, error = %err, "Session fault");
                    break TerminationReason::Fault(err.to_string());
                }
            }
        };

        self.close(reason)
    }

    /// One bounded wait plus whatever work became ready.
    async fn step(&mut self, buf: &mut [u8]) -> Result<(), SessionError> {
        let connected = self.connection.is_connected();
        let writing = !self.pending.is_empty();
        let accepting = self.pending_bytes < MAX_PENDING_INPUT;

        tokio::select! {
            read = self.pty.read(buf) => {
                let n = read?;
                if n == 0 {
                    return Err(SessionError::ShellExited);
                }
                let packet = Packet::TerminalBuffer(buf[..n].to_vec()).encode()?;
                self.connection.write_message(&packet).await?;
            }
            written = self.pty.write_some(next_input(&self.pending)), if writing => {
                self.consume_input(written?)?;
            }
            ready = self.connection.wait_readable(), if connected && accepting => {
                ready?;
                self.drain().await?;
            }
            Some(attachment) = self.reattach_rx.recv() => {
                info!(client_id = %self.client_id, "Client reattached");
                self.connection.attach(attachment);
                self.drain().await?;
            }
            _ = tokio::time::sleep(self.options.poll_interval) => {}
        }

        Ok(())
    }

    /// Process every complete message already buffered on the connection.
    async fn drain(&mut self) -> Result<(), SessionError> {
        while self.connection.has_buffered_data() {
            let Some(message) = self.connection.read_message()? else {
                break;
            };
            self.dispatch(&message).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, message: &[u8]) -> Result<(), SessionError> {
        match Packet::decode(message)? {
            Packet::TerminalBuffer(bytes) => {
                if !bytes.is_empty() {
                    self.pending_bytes += bytes.len();
                    self.pending.push_back(PendingInput::Bytes(Bytes::from(bytes)));
                }
            }
            Packet::KeepAlive => {
                let echo = Packet::KeepAlive.encode()?;
                self.connection.write_message(&echo).await?;
            }
            // A resize must not overtake input that arrived before it.
            Packet::TerminalInfo(info) if self.pending.is_empty() => self.pty.resize(info)?,
            Packet::TerminalInfo(info) => self.pending.push_back(PendingInput::Resize(info)),
        }
        Ok(())
    }

    /// Drop `written` bytes from the head of the queue, then apply any
    /// resizes that were waiting behind them.
    fn consume_input(&mut self, written: usize) -> Result<(), SessionError> {
        if let Some(PendingInput::Bytes(bytes)) = self.pending.front_mut() {
            bytes.advance(written);
            self.pending_bytes -= written;
            if bytes.is_empty() {
                self.pending.pop_front();
            }
        }

        while let Some(PendingInput::Resize(info)) = self.pending.front() {
            let info = *info;
            self.pending.pop_front();
            self.pty.resize(info)?;
        }
        Ok(())
    }

    fn close(mut self, reason: TerminationReason) -> SessionOutcome {
        self.state = SessionState::Closing;
        debug!(
            client_id = %self.client_id,
            reason = ?reason,
            unwritten = self.pending_bytes,
            "Session closing"
        );

        self.registry.end_session(&self.client_id);
        self.connection.close();
        self.pty.close();

        info!(client_id = %self.client_id, reason = ?reason, "Session terminated");
        SessionOutcome {
            client_id: self.client_id,
            state: SessionState::Terminated,
            reason,
        }
    }
}
