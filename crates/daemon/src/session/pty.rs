//! PTY session management.
//!
//! A [`PtySession`] owns one pseudo-terminal pair and the shell attached to
//! its slave side. The shell is started under the identity registered for the
//! client; there is no path that runs it with the daemon's own privileges.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{openpty, Winsize};
use protocol::{ProtocolError, TerminalInfo};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::credential::SpawnCredential;
use super::registry::SessionRegistry;
use crate::network::ConnectionError;

/// Default `PATH` exported to every shell.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/bin:/usr/bin";

/// Shell used when a credential names none.
pub const DEFAULT_SHELL: &str = "/bin/sh";

nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, libc::winsize);
nix::ioctl_read_bad!(get_window_size, libc::TIOCGWINSZ, libc::winsize);

/// Errors that can occur while a session is created or running.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No credential is registered for the client.
    #[error("no credential registered for client: {0}")]
    MissingCredential(String),

    /// The user database lookup failed.
    #[error("credential lookup failed: {0}")]
    CredentialLookup(String),

    /// Allocating or configuring the pseudo-terminal failed.
    #[error("failed to allocate PTY: {0}")]
    PtyAllocation(String),

    /// The shell could not be started.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// Setting the window size failed.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// I/O on the master descriptor failed.
    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),

    /// The client broke the packet protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client connection failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The shell side of the PTY is gone.
    #[error("shell exited")]
    ShellExited,
}

/// How an error affects the session it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer violated the protocol; the session is torn down.
    FatalProtocol,
    /// An OS resource failed; the session is torn down.
    FatalResource,
    /// Only the connection side is closed; the shell keeps running.
    RecoverableConnection,
    /// Normal end of the session.
    ShellExit,
}

impl SessionError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::MissingCredential(_)
            | SessionError::Protocol(_)
            | SessionError::Connection(ConnectionError::Frame(_)) => ErrorKind::FatalProtocol,
            SessionError::Connection(_) => ErrorKind::RecoverableConnection,
            SessionError::ShellExited => ErrorKind::ShellExit,
            SessionError::CredentialLookup(_)
            | SessionError::PtyAllocation(_)
            | SessionError::SpawnFailed(_)
            | SessionError::ResizeFailed(_)
            | SessionError::Io(_) => ErrorKind::FatalResource,
        }
    }
}

/// Settings applied to every spawned shell.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    /// Shell for credentials without one.
    pub default_shell: PathBuf,
    /// Value forced into `PATH`.
    pub default_path: String,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            default_shell: PathBuf::from(DEFAULT_SHELL),
            default_path: DEFAULT_PATH.to_string(),
        }
    }
}

fn winsize(geometry: TerminalInfo) -> Winsize {
    Winsize {
        ws_row: geometry.rows,
        ws_col: geometry.columns,
        ws_xpixel: geometry.pixel_width,
        ws_ypixel: geometry.pixel_height,
    }
}

fn pty_error(context: &str) -> impl FnOnce(nix::Error) -> SessionError + '_ {
    move |e| SessionError::PtyAllocation(format!("{}: {}", context, e))
}

/// A pseudo-terminal with a shell running on its slave side.
pub struct PtySession {
    client_id: String,
    master: AsyncFd<File>,
    child: Child,
    pid: Option<u32>,
}

impl PtySession {
    /// Allocate a PTY and start the client's shell in it.
    ///
    /// `env` is applied first; `SHELL`, `HOME`, `USER`, `LOGNAME` and `PATH`
    /// are then forced from the credential and `options`. Must be called from
    /// within a tokio runtime.
    pub fn create(
        client_id: &str,
        registry: &SessionRegistry,
        geometry: TerminalInfo,
        env: &[(String, String)],
        options: &PtyOptions,
    ) -> Result<Self, SessionError> {
        let credential = registry
            .credential(client_id)
            .ok_or_else(|| SessionError::MissingCredential(client_id.to_string()))?;

        let pty = openpty(Some(&winsize(geometry)), None).map_err(pty_error("openpty"))?;
        let master = pty.master;
        let slave = pty.slave;

        for fd in [&master, &slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(pty_error("set close-on-exec"))?;
        }
        let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL).map_err(pty_error("get flags"))?;
        fcntl(
            master.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .map_err(pty_error("set non-blocking"))?;

        let shell = credential.effective_shell(&options.default_shell).to_path_buf();
        let child = spawn_shell(&shell, &credential, slave, env, options)?;
        let pid = child.id();

        let master = AsyncFd::new(File::from(master))
            .map_err(|e| SessionError::PtyAllocation(format!("register master: {}", e)))?;

        info!(
            client_id = %client_id,
            pid = ?pid,
            user = %credential.username,
            shell = %shell.display(),
            rows = geometry.rows,
            cols = geometry.columns,
            "Spawned shell"
        );

        Ok(Self {
            client_id: client_id.to_string(),
            master,
            child,
            pid,
        })
    }

    /// Pid of the shell process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Read shell output into `buf`.
    ///
    /// Returns `Ok(0)` once the shell side is gone. Cancel safe.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(Ok(n)) => return Ok(n),
                // Linux reports a hung-up slave as EIO rather than end of file.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Wait until the shell accepts input, then write as much of `data` as
    /// fits. Returns the number of bytes written.
    ///
    /// Cancel safe: nothing is written unless the future completes.
    pub async fn write_some(&self, data: &[u8]) -> Result<usize, SessionError> {
        loop {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) if !data.is_empty() => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into())
                }
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of `data` to the shell, retrying short writes.
    ///
    /// Nothing reads the PTY while this runs, so a shell that echoes its
    /// input can stall it. The session loop queues input and uses
    /// [`write_some`](Self::write_some) instead.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), SessionError> {
        while !data.is_empty() {
            let n = self.write_some(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Apply a new window size.
    pub fn resize(&self, geometry: TerminalInfo) -> Result<(), SessionError> {
        let ws = winsize(geometry);
        // SAFETY: the descriptor is a live PTY master and `ws` outlives the call.
        unsafe { set_window_size(self.master.as_raw_fd(), &ws) }
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        debug!(
            client_id = %self.client_id,
            rows = geometry.rows,
            cols = geometry.columns,
            "Resized PTY"
        );
        Ok(())
    }

    /// Current window size as reported by the terminal driver.
    pub fn window_size(&self) -> Result<TerminalInfo, SessionError> {
        let mut ws = winsize(TerminalInfo::default());
        // SAFETY: the descriptor is a live PTY master and `ws` is a valid out pointer.
        unsafe { get_window_size(self.master.as_raw_fd(), &mut ws) }
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        Ok(TerminalInfo {
            rows: ws.ws_row,
            columns: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        })
    }

    /// Close the master descriptor.
    ///
    /// The shell is not killed or waited for; the runtime reaps it once it exits.
    pub fn close(self) {
        debug!(client_id = %self.client_id, pid = ?self.pid, "Closing PTY master");
        drop(self.master);
        drop(self.child);
    }
}

/// Start `shell` on the slave side of a PTY as the credential's user.
///
/// The shell sees only the handshake environment and the forced variables,
/// nothing inherited from the daemon. Group id is set before user id.
/// Everything between the drop of privileges and exec runs without
/// allocating: the hook only issues syscalls on data prepared here in the
/// parent. If any step fails the child exits and the error comes back from
/// `spawn`.
fn spawn_shell(
    shell: &Path,
    credential: &SpawnCredential,
    slave: OwnedFd,
    env: &[(String, String)],
    options: &PtyOptions,
) -> Result<Child, SessionError> {
    let home = CString::new(credential.home.as_os_str().as_bytes())
        .map_err(|e| SessionError::SpawnFailed(format!("invalid home directory: {}", e)))?;

    let stdio = |fd: &OwnedFd| -> Result<Stdio, SessionError> {
        fd.try_clone()
            .map(Stdio::from)
            .map_err(|e| SessionError::PtyAllocation(format!("duplicate slave: {}", e)))
    };

    let mut command = Command::new(shell);
    command
        .stdin(stdio(&slave)?)
        .stdout(stdio(&slave)?)
        .stderr(stdio(&slave)?)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("SHELL", shell)
        .env("HOME", &credential.home)
        .env("USER", &credential.username)
        .env("LOGNAME", &credential.username)
        .env("PATH", &options.default_path)
        .gid(credential.gid)
        .uid(credential.uid);

    // SAFETY: the hook only calls async-signal-safe functions on memory
    // captured before fork.
    unsafe {
        command.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            // A missing home directory leaves the shell where it starts.
            libc::chdir(home.as_ptr());
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", shell.display(), e)))?;

    // The child holds its own copies now; the parent's slave closes with `command`.
    drop(command);
    drop(slave);

    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn registry_with(client_id: &str, shell: &str) -> SessionRegistry {
        let registry = SessionRegistry::new();
        let credential = SpawnCredential::current_user().unwrap().with_shell(shell);
        registry.register_client(client_id, "pw", credential).unwrap();
        registry
    }

    async fn read_to_end(pty: &PtySession) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = timeout(Duration::from_secs(10), pty.read(&mut buf))
                .await
                .expect("timed out waiting for shell output")
                .unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    async fn read_until(pty: &PtySession, needle: &str) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&out).contains(needle) {
            let n = timeout(Duration::from_secs(10), pty.read(&mut buf))
                .await
                .expect("timed out waiting for shell output")
                .unwrap();
            assert!(n > 0, "shell exited before printing {:?}", needle);
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_missing_credential_never_spawns() {
        let registry = SessionRegistry::new();
        let result = PtySession::create(
            "ghost",
            &registry,
            TerminalInfo::new(24, 80),
            &[],
            &PtyOptions::default(),
        );
        assert!(matches!(result, Err(SessionError::MissingCredential(ref id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_initial_window_size() {
        let registry = registry_with("sized", "/bin/sh");
        let pty = PtySession::create(
            "sized",
            &registry,
            TerminalInfo::new(24, 80),
            &[],
            &PtyOptions::default(),
        )
        .unwrap();

        let size = pty.window_size().unwrap();
        assert_eq!((size.rows, size.columns), (24, 80));
        assert!(pty.pid().is_some());
        pty.close();
    }

    #[tokio::test]
    async fn test_resize() {
        let registry = registry_with("resize", "/bin/sh");
        let pty = PtySession::create(
            "resize",
            &registry,
            TerminalInfo::new(24, 80),
            &[],
            &PtyOptions::default(),
        )
        .unwrap();

        pty.resize(TerminalInfo::new(40, 120)).unwrap();
        let size = pty.window_size().unwrap();
        assert_eq!((size.rows, size.columns), (40, 120));
        pty.close();
    }

    #[tokio::test]
    async fn test_environment_and_forced_identity() {
        // `env` with no arguments prints its environment and exits.
        let registry = registry_with("envcheck", "/usr/bin/env");
        let credential = registry.credential("envcheck").unwrap();
        let env = vec![
            ("TERM".to_string(), "xterm".to_string()),
            ("USER".to_string(), "mallory".to_string()),
        ];

        let pty = PtySession::create(
            "envcheck",
            &registry,
            TerminalInfo::new(24, 80),
            &env,
            &PtyOptions::default(),
        )
        .unwrap();

        let output = read_to_end(&pty).await;
        let lines: Vec<&str> = output.lines().map(|l| l.trim_end_matches('\r')).collect();

        assert!(lines.contains(&"TERM=xterm"), "{}", output);
        assert!(lines.contains(&"SHELL=/usr/bin/env"), "{}", output);
        assert!(lines.contains(&format!("HOME={}", credential.home.display()).as_str()));
        assert!(lines.contains(&format!("USER={}", credential.username).as_str()));
        assert!(lines.contains(&format!("LOGNAME={}", credential.username).as_str()));
        assert!(lines.contains(&format!("PATH={}", DEFAULT_PATH).as_str()));
        assert!(!lines.contains(&"USER=mallory"));
        pty.close();
    }

    #[tokio::test]
    async fn test_shell_exit_reads_zero() {
        let registry = registry_with("exits", "/bin/true");
        let pty = PtySession::create(
            "exits",
            &registry,
            TerminalInfo::new(24, 80),
            &[],
            &PtyOptions::default(),
        )
        .unwrap();

        read_to_end(&pty).await;
        pty.close();
    }

    #[tokio::test]
    async fn test_write_reaches_shell() {
        let registry = registry_with("echo", "/bin/sh");
        let pty = PtySession::create(
            "echo",
            &registry,
            TerminalInfo::new(24, 80),
            &[],
            &PtyOptions::default(),
        )
        .unwrap();

        pty.write_all(b"printf 'hel''lo\\n'\n").await.unwrap();
        let output = read_until(&pty, "hello\r\n").await;
        assert!(output.contains("hello"));

        pty.write_all(b"exit\n").await.unwrap();
        read_to_end(&pty).await;
        pty.close();
    }

    #[tokio::test]
    async fn test_large_write_is_complete() {
        // `wc -c` counts every byte that reaches the shell's stdin.
        let registry = registry_with("bulk", "/bin/sh");
        let pty = PtySession::create(
            "bulk",
            &registry,
            TerminalInfo::new(24, 80),
            &[],
            &PtyOptions::default(),
        )
        .unwrap();

        pty.write_all(b"stty -echo -icanon; head -c 20000 | wc -c | tr 0 Z; exit\n")
            .await
            .unwrap();
        // Let the shell switch the terminal mode before the payload arrives.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let payload = vec![b'x'; 20000];
        let writer = pty.write_all(&payload);
        // The count is rewritten so the echoed command cannot match.
        let reader = read_until(&pty, "2ZZZZ");
        let (written, output) = tokio::join!(writer, reader);
        written.unwrap();
        assert!(output.contains("2ZZZZ"), "{}", output);
        pty.close();
    }

    #[tokio::test]
    async fn test_unknown_shell_is_spawn_failure() {
        let registry = registry_with("badshell", "/nonexistent/shell");
        let result = PtySession::create(
            "badshell",
            &registry,
            TerminalInfo::new(24, 80),
            &[],
            &PtyOptions::default(),
        );
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SessionError::MissingCredential("x".into()).kind(),
            ErrorKind::FatalProtocol
        );
        assert_eq!(
            SessionError::Protocol(ProtocolError::UnknownPacketType(9)).kind(),
            ErrorKind::FatalProtocol
        );
        assert_eq!(
            SessionError::Connection(ConnectionError::Closed).kind(),
            ErrorKind::RecoverableConnection
        );
        assert_eq!(
            SessionError::Connection(ConnectionError::NotConnected).kind(),
            ErrorKind::RecoverableConnection
        );
        assert_eq!(
            SessionError::Connection(ConnectionError::Frame(ProtocolError::EmptyPacket)).kind(),
            ErrorKind::FatalProtocol
        );
        assert_eq!(SessionError::ShellExited.kind(), ErrorKind::ShellExit);
        assert_eq!(
            SessionError::PtyAllocation("no pty".into()).kind(),
            ErrorKind::FatalResource
        );
    }
}
