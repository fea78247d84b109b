//! PID file utilities for detecting a running server.
//!
//! ## PID File Location
//!
//! Unless configured otherwise, the PID file is stored at:
//! - `$XDG_DATA_HOME/stayterm/server.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/stayterm/server.pid` otherwise
//!
//! ## Example
//!
//! ```rust
//! use daemon::ipc::pidfile::{get_daemon_pid, get_pid_file_path};
//!
//! if let Some(pid) = get_daemon_pid(&get_pid_file_path()) {
//!     println!("Server is already running with PID {}", pid);
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Get the default path of the server PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("stayterm").join("server.pid")
}

/// Record the current process id, creating parent directories as needed.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the PID file if it still names this process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());

    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Check if a server process is currently running.
///
/// Cleans up stale PID files automatically.
pub fn is_daemon_running(path: &Path) -> bool {
    get_daemon_pid(path).is_some()
}

/// Get the PID of the running server, if any.
///
/// Returns `None` and removes the file when it is unreadable or names a
/// process that no longer exists.
pub fn get_daemon_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Check if a process with the given PID exists.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // Signal 0 only probes for existence; EPERM still means the process is there.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
