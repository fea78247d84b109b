//! Local user identity a client's shell runs as.

use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};

use super::pty::SessionError;

/// Resolved OS identity used to drop privileges before running a shell.
///
/// Built once when a client registers and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCredential {
    /// Login name, exported as `USER` and `LOGNAME`.
    pub username: String,
    /// User id the shell runs as.
    pub uid: u32,
    /// Primary group id the shell runs as.
    pub gid: u32,
    /// Home directory, exported as `HOME` and used as the working directory.
    pub home: PathBuf,
    /// Login shell from the user database, if it names one.
    pub shell: Option<PathBuf>,
}

impl SpawnCredential {
    /// Resolve a uid through the system user database.
    pub fn from_uid(uid: u32) -> Result<Self, SessionError> {
        let user = User::from_uid(Uid::from_raw(uid))
            .map_err(|e| SessionError::CredentialLookup(format!("uid {}: {}", uid, e)))?
            .ok_or_else(|| SessionError::CredentialLookup(format!("no user with uid {}", uid)))?;

        Ok(Self::from(user))
    }

    /// Credential of the user running this process.
    pub fn current_user() -> Result<Self, SessionError> {
        Self::from_uid(Uid::current().as_raw())
    }

    /// Replace the login shell.
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// The shell to exec: the credential's own, or `default` when it has none.
    pub fn effective_shell<'a>(&'a self, default: &'a Path) -> &'a Path {
        match &self.shell {
            Some(shell) if !shell.as_os_str().is_empty() => shell,
            _ => default,
        }
    }
}

impl From<User> for SpawnCredential {
    fn from(user: User) -> Self {
        let shell = (!user.shell.as_os_str().is_empty()).then_some(user.shell);
        Self {
            username: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
            shell,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SpawnCredential {
        SpawnCredential {
            username: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/alice"),
            shell: None,
        }
    }

    #[test]
    fn test_current_user_resolves() {
        let cred = SpawnCredential::current_user().unwrap();
        assert_eq!(cred.uid, Uid::current().as_raw());
        assert!(!cred.username.is_empty());
    }

    #[test]
    fn test_unknown_uid_fails() {
        // Far outside any allocated range on a normal system.
        let err = SpawnCredential::from_uid(u32::MAX - 7).unwrap_err();
        assert!(matches!(err, SessionError::CredentialLookup(_)));
    }

    #[test]
    fn test_effective_shell_falls_back_to_default() {
        let default = Path::new("/bin/sh");
        let cred = sample();
        assert_eq!(cred.effective_shell(default), default);

        let cred = sample().with_shell("");
        assert_eq!(cred.effective_shell(default), default);

        let cred = sample().with_shell("/bin/zsh");
        assert_eq!(cred.effective_shell(default), Path::new("/bin/zsh"));
    }
}
