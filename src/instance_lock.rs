//! Single instance lock using a Unix socket.
//!
//! Two bridges on the same broker would announce the same discovery topics
//! and fight over them. The socket is released by the OS when the process
//! dies, so a crash never leaves a stale lock behind.

use log::debug;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SOCKET_NAME: &str = "heat-transfer.sock";

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("another instance is already running")]
    AlreadyRunning,

    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Held for as long as the process should count as the running instance.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock in the runtime directory.
    pub fn acquire() -> Result<Self, InstanceLockError> {
        Self::acquire_at(Self::socket_path())
    }

    /// Acquire the lock on an explicit socket path.
    pub fn acquire_at(path: PathBuf) -> Result<Self, InstanceLockError> {
        if path.exists() {
            // A live listener answers; a socket left by a SIGKILL'd process does not
            if UnixStream::connect(&path).is_ok() {
                return Err(InstanceLockError::AlreadyRunning);
            }
            debug!("Removing stale instance socket {}", path.display());
            let _ = std::fs::remove_file(&path);
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            // Another instance bound between our check and bind
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                Err(InstanceLockError::AlreadyRunning)
            }
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Socket path under `XDG_RUNTIME_DIR`, falling back to `/tmp`.
    pub fn socket_path() -> PathBuf {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR").ok().map(PathBuf::from);
        socket_path_in(runtime_dir.as_deref())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn socket_path_in(runtime_dir: Option<&Path>) -> PathBuf {
    runtime_dir
        .unwrap_or_else(|| Path::new("/tmp"))
        .join(SOCKET_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_socket(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.sock", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_socket_path_uses_runtime_dir() {
        assert_eq!(
            socket_path_in(Some(Path::new("/run/user/1000"))),
            PathBuf::from("/run/user/1000/heat-transfer.sock")
        );
    }

    #[test]
    fn test_socket_path_fallback_to_tmp() {
        assert_eq!(
            socket_path_in(None),
            PathBuf::from("/tmp/heat-transfer.sock")
        );
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let path = temp_socket("heat-transfer-lock-held");
        let lock = InstanceLock::acquire_at(path.clone()).unwrap();
        assert!(matches!(
            InstanceLock::acquire_at(path.clone()),
            Err(InstanceLockError::AlreadyRunning)
        ));

        drop(lock);
        assert!(!path.exists());
        let again = InstanceLock::acquire_at(path).unwrap();
        drop(again);
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let path = temp_socket("heat-transfer-lock-stale");
        {
            // Bind and drop the listener without removing the file
            let _listener = UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists());

        let lock = InstanceLock::acquire_at(path.clone()).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }
}
