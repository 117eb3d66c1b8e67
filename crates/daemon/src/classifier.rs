// Cloudflared Tunnel Manager - Error Classifier
// Maps raw failures into the TunnelError taxonomy

use std::io;
use std::path::Path;
use std::time::Duration;

use cf_tunnel_common::{Error, TunnelError};

/// Shell exit code for "found but not executable"
const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Shell exit code for "command not found"
const EXIT_NOT_FOUND: i32 = 127;

/// Stateless mapping from I/O, exit and store failures to [`TunnelError`]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Failure to launch the cloudflared binary
    pub fn spawn_error(err: &io::Error, binary: &Path) -> TunnelError {
        let path = binary.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => TunnelError::BinaryNotFound { path },
            io::ErrorKind::PermissionDenied => TunnelError::PermissionDenied { path },
            _ => TunnelError::ProcessStartFailed {
                reason: format!("{}: {}", path, err),
            },
        }
    }

    /// Abnormal exit of a tunnel process; `None` means killed by a signal
    pub fn exit_status(code: Option<i32>, binary: &Path) -> TunnelError {
        match code {
            Some(EXIT_NOT_FOUND) => TunnelError::BinaryNotFound {
                path: binary.display().to_string(),
            },
            Some(EXIT_NOT_EXECUTABLE) => TunnelError::PermissionDenied {
                path: binary.display().to_string(),
            },
            Some(code) => TunnelError::ProcessStartFailed {
                reason: format!("cloudflared exited with status {}", code),
            },
            None => TunnelError::ProcessStartFailed {
                reason: "cloudflared was terminated by a signal".to_string(),
            },
        }
    }

    /// A watched process disappeared without an exit event
    pub fn lost_process(pid: Option<u32>) -> TunnelError {
        let reason = match pid {
            Some(pid) => format!("cloudflared process {} is no longer running", pid),
            None => "cloudflared process is no longer running".to_string(),
        };
        TunnelError::ProcessStartFailed { reason }
    }

    /// A bounded wait on a supervised process ran out
    pub fn timeout(operation: &str, after: Duration) -> TunnelError {
        TunnelError::ProcessStartFailed {
            reason: format!("{} timed out after {:?}", operation, after),
        }
    }

    /// Settings, definition and preset store failures
    pub fn store_error(err: &Error) -> TunnelError {
        match err {
            Error::Io(io_err) if io_err.kind() == io::ErrorKind::PermissionDenied => {
                TunnelError::PermissionDenied {
                    path: io_err.to_string(),
                }
            }
            Error::PermissionDenied(path) => TunnelError::PermissionDenied { path: path.clone() },
            Error::InvalidPath(path) => TunnelError::ConfigNotFound { path: path.clone() },
            Error::Io(io_err) => TunnelError::ProcessStartFailed {
                reason: io_err.to_string(),
            },
            other => TunnelError::InvalidConfiguration {
                reason: other.to_string(),
            },
        }
    }

    /// Backup directory and snapshot file failures
    pub fn backup_io(err: &io::Error, path: &Path) -> TunnelError {
        TunnelError::BackupIoError {
            path: Some(path.display().to_string()),
            reason: err.to_string(),
        }
    }

    /// Snapshot contents that cannot be parsed. Unknown layouts are
    /// reported as version 0.
    pub fn unreadable_snapshot(err: &serde_json::Error, supported: u32) -> TunnelError {
        tracing::debug!("Unreadable backup snapshot: {}", err);
        TunnelError::IncompatibleBackupFormat {
            found: 0,
            supported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_tunnel_common::ErrorKind;

    #[test]
    fn test_spawn_error_kinds() {
        let binary = Path::new("/opt/homebrew/bin/cloudflared");

        let err = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert_eq!(
            ErrorClassifier::spawn_error(&err, binary),
            TunnelError::BinaryNotFound {
                path: "/opt/homebrew/bin/cloudflared".to_string()
            }
        );

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            ErrorClassifier::spawn_error(&err, binary).kind(),
            ErrorKind::PermissionDenied
        );

        let err = io::Error::new(io::ErrorKind::Other, "too many open files");
        assert_eq!(
            ErrorClassifier::spawn_error(&err, binary).kind(),
            ErrorKind::ProcessStartFailed
        );
    }

    #[test]
    fn test_lost_process_and_timeout() {
        assert!(ErrorClassifier::lost_process(Some(4242))
            .to_string()
            .contains("4242"));
        let err = ErrorClassifier::timeout("Liveness poll", Duration::from_secs(2));
        assert_eq!(err.kind(), ErrorKind::ProcessStartFailed);
        assert!(err.to_string().contains("Liveness poll timed out after 2s"));
    }

    #[test]
    fn test_exit_status() {
        let binary = Path::new("/usr/local/bin/cloudflared");
        assert_eq!(
            ErrorClassifier::exit_status(Some(127), binary).kind(),
            ErrorKind::BinaryNotFound
        );
        assert_eq!(
            ErrorClassifier::exit_status(Some(126), binary).kind(),
            ErrorKind::PermissionDenied
        );

        let err = ErrorClassifier::exit_status(Some(1), binary);
        assert!(err.to_string().contains("status 1"));
        assert_eq!(
            ErrorClassifier::exit_status(None, binary).kind(),
            ErrorKind::ProcessStartFailed
        );
    }

    #[test]
    fn test_store_error() {
        let err = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(
            ErrorClassifier::store_error(&err).kind(),
            ErrorKind::PermissionDenied
        );

        let err = Error::Config("bad value".to_string());
        assert_eq!(
            ErrorClassifier::store_error(&err).kind(),
            ErrorKind::InvalidConfiguration
        );
    }

    #[test]
    fn test_unreadable_snapshot() {
        let syntax = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        assert_eq!(
            ErrorClassifier::unreadable_snapshot(&syntax, 1),
            TunnelError::IncompatibleBackupFormat {
                found: 0,
                supported: 1
            }
        );
    }
}
