// Cloudflared Tunnel Manager - PID File Management
// Ensures only one daemon instance runs at a time

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// PID file guard - automatically removes PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create the PID file at `path`.
    ///
    /// Fails if the PID it already names belongs to a live process; stale
    /// files are replaced.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(pid_str) => {
                    if let Ok(pid) = pid_str.trim().parse::<u32>() {
                        if pid != std::process::id() && is_process_running(pid) {
                            anyhow::bail!(
                                "Daemon is already running with PID {}. \
                                 Stop the existing daemon first or remove {} if it's stale.",
                                pid,
                                path.display()
                            );
                        }
                        warn!(
                            "Found stale PID file for process {} (not running), removing it",
                            pid
                        );
                    }
                    fs::remove_file(path).context("Failed to remove stale PID file")?;
                }
                Err(e) => {
                    warn!("Failed to read PID file {}: {}", path.display(), e);
                    let _ = fs::remove_file(path);
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create application directory")?;
        }

        let pid = std::process::id();
        fs::write(path, pid.to_string()).context("Failed to write PID file")?;

        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => {
                debug!("Removed PID file: {}", self.path.display());
            }
            Err(e) => {
                warn!("Failed to remove PID file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Check if a process with the given PID is running
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    // kill(pid, 0) checks existence without delivering a signal
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }

    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => false, // No such process
        Some(libc::EPERM) => true,  // Exists, owned by someone else
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    warn!("Process existence check not implemented for this platform");
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_prevents_multiple_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        // Another live process owns the file
        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, other.id().to_string()).unwrap();

        let result = PidFileGuard::create(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already running"));

        other.kill().unwrap();
        other.wait().unwrap();

        // Stale file is replaced
        let guard = PidFileGuard::create(&path).expect("stale PID file should be replaced");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_nonexistent_process_not_running() {
        // Far above the default pid_max
        assert!(!is_process_running(999_999_999));
    }
}
