// Permissions and security hardening for application files and directories

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use cf_tunnel_common::TunnelError;

/// Set restrictive umask to prevent file permission leaks
/// Should be called early in main() before creating any files
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        // Set umask to 0077 (rwx------) - only owner can access
        // SAFETY: umask(2) only swaps the process file mode mask
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

/// Set file permissions to 0600 (owner read/write only)
pub fn set_file_permissions_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .context(format!("Failed to set permissions on {}", path.display()))?;
        debug!("Set file permissions to 0600: {}", path.display());
    }
    Ok(())
}

/// Ensure a directory exists with 0700 permissions
pub fn ensure_private_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .context(format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .context(format!("Failed to set permissions on {}", path.display()))?;
        info!("Set directory permissions to 700: {}", path.display());
    }
    Ok(())
}

/// Apache configuration files the MAMP integration edits
pub fn mamp_config_files(mamp_dir: &Path) -> [PathBuf; 2] {
    let apache = mamp_dir.join("conf").join("apache");
    [
        apache.join("httpd.conf"),
        apache.join("extra").join("httpd-vhosts.conf"),
    ]
}

/// Both MAMP Apache config files must exist and be writable
pub fn check_mamp_permissions(mamp_dir: &Path) -> Result<(), TunnelError> {
    for file in mamp_config_files(mamp_dir) {
        if !file.is_file() {
            return Err(TunnelError::ConfigNotFound {
                path: file.display().to_string(),
            });
        }
        if !is_writable(&file) {
            return Err(TunnelError::PermissionDenied {
                path: file.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Whether the current user may write `path`
#[cfg(unix)]
pub fn is_writable(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
pub fn is_writable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn running_as_root() -> bool {
        // SAFETY: geteuid(2) cannot fail
        unsafe { libc::geteuid() == 0 }
    }

    fn mamp_layout(dir: &Path) {
        let extra = dir.join("conf").join("apache").join("extra");
        fs::create_dir_all(&extra).unwrap();
        fs::write(dir.join("conf/apache/httpd.conf"), "Listen 8888\n").unwrap();
        fs::write(extra.join("httpd-vhosts.conf"), "").unwrap();
    }

    #[test]
    fn test_mamp_missing_file_is_config_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_mamp_permissions(dir.path()).unwrap_err();
        assert!(matches!(err, TunnelError::ConfigNotFound { path } if path.ends_with("httpd.conf")));
    }

    #[test]
    fn test_mamp_read_only_file_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        mamp_layout(dir.path());
        assert!(check_mamp_permissions(dir.path()).is_ok());

        if running_as_root() {
            // root bypasses file modes
            return;
        }

        let vhosts = dir.path().join("conf/apache/extra/httpd-vhosts.conf");
        fs::set_permissions(&vhosts, fs::Permissions::from_mode(0o444)).unwrap();
        let err = check_mamp_permissions(dir.path()).unwrap_err();
        assert!(matches!(err, TunnelError::PermissionDenied { .. }));
    }

    #[test]
    fn test_private_directory_mode() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("backups");
        ensure_private_directory(&nested).unwrap();

        let mode = fs::metadata(&nested).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
