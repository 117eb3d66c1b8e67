// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Backup Coordinator
// Versioned configuration snapshots: create, restore, list, import/export

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cf_tunnel_common::{
    validate_presets, ManagedTunnelDefinition, PresetStore, QuickTunnelPreset, Settings,
    SettingsStore, TunnelError, TunnelEvent,
};

use crate::classifier::ErrorClassifier;
use crate::registry::{validate_definitions, TunnelRegistry};

/// Snapshot layout written by this release
pub const BACKUP_FORMAT_VERSION: u32 = 1;

const FILE_PREFIX: &str = "cloudflared-backup-";
const FILE_SUFFIX: &str = ".json";
/// Longest the auto-backup loop sleeps before re-reading settings
const AUTO_BACKUP_RECHECK: Duration = Duration::from_secs(60);

/// Self-contained export of the configuration state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub app_version: String,
    pub settings: Settings,
    #[serde(default)]
    pub tunnels: Vec<ManagedTunnelDefinition>,
    #[serde(default)]
    pub presets: Vec<QuickTunnelPreset>,
}

/// Listing entry for one snapshot file
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub tunnel_count: usize,
}

/// What a restore actually replaced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub settings_restored: bool,
    pub tunnels_restored: usize,
    pub presets_restored: usize,
}

/// Validate the format version, then decode the snapshot
pub fn parse_snapshot(bytes: &[u8]) -> Result<BackupSnapshot, TunnelError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| ErrorClassifier::unreadable_snapshot(&e, BACKUP_FORMAT_VERSION))?;

    let found = value
        .get("formatVersion")
        .and_then(serde_json::Value::as_u64)
        .ok_or(TunnelError::IncompatibleBackupFormat {
            found: 0,
            supported: BACKUP_FORMAT_VERSION,
        })?;
    let found = u32::try_from(found).unwrap_or(u32::MAX);
    if found == 0 || found > BACKUP_FORMAT_VERSION {
        return Err(TunnelError::IncompatibleBackupFormat {
            found,
            supported: BACKUP_FORMAT_VERSION,
        });
    }

    serde_json::from_value(value)
        .map_err(|e| ErrorClassifier::unreadable_snapshot(&e, BACKUP_FORMAT_VERSION))
}

/// When the next automatic backup is due; `None` while disabled
pub fn next_auto_backup_due(settings: &Settings, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !settings.auto_backup_enabled {
        return None;
    }
    let interval = settings.clone().normalized().auto_backup_interval_seconds;
    match settings.last_backup_at {
        Some(last) => Some(last + chrono::Duration::seconds(interval as i64)),
        None => Some(now),
    }
}

struct BackupInner {
    dir: PathBuf,
    registry: TunnelRegistry,
    settings: Arc<dyn SettingsStore>,
    presets: PresetStore,
    /// Single-flight guard shared by every file operation
    lock: Mutex<()>,
}

/// Creates and restores configuration snapshots
#[derive(Clone)]
pub struct BackupCoordinator {
    inner: Arc<BackupInner>,
}

impl BackupCoordinator {
    pub fn new(
        dir: impl Into<PathBuf>,
        registry: TunnelRegistry,
        settings: Arc<dyn SettingsStore>,
        presets: PresetStore,
    ) -> Self {
        Self {
            inner: Arc::new(BackupInner {
                dir: dir.into(),
                registry,
                settings,
                presets,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.inner.dir
    }

    fn io_error(&self, err: &std::io::Error, path: &Path) -> TunnelError {
        ErrorClassifier::backup_io(err, path)
    }

    /// Bare file names resolve inside the backup directory
    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() || file.components().count() > 1 {
            file.to_path_buf()
        } else {
            self.inner.dir.join(file)
        }
    }

    fn load_settings(&self) -> Result<Settings, TunnelError> {
        self.inner
            .settings
            .load()
            .map_err(|e| ErrorClassifier::store_error(&e))
    }

    fn emit(&self, event: TunnelEvent) {
        if let Err(e) = self.inner.registry.event_sender().send(event) {
            debug!("No subscribers for backup event: {}", e);
        }
    }

    /// Write a new snapshot of definitions, settings and presets.
    ///
    /// Rejected with `BackupInProgress` while another backup operation runs.
    pub async fn create_backup(&self) -> Result<BackupFile, TunnelError> {
        let _guard = self
            .inner
            .lock
            .try_lock()
            .map_err(|_| TunnelError::BackupInProgress)?;

        match self.write_backup().await {
            Ok(file) => {
                info!("Backup written to {}", file.path.display());
                self.emit(TunnelEvent::BackupCompleted {
                    file: file.path.clone(),
                    timestamp: Utc::now(),
                });
                Ok(file)
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                self.emit(TunnelEvent::BackupFailed {
                    error: e.to_info(),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }

    async fn write_backup(&self) -> Result<BackupFile, TunnelError> {
        let mut settings = self.load_settings()?;
        let snapshot = BackupSnapshot {
            format_version: BACKUP_FORMAT_VERSION,
            created_at: Utc::now(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            settings: settings.clone(),
            tunnels: self.inner.registry.managed_definitions().await,
            presets: self
                .inner
                .presets
                .load_user()
                .map_err(|e| ErrorClassifier::store_error(&e))?,
        };

        let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| TunnelError::BackupIoError {
            path: None,
            reason: e.to_string(),
        })?;
        let file = self.write_unique(&json, snapshot.created_at)?;

        settings.last_backup_at = Some(snapshot.created_at);
        self.inner
            .settings
            .save(&settings)
            .map_err(|e| ErrorClassifier::store_error(&e))?;

        Ok(BackupFile {
            tunnel_count: snapshot.tunnels.len(),
            ..file
        })
    }

    /// Write `bytes` under a fresh timestamped name (temp file + rename, mode 0600)
    fn write_unique(&self, bytes: &[u8], created_at: DateTime<Utc>) -> Result<BackupFile, TunnelError> {
        let dir = &self.inner.dir;
        fs::create_dir_all(dir).map_err(|e| self.io_error(&e, dir))?;

        let stamp = created_at.format("%Y%m%d-%H%M%S").to_string();
        let mut filename = format!("{}{}{}", FILE_PREFIX, stamp, FILE_SUFFIX);
        let mut counter = 1;
        while dir.join(&filename).exists() {
            filename = format!("{}{}-{}{}", FILE_PREFIX, stamp, counter, FILE_SUFFIX);
            counter += 1;
        }

        let path = dir.join(&filename);
        let tmp = dir.join(format!(".{}.tmp", filename));
        write_private(&tmp, bytes).map_err(|e| self.io_error(&e, &tmp))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(self.io_error(&e, &path));
        }

        Ok(BackupFile {
            path,
            filename,
            created_at,
            size_bytes: bytes.len() as u64,
            tunnel_count: 0,
        })
    }

    /// Restore settings and/or tunnel definitions from a snapshot file.
    ///
    /// Never starts a tunnel. The current `last_backup_at` survives a
    /// settings restore.
    pub async fn restore_backup(
        &self,
        file: &Path,
        restore_settings: bool,
        restore_tunnels: bool,
    ) -> Result<RestoreSummary, TunnelError> {
        let _guard = self
            .inner
            .lock
            .try_lock()
            .map_err(|_| TunnelError::BackupInProgress)?;

        let path = self.resolve(file);
        let bytes = fs::read(&path).map_err(|e| self.io_error(&e, &path))?;
        let snapshot = parse_snapshot(&bytes)?;
        info!(
            "Restoring backup {} (format {}, created {})",
            path.display(),
            snapshot.format_version,
            snapshot.created_at
        );

        // Validate everything before the first write so a bad snapshot
        // leaves the current state untouched
        if restore_tunnels {
            validate_definitions(&snapshot.tunnels)?;
            validate_presets(&snapshot.presets).map_err(|e| TunnelError::InvalidConfiguration {
                reason: e.to_string(),
            })?;
        }
        let settings = if restore_settings {
            let current = self.load_settings()?;
            let mut restored = snapshot.settings.clone().normalized();
            restored.last_backup_at = current.last_backup_at;
            Some(restored)
        } else {
            None
        };

        let mut summary = RestoreSummary::default();

        if restore_tunnels {
            summary.tunnels_restored = snapshot.tunnels.len();
            summary.presets_restored = snapshot.presets.len();
            self.inner
                .registry
                .replace_managed_definitions(snapshot.tunnels)
                .await?;
            self.inner
                .presets
                .save_user(&snapshot.presets)
                .map_err(|e| ErrorClassifier::store_error(&e))?;
        }

        if let Some(settings) = settings {
            self.inner
                .settings
                .save(&settings)
                .map_err(|e| ErrorClassifier::store_error(&e))?;
            summary.settings_restored = true;
        }

        Ok(summary)
    }

    /// Snapshot files, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupFile>, TunnelError> {
        let dir = &self.inner.dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| self.io_error(&e, dir))? {
            let entry = entry.map_err(|e| self.io_error(&e, dir))?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.starts_with(FILE_PREFIX) || !filename.ends_with(FILE_SUFFIX) {
                continue;
            }

            let path = entry.path();
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping unreadable backup {}: {}", path.display(), e);
                    continue;
                }
            };

            let (created_at, tunnel_count) = match parse_snapshot(&bytes) {
                Ok(snapshot) => (snapshot.created_at, snapshot.tunnels.len()),
                Err(e) => {
                    warn!("Backup {} is not readable by this release: {}", path.display(), e);
                    let modified = entry
                        .metadata()
                        .and_then(|meta| meta.modified())
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());
                    (modified, 0)
                }
            };

            backups.push(BackupFile {
                path,
                filename,
                created_at,
                size_bytes: bytes.len() as u64,
                tunnel_count,
            });
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(backups)
    }

    pub async fn delete_backup(&self, file: &Path) -> Result<(), TunnelError> {
        let _guard = self
            .inner
            .lock
            .try_lock()
            .map_err(|_| TunnelError::BackupInProgress)?;

        let path = self.resolve(file);
        fs::remove_file(&path).map_err(|e| self.io_error(&e, &path))?;
        info!("Deleted backup {}", path.display());
        Ok(())
    }

    /// Copy a snapshot byte-for-byte to `dest`
    pub async fn export_backup(&self, file: &Path, dest: &Path) -> Result<(), TunnelError> {
        let _guard = self
            .inner
            .lock
            .try_lock()
            .map_err(|_| TunnelError::BackupInProgress)?;

        let path = self.resolve(file);
        fs::copy(&path, dest).map_err(|e| self.io_error(&e, dest))?;
        info!("Exported backup {} to {}", path.display(), dest.display());
        Ok(())
    }

    /// Validate an external snapshot and copy it into the backup directory
    pub async fn import_backup(&self, src: &Path) -> Result<BackupFile, TunnelError> {
        let _guard = self
            .inner
            .lock
            .try_lock()
            .map_err(|_| TunnelError::BackupInProgress)?;

        let bytes = fs::read(src).map_err(|e| self.io_error(&e, src))?;
        let snapshot = parse_snapshot(&bytes)?;

        let file = self.write_unique(&bytes, snapshot.created_at)?;
        info!("Imported backup {} as {}", src.display(), file.filename);
        Ok(BackupFile {
            tunnel_count: snapshot.tunnels.len(),
            ..file
        })
    }

    /// Run automatic backups while enabled; settings are re-read every cycle
    pub fn spawn_auto_backup(&self) -> JoinHandle<()> {
        let coordinator: Weak<BackupInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = coordinator.upgrade() else {
                    debug!("Backup coordinator dropped, auto-backup exiting");
                    break;
                };
                let this = BackupCoordinator { inner };

                let sleep_for = match this.load_settings() {
                    Ok(settings) => match next_auto_backup_due(&settings, Utc::now()) {
                        Some(due) if due <= Utc::now() => {
                            match this.create_backup().await {
                                Ok(file) => info!("Automatic backup created: {}", file.filename),
                                Err(TunnelError::BackupInProgress) => {
                                    debug!("Automatic backup skipped, another backup is running")
                                }
                                Err(e) => warn!("Automatic backup failed: {}", e),
                            }
                            AUTO_BACKUP_RECHECK
                        }
                        Some(due) => (due - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            .min(AUTO_BACKUP_RECHECK),
                        None => AUTO_BACKUP_RECHECK,
                    },
                    Err(e) => {
                        warn!("Auto-backup could not read settings: {}", e);
                        AUTO_BACKUP_RECHECK
                    }
                };

                drop(this);
                tokio::time::sleep(sleep_for).await;
            }
        })
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
