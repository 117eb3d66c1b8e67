// Configuration structures for Cloudflared Tunnel Manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result, TunnelError};
use crate::network::validate_local_target;

/// Bounds for the automatic backup interval (1 hour to 1 week)
pub const MIN_AUTO_BACKUP_INTERVAL_SECS: u64 = 3_600;
pub const MAX_AUTO_BACKUP_INTERVAL_SECS: u64 = 604_800;

const APP_DIR_NAME: &str = "cloudflared-manager";

/// Well-known file locations under the application-support directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    base: PathBuf,
}

impl AppPaths {
    /// Paths rooted at an explicit directory (tests, portable installs)
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Paths rooted at the platform config directory
    pub fn default_location() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(Self::new(config_dir.join(APP_DIR_NAME)))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base.join("settings.toml")
    }

    pub fn tunnels_file(&self) -> PathBuf {
        self.base.join("tunnels.json")
    }

    pub fn presets_file(&self) -> PathBuf {
        self.base.join("presets.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base.join("backups")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base.join("daemon.pid")
    }
}

/// Application settings persisted in `settings.toml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Path to the cloudflared executable (may start with ~)
    #[serde(default = "default_cloudflared_path")]
    pub cloudflared_path: String,

    /// MAMP installation directory (may start with ~)
    #[serde(default = "default_mamp_base_path")]
    pub mamp_base_path: String,

    /// Watchdog tick interval in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,

    #[serde(default)]
    pub auto_backup_enabled: bool,

    /// Automatic backup interval in seconds (clamped to 1h..=168h)
    #[serde(default = "default_auto_backup_interval")]
    pub auto_backup_interval_seconds: u64,

    /// When the last backup was written; drives the auto-backup schedule across restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_at: Option<DateTime<Utc>>,

    /// Maximum automatic restarts of a managed tunnel (0 = never restart)
    #[serde(default = "default_restart_max_attempts")]
    pub restart_max_attempts: u32,

    /// First restart delay in milliseconds, doubled on every attempt
    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,

    /// Upper bound for the restart delay in milliseconds
    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,

    /// Seconds to wait after SIGTERM before force-killing a tunnel process
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
}

// Default value functions
fn default_cloudflared_path() -> String {
    if cfg!(target_os = "macos") {
        "/opt/homebrew/bin/cloudflared".to_string()
    } else {
        "/usr/local/bin/cloudflared".to_string()
    }
}

fn default_mamp_base_path() -> String {
    "/Applications/MAMP".to_string()
}

fn default_check_interval() -> u64 {
    30
}

fn default_auto_backup_interval() -> u64 {
    86_400 // 24 hours
}

fn default_restart_max_attempts() -> u32 {
    5
}

fn default_restart_base_delay_ms() -> u64 {
    1_000
}

fn default_restart_max_delay_ms() -> u64 {
    30_000
}

fn default_stop_grace_seconds() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cloudflared_path: default_cloudflared_path(),
            mamp_base_path: default_mamp_base_path(),
            check_interval_seconds: default_check_interval(),
            auto_backup_enabled: false,
            auto_backup_interval_seconds: default_auto_backup_interval(),
            last_backup_at: None,
            restart_max_attempts: default_restart_max_attempts(),
            restart_base_delay_ms: default_restart_base_delay_ms(),
            restart_max_delay_ms: default_restart_max_delay_ms(),
            stop_grace_seconds: default_stop_grace_seconds(),
        }
    }
}

impl Settings {
    /// Clamp values into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.auto_backup_interval_seconds = self
            .auto_backup_interval_seconds
            .clamp(MIN_AUTO_BACKUP_INTERVAL_SECS, MAX_AUTO_BACKUP_INTERVAL_SECS);
        self.check_interval_seconds = self.check_interval_seconds.max(1);
        self.restart_base_delay_ms = self.restart_base_delay_ms.max(1);
        self.restart_max_delay_ms = self.restart_max_delay_ms.max(self.restart_base_delay_ms);
        self
    }

    /// cloudflared path with `~` and environment variables expanded
    pub fn cloudflared_executable(&self) -> PathBuf {
        expand_path(&self.cloudflared_path)
    }

    /// MAMP directory with `~` and environment variables expanded
    pub fn mamp_dir(&self) -> PathBuf {
        expand_path(&self.mamp_base_path)
    }
}

/// Expand `~` and `$VARS` in a configured path, leaving it untouched on failure
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

/// Key/value persistence of [`Settings`]
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings stored as a TOML file
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    /// Load settings, writing defaults on first run
    fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            info!("No settings found, using defaults");
            info!("Settings will be saved to: {}", self.path.display());
            let settings = Settings::default();
            self.save(&settings)?;
            return Ok(settings);
        }

        let contents = fs::read_to_string(&self.path)?;
        let settings: Settings = toml::from_str(&contents)?;

        debug!("Loaded settings from: {}", self.path.display());
        Ok(settings.normalized())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(settings)?;
        fs::write(&self.path, contents)?;

        // Set restrictive permissions on settings file (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Saved settings to: {}", self.path.display());
        Ok(())
    }
}

/// Settings held in memory only
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        let guard = self
            .settings
            .lock()
            .map_err(|_| Error::Config("settings lock poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| Error::Config("settings lock poisoned".to_string()))?;
        *guard = settings.clone();
        Ok(())
    }
}

/// Persisted definition of a managed tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedTunnelDefinition {
    /// Unique tunnel identifier
    pub id: Uuid,
    /// Tunnel name as known to cloudflared
    pub name: String,
    /// Public hostname routed to this tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// cloudflared config file for this tunnel
    pub config_path: PathBuf,
    /// Local service exposed through the tunnel
    pub local_target: String,
    pub created_at: DateTime<Utc>,
}

impl ManagedTunnelDefinition {
    pub fn new(
        name: impl Into<String>,
        domain: Option<String>,
        config_path: impl Into<PathBuf>,
        local_target: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            domain,
            config_path: config_path.into(),
            local_target: local_target.into(),
            created_at: Utc::now(),
        }
    }

    /// Validate the definition
    pub fn validate(&self) -> std::result::Result<(), TunnelError> {
        if self.name.trim().is_empty() {
            return Err(TunnelError::InvalidConfiguration {
                reason: "Tunnel name cannot be empty".to_string(),
            });
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(TunnelError::InvalidConfiguration {
                reason: format!("Tunnel name '{}' cannot contain whitespace", self.name),
            });
        }
        if self.config_path.as_os_str().is_empty() {
            return Err(TunnelError::InvalidConfiguration {
                reason: "Config path cannot be empty".to_string(),
            });
        }
        validate_local_target(&self.local_target)?;
        Ok(())
    }

    /// Config path with `~` expanded
    pub fn resolved_config_path(&self) -> PathBuf {
        expand_path(&self.config_path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_normalized_clamps_interval() {
        let settings = Settings {
            auto_backup_interval_seconds: 60,
            check_interval_seconds: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.auto_backup_interval_seconds, MIN_AUTO_BACKUP_INTERVAL_SECS);
        assert_eq!(settings.check_interval_seconds, 1);

        let settings = Settings {
            auto_backup_interval_seconds: 10 * 604_800,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.auto_backup_interval_seconds, MAX_AUTO_BACKUP_INTERVAL_SECS);
    }

    #[test]
    fn test_settings_normalized_restart_delays() {
        let settings = Settings {
            restart_base_delay_ms: 0,
            restart_max_delay_ms: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.restart_base_delay_ms, 1);
        assert_eq!(settings.restart_max_delay_ms, 1);
    }

    #[test]
    fn test_default_auto_backup_is_daily_and_disabled() {
        let settings = Settings::default();
        assert!(!settings.auto_backup_enabled);
        assert_eq!(settings.auto_backup_interval_seconds, 86_400);
        assert_eq!(settings.stop_grace_seconds, 5);
    }

    #[test]
    fn test_toml_store_writes_defaults_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlSettingsStore::new(dir.path().join("settings.toml"));

        let loaded = store.load().unwrap();
        assert_eq!(loaded, Settings::default());
        assert!(store.path().exists());

        let mut changed = loaded.clone();
        changed.auto_backup_enabled = true;
        changed.cloudflared_path = "~/bin/cloudflared".to_string();
        store.save(&changed).unwrap();

        assert_eq!(store.load().unwrap(), changed);
    }

    #[test]
    fn test_toml_store_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "check_interval_seconds = 10\n").unwrap();

        let settings = TomlSettingsStore::new(&path).load().unwrap();
        assert_eq!(settings.check_interval_seconds, 10);
        assert_eq!(settings.auto_backup_interval_seconds, 86_400);
    }

    #[test]
    fn test_definition_validation() {
        let def = ManagedTunnelDefinition::new(
            "blog",
            Some("blog.example.com".to_string()),
            "/tmp/blog.yml",
            "http://localhost:8888",
        );
        assert!(def.validate().is_ok());

        let mut bad = def.clone();
        bad.name = "my blog".to_string();
        assert!(bad.validate().is_err());

        let mut bad = def.clone();
        bad.local_target = "localhost:8888".to_string();
        assert!(matches!(
            bad.validate(),
            Err(TunnelError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/cloudflared");
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
        assert_eq!(expand_path("/usr/bin/cloudflared"), PathBuf::from("/usr/bin/cloudflared"));
    }
}
