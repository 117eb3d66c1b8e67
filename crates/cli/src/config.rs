// Cloudflared Tunnel Manager - CLI Config Module
// Builds the in-process services and edits settings from the command line

use std::sync::Arc;

use anyhow::{Context, Result};

use cf_tunnel_common::{AppPaths, PresetStore, Settings, SettingsStore, TomlSettingsStore, TunnelStore};
use cf_tunnel_daemon::{permissions, BackupCoordinator, ProcessSupervisor, SystemPortProbe, TunnelRegistry};

/// Keys accepted by `cf-tunnel settings set`
pub const SETTING_KEYS: &[&str] = &[
    "cloudflared_path",
    "mamp_base_path",
    "check_interval_seconds",
    "auto_backup_enabled",
    "auto_backup_interval_seconds",
    "restart_max_attempts",
    "restart_base_delay_ms",
    "restart_max_delay_ms",
    "stop_grace_seconds",
];

/// Services the CLI drives directly
pub struct CliContext {
    pub paths: AppPaths,
    pub settings: Arc<TomlSettingsStore>,
    pub presets: PresetStore,
    pub registry: TunnelRegistry,
    pub backups: BackupCoordinator,
}

impl CliContext {
    /// Context over the default application-support directory
    pub async fn load() -> Result<Self> {
        let paths = AppPaths::default_location().context("Could not determine config directory")?;
        Self::at(paths).await
    }

    /// Context rooted at `paths`, with persisted tunnels loaded
    pub async fn at(paths: AppPaths) -> Result<Self> {
        permissions::ensure_private_directory(paths.base_dir())?;

        let settings = Arc::new(TomlSettingsStore::new(paths.settings_file()));
        let current = settings.load().context("Failed to load settings")?;

        let registry = TunnelRegistry::new(
            ProcessSupervisor::from_settings(&current),
            Arc::new(SystemPortProbe::new()),
            settings.clone(),
            Some(TunnelStore::new(paths.tunnels_file())),
        );
        registry
            .load_persisted()
            .await
            .context("Failed to load tunnel definitions")?;

        let presets = PresetStore::new(paths.presets_file());
        let backups = BackupCoordinator::new(
            paths.backups_dir(),
            registry.clone(),
            settings.clone(),
            presets.clone(),
        );

        Ok(Self {
            paths,
            settings,
            presets,
            registry,
            backups,
        })
    }

    pub fn current_settings(&self) -> Result<Settings> {
        self.settings.load().context("Failed to load settings")
    }
}

/// Parse `value` into the setting named `key`
pub fn apply_setting(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
        value
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("'{}' expects a number, got '{}'", key, value))
    }

    match key {
        "cloudflared_path" => settings.cloudflared_path = value.to_string(),
        "mamp_base_path" => settings.mamp_base_path = value.to_string(),
        "check_interval_seconds" => settings.check_interval_seconds = number(key, value)?,
        "auto_backup_enabled" => {
            settings.auto_backup_enabled = match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => anyhow::bail!("'{}' expects true or false, got '{}'", key, value),
            }
        }
        "auto_backup_interval_seconds" => {
            settings.auto_backup_interval_seconds = number(key, value)?
        }
        "restart_max_attempts" => settings.restart_max_attempts = number(key, value)?,
        "restart_base_delay_ms" => settings.restart_base_delay_ms = number(key, value)?,
        "restart_max_delay_ms" => settings.restart_max_delay_ms = number(key, value)?,
        "stop_grace_seconds" => settings.stop_grace_seconds = number(key, value)?,
        _ => anyhow::bail!(
            "Unknown setting '{}'. Known settings: {}",
            key,
            SETTING_KEYS.join(", ")
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_tunnel_common::ManagedTunnelDefinition;

    #[test]
    fn test_apply_setting() {
        let mut settings = Settings::default();

        apply_setting(&mut settings, "check_interval_seconds", "15").unwrap();
        assert_eq!(settings.check_interval_seconds, 15);

        apply_setting(&mut settings, "auto_backup_enabled", "yes").unwrap();
        assert!(settings.auto_backup_enabled);

        apply_setting(&mut settings, "cloudflared_path", "~/bin/cloudflared").unwrap();
        assert_eq!(settings.cloudflared_path, "~/bin/cloudflared");

        assert!(apply_setting(&mut settings, "restart_max_attempts", "many").is_err());
        assert!(apply_setting(&mut settings, "auto_backup_enabled", "maybe").is_err());
        assert!(apply_setting(&mut settings, "colour", "blue").is_err());
    }

    #[tokio::test]
    async fn test_context_reloads_persisted_tunnels() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path().join("app"));

        let context = CliContext::at(paths.clone()).await.unwrap();
        assert!(paths.settings_file().exists());

        let definition = ManagedTunnelDefinition::new(
            "blog",
            None,
            dir.path().join("blog.yml"),
            "http://localhost:8888",
        );
        context
            .registry
            .add_managed_definition(definition.clone())
            .await
            .unwrap();

        let reloaded = CliContext::at(paths).await.unwrap();
        assert_eq!(
            reloaded.registry.managed_definitions().await,
            vec![definition]
        );
    }
}
