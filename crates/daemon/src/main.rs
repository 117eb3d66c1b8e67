// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Daemon
// Foreground service supervising cloudflared tunnels

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cf_tunnel_common::{
    AppPaths, PresetStore, SettingsStore, TomlSettingsStore, TunnelEvent, TunnelStore,
};
use cf_tunnel_daemon::{
    permissions, pidfile, BackupCoordinator, ProcessSupervisor, SystemPortProbe, TunnelRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cf_tunnel_daemon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Cloudflared Tunnel Manager Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let paths = AppPaths::default_location().context("Failed to locate config directory")?;
    permissions::ensure_private_directory(paths.base_dir())?;

    // Create PID file to prevent multiple instances
    let _pid_guard = pidfile::PidFileGuard::create(&paths.pid_file())
        .context("Failed to create PID file - another daemon may already be running")?;

    let settings_store = Arc::new(TomlSettingsStore::new(paths.settings_file()));
    let settings = settings_store
        .load()
        .context("Failed to load settings")?
        .normalized();
    info!("cloudflared binary: {}", settings.cloudflared_executable().display());
    info!("Watchdog interval: {}s", settings.check_interval_seconds);

    let registry = TunnelRegistry::new(
        ProcessSupervisor::from_settings(&settings),
        Arc::new(SystemPortProbe::new()),
        settings_store.clone(),
        Some(TunnelStore::new(paths.tunnels_file())),
    );

    match registry.load_persisted().await {
        Ok(count) => info!("{} managed tunnel(s) available", count),
        Err(e) => warn!("Could not load tunnel definitions: {}", e),
    }

    // Log every tunnel event
    let mut events = BroadcastStream::new(registry.events());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => log_event(&event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Event log lagged, {} event(s) skipped", skipped)
                }
            }
        }
    });

    let watchdog = registry.spawn_watchdog(Duration::from_secs(settings.check_interval_seconds));

    let backups = BackupCoordinator::new(
        paths.backups_dir(),
        registry.clone(),
        settings_store.clone(),
        PresetStore::new(paths.presets_file()),
    );
    let auto_backup = backups.spawn_auto_backup();
    info!(
        "Automatic backups {}",
        if settings.auto_backup_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    info!("Daemon started successfully");
    wait_for_shutdown().await?;

    auto_backup.abort();
    watchdog.abort();
    registry.stop_all().await;
    info!("All tunnels stopped");

    info!("Daemon shut down");
    Ok(())
}

fn log_event(event: &TunnelEvent) {
    match event {
        TunnelEvent::StatusChanged {
            id,
            status,
            public_url,
            ..
        } => match public_url {
            Some(url) => info!("Tunnel {} is {} at {}", id, status, url),
            None => info!("Tunnel {} is {}", id, status),
        },
        TunnelEvent::ErrorClassified { id, error, .. } => match id {
            Some(id) => error!("Tunnel {} failed: {} ({:?})", id, error.message, error.remediation),
            None => error!("{} ({:?})", error.message, error.remediation),
        },
        TunnelEvent::Restarting {
            id,
            attempt,
            delay_ms,
            ..
        } => warn!("Tunnel {} restarting (attempt {}) in {}ms", id, attempt, delay_ms),
        TunnelEvent::BackupCompleted { file, .. } => {
            info!("Backup completed: {}", file.display())
        }
        TunnelEvent::BackupFailed { error, .. } => error!("Backup failed: {}", error.message),
    }
    debug!("Tunnel event: {:?}", event);
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}
