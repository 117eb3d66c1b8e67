// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - CLI Client
// Command-line interface for cloudflared tunnels, presets and backups

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::Confirm;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use cf_tunnel_common::{
    ManagedTunnelDefinition, RemediationCategory, SettingsStore, TunnelError, TunnelEvent,
    TunnelStatus, Uuid,
};
use cf_tunnel_daemon::{permissions, BackupFile, PortProbe, SystemPortProbe, TunnelRegistry};

use config::{apply_setting, CliContext};

#[derive(Parser)]
#[command(name = "cf-tunnel")]
#[command(about = "Cloudflared Tunnel Manager CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a quick tunnel for a local URL or preset until Ctrl+C
    Quick {
        /// Local URL (http://localhost:3000) or preset name
        target: String,
    },

    /// Run a managed tunnel until Ctrl+C
    Start {
        /// Tunnel name
        name: String,
    },

    /// List managed tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Add a managed tunnel definition
    Add {
        /// Tunnel name as known to cloudflared
        name: String,

        /// cloudflared config file for this tunnel
        #[arg(short, long)]
        config: PathBuf,

        /// Local service exposed through the tunnel
        #[arg(short, long, default_value = "http://localhost:8888")]
        target: String,

        /// Public hostname routed to this tunnel
        #[arg(short, long)]
        domain: Option<String>,
    },

    /// Remove a managed tunnel definition
    Remove {
        /// Tunnel name
        name: String,

        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Local port helpers
    Port {
        #[command(subcommand)]
        action: PortCommands,
    },

    /// Quick tunnel presets
    Preset {
        #[command(subcommand)]
        action: PresetCommands,
    },

    /// Configuration backups
    Backup {
        #[command(subcommand)]
        action: BackupCommands,
    },

    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsCommands,
    },

    /// Check the cloudflared binary, MAMP configuration and backup storage
    Doctor,
}

#[derive(Subcommand)]
enum PortCommands {
    /// Check whether a port is free
    Check { port: u16 },
    /// Suggest the first free port from a starting point
    Suggest {
        #[arg(default_value = "8080")]
        start: u16,
        #[arg(short, long, default_value = "100")]
        attempts: u16,
    },
}

#[derive(Subcommand)]
enum PresetCommands {
    /// List built-in and user presets
    List,
    /// Add a user preset
    Add {
        name: String,
        url: String,
        #[arg(short, long, default_value = "")]
        details: String,
    },
    /// Remove a user preset by name or id
    Remove { name: String },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a backup now
    Create,
    /// List backups, newest first
    List,
    /// Restore a backup (settings and tunnels unless narrowed)
    Restore {
        /// Backup file name or path
        file: PathBuf,
        /// Restore settings only
        #[arg(long, conflicts_with = "tunnels_only")]
        settings_only: bool,
        /// Restore tunnels and presets only
        #[arg(long)]
        tunnels_only: bool,
        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Delete a backup
    Delete {
        file: PathBuf,
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Copy a backup to another location
    Export { file: PathBuf, dest: PathBuf },
    /// Validate a backup file and add it to the backup directory
    Import { src: PathBuf },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print the current settings
    Show,
    /// Change one setting
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let context = CliContext::load().await?;

    match cli.command {
        Commands::Quick { target } => run_quick(&context, &target).await,
        Commands::Start { name } => run_managed(&context, &name).await,
        Commands::List { json } => list_tunnels(&context, json).await,
        Commands::Add {
            name,
            config,
            target,
            domain,
        } => add_tunnel(&context, name, config, target, domain).await,
        Commands::Remove { name, yes } => remove_tunnel(&context, &name, yes).await,
        Commands::Port { action } => port_command(action),
        Commands::Preset { action } => preset_command(&context, action),
        Commands::Backup { action } => backup_command(&context, action).await,
        Commands::Settings { action } => settings_command(&context, action),
        Commands::Doctor => doctor(&context),
    }
}

/// One-line advice for a remediation category
fn remediation_hint(category: RemediationCategory) -> &'static str {
    match category {
        RemediationCategory::InstallBinary => {
            "Install cloudflared or run: cf-tunnel settings set cloudflared_path <path>"
        }
        RemediationCategory::CheckConfigFile => "Check that the tunnel config file exists",
        RemediationCategory::ChangePort => "Stop the other service or pick a free port (cf-tunnel port suggest)",
        RemediationCategory::FixPermissions => "Fix the file permissions and try again",
        RemediationCategory::StopExistingTunnel => "Stop the running tunnel first",
        RemediationCategory::CheckSystemResources => "Check system resources and try again",
        RemediationCategory::EditConfiguration => "Correct the tunnel configuration",
        RemediationCategory::CheckNetwork => "Check your network connection and DNS",
        RemediationCategory::Login => "Run: cloudflared tunnel login",
        RemediationCategory::UpgradeApplication => "Upgrade to a newer release to read this backup",
        RemediationCategory::CheckBackupStorage => "Check the backup directory is writable and has space",
        RemediationCategory::RetryLater => "Another operation is running, try again shortly",
    }
}

fn explain(err: TunnelError) -> anyhow::Error {
    anyhow::anyhow!(
        "{}\n  {} {}",
        err,
        "hint:".yellow(),
        remediation_hint(err.remediation())
    )
}

fn find_definition(
    definitions: &[ManagedTunnelDefinition],
    name: &str,
) -> Result<ManagedTunnelDefinition> {
    definitions
        .iter()
        .find(|d| d.name == name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Tunnel '{}' not found", name))
}

/// Resolve a quick-tunnel argument: preset names map to their URL
fn resolve_quick_target(context: &CliContext, target: &str) -> Result<String> {
    if target.contains("://") {
        return Ok(target.to_string());
    }
    Ok(context
        .presets
        .all()
        .context("Failed to load presets")?
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(target) || p.id == target)
        .map(|p| p.url)
        .unwrap_or_else(|| target.to_string()))
}

async fn run_quick(context: &CliContext, target: &str) -> Result<()> {
    let url = resolve_quick_target(context, target)?;
    let events = context.registry.events();

    let id = context
        .registry
        .start_quick_tunnel(&url)
        .await
        .map_err(explain)?;
    println!("{} {}", "Starting quick tunnel for".cyan(), url.bold());

    follow_tunnel(&context.registry, id, events).await
}

async fn run_managed(context: &CliContext, name: &str) -> Result<()> {
    let definition = find_definition(&context.registry.managed_definitions().await, name)?;
    let events = context.registry.events();

    let id = context
        .registry
        .start_managed_by_id(definition.id)
        .await
        .map_err(explain)?;
    println!("{} {}", "Starting tunnel".cyan(), definition.name.bold());

    follow_tunnel(&context.registry, id, events).await
}

/// Print events for tunnel `id` until it stops, fails or Ctrl+C is pressed
async fn follow_tunnel(
    registry: &TunnelRegistry,
    id: Uuid,
    events: tokio::sync::broadcast::Receiver<TunnelEvent>,
) -> Result<()> {
    let mut events = BroadcastStream::new(events);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                println!("{}", "Stopping tunnel...".dimmed());
                registry.stop(id).await;
                println!("{}", "Tunnel stopped".green());
                return Ok(());
            }

            event = events.next() => {
                let Some(event) = event else {
                    anyhow::bail!("Tunnel event stream closed");
                };
                // Lagged receivers just skip ahead
                let Ok(event) = event else { continue };
                if event.tunnel_id() != Some(id) {
                    continue;
                }

                match event {
                    TunnelEvent::StatusChanged { status, public_url, .. } => match status {
                        TunnelStatus::Running => {
                            println!();
                            println!("{}", "Tunnel is running".green().bold());
                            if let Some(url) = public_url {
                                println!("  Public URL: {}", url.cyan().underline());
                            }
                            println!("  Press {} to stop", "Ctrl+C".bold());
                            println!();
                        }
                        TunnelStatus::Stopped => {
                            println!("{}", "Tunnel stopped".yellow());
                            return Ok(());
                        }
                        TunnelStatus::Error => {
                            anyhow::bail!("Tunnel failed");
                        }
                        other => println!("  {}", other.to_string().dimmed()),
                    },
                    TunnelEvent::ErrorClassified { error, .. } => {
                        eprintln!("{} {}", "Error:".red().bold(), error.message);
                        eprintln!("  {} {}", "hint:".yellow(), remediation_hint(error.remediation));
                    }
                    TunnelEvent::Restarting { attempt, delay_ms, .. } => {
                        println!(
                            "{}",
                            format!("Restarting (attempt {}) in {}ms", attempt, delay_ms).yellow()
                        );
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn list_tunnels(context: &CliContext, json: bool) -> Result<()> {
    let mut definitions = context.registry.managed_definitions().await;

    if json {
        // JSON output for scripting
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }

    if definitions.is_empty() {
        println!("{}", "No tunnels found.".yellow());
        println!(
            "Create one with: {}",
            "cf-tunnel add <name> --config <file>".cyan()
        );
        return Ok(());
    }

    definitions.sort_by(|a, b| a.name.cmp(&b.name));

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Name").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Domain").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Target").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Config").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);

    for definition in &definitions {
        table.add_row(vec![
            Cell::new(&definition.name).fg(Color::Green),
            Cell::new(definition.domain.as_deref().unwrap_or("-")),
            Cell::new(&definition.local_target),
            Cell::new(definition.config_path.display()).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} tunnel(s) found", definitions.len().to_string().cyan());
    println!();

    Ok(())
}

async fn add_tunnel(
    context: &CliContext,
    name: String,
    config: PathBuf,
    target: String,
    domain: Option<String>,
) -> Result<()> {
    let definition = ManagedTunnelDefinition::new(name, domain, config, target);
    if !definition.resolved_config_path().exists() {
        println!(
            "{} config file {} does not exist yet",
            "Warning:".yellow(),
            definition.config_path.display()
        );
    }

    context
        .registry
        .add_managed_definition(definition.clone())
        .await
        .map_err(explain)?;

    println!();
    println!(
        "{}",
        format!("Tunnel '{}' added successfully", definition.name).green()
    );
    println!("  Start it with: {}", format!("cf-tunnel start {}", definition.name).cyan());
    println!();
    Ok(())
}

async fn remove_tunnel(context: &CliContext, name: &str, yes: bool) -> Result<()> {
    let definition = find_definition(&context.registry.managed_definitions().await, name)?;

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!("Are you sure you want to remove tunnel '{}'?", name.yellow()))
            .default(false)
            .interact()?;
        if !confirm {
            println!("{}", "Removal cancelled".dimmed());
            return Ok(());
        }
    }

    context
        .registry
        .remove(definition.id)
        .await
        .map_err(explain)?;
    println!("{}", format!("Tunnel '{}' removed", name).green());
    Ok(())
}

fn port_command(action: PortCommands) -> Result<()> {
    let probe = SystemPortProbe::new();
    match action {
        PortCommands::Check { port } => match probe.check(port) {
            Ok(()) => println!("{}", format!("Port {} is free", port).green()),
            Err(e) => println!("{}", e.to_string().red()),
        },
        PortCommands::Suggest { start, attempts } => match probe.first_available(start, attempts) {
            Some(port) => println!("{}", port),
            None => anyhow::bail!(
                "No free port found in {} attempt(s) starting at {}",
                attempts,
                start
            ),
        },
    }
    Ok(())
}

fn preset_command(context: &CliContext, action: PresetCommands) -> Result<()> {
    match action {
        PresetCommands::List => {
            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec![
                Cell::new("Name").add_attribute(Attribute::Bold).fg(Color::Cyan),
                Cell::new("URL").add_attribute(Attribute::Bold).fg(Color::Cyan),
                Cell::new("Details").add_attribute(Attribute::Bold).fg(Color::Cyan),
            ]);
            for preset in context.presets.all().context("Failed to load presets")? {
                let name = if preset.built_in {
                    Cell::new(&preset.name)
                } else {
                    Cell::new(&preset.name).fg(Color::Green)
                };
                table.add_row(vec![
                    name,
                    Cell::new(&preset.url),
                    Cell::new(&preset.details).fg(Color::DarkGrey),
                ]);
            }
            println!("{}", table);
        }
        PresetCommands::Add { name, url, details } => {
            let preset = context.presets.add(&name, &url, &details)?;
            println!("{}", format!("Preset '{}' added", preset.name).green());
        }
        PresetCommands::Remove { name } => {
            let preset = context.presets.remove(&name)?;
            println!("{}", format!("Preset '{}' removed", preset.name).green());
        }
    }
    Ok(())
}

fn print_backups(backups: &[BackupFile]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("File").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Created").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Tunnels").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Size").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);
    for backup in backups {
        table.add_row(vec![
            Cell::new(&backup.filename).fg(Color::Green),
            Cell::new(
                backup
                    .created_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S"),
            ),
            Cell::new(backup.tunnel_count),
            Cell::new(format!("{} B", backup.size_bytes)).fg(Color::DarkGrey),
        ]);
    }
    println!("{}", table);
}

async fn backup_command(context: &CliContext, action: BackupCommands) -> Result<()> {
    let backups = &context.backups;
    match action {
        BackupCommands::Create => {
            let file = backups.create_backup().await.map_err(explain)?;
            println!("{}", "Backup created".green());
            println!("  File: {}", file.path.display().to_string().dimmed());
            println!("  Tunnels: {}", file.tunnel_count);
        }
        BackupCommands::List => {
            let list = backups.list_backups().map_err(explain)?;
            if list.is_empty() {
                println!("{}", "No backups found.".yellow());
                println!("Create one with: {}", "cf-tunnel backup create".cyan());
            } else {
                print_backups(&list);
            }
        }
        BackupCommands::Restore {
            file,
            settings_only,
            tunnels_only,
            yes,
        } => {
            let restore_settings = !tunnels_only;
            let restore_tunnels = !settings_only;

            if !yes {
                let confirm = Confirm::new()
                    .with_prompt(format!(
                        "Restore {} from {}? Current values will be replaced",
                        match (restore_settings, restore_tunnels) {
                            (true, true) => "settings and tunnels",
                            (true, false) => "settings",
                            _ => "tunnels and presets",
                        },
                        file.display()
                    ))
                    .default(false)
                    .interact()?;
                if !confirm {
                    println!("{}", "Restore cancelled".dimmed());
                    return Ok(());
                }
            }

            let summary = backups
                .restore_backup(&file, restore_settings, restore_tunnels)
                .await
                .map_err(explain)?;
            println!("{}", "Backup restored".green());
            if summary.settings_restored {
                println!("  Settings restored");
            }
            if restore_tunnels {
                println!("  Tunnels: {}", summary.tunnels_restored);
                println!("  Presets: {}", summary.presets_restored);
            }
        }
        BackupCommands::Delete { file, yes } => {
            if !yes {
                let confirm = Confirm::new()
                    .with_prompt(format!("Delete backup {}?", file.display()))
                    .default(false)
                    .interact()?;
                if !confirm {
                    println!("{}", "Deletion cancelled".dimmed());
                    return Ok(());
                }
            }
            backups.delete_backup(&file).await.map_err(explain)?;
            println!("{}", "Backup deleted".green());
        }
        BackupCommands::Export { file, dest } => {
            backups.export_backup(&file, &dest).await.map_err(explain)?;
            println!("{} {}", "Backup exported to".green(), dest.display());
        }
        BackupCommands::Import { src } => {
            let file = backups.import_backup(&src).await.map_err(explain)?;
            println!("{} {}", "Backup imported as".green(), file.filename);
        }
    }
    Ok(())
}

fn settings_command(context: &CliContext, action: SettingsCommands) -> Result<()> {
    match action {
        SettingsCommands::Show => {
            let settings = context.current_settings()?;
            println!("{}", format!("# {}", context.settings.path().display()).dimmed());
            print!("{}", toml::to_string_pretty(&settings)?);
        }
        SettingsCommands::Set { key, value } => {
            let mut settings = context.current_settings()?;
            apply_setting(&mut settings, &key, &value)?;
            let settings = settings.normalized();
            context
                .settings
                .save(&settings)
                .context("Failed to save settings")?;
            println!("{}", format!("{} updated", key).green());
        }
    }
    Ok(())
}

fn doctor(context: &CliContext) -> Result<()> {
    let settings = context.current_settings()?;
    let mut problems = 0;

    let mut report = |label: &str, result: std::result::Result<String, TunnelError>| match result {
        Ok(detail) => println!("{} {} {}", "✓".green(), label, detail.dimmed()),
        Err(e) => {
            problems += 1;
            println!("{} {} {}", "✗".red(), label, e.to_string().red());
            println!("    {} {}", "hint:".yellow(), remediation_hint(e.remediation()));
        }
    };

    let binary = settings.cloudflared_executable();
    report(
        "cloudflared",
        if binary.is_file() {
            Ok(binary.display().to_string())
        } else {
            Err(TunnelError::BinaryNotFound {
                path: binary.display().to_string(),
            })
        },
    );

    let mamp = settings.mamp_dir();
    report(
        "MAMP configuration",
        permissions::check_mamp_permissions(&mamp).map(|_| mamp.display().to_string()),
    );

    let backups_dir = context.paths.backups_dir();
    let storage = if !backups_dir.exists() || permissions::is_writable(&backups_dir) {
        Ok(backups_dir.display().to_string())
    } else {
        Err(TunnelError::BackupIoError {
            path: Some(backups_dir.display().to_string()),
            reason: "directory is not writable".to_string(),
        })
    };
    report("Backup storage", storage);

    println!();
    if problems == 0 {
        println!("{}", "Everything looks good".green());
    } else {
        println!("{}", format!("{} problem(s) found", problems).yellow());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_tunnel_common::AppPaths;

    #[tokio::test]
    async fn test_resolve_quick_target() {
        let dir = tempfile::tempdir().unwrap();
        let context = CliContext::at(AppPaths::new(dir.path())).await.unwrap();
        context
            .presets
            .add("Blog", "http://localhost:4000", "")
            .unwrap();

        let resolve = |target: &str| resolve_quick_target(&context, target).unwrap();
        assert_eq!(resolve("http://localhost:3000"), "http://localhost:3000");
        assert_eq!(resolve("blog"), "http://localhost:4000");
        assert_eq!(resolve("React"), "http://localhost:3000");
        assert_eq!(resolve("unknown"), "unknown");
    }

    #[test]
    fn test_find_definition() {
        let definitions = vec![ManagedTunnelDefinition::new(
            "blog",
            None,
            "/tmp/blog.yml",
            "http://localhost:8888",
        )];
        assert!(find_definition(&definitions, "blog").is_ok());
        assert!(find_definition(&definitions, "shop").is_err());
    }

    #[test]
    fn test_explain_includes_hint() {
        let message = explain(TunnelError::BackupInProgress).to_string();
        assert!(message.contains("try again"));
    }
}
