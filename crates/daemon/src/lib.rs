// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Core
// Process orchestration, state tracking and backups for cloudflared tunnels

pub mod backup;
pub mod classifier;
pub mod monitor;
pub mod output;
pub mod permissions;
pub mod pidfile;
pub mod port_probe;
pub mod registry;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use backup::{
    next_auto_backup_due, parse_snapshot, BackupCoordinator, BackupFile, BackupSnapshot,
    RestoreSummary, BACKUP_FORMAT_VERSION,
};
pub use classifier::ErrorClassifier;
pub use output::{CloudflaredLineClassifier, LineClass, LineClassifier};
pub use port_probe::{PortProbe, SystemPortProbe};
pub use registry::{RegistrySnapshot, TunnelRegistry};
pub use supervisor::{
    LaunchSpec, LaunchTarget, ProcessEvent, ProcessHandle, ProcessSupervisor, RestartPolicy,
    SupervisorEvent,
};
