// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Common Library
// Shared types, error taxonomy, settings and persistence

pub mod config;
pub mod error;
pub mod network;
pub mod presets;
pub mod tunnel_store;
pub mod types;

pub use config::{
    expand_path, AppPaths, ManagedTunnelDefinition, MemorySettingsStore, Settings,
    SettingsStore, TomlSettingsStore,
};
pub use error::{Error, ErrorInfo, ErrorKind, RemediationCategory, Result, TunnelError};
pub use network::{target_port, validate_local_target};
pub use presets::{built_in_presets, validate_presets, PresetStore, QuickTunnelPreset};
pub use tunnel_store::TunnelStore;
pub use types::{TunnelEndpoint, TunnelEvent, TunnelKind, TunnelStatus};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
