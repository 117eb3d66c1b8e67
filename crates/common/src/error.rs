// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Error types for Cloudflared Tunnel Manager

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage-level errors raised by the settings, definition and preset stores
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Preset error: {0}")]
    Preset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closed failure taxonomy surfaced by the tunnel core.
///
/// Every variant carries the structured context (port, path, process name)
/// a front end needs to render remediation text. No UI strings beyond
/// `Display` are produced here.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TunnelError {
    #[error("cloudflared binary not found or not executable: {path}")]
    BinaryNotFound { path: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Port {port} is already in use{}", by_process(.occupying_process))]
    PortConflict {
        port: u16,
        occupying_process: Option<String>,
    },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Tunnel '{name}' is already running")]
    TunnelAlreadyRunning { name: String },

    #[error("Failed to start process: {reason}")]
    ProcessStartFailed { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Network error: {reason}")]
    NetworkError { reason: String },

    #[error("Cloudflare authentication required: {reason}")]
    AuthenticationRequired { reason: String },

    #[error("Backup format version {found} is not supported (this release reads up to version {supported})")]
    IncompatibleBackupFormat { found: u32, supported: u32 },

    #[error("Backup I/O error: {reason}")]
    BackupIoError { path: Option<String>, reason: String },

    #[error("Another backup operation is already in progress")]
    BackupInProgress,
}

/// Fieldless tag for each `TunnelError` variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BinaryNotFound,
    ConfigNotFound,
    PortConflict,
    PermissionDenied,
    TunnelAlreadyRunning,
    ProcessStartFailed,
    InvalidConfiguration,
    NetworkError,
    AuthenticationRequired,
    IncompatibleBackupFormat,
    BackupIoError,
    BackupInProgress,
}

/// Machine-actionable hint telling a front end which remedy to offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationCategory {
    /// Install cloudflared or point the settings at it
    InstallBinary,
    /// Create or fix the referenced configuration file
    CheckConfigFile,
    /// Pick another port or stop the conflicting service
    ChangePort,
    /// Adjust file permissions
    FixPermissions,
    /// Stop the running tunnel before starting it again
    StopExistingTunnel,
    CheckSystemResources,
    EditConfiguration,
    CheckNetwork,
    /// Run `cloudflared tunnel login`
    Login,
    /// The backup was produced by a newer release
    UpgradeApplication,
    CheckBackupStorage,
    RetryLater,
}

/// Structured error attached to a tunnel endpoint or event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub remediation: RemediationCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

fn by_process(process: &Option<String>) -> String {
    process
        .as_deref()
        .map(|name| format!(" by {}", name))
        .unwrap_or_default()
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::BinaryNotFound { .. } => ErrorKind::BinaryNotFound,
            TunnelError::ConfigNotFound { .. } => ErrorKind::ConfigNotFound,
            TunnelError::PortConflict { .. } => ErrorKind::PortConflict,
            TunnelError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            TunnelError::TunnelAlreadyRunning { .. } => ErrorKind::TunnelAlreadyRunning,
            TunnelError::ProcessStartFailed { .. } => ErrorKind::ProcessStartFailed,
            TunnelError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            TunnelError::NetworkError { .. } => ErrorKind::NetworkError,
            TunnelError::AuthenticationRequired { .. } => ErrorKind::AuthenticationRequired,
            TunnelError::IncompatibleBackupFormat { .. } => ErrorKind::IncompatibleBackupFormat,
            TunnelError::BackupIoError { .. } => ErrorKind::BackupIoError,
            TunnelError::BackupInProgress => ErrorKind::BackupInProgress,
        }
    }

    pub fn remediation(&self) -> RemediationCategory {
        match self {
            TunnelError::BinaryNotFound { .. } => RemediationCategory::InstallBinary,
            TunnelError::ConfigNotFound { .. } => RemediationCategory::CheckConfigFile,
            TunnelError::PortConflict { .. } => RemediationCategory::ChangePort,
            TunnelError::PermissionDenied { .. } => RemediationCategory::FixPermissions,
            TunnelError::TunnelAlreadyRunning { .. } => RemediationCategory::StopExistingTunnel,
            TunnelError::ProcessStartFailed { .. } => RemediationCategory::CheckSystemResources,
            TunnelError::InvalidConfiguration { .. } => RemediationCategory::EditConfiguration,
            TunnelError::NetworkError { .. } => RemediationCategory::CheckNetwork,
            TunnelError::AuthenticationRequired { .. } => RemediationCategory::Login,
            TunnelError::IncompatibleBackupFormat { .. } => RemediationCategory::UpgradeApplication,
            TunnelError::BackupIoError { .. } => RemediationCategory::CheckBackupStorage,
            TunnelError::BackupInProgress => RemediationCategory::RetryLater,
        }
    }

    /// Flatten into the structured form stored as an endpoint's `last_error`
    pub fn to_info(&self) -> ErrorInfo {
        let (port, path, process) = match self {
            TunnelError::BinaryNotFound { path }
            | TunnelError::ConfigNotFound { path }
            | TunnelError::PermissionDenied { path } => (None, Some(path.clone()), None),
            TunnelError::PortConflict {
                port,
                occupying_process,
            } => (Some(*port), None, occupying_process.clone()),
            TunnelError::BackupIoError { path, .. } => (None, path.clone(), None),
            _ => (None, None, None),
        };

        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
            remediation: self.remediation(),
            port,
            path,
            process,
        }
    }
}
