// Common types for Cloudflared Tunnel Manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::ErrorInfo;

/// Kind of tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// Persistently configured tunnel with its own config file
    Managed,
    /// Ephemeral tunnel over a single local URL
    Quick,
}

/// Status of a tunnel process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Stopped,  // no process
    Starting, // process requested or spawned, not yet ready
    Running,  // public URL or connection observed
    Degraded, // output stream ended but process not confirmed dead
    Error,    // failed; see last_error
}

impl TunnelStatus {
    /// A process is (or is about to be) attached to the tunnel
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Starting | TunnelStatus::Running | TunnelStatus::Degraded
        )
    }

    /// Whether the tunnel state machine permits moving from `self` to `next`.
    ///
    /// `Stopped -> Starting` and `Error -> Starting` are only legal through an
    /// explicit start command; the caller enforces that distinction.
    pub fn can_transition_to(&self, next: TunnelStatus) -> bool {
        use TunnelStatus::*;
        match (self, next) {
            (Stopped, Starting) | (Error, Starting) => true,
            (Starting, Running) | (Starting, Error) | (Starting, Stopped) => true,
            (Running, Degraded) | (Running, Error) | (Running, Stopped) | (Running, Starting) => {
                true
            }
            (Degraded, Error) | (Degraded, Stopped) | (Degraded, Starting) => true,
            (Error, Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Running => "running",
            TunnelStatus::Degraded => "degraded",
            TunnelStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of one tunnel, managed or quick.
///
/// The OS process handle is owned by the supervisor and never appears here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelEndpoint {
    pub id: Uuid,
    pub kind: TunnelKind,
    pub local_target: String,
    pub status: TunnelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
    /// Managed only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Managed only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Managed only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub restart_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl TunnelEndpoint {
    /// Display name: the managed name, or the local target for quick tunnels
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.local_target)
    }
}

/// Events emitted by the tunnel core to any front end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Tunnel status changed
    StatusChanged {
        id: Uuid,
        status: TunnelStatus,
        public_url: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A failure was classified for a tunnel (or globally when `id` is None)
    ErrorClassified {
        id: Option<Uuid>,
        error: ErrorInfo,
        timestamp: DateTime<Utc>,
    },

    /// Managed tunnel is being restarted after an abnormal exit
    Restarting {
        id: Uuid,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    BackupCompleted {
        file: PathBuf,
        timestamp: DateTime<Utc>,
    },

    BackupFailed {
        error: ErrorInfo,
        timestamp: DateTime<Utc>,
    },
}

impl TunnelEvent {
    /// Tunnel the event refers to, if any
    pub fn tunnel_id(&self) -> Option<Uuid> {
        match self {
            TunnelEvent::StatusChanged { id, .. } | TunnelEvent::Restarting { id, .. } => {
                Some(*id)
            }
            TunnelEvent::ErrorClassified { id, .. } => *id,
            TunnelEvent::BackupCompleted { .. } | TunnelEvent::BackupFailed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_machine() {
        use TunnelStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Error));
        assert!(Error.can_transition_to(Stopped));

        // Never backwards out of Stopped except via start
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Error));
        assert!(!Stopped.can_transition_to(Degraded));
        assert!(!Error.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Degraded));
    }

    #[test]
    fn test_status_flags() {
        assert!(TunnelStatus::Starting.is_active());
        assert!(TunnelStatus::Degraded.is_active());
        assert!(!TunnelStatus::Error.is_active());
    }

    #[test]
    fn test_event_serialization_tag() {
        let id = Uuid::new_v4();
        let event = TunnelEvent::StatusChanged {
            id,
            status: TunnelStatus::Running,
            public_url: Some("https://abcd-1234.trycloudflare.com".to_string()),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["status"], "running");
        assert_eq!(event.tunnel_id(), Some(id));
    }
}
