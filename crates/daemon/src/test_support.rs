// Shared helpers for the daemon unit tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cf_tunnel_common::{TunnelEndpoint, TunnelStatus, Uuid};

use crate::port_probe::PortProbe;
use crate::registry::TunnelRegistry;

/// Write an executable shell script standing in for cloudflared
#[cfg(unix)]
pub fn fake_cloudflared(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("cloudflared");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Port probe with a fixed set of busy ports
#[derive(Debug, Default)]
pub struct ScriptedPortProbe {
    busy: HashMap<u16, Option<String>>,
}

impl ScriptedPortProbe {
    pub fn busy(mut self, port: u16, process: &str) -> Self {
        self.busy.insert(port, Some(process.to_string()));
        self
    }
}

impl PortProbe for ScriptedPortProbe {
    fn is_available(&self, port: u16) -> bool {
        !self.busy.contains_key(&port)
    }

    fn occupying_process(&self, port: u16) -> Option<String> {
        self.busy.get(&port).cloned().flatten()
    }
}

/// Wait until tunnel `id` reaches `status` and return it
pub async fn wait_for_status(
    registry: &TunnelRegistry,
    id: Uuid,
    status: TunnelStatus,
) -> TunnelEndpoint {
    let mut rx = registry.subscribe();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|snapshot| snapshot.get(&id).is_some_and(|t| t.status == status)),
    )
    .await
    .unwrap_or_else(|_| {
        panic!(
            "tunnel {} never reached {}: {:?}",
            id,
            status,
            registry.snapshot().get(&id)
        )
    })
    .expect("registry dropped")
    .clone();

    snapshot
        .get(&id)
        .cloned()
        .expect("tunnel present in snapshot")
}
