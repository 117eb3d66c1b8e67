// Cloudflared Tunnel Manager - Watchdog
// Periodic liveness re-check of supervised processes

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::classifier::ErrorClassifier;
use crate::registry::TunnelRegistry;

/// Upper bound for a single liveness poll
const POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll every live process once; dead ones move their tunnel to Error
pub async fn watchdog_tick(registry: &TunnelRegistry) {
    let live = registry.live_handles().await;
    debug!("Watchdog checking {} process(es)", live.len());

    for (id, handle) in live {
        let alive = match tokio::time::timeout(POLL_TIMEOUT, registry.supervisor().poll(handle)).await {
            Ok(alive) => alive,
            Err(_) => {
                // Reported but not fatal; the next tick polls again
                let err = ErrorClassifier::timeout("Liveness poll", POLL_TIMEOUT);
                warn!("Tunnel {}: {}", id, err);
                registry.report_error(id, &err);
                continue;
            }
        };

        if !alive {
            warn!("Tunnel {} lost its process {}", id, handle);
            registry.mark_lost(id, handle).await;
        }
    }
}

/// Run [`watchdog_tick`] every `interval` until the registry is dropped
pub fn spawn_watchdog(registry: &TunnelRegistry, interval: Duration) -> JoinHandle<()> {
    let registry = registry.downgrade();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                debug!("Registry dropped, watchdog exiting");
                break;
            };
            watchdog_tick(&registry).await;
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::port_probe::SystemPortProbe;
    use crate::supervisor::ProcessSupervisor;
    use crate::test_support::{fake_cloudflared, wait_for_status};
    use cf_tunnel_common::{ErrorKind, MemorySettingsStore, Settings, TunnelStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_watchdog_keeps_healthy_and_fails_lost_process() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "echo 'INF |  https://watch-1.trycloudflare.com  |'\nexec sleep 30",
        );

        let settings = Settings {
            cloudflared_path: binary.display().to_string(),
            ..Default::default()
        };
        let registry = TunnelRegistry::new(
            ProcessSupervisor::from_settings(&settings),
            Arc::new(SystemPortProbe::new()),
            Arc::new(MemorySettingsStore::new(settings)),
            None,
        );

        let id = registry
            .start_quick_tunnel("http://localhost:3000")
            .await
            .unwrap();
        wait_for_status(&registry, id, TunnelStatus::Running).await;

        // A healthy process survives a tick
        watchdog_tick(&registry).await;
        assert_eq!(
            registry.snapshot().get(&id).map(|t| t.status),
            Some(TunnelStatus::Running)
        );

        let handle = registry.live_handles().await[0].1;
        assert!(registry.supervisor().poll(handle).await);
        let pid = registry.supervisor().pid(handle).await.unwrap();
        registry.mark_lost(id, handle).await;

        let snapshot = registry.snapshot();
        let tunnel = snapshot.get(&id).unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Error);
        assert_eq!(
            tunnel.last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::ProcessStartFailed)
        );
        assert!(tunnel
            .last_error
            .as_ref()
            .is_some_and(|e| e.message.contains(&pid.to_string())));
        assert!(!registry.supervisor().poll(handle).await);
        assert_eq!(registry.supervisor().pid(handle).await, None);
    }
}
