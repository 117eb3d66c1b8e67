// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Tunnel Registry
// Authoritative model of all tunnels; applies supervisor events

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cf_tunnel_common::{
    target_port, validate_local_target, ManagedTunnelDefinition, Settings, SettingsStore,
    TunnelEndpoint, TunnelError, TunnelEvent, TunnelKind, TunnelStatus, TunnelStore,
};

use crate::classifier::ErrorClassifier;
use crate::port_probe::PortProbe;
use crate::supervisor::{LaunchSpec, ProcessEvent, ProcessHandle, ProcessSupervisor, SupervisorEvent};

const EVENT_CAPACITY: usize = 256;

/// Immutable point-in-time view of every tunnel, in registration order
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub tunnels: Vec<TunnelEndpoint>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &Uuid) -> Option<&TunnelEndpoint> {
        self.tunnels.iter().find(|t| t.id == *id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&TunnelEndpoint> {
        self.tunnels
            .iter()
            .find(|t| t.name.as_deref() == Some(name))
    }
}

struct Entry {
    endpoint: TunnelEndpoint,
    /// Managed only
    definition: Option<ManagedTunnelDefinition>,
    handle: Option<ProcessHandle>,
    /// Bumped on every start and stop; a pending spawn only proceeds while it matches
    generation: u64,
}

impl Entry {
    fn quick(local_target: &str) -> Self {
        Self {
            endpoint: TunnelEndpoint {
                id: Uuid::new_v4(),
                kind: TunnelKind::Quick,
                local_target: local_target.to_string(),
                status: TunnelStatus::Stopped,
                public_url: None,
                last_error: None,
                name: None,
                domain: None,
                config_path: None,
                restart_attempts: 0,
                updated_at: Utc::now(),
            },
            definition: None,
            handle: None,
            generation: 0,
        }
    }

    fn managed(definition: ManagedTunnelDefinition) -> Self {
        let mut entry = Self {
            endpoint: TunnelEndpoint {
                id: definition.id,
                kind: TunnelKind::Managed,
                local_target: String::new(),
                status: TunnelStatus::Stopped,
                public_url: None,
                last_error: None,
                name: None,
                domain: None,
                config_path: None,
                restart_attempts: 0,
                updated_at: Utc::now(),
            },
            definition: None,
            handle: None,
            generation: 0,
        };
        entry.set_definition(definition);
        entry
    }

    fn set_definition(&mut self, definition: ManagedTunnelDefinition) {
        self.endpoint.local_target = definition.local_target.clone();
        self.endpoint.name = Some(definition.name.clone());
        self.endpoint.domain = definition.domain.clone();
        self.endpoint.config_path = Some(definition.config_path.clone());
        self.endpoint.updated_at = Utc::now();
        self.definition = Some(definition);
    }

    /// Move to `next` if the state machine allows it
    fn transition(&mut self, next: TunnelStatus) -> Option<TunnelEvent> {
        let current = self.endpoint.status;
        if current == next {
            return None;
        }
        if !current.can_transition_to(next) {
            debug!(
                "Ignoring transition {} -> {} for tunnel {}",
                current, next, self.endpoint.id
            );
            return None;
        }

        self.endpoint.status = next;
        if matches!(next, TunnelStatus::Stopped | TunnelStatus::Error) {
            self.endpoint.public_url = None;
        }
        self.endpoint.updated_at = Utc::now();
        debug!(
            "Tunnel {} ({}): {} -> {}",
            self.endpoint.display_name(),
            self.endpoint.id,
            current,
            next
        );
        Some(status_event(&self.endpoint))
    }

    /// Record `error` and move to Error
    fn fail(&mut self, error: &TunnelError) -> Vec<TunnelEvent> {
        if !self.endpoint.status.can_transition_to(TunnelStatus::Error) {
            return Vec::new();
        }

        warn!(
            "Tunnel {} failed: {}",
            self.endpoint.display_name(),
            error
        );
        let info = error.to_info();
        self.endpoint.last_error = Some(info.clone());

        let mut events = vec![TunnelEvent::ErrorClassified {
            id: Some(self.endpoint.id),
            error: info,
            timestamp: Utc::now(),
        }];
        events.extend(self.transition(TunnelStatus::Error));
        events
    }
}

fn status_event(endpoint: &TunnelEndpoint) -> TunnelEvent {
    TunnelEvent::StatusChanged {
        id: endpoint.id,
        status: endpoint.status,
        public_url: endpoint.public_url.clone(),
        timestamp: Utc::now(),
    }
}

#[derive(Default)]
struct RegistryState {
    order: Vec<Uuid>,
    entries: HashMap<Uuid, Entry>,
    handles: HashMap<ProcessHandle, Uuid>,
    version: u64,
}

impl RegistryState {
    fn insert(&mut self, entry: Entry) {
        let id = entry.endpoint.id;
        let previous = self.entries.insert(id, entry);
        assert!(previous.is_none(), "duplicate tunnel id {}", id);
        self.order.push(id);
    }

    fn remove(&mut self, id: &Uuid) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|other| other != id);
        if let Some(handle) = entry.handle {
            self.handles.remove(&handle);
        }
        Some(entry)
    }

    fn definitions(&self) -> Vec<ManagedTunnelDefinition> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter_map(|entry| entry.definition.clone())
            .collect()
    }

    fn name_taken(&self, name: &str, except: &Uuid) -> bool {
        self.entries.values().any(|entry| {
            entry.endpoint.id != *except && entry.endpoint.name.as_deref() == Some(name)
        })
    }

    /// Detach the process handle, returning it
    fn detach(&mut self, id: &Uuid) -> Option<ProcessHandle> {
        let handle = self.entries.get_mut(id)?.handle.take()?;
        self.handles.remove(&handle);
        Some(handle)
    }

    /// Settle into Stopped; quick tunnels leave the registry once stopped
    fn settle_stopped(&mut self, id: &Uuid) -> Vec<TunnelEvent> {
        let Some(entry) = self.entries.get_mut(id) else {
            return Vec::new();
        };
        let events: Vec<TunnelEvent> = entry.transition(TunnelStatus::Stopped).into_iter().collect();
        if entry.endpoint.kind == TunnelKind::Quick && entry.endpoint.status == TunnelStatus::Stopped {
            self.remove(id);
        }
        events
    }
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    snapshot_tx: watch::Sender<Arc<RegistrySnapshot>>,
    event_tx: broadcast::Sender<TunnelEvent>,
    supervisor: ProcessSupervisor,
    probe: Arc<dyn PortProbe>,
    settings: Arc<dyn SettingsStore>,
    store: Option<TunnelStore>,
    supervisor_tx: mpsc::UnboundedSender<SupervisorEvent>,
}

/// Manages all tunnels, managed and quick
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl TunnelRegistry {
    /// Build a registry and start its supervisor event pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        supervisor: ProcessSupervisor,
        probe: Arc<dyn PortProbe>,
        settings: Arc<dyn SettingsStore>,
        store: Option<TunnelStore>,
    ) -> Self {
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(Arc::new(RegistrySnapshot::default()));
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(RegistryInner {
            state: Mutex::new(RegistryState::default()),
            snapshot_tx,
            event_tx,
            supervisor,
            probe,
            settings,
            store,
            supervisor_tx,
        });

        spawn_event_pump(Arc::downgrade(&inner), supervisor_rx);

        Self { inner }
    }

    /// Non-owning reference for background loops
    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    /// Latest published snapshot (lock-free)
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Latest-state subscription to snapshots
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Subscribe to typed tunnel events
    pub fn events(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Sender for events produced outside the registry (backups)
    pub fn event_sender(&self) -> broadcast::Sender<TunnelEvent> {
        self.inner.event_tx.clone()
    }

    /// Broadcast a classified error that does not change the tunnel's status
    pub(crate) fn report_error(&self, id: Uuid, error: &TunnelError) {
        let event = TunnelEvent::ErrorClassified {
            id: Some(id),
            error: error.to_info(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.inner.event_tx.send(event) {
            debug!("No subscribers for tunnel event: {}", e);
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    fn load_settings(&self) -> Result<Settings, TunnelError> {
        self.inner
            .settings
            .load()
            .map_err(|e| ErrorClassifier::store_error(&e))
    }

    /// Publish the snapshot, then broadcast `events`. Called with the state lock held.
    fn publish(&self, state: &mut RegistryState, events: Vec<TunnelEvent>) {
        state.version += 1;
        let snapshot = RegistrySnapshot {
            version: state.version,
            tunnels: state
                .order
                .iter()
                .filter_map(|id| state.entries.get(id))
                .map(|entry| entry.endpoint.clone())
                .collect(),
        };
        self.inner.snapshot_tx.send_replace(Arc::new(snapshot));

        for event in events {
            if let Err(e) = self.inner.event_tx.send(event) {
                debug!("No subscribers for tunnel event: {}", e);
            }
        }
    }

    fn persist(&self, state: &RegistryState) -> Result<(), TunnelError> {
        match &self.inner.store {
            Some(store) => store
                .save_all(&state.definitions())
                .map_err(|e| ErrorClassifier::store_error(&e)),
            None => Ok(()),
        }
    }

    /// Start a quick tunnel for `local_target`.
    ///
    /// Returns as soon as the tunnel is registered as Starting; the process
    /// is spawned in the background.
    pub async fn start_quick_tunnel(&self, local_target: &str) -> Result<Uuid, TunnelError> {
        validate_local_target(local_target)?;
        let settings = self.load_settings()?;
        let spec = LaunchSpec::quick(settings.cloudflared_executable(), local_target.trim());
        spec.preflight()?;

        let mut entry = Entry::quick(local_target.trim());
        let id = entry.endpoint.id;

        let generation = {
            let mut state = self.inner.state.lock().await;
            entry.generation = 1;
            let events: Vec<TunnelEvent> = entry.transition(TunnelStatus::Starting).into_iter().collect();
            state.insert(entry);
            self.publish(&mut state, events);
            1
        };

        info!("Starting quick tunnel {} for {}", id, local_target.trim());
        self.spawn_launch(id, generation, spec);
        Ok(id)
    }

    /// Register (or update) a managed definition and start it
    pub async fn start_managed_tunnel(
        &self,
        definition: ManagedTunnelDefinition,
    ) -> Result<Uuid, TunnelError> {
        definition.validate()?;
        self.managed_launch_spec(&definition)?.preflight()?;
        let id = definition.id;

        {
            let mut state = self.inner.state.lock().await;
            if let Some(entry) = state.entries.get(&id) {
                if entry.endpoint.status.is_active() {
                    return Err(TunnelError::TunnelAlreadyRunning {
                        name: definition.name.clone(),
                    });
                }
            }
            if state.name_taken(&definition.name, &id) {
                return Err(TunnelError::InvalidConfiguration {
                    reason: format!("A tunnel named '{}' already exists", definition.name),
                });
            }

            match state.entries.get_mut(&id) {
                Some(entry) => entry.set_definition(definition),
                None => state.insert(Entry::managed(definition)),
            }
            self.persist(&state)?;
            self.publish(&mut state, Vec::new());
        }

        self.start_managed_by_id(id).await
    }

    /// Start an already registered managed tunnel
    pub async fn start_managed_by_id(&self, id: Uuid) -> Result<Uuid, TunnelError> {
        let definition = {
            let state = self.inner.state.lock().await;
            let entry = state
                .entries
                .get(&id)
                .ok_or_else(|| TunnelError::InvalidConfiguration {
                    reason: format!("Unknown tunnel {}", id),
                })?;
            let definition =
                entry
                    .definition
                    .clone()
                    .ok_or_else(|| TunnelError::InvalidConfiguration {
                        reason: format!("Tunnel {} is not a managed tunnel", id),
                    })?;
            if entry.endpoint.status.is_active() {
                return Err(TunnelError::TunnelAlreadyRunning {
                    name: definition.name,
                });
            }
            definition
        };

        let spec = self.managed_launch_spec(&definition)?;
        spec.preflight()?;

        let url = validate_local_target(&definition.local_target)?;
        let port = target_port(&url).ok_or_else(|| TunnelError::InvalidConfiguration {
            reason: format!("'{}' has no port", definition.local_target),
        })?;

        let probe = self.inner.probe.clone();
        tokio::task::spawn_blocking(move || probe.check(port))
            .await
            .map_err(|e| TunnelError::ProcessStartFailed {
                reason: format!("port probe failed: {}", e),
            })??;

        // Re-check under the lock: another start may have won while probing
        let generation = {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .entries
                .get_mut(&id)
                .ok_or_else(|| TunnelError::InvalidConfiguration {
                    reason: format!("Tunnel {} was removed", id),
                })?;
            if entry.endpoint.status.is_active() {
                return Err(TunnelError::TunnelAlreadyRunning {
                    name: definition.name,
                });
            }

            entry.generation += 1;
            entry.endpoint.last_error = None;
            entry.endpoint.restart_attempts = 0;
            let generation = entry.generation;
            let events: Vec<TunnelEvent> = entry.transition(TunnelStatus::Starting).into_iter().collect();
            self.publish(&mut state, events);
            generation
        };

        info!("Starting managed tunnel {} ({})", definition.name, id);
        self.spawn_launch(id, generation, spec);
        Ok(id)
    }

    fn managed_launch_spec(
        &self,
        definition: &ManagedTunnelDefinition,
    ) -> Result<LaunchSpec, TunnelError> {
        let settings = self.load_settings()?;
        Ok(LaunchSpec::managed(
            settings.cloudflared_executable(),
            definition.name.clone(),
            definition.resolved_config_path(),
        ))
    }

    fn spawn_launch(&self, id: Uuid, generation: u64, spec: LaunchSpec) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.launch(id, generation, spec).await;
        });
    }

    /// Spawn the process while holding the lock so its events cannot
    /// overtake the handle registration
    async fn launch(&self, id: Uuid, generation: u64, spec: LaunchSpec) {
        let mut state = self.inner.state.lock().await;

        let current = state.entries.get(&id).is_some_and(|entry| {
            entry.generation == generation
                && entry.endpoint.status == TunnelStatus::Starting
                && entry.handle.is_none()
        });
        if !current {
            debug!("Start of tunnel {} was superseded before spawning", id);
            return;
        }

        let result = self
            .inner
            .supervisor
            .start(spec, self.inner.supervisor_tx.clone())
            .await;

        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        match result {
            Ok(handle) => {
                entry.handle = Some(handle);
                state.handles.insert(handle, id);
                debug!("Tunnel {} attached to process {}", id, handle);
            }
            Err(error) => {
                let events = entry.fail(&error);
                self.publish(&mut state, events);
            }
        }
    }

    /// Stop a tunnel. Idempotent; unknown ids are ignored.
    ///
    /// Returns once the process is gone.
    pub async fn stop(&self, id: Uuid) {
        let (handle, generation) = {
            let mut state = self.inner.state.lock().await;
            let handle = state.detach(&id);
            let Some(entry) = state.entries.get_mut(&id) else {
                debug!("Stop requested for unknown tunnel {}", id);
                return;
            };
            entry.generation += 1;
            (handle, entry.generation)
        };

        if let Some(handle) = handle {
            info!("Stopping tunnel {} (process {})", id, handle);
            self.inner.supervisor.stop(handle).await;
        }

        let mut state = self.inner.state.lock().await;
        let current = state
            .entries
            .get(&id)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return;
        }
        let events = state.settle_stopped(&id);
        if !events.is_empty() {
            self.publish(&mut state, events);
        }
    }

    /// Stop every tunnel (best-effort)
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = {
            let state = self.inner.state.lock().await;
            state
                .order
                .iter()
                .filter(|id| {
                    state.entries.get(id).is_some_and(|entry| {
                        entry.handle.is_some() || entry.endpoint.status != TunnelStatus::Stopped
                    })
                })
                .copied()
                .collect()
        };

        for id in ids {
            self.stop(id).await;
        }
        self.inner.supervisor.stop_all().await;
    }

    /// Apply one supervisor observation. Events of detached handles are ignored.
    pub async fn apply_supervisor_event(&self, event: SupervisorEvent) {
        let mut state = self.inner.state.lock().await;

        let Some(id) = state.handles.get(&event.handle).copied() else {
            debug!("Ignoring {:?} from stale process {}", event.event, event.handle);
            return;
        };

        let mut stop_handle = None;
        let events = match event.event {
            ProcessEvent::Spawned { pid } => {
                debug!("Tunnel {} process {} has pid {}", id, event.handle, pid);
                return;
            }
            ProcessEvent::PublicUrlObserved { url } => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                let mut events = Vec::new();
                if entry.endpoint.public_url.is_none() && entry.endpoint.status.is_active() {
                    entry.endpoint.public_url = Some(url);
                }
                match entry.transition(TunnelStatus::Running) {
                    Some(event) => events.push(event),
                    None => events.push(status_event(&entry.endpoint)),
                }
                events
            }
            ProcessEvent::ConnectionRegistered => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                if entry.endpoint.status != TunnelStatus::Starting {
                    return;
                }
                if entry.endpoint.public_url.is_none() {
                    entry.endpoint.public_url =
                        entry.endpoint.domain.as_ref().map(|d| format!("https://{}", d));
                }
                entry.transition(TunnelStatus::Running).into_iter().collect()
            }
            ProcessEvent::FailureObserved { error } => {
                // Failure signatures are terminal: detach and stop the process
                stop_handle = state.detach(&id);
                match state.entries.get_mut(&id) {
                    Some(entry) => entry.fail(&error),
                    None => return,
                }
            }
            ProcessEvent::OutputClosed => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                entry.transition(TunnelStatus::Degraded).into_iter().collect()
            }
            ProcessEvent::Restarting { attempt, delay } => {
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                entry.endpoint.restart_attempts = attempt;
                entry.endpoint.updated_at = Utc::now();
                let mut events = vec![TunnelEvent::Restarting {
                    id,
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    timestamp: Utc::now(),
                }];
                events.extend(entry.transition(TunnelStatus::Starting));
                events
            }
            ProcessEvent::Exited {
                code,
                requested,
                error,
            } => {
                state.detach(&id);
                let status = match state.entries.get(&id) {
                    Some(entry) => entry.endpoint.status,
                    None => return,
                };
                debug!(
                    "Tunnel {} process exited (code {:?}, requested: {})",
                    id, code, requested
                );
                match (status, error) {
                    // Keep the failure that got us here
                    (TunnelStatus::Error, _) => Vec::new(),
                    (_, Some(error)) if !requested => match state.entries.get_mut(&id) {
                        Some(entry) => entry.fail(&error),
                        None => Vec::new(),
                    },
                    _ => state.settle_stopped(&id),
                }
            }
        };

        self.publish(&mut state, events);
        drop(state);

        if let Some(handle) = stop_handle {
            let supervisor = self.inner.supervisor.clone();
            tokio::spawn(async move {
                supervisor.stop(handle).await;
            });
        }
    }

    /// Handles of tunnels that should have a live process
    pub(crate) async fn live_handles(&self) -> Vec<(Uuid, ProcessHandle)> {
        let state = self.inner.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| entry.endpoint.status.is_active())
            .filter_map(|entry| entry.handle.map(|handle| (entry.endpoint.id, handle)))
            .collect()
    }

    /// The process behind `handle` died without an exit event
    pub(crate) async fn mark_lost(&self, id: Uuid, handle: ProcessHandle) {
        let pid = self.inner.supervisor.pid(handle).await;
        let mut state = self.inner.state.lock().await;
        let attached = state
            .entries
            .get(&id)
            .is_some_and(|entry| entry.handle == Some(handle));
        if !attached {
            return;
        }

        state.detach(&id);
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };

        let mut events = Vec::new();
        if entry.endpoint.status == TunnelStatus::Running {
            events.extend(entry.transition(TunnelStatus::Degraded));
        }
        events.extend(entry.fail(&ErrorClassifier::lost_process(pid)));
        self.publish(&mut state, events);
        drop(state);

        // Reap whatever is left of the run task
        self.inner.supervisor.stop(handle).await;
    }

    /// Add a managed definition without starting it
    pub async fn add_managed_definition(
        &self,
        definition: ManagedTunnelDefinition,
    ) -> Result<Uuid, TunnelError> {
        definition.validate()?;
        let id = definition.id;

        let mut state = self.inner.state.lock().await;
        if state.entries.contains_key(&id) || state.name_taken(&definition.name, &id) {
            return Err(TunnelError::InvalidConfiguration {
                reason: format!("A tunnel named '{}' already exists", definition.name),
            });
        }

        info!("Adding managed tunnel {} ({})", definition.name, id);
        state.insert(Entry::managed(definition));
        if let Err(e) = self.persist(&state) {
            state.remove(&id);
            return Err(e);
        }
        self.publish(&mut state, Vec::new());
        Ok(id)
    }

    /// Remove a stopped tunnel (and its persisted definition)
    pub async fn remove(&self, id: Uuid) -> Result<(), TunnelError> {
        let mut state = self.inner.state.lock().await;
        let Some(entry) = state.entries.get(&id) else {
            return Ok(());
        };
        if entry.endpoint.status.is_active() {
            return Err(TunnelError::TunnelAlreadyRunning {
                name: entry.endpoint.display_name().to_string(),
            });
        }

        let managed = entry.definition.is_some();
        state.remove(&id);
        if managed {
            self.persist(&state)?;
        }
        info!("Removed tunnel {}", id);
        self.publish(&mut state, Vec::new());
        Ok(())
    }

    /// Persisted definitions in registration order
    pub async fn managed_definitions(&self) -> Vec<ManagedTunnelDefinition> {
        self.inner.state.lock().await.definitions()
    }

    /// Replace the managed definitions (restore path).
    ///
    /// Definitions are upserted by id. Existing definitions absent from
    /// `definitions` are removed unless their tunnel is active. Nothing is
    /// started.
    pub async fn replace_managed_definitions(
        &self,
        definitions: Vec<ManagedTunnelDefinition>,
    ) -> Result<(), TunnelError> {
        validate_definitions(&definitions)?;

        let mut state = self.inner.state.lock().await;
        let keep: HashSet<Uuid> = definitions.iter().map(|d| d.id).collect();

        let stale: Vec<Uuid> = state
            .order
            .iter()
            .filter(|id| !keep.contains(id))
            .filter(|id| {
                state.entries.get(id).is_some_and(|entry| {
                    entry.definition.is_some() && !entry.endpoint.status.is_active()
                })
            })
            .copied()
            .collect();
        for id in stale {
            state.remove(&id);
        }

        for definition in definitions {
            let id = definition.id;
            // A restored name may belong to a different id that is still running
            let clash = state
                .entries
                .values()
                .find(|entry| {
                    entry.endpoint.id != id
                        && entry.endpoint.name.as_deref() == Some(definition.name.as_str())
                })
                .map(|entry| entry.endpoint.id);
            if let Some(other) = clash {
                warn!(
                    "Skipping restored tunnel '{}': name is used by active tunnel {}",
                    definition.name, other
                );
                continue;
            }

            match state.entries.get_mut(&id) {
                Some(entry) => entry.set_definition(definition),
                None => state.insert(Entry::managed(definition)),
            }
        }

        self.persist(&state)?;
        info!("Restored {} managed tunnel definition(s)", state.definitions().len());
        self.publish(&mut state, Vec::new());
        Ok(())
    }

    /// Load persisted definitions as Stopped tunnels
    pub async fn load_persisted(&self) -> Result<usize, TunnelError> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let definitions = store
            .load_all()
            .map_err(|e| ErrorClassifier::store_error(&e))?;

        let mut state = self.inner.state.lock().await;
        let mut loaded = 0;
        for definition in definitions {
            if state.entries.contains_key(&definition.id)
                || state.name_taken(&definition.name, &definition.id)
            {
                warn!("Skipping duplicate tunnel definition '{}'", definition.name);
                continue;
            }
            state.insert(Entry::managed(definition));
            loaded += 1;
        }

        info!("Loaded {} managed tunnel(s)", loaded);
        self.publish(&mut state, Vec::new());
        Ok(loaded)
    }

    /// One liveness pass over every running process
    pub async fn watchdog_tick(&self) {
        crate::monitor::watchdog_tick(self).await;
    }

    /// Run the watchdog every `interval` until the registry is dropped
    pub fn spawn_watchdog(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        crate::monitor::spawn_watchdog(self, interval)
    }
}

/// Check a batch of definitions: each valid, names and ids unique
pub fn validate_definitions(definitions: &[ManagedTunnelDefinition]) -> Result<(), TunnelError> {
    let mut seen_names = HashSet::new();
    let mut seen_ids = HashSet::new();
    for definition in definitions {
        definition.validate()?;
        if !seen_names.insert(definition.name.as_str()) {
            return Err(TunnelError::InvalidConfiguration {
                reason: format!("Duplicate tunnel name '{}'", definition.name),
            });
        }
        if !seen_ids.insert(definition.id) {
            return Err(TunnelError::InvalidConfiguration {
                reason: format!("Duplicate tunnel id {}", definition.id),
            });
        }
    }
    Ok(())
}

/// Weak counterpart of [`TunnelRegistry`]
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<TunnelRegistry> {
        self.0.upgrade().map(|inner| TunnelRegistry { inner })
    }
}

fn spawn_event_pump(
    inner: Weak<RegistryInner>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    let registry = WeakRegistry(inner);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.apply_supervisor_event(event).await;
        }
        debug!("Supervisor event pump finished");
    });
}
