// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - Process Supervisor
// Spawns, streams and terminates cloudflared processes

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cf_tunnel_common::{Settings, TunnelError};

use crate::classifier::ErrorClassifier;
use crate::output::{CloudflaredLineClassifier, LineClass, LineClassifier};
use crate::pidfile::is_process_running;

/// How long output may be closed before the still-running process is reported
const OUTPUT_CLOSED_SETTLE: Duration = Duration::from_millis(250);
/// Upper bound for reading buffered lines after the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Slack on top of the grace period before `stop` gives up waiting
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// Opaque reference to a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(u64);

impl ProcessHandle {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What cloudflared is asked to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    Quick { local_target: String },
    Managed { name: String, config_path: PathBuf },
}

/// Binary plus target for one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub target: LaunchTarget,
}

impl LaunchSpec {
    pub fn quick(binary: impl Into<PathBuf>, local_target: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            target: LaunchTarget::Quick {
                local_target: local_target.into(),
            },
        }
    }

    pub fn managed(
        binary: impl Into<PathBuf>,
        name: impl Into<String>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            target: LaunchTarget::Managed {
                name: name.into(),
                config_path: config_path.into(),
            },
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.target, LaunchTarget::Managed { .. })
    }

    /// Command-line arguments passed to cloudflared
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["tunnel".into(), "--no-autoupdate".into()];
        match &self.target {
            LaunchTarget::Quick { local_target } => {
                args.push("--url".into());
                args.push(local_target.trim().into());
            }
            LaunchTarget::Managed { name, config_path } => {
                args.push("--config".into());
                args.push(config_path.clone().into_os_string());
                args.push("run".into());
                args.push(name.into());
            }
        }
        args
    }

    /// Fail fast on a missing binary or managed config file
    pub(crate) fn preflight(&self) -> Result<(), TunnelError> {
        if !is_executable(&self.binary) {
            return Err(TunnelError::BinaryNotFound {
                path: self.binary.display().to_string(),
            });
        }
        if let LaunchTarget::Managed { config_path, .. } = &self.target {
            if !config_path.is_file() {
                return Err(TunnelError::ConfigNotFound {
                    path: config_path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Exponential backoff for managed tunnel restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RestartPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.restart_max_attempts,
            base_delay: Duration::from_millis(settings.restart_base_delay_ms),
            max_delay: Duration::from_millis(settings.restart_max_delay_ms),
        }
    }

    /// `base * 2^(attempt - 1)`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Observation about one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned { pid: u32 },
    PublicUrlObserved { url: String },
    ConnectionRegistered,
    FailureObserved { error: TunnelError },
    /// Output ended while the process is still alive
    OutputClosed,
    Restarting { attempt: u32, delay: Duration },
    /// Always the last event of a handle
    Exited {
        code: Option<i32>,
        requested: bool,
        error: Option<TunnelError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorEvent {
    pub handle: ProcessHandle,
    pub event: ProcessEvent,
}

#[derive(Clone)]
struct ProcessSlot {
    pid: Arc<AtomicU32>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

struct SupervisorInner {
    next_handle: AtomicU64,
    processes: Mutex<HashMap<ProcessHandle, ProcessSlot>>,
    policy: RestartPolicy,
    grace: Duration,
    classifier: Arc<dyn LineClassifier>,
}

/// Owns every cloudflared child process
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    pub fn new(policy: RestartPolicy, grace: Duration) -> Self {
        Self::with_classifier(policy, grace, Arc::new(CloudflaredLineClassifier))
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            RestartPolicy::from_settings(settings),
            Duration::from_secs(settings.stop_grace_seconds),
        )
    }

    pub fn with_classifier(
        policy: RestartPolicy,
        grace: Duration,
        classifier: Arc<dyn LineClassifier>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                next_handle: AtomicU64::new(1),
                processes: Mutex::new(HashMap::new()),
                policy,
                grace,
                classifier,
            }),
        }
    }

    /// Spawn cloudflared and supervise it on a background task.
    ///
    /// Events for the returned handle are sent on `events` in the order
    /// they were observed.
    pub async fn start(
        &self,
        spec: LaunchSpec,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<ProcessHandle, TunnelError> {
        spec.preflight()?;
        let child = spawn_child(&spec).await?;

        let handle = ProcessHandle(self.inner.next_handle.fetch_add(1, Ordering::SeqCst));
        let (done_tx, done_rx) = watch::channel(false);
        let slot = ProcessSlot {
            pid: Arc::new(AtomicU32::new(0)),
            cancel: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
            done: done_rx,
        };

        self.inner
            .processes
            .lock()
            .await
            .insert(handle, slot.clone());

        info!(
            "Started cloudflared {} ({:?}) as {}",
            spec.binary.display(),
            spec.target,
            handle
        );

        let run = ProcessRun {
            handle,
            spec,
            events,
            slot,
            done: done_tx,
            policy: self.inner.policy,
            grace: self.inner.grace,
            classifier: self.inner.classifier.clone(),
            supervisor: Arc::downgrade(&self.inner),
        };
        tokio::spawn(run.run(child));

        Ok(handle)
    }

    /// Terminate the process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Returns once the process is gone. Unknown handles are ignored.
    pub async fn stop(&self, handle: ProcessHandle) {
        let slot = self.inner.processes.lock().await.get(&handle).cloned();
        let Some(slot) = slot else {
            debug!("Stop requested for finished process {}", handle);
            return;
        };

        slot.cancel.cancel();

        let mut done = slot.done.clone();
        let bound = self.inner.grace + STOP_MARGIN;
        if tokio::time::timeout(bound, done.wait_for(|finished| *finished))
            .await
            .is_err()
        {
            warn!("Process {} did not confirm termination within {:?}", handle, bound);
        }
    }

    /// Non-blocking liveness check
    pub async fn poll(&self, handle: ProcessHandle) -> bool {
        let processes = self.inner.processes.lock().await;
        match processes.get(&handle) {
            Some(slot) if !slot.finished.load(Ordering::SeqCst) => {
                match slot.pid.load(Ordering::SeqCst) {
                    // Between restarts the run task itself is the live part
                    0 => true,
                    pid => is_process_running(pid),
                }
            }
            _ => false,
        }
    }

    /// Pid of the current process behind `handle`, if one is running
    pub(crate) async fn pid(&self, handle: ProcessHandle) -> Option<u32> {
        let processes = self.inner.processes.lock().await;
        processes
            .get(&handle)
            .map(|slot| slot.pid.load(Ordering::SeqCst))
            .filter(|pid| *pid != 0)
    }

    /// Stop every supervised process
    pub async fn stop_all(&self) {
        let handles: Vec<ProcessHandle> = {
            let processes = self.inner.processes.lock().await;
            processes.keys().copied().collect()
        };

        for handle in handles {
            self.stop(handle).await;
        }
    }
}

#[derive(Default)]
struct LineState {
    url_seen: bool,
    registered: bool,
    failure: bool,
}

impl LineState {
    fn ready(&self) -> bool {
        self.url_seen || self.registered
    }
}

struct WatchOutcome {
    code: Option<i32>,
    requested: bool,
    ready: bool,
    failure: bool,
}

/// State of the single task that owns a child and emits its events
struct ProcessRun {
    handle: ProcessHandle,
    spec: LaunchSpec,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    slot: ProcessSlot,
    done: watch::Sender<bool>,
    policy: RestartPolicy,
    grace: Duration,
    classifier: Arc<dyn LineClassifier>,
    supervisor: Weak<SupervisorInner>,
}

impl ProcessRun {
    fn emit(&self, event: ProcessEvent) {
        if self
            .events
            .send(SupervisorEvent {
                handle: self.handle,
                event,
            })
            .is_err()
        {
            debug!("No receiver for events of process {}", self.handle);
        }
    }

    async fn run(self, mut child: Child) {
        let mut attempt: u32 = 0;

        loop {
            let outcome = self.watch(&mut child).await;
            let requested = outcome.requested || self.slot.cancel.is_cancelled();
            let clean = outcome.code == Some(0);

            // A restarted process that came up again earns a fresh budget
            if outcome.ready {
                attempt = 0;
            }

            let restart = self.spec.is_managed()
                && !requested
                && !clean
                && !outcome.failure
                && attempt < self.policy.max_attempts;

            if !restart {
                let error = (!requested && !clean)
                    .then(|| ErrorClassifier::exit_status(outcome.code, &self.spec.binary));
                info!(
                    "Process {} exited (code {:?}, requested: {})",
                    self.handle, outcome.code, requested
                );
                self.emit(ProcessEvent::Exited {
                    code: outcome.code,
                    requested,
                    error,
                });
                break;
            }

            attempt += 1;
            let delay = self.policy.delay_for(attempt);
            warn!(
                "Process {} exited with {:?}; restart {}/{} in {:?}",
                self.handle, outcome.code, attempt, self.policy.max_attempts, delay
            );
            self.slot.pid.store(0, Ordering::SeqCst);
            self.emit(ProcessEvent::Restarting { attempt, delay });

            tokio::select! {
                _ = self.slot.cancel.cancelled() => {
                    self.emit(ProcessEvent::Exited {
                        code: outcome.code,
                        requested: true,
                        error: None,
                    });
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match spawn_child(&self.spec).await {
                Ok(next) => child = next,
                Err(error) => {
                    warn!("Restart of process {} failed: {}", self.handle, error);
                    self.emit(ProcessEvent::Exited {
                        code: None,
                        requested: false,
                        error: Some(error),
                    });
                    break;
                }
            }
        }

        self.finish().await;
    }

    /// Stream one child's output until it exits or is cancelled
    async fn watch(&self, child: &mut Child) -> WatchOutcome {
        let pid = child.id();
        self.slot.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
        if let Some(pid) = pid {
            self.emit(ProcessEvent::Spawned { pid });
        }

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut state = LineState::default();
        let mut output_open = true;
        let mut closed_at: Option<Instant> = None;
        let mut requested = false;

        let code = loop {
            tokio::select! {
                biased;

                _ = self.slot.cancel.cancelled() => {
                    requested = true;
                    break terminate(child, self.grace, self.handle).await;
                }

                line = line_rx.recv(), if output_open => match line {
                    Some(line) => self.handle_line(&line, &mut state),
                    None => {
                        output_open = false;
                        closed_at = Some(Instant::now() + OUTPUT_CLOSED_SETTLE);
                    }
                },

                _ = tokio::time::sleep_until(closed_at.unwrap_or_else(Instant::now)), if closed_at.is_some() => {
                    closed_at = None;
                    warn!("Output of process {} ended while it is still running", self.handle);
                    self.emit(ProcessEvent::OutputClosed);
                }

                status = child.wait() => {
                    break match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!("Failed to wait for process {}: {}", self.handle, e);
                            None
                        }
                    };
                }
            }
        };

        if output_open && !requested {
            let drain = async {
                while let Some(line) = line_rx.recv().await {
                    self.handle_line(&line, &mut state);
                }
            };
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
        }

        for reader in readers {
            reader.abort();
        }

        WatchOutcome {
            code,
            requested,
            ready: state.ready(),
            failure: state.failure,
        }
    }

    fn handle_line(&self, line: &str, state: &mut LineState) {
        debug!("[cloudflared {}] {}", self.handle, line);

        match self.classifier.classify(line) {
            LineClass::PublicUrl(url) => {
                if !state.url_seen {
                    state.url_seen = true;
                    info!("Process {} public URL: {}", self.handle, url);
                    self.emit(ProcessEvent::PublicUrlObserved { url });
                }
            }
            LineClass::ConnectionRegistered => {
                if !state.registered {
                    state.registered = true;
                    info!("Process {} registered a tunnel connection", self.handle);
                    self.emit(ProcessEvent::ConnectionRegistered);
                }
            }
            LineClass::Failure(error) => {
                if !state.failure {
                    state.failure = true;
                    warn!("Process {} reported failure: {}", self.handle, error);
                    self.emit(ProcessEvent::FailureObserved { error });
                }
            }
            LineClass::Other => {}
        }
    }

    async fn finish(self) {
        self.slot.finished.store(true, Ordering::SeqCst);
        if let Some(inner) = self.supervisor.upgrade() {
            inner.processes.lock().await.remove(&self.handle);
        }
        let _ = self.done.send(true);
    }
}

async fn spawn_child(spec: &LaunchSpec) -> Result<Child, TunnelError> {
    let mut attempts = 0;
    loop {
        let result = Command::new(&spec.binary)
            .args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match result {
            Ok(child) => return Ok(child),
            // A freshly written binary can still be open for writing elsewhere
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => return Err(ErrorClassifier::spawn_error(&e, &spec.binary)),
        }
    }
}

/// Forward output lines; invalid UTF-8 is replaced so reading never stops early
fn spawn_reader<R>(reader: R, lines: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Stopped reading process output: {}", e);
                    break;
                }
            }
        }
    })
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration, handle: ProcessHandle) -> Option<i32> {
    if let Some(pid) = child.id() {
        send_terminate(pid, child);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!("Failed to wait for process {}: {}", handle, e);
            None
        }
        Err(_) => {
            warn!(
                "Process {} did not exit within {:?}, killing it",
                handle, grace
            );
            if let Err(e) = child.kill().await {
                warn!("Failed to kill process {}: {}", handle, e);
            }
            child.wait().await.ok().and_then(|status| status.code())
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32, _child: &mut Child) {
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        debug!(
            "SIGTERM to {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32, child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::fake_cloudflared;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

    fn fast_policy(max_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> ProcessEvent {
        tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for supervisor event")
            .expect("event channel closed")
            .event
    }

    async fn collect_until_exit(
        rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let exited = matches!(event, ProcessEvent::Exited { .. });
            events.push(event);
            if exited {
                return events;
            }
        }
    }

    #[test]
    fn test_restart_delays_double_and_cap() {
        let policy = RestartPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_launch_args() {
        let quick = LaunchSpec::quick("/usr/bin/cloudflared", " http://localhost:3000 ");
        assert_eq!(
            quick.args(),
            ["tunnel", "--no-autoupdate", "--url", "http://localhost:3000"]
                .iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );

        let managed = LaunchSpec::managed("/usr/bin/cloudflared", "blog", "/etc/cf/blog.yml");
        assert_eq!(
            managed.args(),
            ["tunnel", "--no-autoupdate", "--config", "/etc/cf/blog.yml", "run", "blog"]
                .iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_missing_binary_and_config_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(fast_policy(0), Duration::from_secs(1));
        let (tx, _rx) = mpsc::unbounded_channel();

        let missing = dir.path().join("cloudflared");
        let err = supervisor
            .start(LaunchSpec::quick(&missing, "http://localhost:3000"), tx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BinaryNotFound { .. }));

        // Present but not executable
        std::fs::write(&missing, "#!/bin/sh\n").unwrap();
        let err = supervisor
            .start(LaunchSpec::quick(&missing, "http://localhost:3000"), tx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BinaryNotFound { .. }));

        let binary = fake_cloudflared(dir.path(), "exec sleep 30");
        let err = supervisor
            .start(
                LaunchSpec::managed(&binary, "blog", dir.path().join("missing.yml")),
                tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_quick_tunnel_url_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "echo 'INF Requesting new quick Tunnel on trycloudflare.com...' >&2\n\
             echo 'INF |  https://abcd-1234.trycloudflare.com  |' >&2\n\
             echo 'INF |  https://abcd-1234.trycloudflare.com  |' >&2\n\
             exec sleep 30",
        );

        let supervisor = ProcessSupervisor::new(fast_policy(3), Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = supervisor
            .start(LaunchSpec::quick(&binary, "http://localhost:3000"), tx)
            .await
            .unwrap();

        assert!(matches!(next_event(&mut rx).await, ProcessEvent::Spawned { .. }));
        assert_eq!(
            next_event(&mut rx).await,
            ProcessEvent::PublicUrlObserved {
                url: "https://abcd-1234.trycloudflare.com".to_string()
            }
        );
        assert!(supervisor.poll(handle).await);

        supervisor.stop(handle).await;
        let rest = collect_until_exit(&mut rx).await;
        assert!(matches!(
            rest.last(),
            Some(ProcessEvent::Exited { requested: true, error: None, .. })
        ));
        // The URL is reported once per run
        assert!(!rest
            .iter()
            .any(|e| matches!(e, ProcessEvent::PublicUrlObserved { .. })));
        assert!(!supervisor.poll(handle).await);

        // Stopping again is harmless
        supervisor.stop(handle).await;
    }

    #[tokio::test]
    async fn test_managed_restarts_until_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("blog.yml");
        std::fs::write(&config, "tunnel: blog\n").unwrap();
        let binary = fake_cloudflared(dir.path(), "echo 'ERR connection refused' >&2\nexit 1");

        let supervisor = ProcessSupervisor::new(fast_policy(3), Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        supervisor
            .start(LaunchSpec::managed(&binary, "blog", &config), tx)
            .await
            .unwrap();

        let events = collect_until_exit(&mut rx).await;

        let spawned = events
            .iter()
            .filter(|e| matches!(e, ProcessEvent::Spawned { .. }))
            .count();
        assert_eq!(spawned, 4);

        let delays: Vec<Duration> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Restarting { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));

        match events.last() {
            Some(ProcessEvent::Exited {
                code: Some(1),
                requested: false,
                error: Some(_),
            }) => {}
            other => panic!("unexpected final event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quick_tunnel_never_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(dir.path(), "exit 1");

        let supervisor = ProcessSupervisor::new(fast_policy(5), Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        supervisor
            .start(LaunchSpec::quick(&binary, "http://localhost:3000"), tx)
            .await
            .unwrap();

        let events = collect_until_exit(&mut rx).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProcessEvent::Restarting { .. })));
        assert!(matches!(
            events.last(),
            Some(ProcessEvent::Exited { code: Some(1), requested: false, error: Some(_) })
        ));
    }

    #[tokio::test]
    async fn test_failure_signature_is_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("blog.yml");
        std::fs::write(&config, "tunnel: blog\n").unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "echo 'ERR Cannot determine default origin certificate path. No file cert.pem' >&2\nexit 1",
        );

        let supervisor = ProcessSupervisor::new(fast_policy(5), Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        supervisor
            .start(LaunchSpec::managed(&binary, "blog", &config), tx)
            .await
            .unwrap();

        let events = collect_until_exit(&mut rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessEvent::FailureObserved {
                error: TunnelError::AuthenticationRequired { .. }
            }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProcessEvent::Restarting { .. })));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "trap '' TERM\necho 'INF |  https://stubborn-1.trycloudflare.com  |'\nwhile true; do sleep 1; done",
        );

        let supervisor = ProcessSupervisor::new(fast_policy(0), Duration::from_millis(300));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = supervisor
            .start(LaunchSpec::quick(&binary, "http://localhost:3000"), tx)
            .await
            .unwrap();

        loop {
            if let ProcessEvent::PublicUrlObserved { .. } = next_event(&mut rx).await {
                break;
            }
        }

        let started = std::time::Instant::now();
        supervisor.stop(handle).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let events = collect_until_exit(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(ProcessEvent::Exited { requested: true, .. })
        ));
        assert!(!supervisor.poll(handle).await);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_reading() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(
            dir.path(),
            "printf 'INF \\377\\376 banner\\n' >&2\necho 'INF |  https://after-bytes-1.trycloudflare.com  |' >&2\nexec sleep 30",
        );

        let supervisor = ProcessSupervisor::new(fast_policy(0), Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = supervisor
            .start(LaunchSpec::quick(&binary, "http://localhost:3000"), tx)
            .await
            .unwrap();

        loop {
            match next_event(&mut rx).await {
                ProcessEvent::PublicUrlObserved { url } => {
                    assert_eq!(url, "https://after-bytes-1.trycloudflare.com");
                    break;
                }
                ProcessEvent::Spawned { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }

        supervisor.stop(handle).await;
    }

    #[tokio::test]
    async fn test_output_closed_while_alive() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_cloudflared(dir.path(), "exec >/dev/null 2>&1\nexec sleep 30");

        let supervisor = ProcessSupervisor::new(fast_policy(0), Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = supervisor
            .start(LaunchSpec::quick(&binary, "http://localhost:3000"), tx)
            .await
            .unwrap();

        assert!(matches!(next_event(&mut rx).await, ProcessEvent::Spawned { .. }));
        assert_eq!(next_event(&mut rx).await, ProcessEvent::OutputClosed);
        assert!(supervisor.poll(handle).await);

        supervisor.stop(handle).await;
        let events = collect_until_exit(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(ProcessEvent::Exited { requested: true, .. })
        ));
    }
}
