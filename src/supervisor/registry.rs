//! Server registry — named child servers and their lifecycle.
//!
//! Each entry pairs an immutable `LaunchSpec` with its runtime record
//! (state, current handle, restart count, last failure). Start, stop and
//! restart of one entry are serialized by a per-entry async lock; dispatch
//! only reads the record and never waits behind a lifecycle operation.
//!
//! A background monitor checks every running entry on a fixed interval,
//! marks it `Degraded` when its process has exited or its health counters
//! cross a threshold, and optionally restarts exited entries.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::errors::SupervisorError;
use super::framing;
use super::handle::{HandleSettings, ServerHandle};
use super::types::{LaunchSpec, LifecycleEvent, LifecycleState, MethodResult, ServerStatus};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol version sent in the default handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Timeout for the handshake call.
///
/// Generous because some servers import large frameworks at startup.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between closing stdin and force-killing.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum restarts before an entry is left permanently stopped.
const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Base delay between restarts (doubles each time).
const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Default per-call timeout for callers that do not pick one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Stderr lines included in a status snapshot.
const STATUS_STDERR_LINES: usize = 20;

/// Stderr lines appended to a handshake failure.
const HANDSHAKE_STDERR_LINES: usize = 10;

const EVENT_CAPACITY: usize = 64;

// ─── Settings ────────────────────────────────────────────────────────────────

/// The protocol call that confirms a fresh child is ready.
#[derive(Debug, Clone)]
pub struct HandshakeSpec {
    pub method: String,
    pub params: Option<Value>,
    pub timeout: Duration,
    /// Notification sent after a successful handshake, if any.
    pub initialized_notification: Option<String>,
}

impl Default for HandshakeSpec {
    fn default() -> Self {
        Self {
            method: "initialize".to_string(),
            params: Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            initialized_notification: Some("notifications/initialized".to_string()),
        }
    }
}

/// Registry-wide supervision policy.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub handshake: HandshakeSpec,
    pub grace_period: Duration,
    /// Zero disables the background monitor.
    pub health_interval: Duration,
    pub max_restarts: u32,
    /// Zero disables backoff.
    pub restart_backoff: Duration,
    /// Restart entries whose process exited, within `max_restarts`.
    pub auto_restart: bool,
    /// Consecutive call timeouts before an entry is marked `Degraded`.
    pub timeout_threshold: u32,
    /// Discarded frames in a row (no matched response between them) before
    /// an entry is marked `Degraded`.
    pub malformed_threshold: u64,
    pub handle: HandleSettings,
    pub default_call_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            handshake: HandshakeSpec::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            auto_restart: false,
            timeout_threshold: 3,
            malformed_threshold: 20,
            handle: HandleSettings::default(),
            default_call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

// ─── Entries ─────────────────────────────────────────────────────────────────

/// Mutable runtime half of an entry.
struct EntryRecord {
    state: LifecycleState,
    /// Replaced, never mutated, on every start.
    handle: Option<Arc<ServerHandle>>,
    restart_count: u32,
    last_failure: Option<String>,
    /// Stderr tail of the last handle that was torn down.
    last_stderr: Vec<String>,
    /// Set once the restart limit is hit; the entry stays `Stopped`.
    exhausted: bool,
    /// Incremented on every successful spawn.
    runs: u64,
}

struct RegistryEntry {
    name: String,
    spec: LaunchSpec,
    /// Serializes start/stop/restart for this entry.
    lifecycle: tokio::sync::Mutex<()>,
    record: Mutex<EntryRecord>,
    /// Cleanup and auto-restart tasks spawned by the health monitor.
    recovery: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryEntry {
    fn new(name: String, spec: LaunchSpec) -> Self {
        Self {
            name,
            spec,
            lifecycle: tokio::sync::Mutex::new(()),
            record: Mutex::new(EntryRecord {
                state: LifecycleState::NotStarted,
                handle: None,
                restart_count: 0,
                last_failure: None,
                last_stderr: Vec::new(),
                exhausted: false,
                runs: 0,
            }),
            recovery: Mutex::new(Vec::new()),
        }
    }

    fn record(&self) -> MutexGuard<'_, EntryRecord> {
        self.record.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn track_recovery(&self, task: JoinHandle<()>) {
        let mut tasks = self.recovery.lock().unwrap_or_else(|poison| poison.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Abort pending monitor work (a backoff sleep or a restart in progress).
    fn cancel_recovery(&self) {
        let tasks: Vec<_> = self
            .recovery
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

/// What the monitor found wrong with a running entry.
enum HealthFinding {
    /// The process is gone; `run` identifies which spawn it was.
    Exited { handle: Arc<ServerHandle>, run: u64 },
    Unhealthy,
}

struct RegistryShared {
    entries: BTreeMap<String, Arc<RegistryEntry>>,
    settings: RegistrySettings,
    events: broadcast::Sender<LifecycleEvent>,
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Supervises a fixed set of named child servers.
///
/// Dropping the registry kills every child it still owns; call
/// [`ServerRegistry::shutdown_all`] first for a graceful exit.
pub struct ServerRegistry {
    shared: Arc<RegistryShared>,
    monitor: Option<JoinHandle<()>>,
}

impl ServerRegistry {
    /// Build a registry over `specs`. Every entry starts `NotStarted`.
    ///
    /// The health monitor runs only when created inside a Tokio runtime and
    /// `health_interval` is non-zero.
    pub fn new<I>(specs: I, settings: RegistrySettings) -> Self
    where
        I: IntoIterator<Item = (String, LaunchSpec)>,
    {
        let entries = specs
            .into_iter()
            .map(|(name, spec)| (name.clone(), Arc::new(RegistryEntry::new(name, spec))))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(RegistryShared {
            entries,
            settings,
            events,
        });

        let interval = shared.settings.health_interval;
        let monitor = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !interval.is_zero() => {
                Some(runtime.spawn(monitor_loop(Arc::downgrade(&shared), interval)))
            }
            Ok(_) => None,
            Err(_) => {
                tracing::warn!("registry created outside a runtime, health monitor disabled");
                None
            }
        };

        Self { shared, monitor }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.shared.settings
    }

    /// Registered server names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.shared.entries.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.entries.contains_key(name)
    }

    /// Receive every lifecycle transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.events.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server and perform the handshake.
    ///
    /// Ends in `Ready` on success, or `Degraded` with the failure recorded.
    /// Starting a `Stopped` entry is a restart and counts against the
    /// restart limit.
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        let entry = self.shared.entry(name)?;
        let _lifecycle = entry.lifecycle.lock().await;
        let state = entry.record().state;
        if state == LifecycleState::Stopped {
            return self.shared.restart_locked(&entry).await;
        }
        self.shared.start_locked(&entry).await
    }

    /// Terminate the current handle and move to `Stopped`.
    ///
    /// New calls fail with `ServerNotReady` from the moment this begins.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let entry = self.shared.entry(name)?;
        entry.cancel_recovery();
        let _lifecycle = entry.lifecycle.lock().await;
        self.shared.stop_locked(&entry, "server stopped").await;
        Ok(())
    }

    /// Stop then start, counting against the restart limit.
    pub async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        let entry = self.shared.entry(name)?;
        entry.cancel_recovery();
        let _lifecycle = entry.lifecycle.lock().await;
        self.shared.restart_locked(&entry).await
    }

    /// Start every entry concurrently. Returns the failures; partial
    /// startup is acceptable.
    pub async fn start_all(&self) -> Vec<(String, SupervisorError)> {
        let names = self.names();
        let results = join_all(names.iter().map(|name| self.start(name))).await;

        let errors: Vec<(String, SupervisorError)> = names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        tracing::info!(
            started = self.shared.entries.len() - errors.len(),
            failed = errors.len(),
            "servers started"
        );
        for (name, err) in &errors {
            tracing::warn!(server = %name, error = %err, "server failed to start");
        }
        errors
    }

    /// Stop every entry concurrently.
    pub async fn shutdown_all(&self) {
        let names = self.names();
        join_all(names.iter().map(|name| self.stop(name))).await;
        tracing::info!(servers = names.len(), "all servers shut down");
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Call `method` on a `Ready` server.
    ///
    /// Errors from the child or the transport are returned as-is; nothing
    /// is retried here.
    pub async fn dispatch(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SupervisorError> {
        let entry = self.shared.entry(name)?;
        let handle = {
            let record = entry.record();
            match (&record.handle, record.state) {
                (Some(handle), LifecycleState::Ready) => Arc::clone(handle),
                (_, state) => {
                    return Err(SupervisorError::ServerNotReady {
                        name: name.to_string(),
                        state,
                    })
                }
            }
        };

        let result = handle.client().call(method, params, timeout).await;

        if let Err(SupervisorError::ChildTerminated { reason, .. }) = &result {
            let reason = handle.exit_reason().unwrap_or_else(|| reason.clone());
            self.shared.mark_degraded(&entry, &handle, reason);
        }
        result
    }

    /// Like [`dispatch`](Self::dispatch), validating the result against the
    /// schema of known methods.
    pub async fn dispatch_typed(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<MethodResult, SupervisorError> {
        let value = self.dispatch(name, method, params, timeout).await?;
        framing::decode_result(method, value).map_err(|e| e.into_supervisor_error(name))
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Snapshot of one entry. Never waits on the child.
    pub fn status(&self, name: &str) -> Result<ServerStatus, SupervisorError> {
        let entry = self.shared.entry(name)?;
        let record = entry.record();
        let handle = record.handle.as_deref();

        Ok(ServerStatus {
            name: entry.name.clone(),
            state: record.state,
            pid: handle.and_then(ServerHandle::pid),
            restart_count: record.restart_count,
            last_failure: record.last_failure.clone(),
            started_at: handle.map(ServerHandle::started_at),
            last_health_check: handle.and_then(ServerHandle::last_health_check),
            health: handle.map(|h| h.client().health()),
            stderr_tail: match handle {
                Some(h) => h.stderr_tail(STATUS_STDERR_LINES),
                None => record.last_stderr.clone(),
            },
        })
    }

    /// Snapshot of every entry, sorted by name.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.shared
            .entries
            .keys()
            .filter_map(|name| self.status(name).ok())
            .collect()
    }
}

impl Drop for ServerRegistry {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        for entry in self.shared.entries.values() {
            entry.cancel_recovery();
            if let Some(handle) = entry.record().handle.take() {
                handle.kill_now();
            }
        }
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.names())
            .finish()
    }
}

// ─── Lifecycle internals ─────────────────────────────────────────────────────

impl RegistryShared {
    fn entry(&self, name: &str) -> Result<Arc<RegistryEntry>, SupervisorError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownServer {
                name: name.to_string(),
            })
    }

    /// Apply a legal transition and broadcast it. Returns whether it applied.
    fn transition(
        &self,
        entry: &RegistryEntry,
        record: &mut EntryRecord,
        to: LifecycleState,
        reason: Option<String>,
    ) -> bool {
        let from = record.state;
        if from == to {
            return false;
        }
        if !from.can_transition_to(to) {
            tracing::debug!(server = %entry.name, from = %from, to = %to, "ignoring illegal transition");
            return false;
        }

        record.state = to;
        match &reason {
            Some(reason) => {
                tracing::info!(server = %entry.name, from = %from, to = %to, reason = %reason, "state changed")
            }
            None => tracing::info!(server = %entry.name, from = %from, to = %to, "state changed"),
        }
        // No subscribers is fine.
        let _ = self.events.send(LifecycleEvent {
            server: entry.name.clone(),
            from,
            to,
            reason,
            at: Utc::now(),
        });
        true
    }

    /// Caller holds the entry's lifecycle lock.
    async fn start_locked(&self, entry: &RegistryEntry) -> Result<(), SupervisorError> {
        let stale = {
            let mut record = entry.record();
            if record.exhausted {
                return Err(SupervisorError::RestartLimitExceeded {
                    name: entry.name.clone(),
                    limit: self.settings.max_restarts,
                });
            }
            if let Some(handle) = &record.handle {
                if handle.is_alive() {
                    return Err(SupervisorError::AlreadyRunning {
                        name: entry.name.clone(),
                        pid: handle.pid(),
                    });
                }
            }
            let stale = record.handle.take();
            if let Some(handle) = &stale {
                // Exited but not yet noticed by the monitor.
                let reason = handle
                    .exit_reason()
                    .unwrap_or_else(|| "process exited".to_string());
                if self.transition(entry, &mut record, LifecycleState::Degraded, Some(reason.clone())) {
                    record.last_failure = Some(reason);
                }
            }
            self.transition(entry, &mut record, LifecycleState::Starting, None);
            stale
        };

        if let Some(handle) = stale {
            self.retire(entry, &handle, "replaced by new start").await;
        }

        let handle = match ServerHandle::spawn(&entry.name, &entry.spec, self.settings.handle) {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                self.record_failure(entry, err.to_string());
                return Err(err);
            }
        };
        {
            let mut record = entry.record();
            record.handle = Some(Arc::clone(&handle));
            record.runs += 1;
        }

        if let Err(err) = self.handshake(&handle).await {
            entry.record().handle = None;
            handle
                .terminate(self.settings.grace_period, "handshake failed")
                .await;
            let stderr = handle.stderr_tail(HANDSHAKE_STDERR_LINES);
            let reason = format!("{err}{}", format_stderr_suffix(&stderr));
            if !stderr.is_empty() {
                tracing::warn!(
                    server = %entry.name,
                    stderr = %stderr.join(" | "),
                    "server stderr captured on handshake failure"
                );
            }
            {
                let mut record = entry.record();
                record.last_stderr = stderr;
            }
            self.record_failure(entry, reason.clone());
            return Err(SupervisorError::HandshakeFailed {
                name: entry.name.clone(),
                reason,
            });
        }

        let mut record = entry.record();
        self.transition(entry, &mut record, LifecycleState::Ready, None);
        tracing::info!(server = %entry.name, pid = handle.pid(), "server ready");
        Ok(())
    }

    async fn handshake(&self, handle: &ServerHandle) -> Result<(), SupervisorError> {
        let spec = &self.settings.handshake;
        let value = handle
            .client()
            .call(&spec.method, spec.params.clone(), spec.timeout)
            .await?;

        if let MethodResult::Initialize(init) = framing::decode_result(&spec.method, value)
            .map_err(|e| e.into_supervisor_error(handle.name()))?
        {
            tracing::debug!(
                server = handle.name(),
                protocol_version = ?init.protocol_version,
                server_name = ?init.server_info.as_ref().and_then(|s| s.name.as_deref()),
                "handshake complete"
            );
        }

        if let Some(method) = &spec.initialized_notification {
            handle.client().notify(method, None).await?;
        }
        Ok(())
    }

    fn record_failure(&self, entry: &RegistryEntry, reason: String) {
        let mut record = entry.record();
        self.transition(entry, &mut record, LifecycleState::Degraded, Some(reason.clone()));
        record.last_failure = Some(reason);
    }

    /// Caller holds the entry's lifecycle lock.
    async fn stop_locked(&self, entry: &RegistryEntry, reason: &str) {
        let handle = {
            let mut record = entry.record();
            self.transition(entry, &mut record, LifecycleState::Stopped, Some(reason.to_string()));
            record.handle.take()
        };
        if let Some(handle) = handle {
            self.retire(entry, &handle, reason).await;
        }
    }

    /// Caller holds the entry's lifecycle lock.
    async fn restart_locked(&self, entry: &RegistryEntry) -> Result<(), SupervisorError> {
        let limit = self.settings.max_restarts;
        let over_limit = {
            let mut record = entry.record();
            if record.exhausted || record.restart_count >= limit {
                record.exhausted = true;
                record.last_failure = Some(format!("restart limit of {limit} exceeded"));
                true
            } else {
                false
            }
        };
        if over_limit {
            self.stop_locked(entry, "restart limit exceeded").await;
            tracing::error!(server = %entry.name, limit, "restart limit exceeded, server left stopped");
            return Err(SupervisorError::RestartLimitExceeded {
                name: entry.name.clone(),
                limit,
            });
        }

        self.stop_locked(entry, "restarting").await;

        let attempt = {
            let mut record = entry.record();
            record.restart_count += 1;
            record.restart_count
        };

        let delay = restart_delay(self.settings.restart_backoff, attempt);
        tracing::info!(
            server = %entry.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "restarting server"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.start_locked(entry).await
    }

    /// Terminate a handle that has left the record, keeping its stderr tail.
    ///
    /// Caller holds the entry's lifecycle lock, so `handle` is the latest run.
    async fn retire(&self, entry: &RegistryEntry, handle: &ServerHandle, reason: &str) {
        let run = entry.record().runs;
        self.retire_run(entry, handle, run, reason).await;
    }

    /// Terminate the handle of spawn number `run`. Its stderr tail is kept
    /// only while no later spawn has happened.
    async fn retire_run(
        &self,
        entry: &RegistryEntry,
        handle: &ServerHandle,
        run: u64,
        reason: &str,
    ) {
        handle.terminate(self.settings.grace_period, reason).await;
        let tail = handle.stderr_tail(STATUS_STDERR_LINES);
        let mut record = entry.record();
        if record.runs == run {
            record.last_stderr = tail;
        } else {
            tracing::debug!(server = %entry.name, run, "newer run started, dropping stale stderr");
        }
    }

    /// `Ready → Degraded`, only if `handle` is still the entry's current one.
    fn mark_degraded(&self, entry: &RegistryEntry, handle: &Arc<ServerHandle>, reason: String) {
        let mut record = entry.record();
        let current = record
            .handle
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, handle));
        if current
            && record.state == LifecycleState::Ready
            && self.transition(entry, &mut record, LifecycleState::Degraded, Some(reason.clone()))
        {
            record.last_failure = Some(reason);
        }
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// One monitor pass. Never waits on a child: cleanup and restarts of
    /// exited entries run on their own tasks.
    fn check_health(self: &Arc<Self>) {
        for entry in self.entries.values() {
            if let Some(HealthFinding::Exited { handle, run }) = self.inspect(entry) {
                let task = tokio::spawn(Arc::clone(self).recover(Arc::clone(entry), handle, run));
                entry.track_recovery(task);
            }
        }
    }

    /// Reap an exited run, then restart it if configured.
    ///
    /// The cleanup runs on its own task so aborting recovery never leaves
    /// the dead child's pipes open.
    async fn recover(
        self: Arc<Self>,
        entry: Arc<RegistryEntry>,
        handle: Arc<ServerHandle>,
        run: u64,
    ) {
        let cleanup = tokio::spawn({
            let shared = Arc::clone(&self);
            let entry = Arc::clone(&entry);
            async move { shared.retire_run(&entry, &handle, run, "process exited").await }
        });
        if let Err(e) = cleanup.await {
            tracing::error!(server = %entry.name, error = %e, "cleanup of exited server failed");
        }
        if self.settings.auto_restart {
            self.auto_restart(&entry).await;
        }
    }

    /// Examine one entry without blocking. A handle whose process exited is
    /// taken out of the record for cleanup.
    fn inspect(&self, entry: &RegistryEntry) -> Option<HealthFinding> {
        let mut record = entry.record();
        if !matches!(record.state, LifecycleState::Ready | LifecycleState::Degraded) {
            return None;
        }
        let handle = Arc::clone(record.handle.as_ref()?);
        handle.mark_health_checked();

        if !handle.is_alive() {
            let reason = handle
                .exit_reason()
                .unwrap_or_else(|| "process exited".to_string());
            if record.state == LifecycleState::Ready {
                tracing::warn!(server = %entry.name, pid = handle.pid(), reason = %reason, "server exited unexpectedly");
                self.transition(entry, &mut record, LifecycleState::Degraded, Some(reason.clone()));
                record.last_failure = Some(reason);
            }
            record.handle = None;
            return Some(HealthFinding::Exited {
                handle,
                run: record.runs,
            });
        }

        if record.state != LifecycleState::Ready {
            return None;
        }

        let health = handle.client().health();
        let reason = if health.consecutive_timeouts >= self.settings.timeout_threshold {
            format!("{} consecutive call timeouts", health.consecutive_timeouts)
        } else if health.consecutive_malformed >= self.settings.malformed_threshold {
            format!("{} consecutive malformed frames", health.consecutive_malformed)
        } else {
            return None;
        };

        tracing::warn!(server = %entry.name, reason = %reason, "server unhealthy");
        self.transition(entry, &mut record, LifecycleState::Degraded, Some(reason.clone()));
        record.last_failure = Some(reason);
        Some(HealthFinding::Unhealthy)
    }

    async fn auto_restart(&self, entry: &RegistryEntry) {
        let _lifecycle = entry.lifecycle.lock().await;
        {
            // A stop or start may have run while we waited for the lock.
            let record = entry.record();
            if record.state != LifecycleState::Degraded || record.handle.is_some() {
                return;
            }
        }
        match self.restart_locked(entry).await {
            Ok(()) => tracing::info!(server = %entry.name, "server auto-restarted"),
            Err(e) => tracing::error!(server = %entry.name, error = %e, "auto-restart failed"),
        }
    }
}

async fn monitor_loop(shared: Weak<RegistryShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.check_health();
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`.
fn restart_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", lines.join(" | "))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
