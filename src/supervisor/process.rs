//! Child process ownership.
//!
//! Spawns one child with three piped streams, drains its stderr into a
//! bounded ring on a separate task, answers non-blocking liveness queries
//! and terminates it (close input, SIGTERM, grace period, kill).

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::errors::SupervisorError;
use super::framing::{read_frame, FrameRead};
use super::types::LaunchSpec;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default number of stderr lines kept per child.
pub const DEFAULT_STDERR_LINES: usize = 200;

/// Longest stderr line kept verbatim; longer lines are replaced by a marker.
const STDERR_LINE_MAX_BYTES: usize = 4096;

// ─── Stderr Ring ─────────────────────────────────────────────────────────────

/// Bounded buffer of the most recent stderr lines.
#[derive(Debug)]
pub struct StderrRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    total: AtomicU64,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Lines seen since the child started, including evicted ones.
    pub fn total_lines(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

fn spawn_stderr_drain(name: String, stderr: ChildStderr, ring: Arc<StderrRing>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::with_capacity(256);
        loop {
            match read_frame(&mut reader, &mut buf, STDERR_LINE_MAX_BYTES).await {
                Ok(FrameRead::Frame) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    tracing::debug!(server = %name, stderr = %line, "child stderr");
                    ring.push(line);
                }
                Ok(FrameRead::Oversized(bytes)) => {
                    ring.push(format!("...({bytes} bytes truncated)"));
                }
                Ok(FrameRead::Eof) => break,
                Err(e) => {
                    tracing::debug!(server = %name, error = %e, "stderr drain stopped");
                    break;
                }
            }
        }
    })
}

// ─── ChildProcess ────────────────────────────────────────────────────────────

/// One spawned child server process.
///
/// Stdin and stdout are handed to the protocol client at spawn time; this
/// type keeps the process itself, the stderr ring and its drain task.
#[derive(Debug)]
pub struct ChildProcess {
    name: String,
    pid: Option<u32>,
    /// `None` once `terminate` has taken ownership.
    child: Mutex<Option<Child>>,
    exit_status: Mutex<Option<ExitStatus>>,
    stderr: Arc<StderrRing>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

/// Lock a std mutex, recovering from poisoning so cleanup paths still run.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

impl ChildProcess {
    /// Spawn the executable described by `spec`.
    ///
    /// Must be called from within a Tokio runtime (the stderr drain is a task).
    pub fn spawn(
        name: &str,
        spec: &LaunchSpec,
        stderr_lines: usize,
    ) -> Result<(Self, ChildStdin, ChildStdout), SupervisorError> {
        let mut cmd = Command::new(spec.command());
        cmd.args(spec.args());

        if !spec.inherits_env() {
            cmd.env_clear();
        }
        cmd.envs(spec.env());

        if let Some(dir) = spec.cwd() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", spec.command()),
        })?;

        let capture_failed = |stream: &str| SupervisorError::SpawnFailed {
            name: name.to_string(),
            reason: format!("failed to capture {stream}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| capture_failed("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| capture_failed("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| capture_failed("stderr"))?;

        let pid = child.id();
        let ring = Arc::new(StderrRing::new(stderr_lines));
        let stderr_task = spawn_stderr_drain(name.to_string(), stderr, Arc::clone(&ring));

        tracing::debug!(
            server = name,
            pid,
            command = spec.command(),
            args = ?spec.args(),
            "child server spawned"
        );

        let process = Self {
            name: name.to_string(),
            pid,
            child: Mutex::new(Some(child)),
            exit_status: Mutex::new(None),
            stderr: ring,
            stderr_task: Mutex::new(Some(stderr_task)),
            started_at: Utc::now(),
        };
        Ok((process, stdin, stdout))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stderr(&self) -> &StderrRing {
        &self.stderr
    }

    /// Non-blocking: whether the process is still running.
    pub fn is_running(&self) -> bool {
        let mut guard = relock(&self.child);
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                *relock(&self.exit_status) = Some(status);
                false
            }
            Err(_) => false,
        }
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *relock(&self.exit_status)
    }

    /// Human-readable exit description for diagnostics.
    pub fn exit_reason(&self) -> Option<String> {
        self.exit_status().map(|status| format!("process exited ({status})"))
    }

    /// Terminate the process: SIGTERM after half the grace period, kill
    /// after the full one. Idempotent.
    ///
    /// The caller closes stdin first so well-behaved children exit on EOF.
    pub async fn terminate(&self, grace: Duration) {
        let Some(mut child) = relock(&self.child).take() else {
            return;
        };

        let first_wait = grace / 2;
        if let Ok(Ok(status)) = tokio::time::timeout(first_wait, child.wait()).await {
            self.record_exit(status);
            return;
        }

        if let Some(pid) = self.pid {
            send_terminate_signal(&self.name, pid);
        }

        if let Ok(Ok(status)) = tokio::time::timeout(grace - first_wait, child.wait()).await {
            self.record_exit(status);
            return;
        }

        tracing::warn!(
            server = %self.name,
            pid = self.pid,
            grace_ms = grace.as_millis() as u64,
            "child did not exit within grace period, killing"
        );
        if let Err(e) = child.kill().await {
            tracing::warn!(server = %self.name, error = %e, "failed to kill child");
        }
        if let Ok(Some(status)) = child.try_wait() {
            self.record_exit(status);
        }
    }

    fn record_exit(&self, status: ExitStatus) {
        tracing::debug!(server = %self.name, pid = self.pid, %status, "child exited");
        *relock(&self.exit_status) = Some(status);
    }

    /// Wait for the stderr drain to finish, aborting it after `wait`.
    pub async fn join_stderr(&self, wait: Duration) {
        let task = relock(&self.stderr_task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(wait, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
    }

    /// Best-effort synchronous kill, for drop paths.
    pub fn kill_now(&self) {
        if let Some(child) = relock(&self.child).as_mut() {
            let _ = child.start_kill();
        }
        if let Some(task) = relock(&self.stderr_task).take() {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn send_terminate_signal(name: &str, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(server = name, pid, error = %e, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_terminate_signal(_name: &str, _pid: u32) {}

// ─── Tests ───────────────────────────────────────────────────────────────────
