//! Server handle — one live (or terminated) child plus its protocol client.
//!
//! A handle is created per start and never reused; a restart replaces the
//! whole handle.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::client::ProtocolClient;
use super::errors::SupervisorError;
use super::framing::DEFAULT_MAX_FRAME_BYTES;
use super::process::{ChildProcess, DEFAULT_STDERR_LINES};
use super::types::LaunchSpec;

/// How long the reader and stderr drain get to finish after the process ends.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-handle bounds.
#[derive(Debug, Clone, Copy)]
pub struct HandleSettings {
    pub max_frame_bytes: usize,
    pub stderr_lines: usize,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            stderr_lines: DEFAULT_STDERR_LINES,
        }
    }
}

/// A spawned child together with the client speaking to it.
#[derive(Debug)]
pub struct ServerHandle {
    name: String,
    process: ChildProcess,
    client: ProtocolClient,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl ServerHandle {
    /// Spawn the child and attach a protocol client to its stdio.
    pub fn spawn(
        name: &str,
        spec: &LaunchSpec,
        settings: HandleSettings,
    ) -> Result<Self, SupervisorError> {
        let (process, stdin, stdout) = ChildProcess::spawn(name, spec, settings.stderr_lines)?;
        let client = ProtocolClient::new(name, stdin, stdout, settings.max_frame_bytes);

        tracing::info!(server = name, pid = process.pid(), "server process started");

        Ok(Self {
            name: name.to_string(),
            process,
            client,
            last_health_check: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.process.started_at()
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// Non-blocking: process still running and its output stream still open.
    pub fn is_alive(&self) -> bool {
        self.process.is_running() && !self.client.is_closed()
    }

    /// Why the child is gone, if it is.
    pub fn exit_reason(&self) -> Option<String> {
        if let Some(reason) = self.process.exit_reason() {
            return Some(reason);
        }
        self.client
            .is_closed()
            .then(|| "output stream closed".to_string())
    }

    /// The most recent `n` stderr lines, oldest first.
    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        self.process.stderr().tail(n)
    }

    pub fn mark_health_checked(&self) {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(Utc::now());
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Shut down in order: fail in-flight calls, close stdin, terminate the
    /// process, then join the reader and the stderr drain.
    ///
    /// Idempotent. After this returns every pipe to the child is closed.
    pub async fn terminate(&self, grace: Duration, reason: &str) {
        self.client.begin_shutdown(reason);
        self.client.close_input(grace).await;
        self.process.terminate(grace).await;
        self.client.join_reader(JOIN_TIMEOUT).await;
        self.process.join_stderr(JOIN_TIMEOUT).await;

        tracing::info!(
            server = %self.name,
            pid = self.pid(),
            status = ?self.process.exit_status(),
            "server process stopped"
        );
    }

    /// Synchronous best-effort kill for drop paths.
    pub fn kill_now(&self) {
        self.client.begin_shutdown("registry dropped");
        self.process.kill_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let spec = LaunchSpec::new("/nonexistent/definitely-not-a-server");
        let err = ServerHandle::spawn("ghost", &spec, HandleSettings::default()).unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { ref name, .. } if name == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_closes_everything() {
        // `cat` exits on stdin EOF, so the graceful path is taken.
        let handle = ServerHandle::spawn("cat", &LaunchSpec::new("cat"), HandleSettings::default())
            .unwrap();
        assert!(handle.is_alive());
        assert!(handle.pid().is_some());

        handle.terminate(Duration::from_secs(2), "test stop").await;
        assert!(!handle.is_alive());
        assert!(handle.client().is_closed());
        assert!(handle.exit_reason().is_some());

        // Second terminate is a no-op.
        handle.terminate(Duration::from_secs(2), "again").await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_check_timestamp() {
        let handle = ServerHandle::spawn("cat", &LaunchSpec::new("cat"), HandleSettings::default())
            .unwrap();
        assert!(handle.last_health_check().is_none());
        handle.mark_health_checked();
        assert!(handle.last_health_check().is_some());
        handle.terminate(Duration::from_secs(1), "done").await;
    }
}
