//! Protocol client — correlated JSON-RPC calls over one child's stdio.
//!
//! Writes are serialized through a mutex on the input stream. A single
//! background reader decodes every output frame and resolves the pending
//! call with the matching correlation id, so many calls can be outstanding
//! at once and responses may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::SupervisorError;
use super::framing::{self, FrameError, FrameRead};
use super::types::{ClientHealth, Inbound, RpcNotification, RpcRequest, RpcResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<Option<BoxedWriter>>>;
type CallResult = Result<Value, SupervisorError>;

// ─── In-flight table ─────────────────────────────────────────────────────────

/// One outstanding call, from send until its response or timeout.
struct PendingCall {
    method: String,
    sent_at: Instant,
    completion: oneshot::Sender<CallResult>,
}

/// Outstanding calls keyed by correlation id.
///
/// Once `closed` is set no new calls are registered; the error is handed to
/// every late arrival.
#[derive(Default)]
struct InFlight {
    calls: HashMap<u64, PendingCall>,
    closed: Option<SupervisorError>,
}

#[derive(Default)]
struct InFlightTable(Mutex<InFlight>);

impl InFlightTable {
    fn lock(&self) -> MutexGuard<'_, InFlight> {
        self.0.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn register(
        &self,
        id: u64,
        method: &str,
        completion: oneshot::Sender<CallResult>,
    ) -> Result<(), SupervisorError> {
        let mut table = self.lock();
        if let Some(err) = &table.closed {
            return Err(err.clone());
        }
        table.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                sent_at: Instant::now(),
                completion,
            },
        );
        Ok(())
    }

    fn take(&self, id: u64) -> Option<PendingCall> {
        self.lock().calls.remove(&id)
    }

    fn len(&self) -> usize {
        self.lock().calls.len()
    }

    /// Close the table and fail every outstanding call with `err`.
    fn fail_all(&self, err: SupervisorError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(err.clone());
            }
            table.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.completion.send(Err(err.clone()));
        }
        count
    }
}

/// Removes the caller's entry when the call ends without a response
/// (timeout, write failure, or the caller's future being dropped).
struct PendingGuard<'a> {
    table: &'a InFlightTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.take(self.id);
    }
}

// ─── Counters ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ClientStats {
    completed: AtomicU64,
    consecutive_timeouts: AtomicU32,
    total_timeouts: AtomicU64,
    malformed_frames: AtomicU64,
    consecutive_malformed: AtomicU64,
    unmatched_responses: AtomicU64,
}

impl ClientStats {
    fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
        self.consecutive_malformed.fetch_add(1, Ordering::Relaxed);
    }
}

// ─── ProtocolClient ──────────────────────────────────────────────────────────

/// Issues requests to one child and matches responses by correlation id.
pub struct ProtocolClient {
    server: String,
    next_id: AtomicU64,
    writer: SharedWriter,
    in_flight: Arc<InFlightTable>,
    stats: Arc<ClientStats>,
    shutting_down: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolClient {
    /// Wrap an input/output stream pair and start the background reader.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<W, R>(server: &str, writer: W, reader: R, max_frame_bytes: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(Box::new(writer))));
        let in_flight = Arc::new(InFlightTable::default());
        let stats = Arc::new(ClientStats::default());
        let shutting_down = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(ReaderContext {
            server: server.to_string(),
            reader: BufReader::new(reader),
            max_frame_bytes,
            writer: Arc::clone(&writer),
            in_flight: Arc::clone(&in_flight),
            stats: Arc::clone(&stats),
            shutting_down: Arc::clone(&shutting_down),
            closed: Arc::clone(&closed),
        }));

        Self {
            server: server.to_string(),
            next_id: AtomicU64::new(1),
            writer,
            in_flight,
            stats,
            shutting_down,
            closed,
            reader: Mutex::new(Some(reader_task)),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Send `method` and wait up to `timeout` for the matching response.
    ///
    /// A timeout abandons only this call; the child and other outstanding
    /// calls are unaffected.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SupervisorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);
        let frame = framing::encode_request(&request)
            .map_err(|e| e.into_supervisor_error(&self.server))?;

        let (tx, rx) = oneshot::channel();
        self.in_flight.register(id, method, tx)?;
        let _guard = PendingGuard {
            table: &self.in_flight,
            id,
        };

        tracing::debug!(server = %self.server, id, method, "sending request");

        // The write runs on its own task so a cancelled caller can never
        // leave half a frame on the stream.
        let write = tokio::spawn(write_frame(
            self.server.clone(),
            Arc::clone(&self.writer),
            frame,
        ));

        let exchange = async {
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(SupervisorError::TransportError {
                        server: self.server.clone(),
                        reason: format!("write task failed: {e}"),
                    })
                }
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(SupervisorError::terminated(
                    &self.server,
                    "response slot dropped",
                )),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                let consecutive = self.stats.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    server = %self.server,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    consecutive,
                    "call timed out"
                );
                Err(SupervisorError::CallTimeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SupervisorError> {
        if self.closed.load(Ordering::Acquire) || self.shutting_down.load(Ordering::Acquire) {
            return Err(SupervisorError::terminated(&self.server, "client is closed"));
        }
        let frame = framing::encode_notification(&RpcNotification::new(method, params))
            .map_err(|e| e.into_supervisor_error(&self.server))?;
        tokio::spawn(write_frame(self.server.clone(), Arc::clone(&self.writer), frame))
            .await
            .map_err(|e| SupervisorError::TransportError {
                server: self.server.clone(),
                reason: format!("write task failed: {e}"),
            })?
    }

    /// Whether the output stream has closed (reader finished).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn health(&self) -> ClientHealth {
        ClientHealth {
            in_flight: self.in_flight.len(),
            completed: self.stats.completed.load(Ordering::Relaxed),
            consecutive_timeouts: self.stats.consecutive_timeouts.load(Ordering::Relaxed),
            total_timeouts: self.stats.total_timeouts.load(Ordering::Relaxed),
            malformed_frames: self.stats.malformed_frames.load(Ordering::Relaxed),
            consecutive_malformed: self.stats.consecutive_malformed.load(Ordering::Relaxed),
            unmatched_responses: self.stats.unmatched_responses.load(Ordering::Relaxed),
        }
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Refuse new calls and fail every outstanding one with `ChildTerminated`.
    ///
    /// Marks the coming end-of-stream as expected so the reader does not
    /// report it as a crash.
    pub fn begin_shutdown(&self, reason: &str) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let failed = self
            .in_flight
            .fail_all(SupervisorError::terminated(&self.server, reason));
        if failed > 0 {
            tracing::debug!(server = %self.server, failed, "failed in-flight calls on shutdown");
        }
        failed
    }

    /// Close the input stream. Gives up after `wait` if a write is stuck.
    pub async fn close_input(&self, wait: Duration) {
        match tokio::time::timeout(wait, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut stream) = writer.take() {
                    let _ = stream.shutdown().await;
                }
            }
            Err(_) => {
                tracing::warn!(server = %self.server, "input stream busy, not closed before terminate");
            }
        }
    }

    /// Wait for the reader to finish, aborting it after `wait`.
    pub async fn join_reader(&self, wait: Duration) {
        let task = self
            .reader
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(wait, &mut task).await.is_err() {
                tracing::debug!(server = %self.server, "reader still running, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("server", &self.server)
            .field("in_flight", &self.in_flight.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_frame(
    server: String,
    writer: SharedWriter,
    frame: Vec<u8>,
) -> Result<(), SupervisorError> {
    let mut guard = writer.lock().await;
    let Some(stream) = guard.as_mut() else {
        return Err(SupervisorError::terminated(&server, "input stream closed"));
    };
    let written = async {
        stream.write_all(&frame).await?;
        stream.flush().await
    }
    .await;
    written.map_err(|e| match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
            SupervisorError::terminated(&server, format!("input stream closed: {e}"))
        }
        _ => SupervisorError::TransportError {
            server: server.clone(),
            reason: format!("failed to write request: {e}"),
        },
    })
}

// ─── Reader ──────────────────────────────────────────────────────────────────

struct ReaderContext<R> {
    server: String,
    reader: BufReader<R>,
    max_frame_bytes: usize,
    writer: SharedWriter,
    in_flight: Arc<InFlightTable>,
    stats: Arc<ClientStats>,
    shutting_down: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

async fn read_loop<R>(mut ctx: ReaderContext<R>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);

    let reason = loop {
        match framing::read_frame(&mut ctx.reader, &mut buf, ctx.max_frame_bytes).await {
            Ok(FrameRead::Frame) => {}
            Ok(FrameRead::Oversized(bytes)) => {
                ctx.stats.record_malformed();
                tracing::warn!(
                    server = %ctx.server,
                    bytes,
                    limit = ctx.max_frame_bytes,
                    "discarding oversized frame"
                );
                continue;
            }
            Ok(FrameRead::Eof) => break "output stream closed".to_string(),
            Err(e) => break format!("output stream read failed: {e}"),
        }

        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match framing::decode(&buf) {
            Ok(Inbound::Response(response)) => ctx.resolve(response),
            Ok(Inbound::ServerMessage { method, id }) => {
                tracing::debug!(
                    server = %ctx.server,
                    method = %method,
                    id = ?id,
                    "ignoring server-initiated message"
                );
            }
            Err(err) => ctx.reject(err),
        }
    };

    ctx.closed.store(true, Ordering::Release);
    if ctx.shutting_down.load(Ordering::Acquire) {
        tracing::debug!(server = %ctx.server, "reader finished after shutdown");
    } else {
        tracing::warn!(server = %ctx.server, reason = %reason, "child output closed unexpectedly");
    }

    let failed = ctx
        .in_flight
        .fail_all(SupervisorError::terminated(&ctx.server, reason));
    if failed > 0 {
        tracing::warn!(server = %ctx.server, failed, "failed outstanding calls");
    }

    // Release stdin as well; nothing can be written to a closed child.
    ctx.writer.lock().await.take();
}

impl<R> ReaderContext<R> {
    fn resolve(&self, response: RpcResponse) {
        let id = response.id;
        match self.in_flight.take(id) {
            Some(call) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                self.stats.consecutive_timeouts.store(0, Ordering::Relaxed);
                self.stats.consecutive_malformed.store(0, Ordering::Relaxed);
                tracing::debug!(
                    server = %self.server,
                    id,
                    method = %call.method,
                    elapsed_ms = call.sent_at.elapsed().as_millis() as u64,
                    "response matched"
                );
                let _ = call.completion.send(response.into_result());
            }
            None => {
                self.stats.unmatched_responses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    server = %self.server,
                    id,
                    "discarding response with unknown correlation id"
                );
            }
        }
    }

    fn reject(&self, err: FrameError) {
        self.stats.record_malformed();
        tracing::warn!(server = %self.server, error = %err, "discarding bad frame");

        if let FrameError::UnexpectedShape { id: Some(id), .. } = &err {
            if let Some(call) = self.in_flight.take(*id) {
                let _ = call
                    .completion
                    .send(Err(err.clone().into_supervisor_error(&self.server)));
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
