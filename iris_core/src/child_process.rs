//! # One Live Assistant Process
//!
//! `ChildProcess` adapts a single OS child into a reliable, ordered
//! request/response endpoint:
//!
//! * **Spawn**: the assistant command runs with `cwd = team.path` and the
//!   session context passed through `IRIS_SESSION_ID` / `IRIS_FROM_TEAM`.
//! * **Framing**: exactly one JSON object per line in both directions.
//!   Stdout lines are classified by their `type` discriminator — `reply`
//!   completes the inflight request, any other well-formed object is a
//!   progress frame, and unparseable lines go verbatim to the output
//!   cache. All of stderr goes to the cache.
//! * **Queue**: strict FIFO with a single inflight request. A queued
//!   request can be cancelled synchronously before any byte reaches the
//!   child; cancelling the inflight request writes an interrupt frame and
//!   escalates to termination if the child does not settle within the
//!   grace window.
//! * **Teardown**: graceful termination writes a shutdown frame and hard
//!   kills after a grace period; force termination kills immediately.
//!   Either way every outstanding request fails with `ProcessTerminated`
//!   and the count is surfaced as `lost_messages`.
//!
//! A stopped process is never resurrected. The pool creates a fresh
//! instance on the next wake; the output cache survives on the old entry
//! for post-mortem reporting until then.

use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::VecDeque,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{Mutex, Notify, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    constants::{INTERRUPT_GRACE, TERMINATE_GRACE},
    error::{OrchestratorError, Result},
    output_cache::OutputCache,
};

/// Lifecycle of a child. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessStatus {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    Terminating = 3,
    Stopped = 4,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Stopped)
    }

    /// Live means the entry still owns a running OS process.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProcessStatus::Starting,
            1 => ProcessStatus::Idle,
            2 => ProcessStatus::Busy,
            3 => ProcessStatus::Terminating,
            _ => ProcessStatus::Stopped,
        }
    }
}

/// Everything needed to start an assistant for one team.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub team: String,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    pub session_id: String,
    pub from_team: Option<String>,
    pub skip_permissions: bool,
    pub session_init_timeout: Duration,
}

/// Point-in-time metrics for one child.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub pid: Option<u32>,
    pub session_id: String,
    pub status: ProcessStatus,
    pub message_count: u64,
    pub uptime_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub queued: usize,
}

/// Outcome of a `terminate` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationReport {
    pub team: String,
    pub lost_messages: usize,
    pub forced: bool,
}

#[derive(Debug)]
enum Frame {
    Ready,
    Reply(Value),
    Progress(Value),
    Unstructured(String),
}

fn classify_frame(line: &str) -> Frame {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => match value.get("type").and_then(Value::as_str) {
            Some("ready") => Frame::Ready,
            Some("reply") => Frame::Reply(value),
            _ => Frame::Progress(value),
        },
        Err(_) => Frame::Unstructured(line.to_string()),
    }
}

#[derive(Debug, Clone, Copy)]
enum CancelReason {
    Cancelled,
    Timeout { elapsed: Duration },
}

impl CancelReason {
    fn error(self) -> OrchestratorError {
        match self {
            CancelReason::Cancelled => OrchestratorError::Cancelled,
            CancelReason::Timeout { elapsed } => OrchestratorError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
            },
        }
    }
}

struct QueuedRequest {
    id: Uuid,
    frame: Value,
    tx: oneshot::Sender<Result<Value>>,
    cancel: CancellationToken,
}

struct InflightRequest {
    id: Uuid,
    /// Taken when the waiter has already been resolved (cancel/timeout);
    /// the slot stays occupied so the eventual reply cannot complete a
    /// later request out of order.
    tx: Option<oneshot::Sender<Result<Value>>>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<QueuedRequest>,
    inflight: Option<InflightRequest>,
}

struct ProcessInner {
    team: String,
    pid: Option<u32>,
    spawned_at: Instant,
    status: AtomicU8,
    state: Mutex<QueueState>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    dispatch: Notify,
    /// Cancelled once the child has signalled readiness.
    ready: CancellationToken,
    /// Cancelled once the process reaches `Stopped`.
    shutdown: CancellationToken,
    cache: Arc<OutputCache>,
    last_activity_ms: AtomicU64,
    message_count: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl std::fmt::Debug for ProcessInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInner")
            .field("team", &self.team)
            .field("pid", &self.pid)
            .field("status", &self.status_snapshot())
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        // Last line of defence against leaked OS children.
        if let Ok(mut guard) = self.child.try_lock()
            && let Some(child) = guard.as_mut()
        {
            let _ = child.start_kill();
        }
    }
}

impl ProcessInner {
    fn status_snapshot(&self) -> ProcessStatus {
        ProcessStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ProcessStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.spawned_at.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.spawned_at.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    async fn write_frame(&self, frame: &Value) -> std::io::Result<usize> {
        let mut line = serde_json::to_string(frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stdin closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(line.len())
    }

    async fn promote_ready(&self) {
        let _st = self.state.lock().await;
        if self.status_snapshot() == ProcessStatus::Starting {
            self.set_status(ProcessStatus::Idle);
            tracing::debug!("Child for team '{}' is ready", self.team);
        }
        drop(_st);
        self.dispatch.notify_one();
    }

    /// Pop and dispatch the next request if the child is idle.
    /// Returns false when there is nothing further to do right now.
    async fn dispatch_next(&self) -> bool {
        let (id, frame) = {
            let mut st = self.state.lock().await;
            if self.status_snapshot() != ProcessStatus::Idle || st.inflight.is_some() {
                return false;
            }
            loop {
                match st.queue.pop_front() {
                    None => return false,
                    Some(req) if req.cancel.is_cancelled() => {
                        let _ = req.tx.send(Err(OrchestratorError::Cancelled));
                    }
                    Some(req) => {
                        st.inflight = Some(InflightRequest {
                            id: req.id,
                            tx: Some(req.tx),
                        });
                        self.set_status(ProcessStatus::Busy);
                        break (req.id, req.frame);
                    }
                }
            }
        };

        match self.write_frame(&frame).await {
            Ok(n) => {
                self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                self.message_count.fetch_add(1, Ordering::Relaxed);
                self.touch();
                tracing::debug!("Dispatched request {} to team '{}'", id, self.team);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Write to child for team '{}' failed ({}); tearing down",
                    self.team,
                    e
                );
                self.handle_exit(true).await;
                false
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        match classify_frame(line) {
            Frame::Ready => {
                self.ready.cancel();
                self.promote_ready().await;
            }
            Frame::Reply(value) => self.complete_inflight(value).await,
            Frame::Progress(value) => {
                tracing::debug!(
                    "Progress frame from team '{}': {}",
                    self.team,
                    value.get("type").and_then(serde_json::Value::as_str).unwrap_or("?")
                );
            }
            Frame::Unstructured(text) => {
                let mut bytes = text.into_bytes();
                bytes.push(b'\n');
                self.cache.append_stdout(&bytes).await;
            }
        }
    }

    async fn complete_inflight(&self, value: Value) {
        let resolved = {
            let mut st = self.state.lock().await;
            match st.inflight.take() {
                Some(inflight) => {
                    if !self.status_snapshot().is_terminal()
                        && self.status_snapshot() != ProcessStatus::Terminating
                    {
                        self.set_status(ProcessStatus::Idle);
                    }
                    self.touch();
                    Some(inflight)
                }
                None => None,
            }
        };

        match resolved {
            Some(inflight) => match inflight.tx {
                Some(tx) => {
                    let _ = tx.send(Ok(value));
                }
                None => {
                    tracing::debug!(
                        "Reply for interrupted request {} from team '{}' dropped",
                        inflight.id,
                        self.team
                    );
                }
            },
            None => {
                tracing::warn!(
                    "Spurious reply with no inflight request from team '{}'; dropped",
                    self.team
                );
            }
        }
        self.dispatch.notify_one();
    }

    /// Fail every queued and inflight request. Returns how many were lost.
    async fn fail_all(&self) -> usize {
        let mut st = self.state.lock().await;
        let mut lost = 0;
        if let Some(inflight) = st.inflight.take() {
            if let Some(tx) = inflight.tx {
                let _ = tx.send(Err(OrchestratorError::ProcessTerminated { lost_messages: 1 }));
                lost += 1;
            }
        }
        while let Some(req) = st.queue.pop_front() {
            let _ = req
                .tx
                .send(Err(OrchestratorError::ProcessTerminated { lost_messages: 1 }));
            lost += 1;
        }
        lost
    }

    /// Process exit path, expected or not. Idempotent.
    async fn handle_exit(&self, kill: bool) {
        let previous = self.status_snapshot();
        if previous == ProcessStatus::Stopped {
            return;
        }

        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                if kill {
                    let _ = child.start_kill();
                }
                let _ = child.wait().await;
            }
        }

        let lost = self.fail_all().await;
        self.set_status(ProcessStatus::Stopped);
        self.shutdown.cancel();
        self.dispatch.notify_waiters();

        if previous != ProcessStatus::Terminating {
            tracing::warn!(
                "Child for team '{}' exited unexpectedly ({} request(s) lost); cache retained for report",
                self.team,
                lost
            );
        }
    }

    async fn cancel_request(self: Arc<Self>, id: Option<Uuid>, reason: CancelReason) -> bool {
        let interrupted = {
            let mut st = self.state.lock().await;
            if let Some(id) = id
                && let Some(pos) = st.queue.iter().position(|r| r.id == id)
            {
                let req = st.queue.remove(pos).expect("position just found");
                req.cancel.cancel();
                let _ = req.tx.send(Err(reason.error()));
                tracing::debug!("Cancelled queued request {} for team '{}'", id, self.team);
                return true;
            }
            match st.inflight.as_mut() {
                Some(inflight) if id.is_none() || id == Some(inflight.id) => {
                    if let Some(tx) = inflight.tx.take() {
                        let _ = tx.send(Err(reason.error()));
                    }
                    inflight.id
                }
                _ => return false,
            }
        };

        tracing::info!(
            "Interrupting inflight request {} for team '{}'",
            interrupted,
            self.team
        );
        if let Err(e) = self.write_frame(&json!({ "type": "interrupt" })).await {
            tracing::warn!(
                "Interrupt frame for team '{}' failed ({}); terminating",
                self.team,
                e
            );
            self.handle_exit(true).await;
            return true;
        }

        // Escalate if the child does not settle within the grace window.
        let inner = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(INTERRUPT_GRACE).await;
            let stuck = {
                let st = inner.state.lock().await;
                matches!(&st.inflight, Some(inflight) if inflight.id == interrupted)
            };
            if stuck {
                tracing::warn!(
                    "Team '{}' ignored interrupt for {:?}; forcing termination",
                    inner.team,
                    INTERRUPT_GRACE
                );
                inner.terminate_inner(true).await;
            }
        });
        true
    }

    async fn terminate_inner(&self, force: bool) -> TerminationReport {
        let lost = {
            let st = self.state.lock().await;
            let status = self.status_snapshot();
            if status == ProcessStatus::Stopped || status == ProcessStatus::Terminating {
                return TerminationReport {
                    team: self.team.clone(),
                    lost_messages: 0,
                    forced: force,
                };
            }
            self.set_status(ProcessStatus::Terminating);
            drop(st);
            self.fail_all().await
        };

        if force {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        } else {
            let _ = self.write_frame(&json!({ "type": "shutdown" })).await;
            let exited = {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => timeout(TERMINATE_GRACE, child.wait()).await.is_ok(),
                    None => true,
                }
            };
            if !exited {
                tracing::warn!(
                    "Team '{}' did not exit within {:?}; killing",
                    self.team,
                    TERMINATE_GRACE
                );
                let mut guard = self.child.lock().await;
                if let Some(child) = guard.as_mut() {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.set_status(ProcessStatus::Stopped);
        self.shutdown.cancel();
        self.dispatch.notify_waiters();
        tracing::info!(
            "Terminated child for team '{}' (forced: {}, lost: {})",
            self.team,
            force,
            lost
        );
        TerminationReport {
            team: self.team.clone(),
            lost_messages: lost,
            forced: force,
        }
    }
}

/// Handle to one submitted request.
///
/// Dropping the handle abandons the wait but leaves the request queued;
/// use [`RequestHandle::await_reply`] or cancel through the process.
pub struct RequestHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<Value>>,
    deadline: Option<Duration>,
    inner: Arc<ProcessInner>,
}

impl RequestHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the reply, honouring the deadline. A deadline expiry
    /// cancels the request (interrupting it if already inflight) and
    /// surfaces as `Timeout`.
    pub async fn await_reply(self) -> Result<Value> {
        let RequestHandle {
            id,
            mut rx,
            deadline,
            inner,
        } = self;

        let expiry = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = &mut rx => match res {
                Ok(outcome) => outcome,
                // Sender dropped without resolution: the process died mid-teardown.
                Err(_) => Err(OrchestratorError::ProcessTerminated { lost_messages: 1 }),
            },
            _ = expiry => {
                let elapsed = deadline.unwrap_or_default();
                inner
                    .cancel_request(Some(id), CancelReason::Timeout { elapsed })
                    .await;
                Err(OrchestratorError::Timeout { elapsed_ms: elapsed.as_millis() as u64 })
            }
        }
    }
}

/// One live assistant child for a team.
#[derive(Debug)]
pub struct ChildProcess {
    team: String,
    session_id: String,
    from_team: Option<String>,
    cache: Arc<OutputCache>,
    inner: Arc<ProcessInner>,
}

impl ChildProcess {
    /// Spawn the assistant and install the I/O loops.
    pub async fn start(spec: SpawnSpec) -> Result<Self> {
        let SpawnSpec {
            team,
            cwd,
            command,
            session_id,
            from_team,
            skip_permissions,
            session_init_timeout,
        } = spec;

        if command.is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "team '{}' has an empty assistant command",
                team
            )));
        }

        tracing::debug!(
            "Spawning assistant for team '{}' in {:?}: {:?}",
            team,
            cwd,
            command
        );

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(&cwd)
            .env("IRIS_SESSION_ID", &session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(from) = &from_team {
            cmd.env("IRIS_FROM_TEAM", from);
        }
        if skip_permissions {
            cmd.env("IRIS_SKIP_PERMISSIONS", "1");
        }

        let mut child = cmd.spawn().map_err(|e| OrchestratorError::Spawn {
            team: team.clone(),
            source: e,
        })?;

        let broken_pipe = |what: &str| OrchestratorError::Spawn {
            team: team.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("failed to get child {}", what),
            ),
        };
        let stdin = child.stdin.take().ok_or_else(|| broken_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| broken_pipe("stderr"))?;
        let pid = child.id();

        let cache = Arc::new(OutputCache::new(team.clone()));
        let inner = Arc::new(ProcessInner {
            team: team.clone(),
            pid,
            spawned_at: Instant::now(),
            status: AtomicU8::new(ProcessStatus::Starting as u8),
            state: Mutex::new(QueueState::default()),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            dispatch: Notify::new(),
            ready: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            cache: Arc::clone(&cache),
            last_activity_ms: AtomicU64::new(0),
            message_count: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });

        // Stdout reader: framing, classification, exit detection.
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(n) => {
                            inner.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                            inner.handle_line(line.trim_end_matches(['\n', '\r'])).await;
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Error reading stdout of team '{}': {}",
                                inner.team,
                                e
                            );
                            break;
                        }
                    }
                }
                inner.handle_exit(false).await;
            });
        }

        // Stderr reader: free-form text straight into the cache.
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(n) => {
                            inner.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                            inner.cache.append_stderr(line.as_bytes()).await;
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        // Dispatcher: pops the queue whenever the child is idle.
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.dispatch.notified() => {}
                        _ = inner.shutdown.cancelled() => break,
                    }
                    while inner.dispatch_next().await {}
                }
            });
        }

        // Readiness: promoted by an explicit ready frame, or implicitly
        // once the init window has elapsed.
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = inner.ready.cancelled() => {}
                    _ = tokio::time::sleep(session_init_timeout) => {
                        tracing::debug!(
                            "Team '{}' sent no ready frame within {:?}; assuming ready",
                            inner.team,
                            session_init_timeout
                        );
                    }
                    _ = inner.shutdown.cancelled() => return,
                }
                inner.promote_ready().await;
            });
        }

        inner.touch();
        tracing::info!(
            "Spawned assistant for team '{}' (pid {:?}, session {})",
            team,
            pid,
            session_id
        );

        Ok(Self {
            team,
            session_id,
            from_team,
            cache,
            inner,
        })
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.status_snapshot()
    }

    pub fn cache(&self) -> Arc<OutputCache> {
        Arc::clone(&self.cache)
    }

    /// Time since the last dispatch, reply or spawn.
    pub fn idle_for(&self) -> Duration {
        self.inner.idle_for()
    }

    /// Enqueue one request. FIFO order is preserved; the frame reaches the
    /// child only when it is at the head of the queue and the child is idle.
    pub async fn submit(&self, content: Value, deadline: Option<Duration>) -> Result<RequestHandle> {
        let id = Uuid::new_v4();
        let frame = json!({
            "type": "request",
            "id": id,
            "from": self.from_team,
            "content": content,
        });
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        {
            let mut st = self.inner.state.lock().await;
            let status = self.inner.status_snapshot();
            if status == ProcessStatus::Stopped || status == ProcessStatus::Terminating {
                return Err(OrchestratorError::ProcessTerminated { lost_messages: 0 });
            }
            st.queue.push_back(QueuedRequest {
                id,
                frame,
                tx,
                cancel,
            });
        }
        self.inner.dispatch.notify_one();

        Ok(RequestHandle {
            id,
            rx,
            deadline,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Cancel a request by id, or the current inflight request when no id
    /// is given. Returns false if nothing matched.
    pub async fn cancel(&self, id: Option<Uuid>) -> bool {
        Arc::clone(&self.inner)
            .cancel_request(id, CancelReason::Cancelled)
            .await
    }

    /// Terminate the child. Graceful mode writes a shutdown frame and
    /// waits out the grace period before killing.
    pub async fn terminate(&self, force: bool) -> TerminationReport {
        self.inner.terminate_inner(force).await
    }

    pub async fn metrics(&self) -> ProcessMetrics {
        let queued = self.inner.state.lock().await.queue.len();
        ProcessMetrics {
            pid: self.inner.pid,
            session_id: self.session_id.clone(),
            status: self.status(),
            message_count: self.inner.message_count.load(Ordering::Relaxed),
            uptime_ms: self.inner.spawned_at.elapsed().as_millis() as u64,
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::logging::init_test_logging;

    /// A scripted assistant speaking the line protocol: announces
    /// readiness, replies "pong" to every request, exits on shutdown.
    fn pong_spec(reply_delay_secs: u32) -> SpawnSpec {
        let script = format!(
            r#"echo '{{"type":"ready"}}'
while IFS= read -r line; do
  case "$line" in
    *'"interrupt"'*) : ;;
    *'"shutdown"'*) exit 0 ;;
    *) sleep {delay}; printf '{{"type":"reply","content":"pong"}}\n' ;;
  esac
done"#,
            delay = reply_delay_secs
        );
        SpawnSpec {
            team: "alpha".to_string(),
            cwd: std::env::temp_dir(),
            command: vec!["bash".to_string(), "-c".to_string(), script],
            session_id: Uuid::new_v4().to_string(),
            from_team: None,
            skip_permissions: false,
            session_init_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn tell_round_trip_increments_message_count() {
        init_test_logging();
        let proc = ChildProcess::start(pong_spec(0)).await.unwrap();
        let handle = proc
            .submit(json!("ping"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let reply = handle.await_reply().await.unwrap();
        assert_eq!(reply["content"], "pong");
        let metrics = proc.metrics().await;
        assert_eq!(metrics.message_count, 1);
        assert_eq!(metrics.status, ProcessStatus::Idle);
        proc.terminate(true).await;
    }

    #[tokio::test]
    async fn replies_preserve_submission_order() {
        init_test_logging();
        let proc = ChildProcess::start(pong_spec(0)).await.unwrap();
        let first = proc.submit(json!("one"), None).await.unwrap();
        let second = proc.submit(json!("two"), None).await.unwrap();
        assert!(first.await_reply().await.is_ok());
        assert!(second.await_reply().await.is_ok());
        assert_eq!(proc.metrics().await.message_count, 2);
        proc.terminate(true).await;
    }

    #[tokio::test]
    async fn cancelling_queued_request_delivers_no_bytes() {
        init_test_logging();
        let proc = ChildProcess::start(pong_spec(1)).await.unwrap();
        let first = proc.submit(json!("slow"), None).await.unwrap();
        let second = proc.submit(json!("never"), None).await.unwrap();
        let second_id = second.id();

        assert!(proc.cancel(Some(second_id)).await);
        let err = second.await_reply().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));

        // The first request still completes; only one frame ever reached
        // the child.
        assert!(first.await_reply().await.is_ok());
        assert_eq!(proc.metrics().await.message_count, 1);
        proc.terminate(true).await;
    }

    #[tokio::test]
    async fn force_terminate_fails_outstanding_requests() {
        init_test_logging();
        let proc = ChildProcess::start(pong_spec(30)).await.unwrap();
        let handles = vec![
            proc.submit(json!("a"), None).await.unwrap(),
            proc.submit(json!("b"), None).await.unwrap(),
            proc.submit(json!("c"), None).await.unwrap(),
        ];
        // Let the first request reach the child so one is inflight.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = proc.terminate(true).await;
        assert_eq!(report.lost_messages, 3);
        assert_eq!(proc.status(), ProcessStatus::Stopped);

        for handle in handles {
            let err = handle.await_reply().await.unwrap_err();
            assert!(matches!(
                err,
                OrchestratorError::ProcessTerminated { .. }
            ));
        }
    }

    #[tokio::test]
    async fn unparseable_stdout_lands_in_cache() {
        init_test_logging();
        let script = r#"echo 'not json at all'
echo '{"type":"ready"}'
while IFS= read -r line; do :; done"#;
        let spec = SpawnSpec {
            command: vec!["bash".to_string(), "-c".to_string(), script.to_string()],
            ..pong_spec(0)
        };
        let proc = ChildProcess::start(spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = proc.cache().snapshot().await;
        assert!(snapshot.stdout.contains("not json at all"));
        proc.terminate(true).await;
    }

    #[tokio::test]
    async fn unexpected_exit_stops_and_fails_inflight() {
        init_test_logging();
        let script = r#"echo '{"type":"ready"}'
read -r line
exit 7"#;
        let spec = SpawnSpec {
            command: vec!["bash".to_string(), "-c".to_string(), script.to_string()],
            ..pong_spec(0)
        };
        let proc = ChildProcess::start(spec).await.unwrap();
        let handle = proc.submit(json!("boom"), None).await.unwrap();
        let err = handle.await_reply().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ProcessTerminated { .. }));
        assert_eq!(proc.status(), ProcessStatus::Stopped);

        // A dead child accepts no further submissions.
        assert!(proc.submit(json!("again"), None).await.is_err());
    }

    #[test]
    fn frame_classification() {
        assert!(matches!(classify_frame(r#"{"type":"ready"}"#), Frame::Ready));
        assert!(matches!(
            classify_frame(r#"{"type":"reply","content":"x"}"#),
            Frame::Reply(_)
        ));
        assert!(matches!(
            classify_frame(r#"{"type":"thinking"}"#),
            Frame::Progress(_)
        ));
        assert!(matches!(
            classify_frame(r#"{"no":"discriminator"}"#),
            Frame::Progress(_)
        ));
        assert!(matches!(classify_frame("plain text"), Frame::Unstructured(_)));
    }
}
