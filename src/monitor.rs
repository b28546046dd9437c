/// Session lifecycle: spawn the producer, read its stdout line by line,
/// decode progressively, and post progress and completion envelopes.
///
/// The child is spawned in its own process group (via `process_group(0)`)
/// so termination reaches anything it forked.
use crate::command::CommandLine;
use crate::config::MonitorConfig;
use crate::decode::StreamDecoder;
use crate::dispatch::{
    Dispatcher, Envelope, EnvelopeSender, ProgressSnapshot, SessionId, SessionObserver,
    SessionOutcome, SessionResult,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Lifecycle of one session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Terminated,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Running,
            _ => SessionState::Terminated,
        }
    }
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn advance(&self, to: SessionState) {
        self.0.fetch_max(to as u8, Ordering::AcqRel);
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Set-once cancellation flag with a wakeup for the reader, plus a second
/// flag that cuts shutdown short.
#[derive(Debug, Default)]
struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
    force: AtomicBool,
    force_notify: Notify,
}

impl CancelSignal {
    /// Returns true only for the call that actually flipped the flag.
    fn cancel(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::AcqRel);
        if first {
            // Stores a permit if the reader is not waiting yet.
            self.notify.notify_one();
        }
        first
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }

    fn force(&self) -> bool {
        self.cancel();
        let first = !self.force.swap(true, Ordering::AcqRel);
        if first {
            self.force_notify.notify_one();
        }
        first
    }

    fn is_forced(&self) -> bool {
        self.force.load(Ordering::Acquire)
    }

    async fn forced(&self) {
        while !self.is_forced() {
            self.force_notify.notified().await;
        }
    }
}

/// Caller's handle on a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    cancel: Arc<CancelSignal>,
    state: Arc<StateCell>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Ask the reader to stop. Idempotent; returns true on the first call.
    ///
    /// The child is not guaranteed to have exited when this returns; the
    /// session's completion event confirms it.
    pub fn cancel(&self) -> bool {
        let first = self.cancel.cancel();
        if first {
            tracing::info!(session = %self.id, "cancellation requested");
        }
        first
    }

    /// Cancel and skip the grace steps: the process group is sent SIGKILL
    /// as soon as the reader stops. Returns true on the first call.
    pub fn kill(&self) -> bool {
        let first = self.cancel.force();
        if first {
            tracing::info!(session = %self.id, "kill requested");
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }
}

/// Starts supervised sessions and routes their events to a `Dispatcher`.
pub struct ProcessStreamMonitor {
    tx: EnvelopeSender,
    config: MonitorConfig,
    next_id: AtomicU64,
}

impl ProcessStreamMonitor {
    /// Create a monitor and the dispatcher its sessions deliver through.
    pub fn new(config: MonitorConfig) -> (Self, Dispatcher) {
        let (tx, dispatcher) = Dispatcher::channel();
        let monitor = Self {
            tx,
            config,
            next_id: AtomicU64::new(1),
        };
        (monitor, dispatcher)
    }

    /// Launch `command` in the background and supervise it.
    ///
    /// Never fails synchronously: a launch error arrives as the session's
    /// completion. Must be called from within a Tokio runtime.
    pub fn start<O>(&self, command: CommandLine, observer: O) -> SessionHandle
    where
        O: SessionObserver + 'static,
    {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = SessionHandle {
            id,
            cancel: Arc::new(CancelSignal::default()),
            state: Arc::new(StateCell::default()),
        };

        if self
            .tx
            .send(Envelope::Attach {
                session: id,
                observer: Box::new(observer),
            })
            .is_err()
        {
            tracing::warn!(session = %id, "dispatcher dropped, events will be discarded");
        }

        let session = Session {
            id,
            command,
            cancel: Arc::clone(&handle.cancel),
            state: Arc::clone(&handle.state),
            config: self.config.clone(),
            tx: self.tx.clone(),
        };
        tokio::spawn(session.run());

        handle
    }
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    EndOfStream,
    Cancelled,
    ReadFailed,
}

/// Everything the background task owns for one run.
struct Session {
    id: SessionId,
    command: CommandLine,
    cancel: Arc<CancelSignal>,
    state: Arc<StateCell>,
    config: MonitorConfig,
    tx: EnvelopeSender,
}

impl Session {
    async fn run(self) {
        let started_at = Utc::now();
        let start = Instant::now();
        let grace = self.config.grace();

        let mut cmd = Command::new(self.command.program());
        cmd.args(self.command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::info!(
            session = %self.id,
            command = %self.command,
            "spawning monitored process"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.finish(SessionResult {
                    session: self.id,
                    outcome: SessionOutcome::LaunchFailed(e),
                    cancelled: self.cancel.is_cancelled(),
                    exit_code: None,
                    pid: None,
                    started_at,
                    duration: start.elapsed(),
                    stderr_tail: Vec::new(),
                });
                return;
            }
        };

        let pid = child.id();
        self.state.advance(SessionState::Running);
        tracing::info!(session = %self.id, pid = ?pid, "monitored process started");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            // Both are piped above, so this is unreachable in practice.
            let e = std::io::Error::other("child stdio not captured");
            self.finish(SessionResult {
                session: self.id,
                outcome: SessionOutcome::LaunchFailed(e),
                cancelled: self.cancel.is_cancelled(),
                exit_code: None,
                pid,
                started_at,
                duration: start.elapsed(),
                stderr_tail: Vec::new(),
            });
            return;
        };

        let mut drain = tokio::spawn(drain_stderr(
            stderr,
            self.id,
            self.config.stderr_tail_lines,
        ));

        let mut decoder = StreamDecoder::new(self.config.progress_field.as_str());
        let exit = self.read_loop(stdout, &mut decoder).await;
        tracing::debug!(session = %self.id, ?exit, bytes = decoder.len(), "read loop finished");

        let terminate = exit != LoopExit::EndOfStream;
        let exit_code =
            shutdown_child(&mut child, terminate, grace, &self.cancel, self.id).await;

        let stderr_tail = match timeout(grace, &mut drain).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(e)) => {
                tracing::warn!(session = %self.id, error = %e, "stderr drain task failed");
                Vec::new()
            }
            Err(_) => {
                tracing::debug!(session = %self.id, "stderr still open after grace, abandoning");
                drain.abort();
                Vec::new()
            }
        };
        drop(child);

        let outcome = match decoder.finish() {
            Ok(doc) => SessionOutcome::Completed(doc),
            Err(e) => SessionOutcome::DecodeFailed(e),
        };

        self.finish(SessionResult {
            session: self.id,
            outcome,
            cancelled: exit == LoopExit::Cancelled,
            exit_code,
            pid,
            started_at,
            duration: start.elapsed(),
            stderr_tail,
        });
    }

    /// Read stdout until end-of-stream or cancellation, whichever comes first.
    async fn read_loop<R>(&self, stdout: R, decoder: &mut StreamDecoder) -> LoopExit
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::with_capacity(1024);
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // `read_until` may have consumed bytes without reaching a newline.
                    if !line.is_empty() {
                        self.accept_line(decoder, &line, &mut sequence);
                    }
                    return LoopExit::Cancelled;
                }
                read = reader.read_until(b'\n', &mut line) => match read {
                    Ok(0) => return LoopExit::EndOfStream,
                    Ok(_) => {
                        self.accept_line(decoder, &line, &mut sequence);
                        line.clear();
                    }
                    Err(e) => {
                        tracing::warn!(session = %self.id, error = %e, "failed to read stdout");
                        return LoopExit::ReadFailed;
                    }
                },
            }
        }
    }

    /// Feed one line to the decoder and post a snapshot if it produced one.
    fn accept_line(&self, decoder: &mut StreamDecoder, line: &[u8], sequence: &mut u64) {
        let Some(records) = decoder.push_line(&String::from_utf8_lossy(line)) else {
            return;
        };
        *sequence += 1;
        tracing::debug!(
            session = %self.id,
            sequence = *sequence,
            records = records.len(),
            "progress snapshot"
        );
        self.post(Envelope::Progress(ProgressSnapshot {
            session: self.id,
            sequence: *sequence,
            records,
        }));
    }

    fn post(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            tracing::debug!(session = %self.id, "dispatcher gone, event discarded");
        }
    }

    fn finish(&self, result: SessionResult) {
        self.state.advance(SessionState::Terminated);
        match &result.outcome {
            SessionOutcome::Completed(_) => tracing::info!(
                session = %self.id,
                exit_code = ?result.exit_code,
                cancelled = result.cancelled,
                duration_ms = result.duration.as_millis() as u64,
                "session completed"
            ),
            SessionOutcome::DecodeFailed(e) => tracing::warn!(
                session = %self.id,
                exit_code = ?result.exit_code,
                cancelled = result.cancelled,
                error = %e,
                "session ended without a complete document"
            ),
            SessionOutcome::LaunchFailed(e) => tracing::warn!(
                session = %self.id,
                error = %e,
                "session failed to launch"
            ),
        }
        self.post(Envelope::Complete(result));
    }
}

/// Read stderr to the end so a chatty child never blocks on a full pipe.
async fn drain_stderr<R>(stderr: R, session: SessionId, keep: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(keep.min(64));

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                tracing::debug!(%session, line = %line, "stderr");
                if keep == 0 {
                    continue;
                }
                if tail.len() == keep {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                tracing::debug!(%session, error = %e, "stderr read failed");
                break;
            }
        }
    }

    tail.into()
}

/// Bring the child down within bounded time and report its exit code.
///
/// After a clean end-of-stream the child is normally already exiting, so it
/// gets `grace` to do so. Otherwise, or if it lingers, its process group is
/// sent SIGTERM and given `grace` again, then SIGKILL and one last `grace`
/// to be reaped. A forced cancel skips straight to SIGKILL.
async fn shutdown_child(
    child: &mut Child,
    terminate: bool,
    grace: Duration,
    signal: &CancelSignal,
    session: SessionId,
) -> Option<i32> {
    // Gone once the child is reaped, so keep it for the group signals.
    let pid = child.id();

    if !terminate {
        match settle(child, grace, signal).await {
            Some(Ok(status)) => return status.code(),
            Some(Err(e)) => {
                tracing::warn!(%session, error = %e, "failed to wait for child");
                return None;
            }
            None => tracing::debug!(%session, "child still running after end of output"),
        }
    }

    match child.try_wait() {
        Ok(Some(status)) => return status.code(),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(%session, error = %e, "failed to poll child status");
            return None;
        }
    }

    if !signal.is_forced() {
        request_terminate(child, pid, session);
        match settle(child, grace, signal).await {
            Some(Ok(status)) => {
                // Members of the group that ignored SIGTERM outlive the leader.
                kill_group(child, pid, session);
                return status.code();
            }
            Some(Err(e)) => {
                tracing::warn!(%session, error = %e, "failed to wait for child");
                kill_group(child, pid, session);
                return None;
            }
            None => tracing::warn!(
                %session,
                grace_ms = grace.as_millis() as u64,
                forced = signal.is_forced(),
                "child still running after SIGTERM, killing"
            ),
        }
    }

    kill_group(child, pid, session);
    if timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(%session, "child not reaped after SIGKILL");
    }
    None
}

/// Wait up to `grace` for the child to exit. None if it is still running
/// when the grace runs out or a forced cancel arrives.
async fn settle(
    child: &mut Child,
    grace: Duration,
    signal: &CancelSignal,
) -> Option<std::io::Result<std::process::ExitStatus>> {
    tokio::select! {
        biased;
        _ = signal.forced() => None,
        waited = timeout(grace, child.wait()) => waited.ok(),
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child, pid: Option<u32>, session: SessionId) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    tracing::debug!(%session, pid, "sending SIGTERM to process group");
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(%session, pid, error = %e, "SIGTERM failed, killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child, _pid: Option<u32>, session: SessionId) {
    tracing::debug!(%session, "killing child");
    if let Err(e) = child.start_kill() {
        tracing::warn!(%session, error = %e, "failed to kill child");
    }
}

/// SIGKILL everything left in the child's process group.
#[cfg(unix)]
fn kill_group(child: &mut Child, pid: Option<u32>, session: SessionId) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(%session, pid, "sent SIGKILL to process group"),
        // Nothing left in the group.
        Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(%session, pid, error = %e, "failed to kill process group");
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child, _pid: Option<u32>, session: SessionId) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(%session, error = %e, "failed to kill child");
    }
}
