/// Observer capabilities and the dispatcher that delivers session events.
///
/// Reader tasks never call observers. They post envelopes onto one FIFO
/// channel and the `Dispatcher`, driven by the caller's own task or UI tick,
/// invokes `on_progress` / `on_complete` one at a time. Observer state is
/// therefore only ever touched from a single execution context.
use crate::decode::DecodeError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

/// Completions remembered for a later `run_until_complete` call.
const REMEMBERED_COMPLETIONS: usize = 256;

/// Identifies one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Full progress array decoded from the accumulator at one point in time.
///
/// Each snapshot supersedes the previous one; `records` is never a delta.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub session: SessionId,
    /// 1-based, increases by one per snapshot within a session.
    pub sequence: u64,
    pub records: Vec<Value>,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The accumulated output decoded as a complete document.
    Completed(Value),
    /// The stream ended (or was cancelled) without a complete document.
    DecodeFailed(DecodeError),
    /// The child process could not be created.
    LaunchFailed(std::io::Error),
}

/// Terminal event of a session. Exactly one is delivered per session.
#[derive(Debug)]
pub struct SessionResult {
    pub session: SessionId,
    pub outcome: SessionOutcome,
    /// Cancellation was requested before the stream ended.
    pub cancelled: bool,
    /// None if the child never started, was killed by a signal, or did not
    /// exit within the grace period.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Last lines the child wrote to stderr.
    pub stderr_tail: Vec<String>,
}

impl SessionResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Completed(_))
    }

    /// The decoded document, if the session completed.
    pub fn document(&self) -> Option<&Value> {
        match &self.outcome {
            SessionOutcome::Completed(doc) => Some(doc),
            _ => None,
        }
    }

    /// Human-readable failure, if the session did not complete.
    pub fn failure(&self) -> Option<String> {
        match &self.outcome {
            SessionOutcome::Completed(_) => None,
            SessionOutcome::DecodeFailed(e) => Some(e.to_string()),
            SessionOutcome::LaunchFailed(e) => Some(format!("failed to launch: {e}")),
        }
    }
}

/// Consumer of session events. Invoked only by a `Dispatcher`.
pub trait SessionObserver: Send {
    fn on_progress(&mut self, snapshot: &ProgressSnapshot);

    /// Last call for this session; the observer is dropped afterwards.
    fn on_complete(&mut self, result: SessionResult);
}

pub(crate) enum Envelope {
    Attach {
        session: SessionId,
        observer: Box<dyn SessionObserver>,
    },
    Progress(ProgressSnapshot),
    Complete(SessionResult),
}

pub(crate) type EnvelopeSender = mpsc::UnboundedSender<Envelope>;

/// Delivers queued session events to their observers, in order.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Envelope>,
    observers: HashMap<SessionId, Box<dyn SessionObserver>>,
    /// Completed sessions nobody has waited on yet, oldest first.
    completed: VecDeque<SessionId>,
}

impl Dispatcher {
    pub(crate) fn channel() -> (EnvelopeSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            rx,
            observers: HashMap::new(),
            completed: VecDeque::new(),
        };
        (tx, dispatcher)
    }

    /// Deliver one envelope. Returns the session id when it was a completion.
    fn deliver(&mut self, envelope: Envelope) -> Option<SessionId> {
        match envelope {
            Envelope::Attach { session, observer } => {
                self.observers.insert(session, observer);
                None
            }
            Envelope::Progress(snapshot) => {
                match self.observers.get_mut(&snapshot.session) {
                    Some(observer) => observer.on_progress(&snapshot),
                    None => tracing::warn!(
                        session = %snapshot.session,
                        "progress for unknown session dropped"
                    ),
                }
                None
            }
            Envelope::Complete(result) => {
                let session = result.session;
                match self.observers.remove(&session) {
                    Some(mut observer) => observer.on_complete(result),
                    None => tracing::warn!(%session, "completion for unknown session dropped"),
                }
                if self.completed.len() == REMEMBERED_COMPLETIONS {
                    self.completed.pop_front();
                }
                self.completed.push_back(session);
                Some(session)
            }
        }
    }

    /// Deliver everything already queued without waiting. Returns the number
    /// of envelopes processed. Suited to a UI tick loop.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            self.deliver(envelope);
            count += 1;
        }
        count
    }

    /// Deliver events until `session` has completed.
    ///
    /// Returns false if every sender went away first. Events of other
    /// sessions are delivered along the way.
    pub async fn run_until_complete(&mut self, session: SessionId) -> bool {
        if self.take_completed(session) {
            return true;
        }
        while let Some(envelope) = self.rx.recv().await {
            if self.deliver(envelope) == Some(session) {
                self.take_completed(session);
                return true;
            }
        }
        false
    }

    fn take_completed(&mut self, session: SessionId) -> bool {
        match self.completed.iter().position(|s| *s == session) {
            Some(i) => {
                self.completed.remove(i);
                true
            }
            None => false,
        }
    }

    /// Deliver events until the monitor and every reader task are gone.
    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            self.deliver(envelope);
        }
    }

    /// Sessions whose observer is still waiting for completion.
    pub fn active_sessions(&self) -> usize {
        self.observers.len()
    }
}
