//! Per-run event history and observers
//!
//! Every run keeps its full event history in memory. Observers read the
//! history by index and use a broadcast channel only as a wake-up signal,
//! so a slow observer can lag without losing events and a late observer
//! replays from the start.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::bus::EventBus;
use super::types::{ActionEvent, ProgressLevel};
use crate::eval::CancelToken;
use crate::rule::{BuildError, ErrorInfo};

const WAKE_CAPACITY: usize = 64;

#[derive(Default)]
struct RunState {
    history: Vec<ActionEvent>,
    terminal: bool,
}

enum Poll {
    Ready(ActionEvent),
    Pending,
    Closed,
}

/// One build or action invocation in flight (or recently finished)
pub struct ActionRun {
    id: String,
    target: String,
    started_at: DateTime<Utc>,
    state: Mutex<RunState>,
    wake: broadcast::Sender<()>,
    bus: Option<Arc<EventBus>>,
    cancel: CancelToken,
}

impl ActionRun {
    /// New run with a fresh time-ordered id
    pub fn new(target: impl Into<String>, bus: Option<Arc<EventBus>>) -> Arc<Self> {
        Self::with_id(uuid::Uuid::now_v7().to_string(), target, bus)
    }

    pub fn with_id(id: impl Into<String>, target: impl Into<String>, bus: Option<Arc<EventBus>>) -> Arc<Self> {
        let id = id.into();
        let target = target.into();
        debug!(%id, %target, "ActionRun::new: called");
        let (wake, _) = broadcast::channel(WAKE_CAPACITY);
        Arc::new(Self {
            id,
            target,
            started_at: Utc::now(),
            state: Mutex::new(RunState::default()),
            wake,
            bus,
            cancel: CancelToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Append an event; returns false once the run has terminated
    pub fn publish(&self, event: ActionEvent) -> bool {
        {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if state.terminal {
                debug!(run_id = %self.id, event_type = event.event_type(), "ActionRun::publish: dropped after terminal");
                return false;
            }
            state.terminal = event.is_terminal();
            state.history.push(event.clone());
        }
        let _ = self.wake.send(());
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().map(|s| s.terminal).unwrap_or(true)
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<ActionEvent> {
        self.state.lock().map(|s| s.history.clone()).unwrap_or_default()
    }

    /// The `Finished` or `Failed` event, once present
    pub fn terminal_event(&self) -> Option<ActionEvent> {
        let state = self.state.lock().ok()?;
        if state.terminal { state.history.last().cloned() } else { None }
    }

    fn poll(&self, index: usize) -> Poll {
        let Ok(state) = self.state.lock() else {
            return Poll::Closed;
        };
        match state.history.get(index) {
            Some(event) => Poll::Ready(event.clone()),
            None if state.terminal => Poll::Closed,
            None => Poll::Pending,
        }
    }

    /// Observer that replays the history from the first event
    pub fn observe(self: &Arc<Self>) -> RunObserver {
        debug!(run_id = %self.id, "ActionRun::observe: called");
        RunObserver {
            wake: self.wake.subscribe(),
            run: Arc::clone(self),
            next: 0,
        }
    }

    /// Request cancellation
    ///
    /// Observers see `Failed(Cancelled)` right away; work already running
    /// finishes its current step and is discarded. Returns false if the run
    /// had already terminated.
    pub fn cancel(&self) -> bool {
        info!(run_id = %self.id, "ActionRun::cancel: called");
        self.cancel.cancel();
        self.publish(ActionEvent::Failed {
            run_id: self.id.clone(),
            error: ErrorInfo::from(&BuildError::Cancelled),
        })
    }

    /// Progress logger for a rule executing within this run
    pub fn progress(self: &Arc<Self>, rule: &str) -> ProgressLogger {
        ProgressLogger {
            run: Some(Arc::clone(self)),
            rule: rule.to_string(),
        }
    }
}

/// Ordered reader over one run's events
pub struct RunObserver {
    run: Arc<ActionRun>,
    next: usize,
    wake: broadcast::Receiver<()>,
}

impl RunObserver {
    /// Next event, or `None` after the terminal event has been returned
    pub async fn next(&mut self) -> Option<ActionEvent> {
        loop {
            match self.run.poll(self.next) {
                Poll::Ready(event) => {
                    self.next += 1;
                    return Some(event);
                }
                Poll::Closed => return None,
                Poll::Pending => {}
            }
            match self.wake.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn run_id(&self) -> &str {
        self.run.id()
    }
}

/// Logger handed to rule bodies
///
/// Messages go to tracing and, when attached to a run, to its observers.
#[derive(Clone)]
pub struct ProgressLogger {
    run: Option<Arc<ActionRun>>,
    rule: String,
}

impl ProgressLogger {
    /// Logger not attached to any run
    pub fn detached(rule: &str) -> Self {
        Self {
            run: None,
            rule: rule.to_string(),
        }
    }

    /// Same run, different rule
    pub fn for_rule(&self, rule: &str) -> Self {
        Self {
            run: self.run.clone(),
            rule: rule.to_string(),
        }
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn verbose(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(rule = %self.rule, %message, "progress");
        self.progress(ProgressLevel::Verbose, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(rule = %self.rule, %message, "progress");
        self.progress(ProgressLevel::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(rule = %self.rule, %message, "progress");
        self.progress(ProgressLevel::Error, message);
    }

    /// Forward one line of subprocess output
    pub fn output(&self, line: impl Into<String>, stderr: bool) {
        let Some(run) = &self.run else {
            return;
        };
        run.publish(ActionEvent::Output {
            run_id: run.id().to_string(),
            rule: self.rule.clone(),
            line: line.into(),
            stderr,
        });
    }

    fn progress(&self, level: ProgressLevel, message: String) {
        let Some(run) = &self.run else {
            return;
        };
        if !run.publish(ActionEvent::Progress {
            run_id: run.id().to_string(),
            rule: self.rule.clone(),
            level,
            message,
        }) {
            warn!(run_id = %run.id(), "ProgressLogger: run already finished");
        }
    }
}
