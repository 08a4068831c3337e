//! Progress and event channel between a run and its observer.
//!
//! One producer (the run worker), one consumer (an SSE stream or the
//! terminal front end). Delivery is unbounded so the worker never waits on a
//! slow observer, and a vanished observer never aborts the run.
//!
//! Terminal events can only be sent through [`EventSender::done`] or
//! [`EventSender::fail`], which consume the sender. That makes "exactly one
//! terminal event, then the channel closes" a property of the types.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::classify::Classification;
use crate::store::ResultSet;

/// Width of the rendered progress bar, in cells.
const BAR_WIDTH: usize = 30;

/// Message pushed from a run to its observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Append-only log line.
    Log { text: String },
    /// In-place progress for one label.
    Progress {
        label: String,
        current: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },
    /// The run is suspended until a second-factor code is submitted.
    RequestSecondFactor,
    /// New runs for this handle must not be started.
    LockInput,
    /// The observer may collect credentials again.
    UnlockInput,
    /// Terminal success.
    Done { summary: Box<RunSummary> },
    /// Terminal failure.
    Failed { reason: String },
}

impl RunEvent {
    /// Short kind name, used as the SSE event name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Progress { .. } => "progress",
            Self::RequestSecondFactor => "request_second_factor",
            Self::LockInput => "lock_input",
            Self::UnlockInput => "unlock_input",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether this event ends the run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }
}

/// Payload of the terminal success event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Account the run was for.
    pub handle: String,
    /// The four classified lists.
    pub classification: Classification,
    /// Where the exports were written.
    pub result_set: ResultSet,
    /// Accounts skipped while draining `following`.
    pub skipped_following: usize,
    /// Accounts skipped while draining `followers`.
    pub skipped_followers: usize,
}

/// Create a connected sender/receiver pair for one run.
#[must_use]
pub fn event_channel(handle: &str) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender {
            tx,
            handle: handle.to_string(),
        },
        EventReceiver {
            rx,
            finished: false,
            prompt_pending: false,
            replay: None,
        },
    )
}

/// Producer half, owned by the run worker.
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RunEvent>,
    handle: String,
}

impl EventSender {
    fn emit(&self, event: RunEvent) {
        if self.tx.send(event).is_err() {
            debug!(handle = %self.handle, "Observer gone, event dropped");
        }
    }

    /// Append a log line.
    pub fn log(&self, text: impl Into<String>) {
        let text = text.into();
        debug!(handle = %self.handle, "{text}");
        self.emit(RunEvent::Log { text });
    }

    /// Report progress for a label.
    pub fn progress(&self, label: &str, current: u64, total: Option<u64>) {
        self.emit(RunEvent::Progress {
            label: label.to_string(),
            current,
            total,
        });
    }

    /// Ask the observer for a second-factor code.
    pub fn request_second_factor(&self) {
        self.emit(RunEvent::RequestSecondFactor);
    }

    /// Tell the observer to block new starts for this handle.
    pub fn lock_input(&self) {
        self.emit(RunEvent::LockInput);
    }

    /// Tell the observer it may collect credentials again.
    pub fn unlock_input(&self) {
        self.emit(RunEvent::UnlockInput);
    }

    /// Whether the observer has hung up.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Finish the run successfully and close the channel.
    pub fn done(self, summary: RunSummary) {
        self.emit(RunEvent::Done {
            summary: Box::new(summary),
        });
    }

    /// Finish the run with a failure and close the channel.
    pub fn fail(self, reason: impl Into<String>) {
        self.emit(RunEvent::Failed {
            reason: reason.into(),
        });
    }
}

/// What the observer sees next.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// A non-terminal event.
    Event(RunEvent),
    /// The terminal event. Nothing follows.
    Terminal(RunEvent),
    /// The producer went away without a terminal event.
    Disconnected,
}

/// Consumer half, held by one observer at a time.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<RunEvent>,
    finished: bool,
    /// The last delivered event was a second-factor request.
    prompt_pending: bool,
    replay: Option<RunEvent>,
}

impl EventReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` after a terminal event or a disconnect has been reported.
    pub async fn next(&mut self) -> Option<Observed> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.replay.take() {
            return Some(Observed::Event(event));
        }
        match self.rx.recv().await {
            Some(event) if event.is_terminal() => {
                self.finished = true;
                self.prompt_pending = false;
                self.rx.close();
                Some(Observed::Terminal(event))
            }
            Some(event) => {
                self.prompt_pending = matches!(event, RunEvent::RequestSecondFactor);
                Some(Observed::Event(event))
            }
            None => {
                self.finished = true;
                Some(Observed::Disconnected)
            }
        }
    }

    /// Whether the terminal event or a disconnect has been delivered.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Deliver the last second-factor request again before anything new.
    ///
    /// Does nothing unless that request was the last event delivered.
    pub fn replay_prompt(&mut self) {
        if self.prompt_pending && !self.finished {
            self.replay = Some(RunEvent::RequestSecondFactor);
        }
    }
}

/// Render a progress value the way the log view shows it.
#[must_use]
pub fn render_progress(label: &str, current: u64, total: Option<u64>) -> String {
    match total {
        Some(total) if total > 0 => {
            let ratio = (current as f64 / total as f64).min(1.0);
            let filled = (BAR_WIDTH as f64 * ratio).round() as usize;
            let percent = (ratio * 100.0).round() as u64;
            format!(
                "{label}: {current}/{total} [{}{}] {percent}%",
                "█".repeat(filled),
                "_".repeat(BAR_WIDTH - filled)
            )
        }
        _ => format!("{label}: {current} items"),
    }
}

/// Line-oriented view of a run's output.
///
/// Log lines are appended. A progress update replaces the most recent line
/// carrying the same label, or is appended if there is none.
#[derive(Debug, Default, Clone)]
pub struct LogView {
    lines: Vec<(Option<String>, String)>,
}

impl LogView {
    /// Create an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the view.
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Log { text } => self.lines.push((None, text.clone())),
            RunEvent::Progress {
                label,
                current,
                total,
            } => {
                let line = render_progress(label, *current, *total);
                let existing = self
                    .lines
                    .iter_mut()
                    .rev()
                    .find(|(l, _)| l.as_deref() == Some(label.as_str()));
                match existing {
                    Some((_, text)) => *text = line,
                    None => self.lines.push((Some(label.clone()), line)),
                }
            }
            RunEvent::Failed { reason } => self.lines.push((None, format!("[ERROR] {reason}"))),
            RunEvent::RequestSecondFactor
            | RunEvent::LockInput
            | RunEvent::UnlockInput
            | RunEvent::Done { .. } => {}
        }
    }

    /// Current lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|(_, text)| text.as_str())
    }
}
