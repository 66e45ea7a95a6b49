use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of the test controller.
///
/// The legal moves between these states live in
/// [`crate::state::successors`]; nothing else may change a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    NotStarted,
    Idle,
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Error,
    Stopped,
}

impl RunState {
    /// Terminal for a single run; each of these returns to `Idle` for reuse
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Error | RunState::Stopped
        )
    }

    /// A run is in flight
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::NotStarted => "NOT_STARTED",
            RunState::Idle => "IDLE",
            RunState::Initializing => "INITIALIZING",
            RunState::Ready => "READY",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Error => "ERROR",
            RunState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress data for the current run.
///
/// The state machine owns the live copy; observers and callers only ever see
/// clones of it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunContext {
    /// Fraction of the run completed, 0.0 to 1.0
    pub progress: f64,

    /// Image being processed, empty between items
    pub current_item: String,

    /// Human-readable status line
    pub status: String,

    pub error: Option<String>,

    pub total_images: usize,
    pub processed_images: usize,

    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl RunContext {
    /// Time since the run entered `Running`, frozen once it finished
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        Some(match self.finished_at {
            Some(end) => end.saturating_duration_since(start),
            None => start.elapsed(),
        })
    }

    pub fn current_image(&self) -> Option<&str> {
        if self.current_item.is_empty() {
            None
        } else {
            Some(&self.current_item)
        }
    }
}
