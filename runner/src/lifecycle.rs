pub mod marker;


use marker::{MarkerBoard, MarkerContent};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid run state transition from {from} to {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// Solver logging flavour, reported to monitors through the running marker
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    #[default]
    Standard,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Preparing,
    Ready,
    Running(LoggingMode),
    Finished,
    Failed,
    Saving,
    /// no marker: never started or fully saved
    Done,
}

impl RunState {
    /// every state that is published through a marker file
    pub const MARKED: [RunState; 7] = [
        Self::Preparing,
        Self::Ready,
        Self::Running(LoggingMode::Standard),
        Self::Running(LoggingMode::Extended),
        Self::Finished,
        Self::Failed,
        Self::Saving,
    ];

    /// marker file prefix, `None` for the unmarked terminal state
    pub fn marker_name(self) -> Option<&'static str> {
        match self {
            Self::Preparing => Some("preparing"),
            Self::Ready => Some("ready"),
            Self::Running(LoggingMode::Standard) => Some("runningstd"),
            Self::Running(LoggingMode::Extended) => Some("runningext"),
            Self::Finished => Some("finished"),
            Self::Failed => Some("failed"),
            Self::Saving => Some("saving"),
            Self::Done => None,
        }
    }

    /// whether `self` may directly follow `previous`
    pub fn can_follow(self, previous: RunState) -> bool {
        use RunState::*;

        matches!(
            (previous, self),
            (Done, Preparing)
                | (Preparing, Ready)
                | (Preparing, Failed)
                | (Ready, Running(_))
                | (Running(_), Finished)
                | (Running(_), Failed)
                | (Ready, Saving)
                | (Finished, Saving)
                | (Failed, Saving)
                | (Saving, Done)
        )
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker_name().unwrap_or("done"))
    }
}

/// Single writer state machine for one run, published as marker files.
///
/// Marker IO is best effort: failures are logged and never abort the run.
/// Any marker still present when the lifecycle is dropped is removed.
#[derive(Debug)]
pub struct RunLifecycle {
    board: MarkerBoard,
    state: RunState,
}

impl RunLifecycle {
    /// start tracking a run with no prior state
    pub fn new(board: MarkerBoard) -> Self {
        Self {
            board,
            state: RunState::Done,
        }
    }

    /// Continue a run prepared by an earlier invocation.
    ///
    /// The state on disk wins; `assumed` is used when no marker is left.
    pub fn attach(board: MarkerBoard, assumed: RunState) -> Self {
        let state = board
            .current()
            .map(|(state, _)| state)
            .unwrap_or(assumed);
        debug!(state = %state, run_id = board.run_id(), "Attached to run");

        Self { board, state }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// move to `next`, renaming (or creating/removing) the marker file
    pub fn advance(&mut self, next: RunState) -> Result<(), LifecycleError> {
        if !next.can_follow(self.state) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        self.board.publish(next);
        info!(from = %self.state, to = %next, run_id = self.board.run_id(), "Run state changed");
        self.state = next;

        Ok(())
    }

    /// Monitor view of a run: current state and marker content, if readable.
    pub fn observe(script_dir: &Path, run_id: &str) -> (RunState, Option<MarkerContent>) {
        match marker::find_marker(script_dir, run_id) {
            Some((state, path)) => (state, MarkerContent::read(&path)),
            None => (RunState::Done, None),
        }
    }
}

impl Drop for RunLifecycle {
    fn drop(&mut self) {
        if self.board.current().is_some() {
            debug!(run_id = self.board.run_id(), "Removing leftover run marker");
            self.board.publish(RunState::Done);
        }
    }
}
