//! Run state machine for one tailoring request.
//!
//! Stages only move forward and progress never decreases. Terminal states
//! (completed, failed, aborted) accept no further transitions.

use serde::Serialize;
use thiserror::Error;

/// Non-terminal stages, in run order. Completion and failure are `RunState`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Preprocessing,
    Scoring,
    Generating,
    Processing,
    /// Re-scoring after generation. Clients see it as a second `scoring` stage.
    #[serde(rename = "scoring")]
    PostScoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Active { stage: Stage, progress: u8 },
    Completed,
    Failed,
    /// The client went away. Nothing more is written.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("run has already terminated")]
    Terminated,

    #[error("stage cannot move back from {from:?} to {to:?}")]
    StageRegression { from: Stage, to: Stage },

    #[error("progress cannot move back from {from} to {to}")]
    ProgressRegression { from: u8, to: u8 },
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Active {
            stage: Stage::Init,
            progress: 0,
        }
    }
}

impl RunState {
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Active { .. })
    }

    /// The current stage while active.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunState::Active { stage, .. } => Some(*stage),
            RunState::Completed | RunState::Failed | RunState::Aborted => None,
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            RunState::Active { progress, .. } => *progress,
            RunState::Completed => 100,
            RunState::Failed | RunState::Aborted => 0,
        }
    }

    pub fn advance(&mut self, to: Stage, progress: u8) -> Result<(), TransitionError> {
        let RunState::Active {
            stage: from,
            progress: current,
        } = *self
        else {
            return Err(TransitionError::Terminated);
        };

        if to < from {
            return Err(TransitionError::StageRegression { from, to });
        }
        let progress = progress.min(100);
        if progress < current {
            return Err(TransitionError::ProgressRegression {
                from: current,
                to: progress,
            });
        }

        *self = RunState::Active {
            stage: to,
            progress,
        };
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.terminate(RunState::Completed)
    }

    pub fn fail(&mut self) -> Result<(), TransitionError> {
        self.terminate(RunState::Failed)
    }

    pub fn abort(&mut self) -> Result<(), TransitionError> {
        self.terminate(RunState::Aborted)
    }

    fn terminate(&mut self, to: RunState) -> Result<(), TransitionError> {
        if !self.is_active() {
            return Err(TransitionError::Terminated);
        }
        *self = to;
        Ok(())
    }
}
