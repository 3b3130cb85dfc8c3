//! Reconciliation State Machine
//!
//! Each target walks `Idle -> Diffing -> {Clean | ErrantFound} -> ...` and ends
//! in `Done` or `Failed`. Transitions outside the table are rejected.

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Per-target reconciliation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileState {
    Idle,
    /// Snapshots and engine-side subtraction
    Diffing,
    /// Target holds nothing the source lacks
    Clean,
    /// Target holds transactions the source never ran
    ErrantFound,
    /// Errant transactions reported, no repair requested
    NoFix,
    /// Injecting empty transactions on the source
    FixSource,
    /// Injecting empty transactions on the replica
    FixReplica,
    /// Checking the outcome of a repair
    Verifying,
    Done,
    Failed,
}

impl ReconcileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReconcileState::Done | ReconcileState::Failed)
    }

    /// Check whether `next` may follow `self`
    pub fn can_transition_to(self, next: ReconcileState) -> bool {
        use ReconcileState::*;

        if next == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Idle, Diffing)
                | (Diffing, Clean)
                | (Diffing, ErrantFound)
                | (Clean, Done)
                // An empty fix plan ends the target without a repair
                | (ErrantFound, Done)
                | (ErrantFound, NoFix)
                | (ErrantFound, FixSource)
                | (ErrantFound, FixReplica)
                | (NoFix, Done)
                | (FixSource, Verifying)
                | (FixReplica, Verifying)
                | (Verifying, Done)
        )
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks one target's progress and the path it took
#[derive(Debug, Clone)]
pub struct TargetStateMachine {
    target: String,
    state: ReconcileState,
    history: Vec<ReconcileState>,
}

impl TargetStateMachine {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: ReconcileState::Idle,
            history: vec![ReconcileState::Idle],
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    pub fn history(&self) -> &[ReconcileState] {
        &self.history
    }

    /// Move to `next`, rejecting transitions outside the table
    pub fn transition(&mut self, next: ReconcileState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal reconciliation transition {} -> {} for {}",
                self.state, next, self.target
            )));
        }
        tracing::debug!(
            target_node = %self.target,
            from = %self.state,
            to = %next,
            "State transition"
        );
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Mark the target failed unless it already finished
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = ReconcileState::Failed;
            self.history.push(ReconcileState::Failed);
        }
    }
}
