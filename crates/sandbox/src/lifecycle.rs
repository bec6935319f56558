use std::fmt;

use crate::error::{Result, SandboxError};

/// Lifecycle of a single-use environment.
///
/// ```text
/// Created -> Staged -> Running -> {Completed | TimedOut | RunFailed} -> Extracted -> Destroyed
/// ```
///
/// `Destroyed` is reachable from every other state. Nothing moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Staged,
    Running,
    Completed,
    TimedOut,
    RunFailed,
    Extracted,
    Destroyed,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Created, Staged) | (Staged, Running) => true,
            (Running, Completed | TimedOut | RunFailed) => true,
            (Completed | TimedOut | RunFailed, Extracted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Staged => f.write_str("staged"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::TimedOut => f.write_str("timed-out"),
            Self::RunFailed => f.write_str("run-failed"),
            Self::Extracted => f.write_str("extracted"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// Checked holder for an environment's current state.
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Created,
        }
    }

    pub fn current(&self) -> LifecycleState {
        self.state
    }

    /// Fail with [`SandboxError::InvalidState`] unless `to` is reachable from the current state.
    pub fn ensure(&self, to: LifecycleState) -> Result<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(SandboxError::InvalidState {
                from: self.state,
                to,
            })
        }
    }

    pub fn advance(&mut self, to: LifecycleState) -> Result<()> {
        self.ensure(to)?;
        self.state = to;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
