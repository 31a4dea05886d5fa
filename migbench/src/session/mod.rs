//! # Benchmark Sessions
//!
//! A session walks one workload through a fixed sequence of phases:
//!
//! ```text
//! Idle ─▶ ConfiguringFrequency ─▶ AttachingProbes ─▶ ConstrainingGroup
//!      ─▶ RegisteringCorrelation ─▶ Launching ─▶ [Reassigning]
//!      ─▶ AwaitingCompletion ─▶ Teardown ─▶ Completed | Aborted
//! ```
//!
//! Any phase from `ConfiguringFrequency` on may jump straight to `Teardown`
//! when it fails. Teardown always runs and always ends in a terminal state.
//!
//! - [`config`]: typed session configuration
//! - [`orchestrator`]: drives the phases
//! - [`report`]: outcome of a session

pub mod config;
pub mod orchestrator;
pub mod report;

use std::fmt;

use log::debug;

use crate::domain::SessionError;

pub use config::{EnergyCapture, FrequencyPin, MonitorSpec, SessionConfig};
pub use orchestrator::BenchmarkOrchestrator;
pub use report::SessionReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ConfiguringFrequency,
    AttachingProbes,
    ConstrainingGroup,
    RegisteringCorrelation,
    Launching,
    Reassigning,
    AwaitingCompletion,
    Teardown,
    Completed,
    Aborted,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Whether `self -> next` is a legal step
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        use SessionState::{
            Aborted, AttachingProbes, AwaitingCompletion, Completed, ConfiguringFrequency,
            ConstrainingGroup, Idle, Launching, Reassigning, RegisteringCorrelation, Teardown,
        };

        match (self, next) {
            (Idle, ConfiguringFrequency)
            | (ConfiguringFrequency, AttachingProbes)
            | (AttachingProbes, ConstrainingGroup)
            | (ConstrainingGroup, RegisteringCorrelation)
            | (RegisteringCorrelation, Launching)
            | (Launching, Reassigning | AwaitingCompletion)
            | (Reassigning, AwaitingCompletion)
            | (Teardown, Completed | Aborted) => true,
            (from, Teardown) => !from.is_terminal() && from != Teardown,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Current state plus the path taken to reach it
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    history: Vec<SessionState>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self { state: SessionState::Idle, history: vec![SessionState::Idle] }
    }
}

impl SessionMachine {
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`
    #[must_use]
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Move to `next`
    ///
    /// # Errors
    /// [`SessionError::Transition`] if `next` is not reachable from the current state
    pub fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_advance_to(next) {
            return Err(SessionError::Transition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Session {} -> {next}", self.state);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::{
        Aborted, AttachingProbes, AwaitingCompletion, Completed, ConfiguringFrequency,
        ConstrainingGroup, Idle, Launching, Reassigning, RegisteringCorrelation, Teardown,
    };

    #[test]
    fn test_full_path_with_reassignment() {
        let mut machine = SessionMachine::default();
        for next in [
            ConfiguringFrequency,
            AttachingProbes,
            ConstrainingGroup,
            RegisteringCorrelation,
            Launching,
            Reassigning,
            AwaitingCompletion,
            Teardown,
            Completed,
        ] {
            machine.advance(next).unwrap();
        }
        assert_eq!(machine.history().len(), 10);
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_skipping_a_phase_is_rejected() {
        let mut machine = SessionMachine::default();
        machine.advance(ConfiguringFrequency).unwrap();
        let err = machine.advance(RegisteringCorrelation).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid session transition ConfiguringFrequency -> RegisteringCorrelation"
        );
        assert_eq!(machine.state(), ConfiguringFrequency);
    }

    #[test]
    fn test_any_active_phase_can_abort() {
        for from in [ConfiguringFrequency, AttachingProbes, Launching, AwaitingCompletion] {
            assert!(from.can_advance_to(Teardown), "{from}");
        }
        assert!(!Completed.can_advance_to(Teardown));
        assert!(!Teardown.can_advance_to(Teardown));
        assert!(!Idle.can_advance_to(Completed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut machine = SessionMachine::default();
        machine.advance(ConfiguringFrequency).unwrap();
        machine.advance(Teardown).unwrap();
        machine.advance(Aborted).unwrap();
        assert!(machine.advance(ConfiguringFrequency).is_err());
        assert!(machine.advance(Completed).is_err());
    }
}
