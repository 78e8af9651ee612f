//! Run state machine
//!
//! Every executor state change goes through [`RunState::transition`]; events
//! that make no sense in the current state leave it unchanged.

use serde::Serialize;

/// Executor run states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Ready to start (a trajectory may or may not be loaded)
    #[default]
    Idle,
    /// Scheduling loop active
    Running,
    /// Loop suspended, elapsed time frozen
    Paused,
    /// Trajectory finished; outputs zeroed
    Completed,
    /// A power-source command failed
    Error,
    /// Stopped by the operator; outputs zeroed
    Aborted,
}

/// Events driving the run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunEvent {
    /// A trajectory was loaded
    Load,
    /// Start requested and the protective limit was programmed
    Start,
    Pause,
    Resume,
    /// Operator stop
    Stop,
    /// Elapsed time reached the trajectory duration
    Finish,
    /// A power-source command failed
    Fault,
}

impl RunState {
    /// Check if the scheduling loop owns the power source
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }

    /// Check if this state requires a fresh load before starting again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Error | RunState::Aborted
        )
    }

    /// Process an event and return the next state
    pub fn transition(self, event: RunEvent) -> Self {
        use RunEvent::*;
        use RunState::*;

        match (self, event) {
            // Loading is refused while a run owns the source
            (Idle | Completed | Error | Aborted, Load) => Idle,

            (Idle, Start) => Running,
            (Idle, Fault) => Error,

            (Running, Pause) => Paused,
            (Running, Stop) => Aborted,
            (Running, Finish) => Completed,
            (Running, Fault) => Error,

            (Paused, Resume) => Running,
            (Paused, Stop) => Aborted,
            (Paused, Finish) => Completed,
            (Paused, Fault) => Error,

            // Invalid transitions - stay in current state
            (state, _) => state,
        }
    }
}

impl core::fmt::Display for RunState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Error => "error",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_run() {
        let mut state = RunState::Idle;

        state = state.transition(RunEvent::Load);
        assert_eq!(state, RunState::Idle);

        state = state.transition(RunEvent::Start);
        assert_eq!(state, RunState::Running);

        state = state.transition(RunEvent::Pause);
        assert_eq!(state, RunState::Paused);

        state = state.transition(RunEvent::Resume);
        assert_eq!(state, RunState::Running);

        state = state.transition(RunEvent::Finish);
        assert_eq!(state, RunState::Completed);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_stop_from_active_states() {
        assert_eq!(RunState::Running.transition(RunEvent::Stop), RunState::Aborted);
        assert_eq!(RunState::Paused.transition(RunEvent::Stop), RunState::Aborted);
    }

    #[test]
    fn test_stop_is_noop_when_inactive() {
        for state in [
            RunState::Idle,
            RunState::Completed,
            RunState::Error,
            RunState::Aborted,
        ] {
            assert_eq!(state.transition(RunEvent::Stop), state);
        }
    }

    #[test]
    fn test_terminal_states_need_load() {
        for state in [RunState::Completed, RunState::Error, RunState::Aborted] {
            assert_eq!(state.transition(RunEvent::Start), state);
            assert_eq!(state.transition(RunEvent::Load), RunState::Idle);
        }
    }

    #[test]
    fn test_load_refused_while_active() {
        assert_eq!(RunState::Running.transition(RunEvent::Load), RunState::Running);
        assert_eq!(RunState::Paused.transition(RunEvent::Load), RunState::Paused);
    }

    #[test]
    fn test_invalid_transitions() {
        // Can't pause from idle
        assert_eq!(RunState::Idle.transition(RunEvent::Pause), RunState::Idle);
        // Can't resume a running loop
        assert_eq!(RunState::Running.transition(RunEvent::Resume), RunState::Running);
        // Can't start twice
        assert_eq!(RunState::Running.transition(RunEvent::Start), RunState::Running);
    }

    #[test]
    fn test_fault_from_start() {
        assert_eq!(RunState::Idle.transition(RunEvent::Fault), RunState::Error);
    }
}
