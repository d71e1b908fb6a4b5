use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trigger::TriggerSource;

/// Lifecycle of one participant's recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Created,
    AwaitingTrigger,
    /// Whole ticks left before the scheduled start
    Countdown { remaining: u32 },
    Recording { source: TriggerSource },
    Uploading,
    Finished { upload_succeeded: bool },
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionState::Finished { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {event} while {from:?}")]
    Invalid {
        from: SessionState,
        event: &'static str,
    },

    /// A countdown or recording already owns this session
    #[error("already engaged in {0:?}")]
    AlreadyEngaged(SessionState),
}

/// Pure transition table for a participant
///
/// The engaged flag is the single guard shared by every trigger path: once a
/// countdown or recording has begun, no other trigger may start one until
/// the session finishes or the attempt is abandoned.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    engaged: bool,
    last_error: Option<String>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Created,
            engaged: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Created → AwaitingTrigger once store access and input are set up
    pub fn ready(&mut self) -> Result<SessionState, TransitionError> {
        match self.state {
            SessionState::Created => self.enter(SessionState::AwaitingTrigger),
            from => Err(TransitionError::Invalid {
                from,
                event: "become ready",
            }),
        }
    }

    /// AwaitingTrigger → Countdown when the scheduled start is near
    pub fn begin_countdown(&mut self, remaining: u32) -> Result<SessionState, TransitionError> {
        self.check_free()?;
        match self.state {
            SessionState::AwaitingTrigger if remaining > 0 => {
                self.engaged = true;
                self.enter(SessionState::Countdown { remaining })
            }
            from => Err(TransitionError::Invalid {
                from,
                event: "begin countdown",
            }),
        }
    }

    /// Countdown → Countdown with one tick less
    pub fn tick(&mut self, remaining: u32) -> Result<SessionState, TransitionError> {
        match self.state {
            SessionState::Countdown { remaining: current } if remaining > 0 && remaining < current => {
                self.enter(SessionState::Countdown { remaining })
            }
            from => Err(TransitionError::Invalid {
                from,
                event: "tick",
            }),
        }
    }

    /// Countdown → Recording at the aligned deadline
    pub fn countdown_elapsed(&mut self) -> Result<SessionState, TransitionError> {
        match self.state {
            SessionState::Countdown { .. } => self.enter(SessionState::Recording {
                source: TriggerSource::Scheduled,
            }),
            from => Err(TransitionError::Invalid {
                from,
                event: "finish countdown",
            }),
        }
    }

    /// AwaitingTrigger → Recording on any trigger; refused while engaged
    pub fn trigger(&mut self, source: TriggerSource) -> Result<SessionState, TransitionError> {
        self.check_free()?;
        match self.state {
            SessionState::AwaitingTrigger => {
                self.engaged = true;
                self.enter(SessionState::Recording { source })
            }
            from => Err(TransitionError::Invalid {
                from,
                event: "trigger",
            }),
        }
    }

    /// Recording → Uploading after the fixed duration
    pub fn recording_elapsed(&mut self) -> Result<SessionState, TransitionError> {
        match self.state {
            SessionState::Recording { .. } => self.enter(SessionState::Uploading),
            from => Err(TransitionError::Invalid {
                from,
                event: "stop recording",
            }),
        }
    }

    /// Uploading → Finished; clears the guard
    pub fn finish(&mut self, upload_succeeded: bool) -> Result<SessionState, TransitionError> {
        match self.state {
            SessionState::Uploading => {
                self.engaged = false;
                self.enter(SessionState::Finished { upload_succeeded })
            }
            from => Err(TransitionError::Invalid {
                from,
                event: "finish",
            }),
        }
    }

    /// Abandon a countdown or recording after a recoverable failure
    pub fn recover(&mut self, error: impl Into<String>) -> Result<SessionState, TransitionError> {
        match self.state {
            SessionState::Countdown { .. } | SessionState::Recording { .. } => {
                self.engaged = false;
                self.last_error = Some(error.into());
                self.enter(SessionState::AwaitingTrigger)
            }
            from => Err(TransitionError::Invalid {
                from,
                event: "recover",
            }),
        }
    }

    fn check_free(&self) -> Result<(), TransitionError> {
        if self.engaged {
            Err(TransitionError::AlreadyEngaged(self.state))
        } else {
            Ok(())
        }
    }

    fn enter(&mut self, state: SessionState) -> Result<SessionState, TransitionError> {
        self.state = state;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaiting() -> SessionMachine {
        let mut machine = SessionMachine::new();
        machine.ready().unwrap();
        machine
    }

    #[test]
    fn test_second_trigger_is_refused() {
        let mut machine = awaiting();
        machine.trigger(TriggerSource::Acoustic).unwrap();

        let err = machine.trigger(TriggerSource::Manual).unwrap_err();
        assert!(matches!(err, TransitionError::AlreadyEngaged(_)));
        assert_eq!(
            machine.state(),
            SessionState::Recording {
                source: TriggerSource::Acoustic
            }
        );
    }

    #[test]
    fn test_trigger_refused_during_countdown() {
        let mut machine = awaiting();
        machine.begin_countdown(5).unwrap();
        assert!(machine.trigger(TriggerSource::Acoustic).is_err());

        machine.tick(4).unwrap();
        assert!(machine.tick(4).is_err());
        assert_eq!(
            machine.countdown_elapsed().unwrap(),
            SessionState::Recording {
                source: TriggerSource::Scheduled
            }
        );
    }

    #[test]
    fn test_full_lifecycle_clears_guard() {
        let mut machine = awaiting();
        machine.trigger(TriggerSource::Manual).unwrap();
        machine.recording_elapsed().unwrap();
        assert!(machine.is_engaged());
        machine.finish(true).unwrap();
        assert!(!machine.is_engaged());
        assert!(machine.state().is_finished());
    }

    #[test]
    fn test_recover_returns_to_awaiting() {
        let mut machine = awaiting();
        machine.trigger(TriggerSource::Scheduled).unwrap();
        machine.recover("microphone denied").unwrap();
        assert_eq!(machine.state(), SessionState::AwaitingTrigger);
        assert_eq!(machine.last_error(), Some("microphone denied"));
        assert!(machine.trigger(TriggerSource::Manual).is_ok());
    }

    #[test]
    fn test_uploading_cannot_recover() {
        let mut machine = awaiting();
        machine.trigger(TriggerSource::Manual).unwrap();
        machine.recording_elapsed().unwrap();
        assert!(machine.recover("late").is_err());
    }
}
