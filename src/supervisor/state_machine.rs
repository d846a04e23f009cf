use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Running,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ServerState, ServerState),
}

pub struct StateMachine {
    state: ServerState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: ServerState::Stopped }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn can_transition(&self, to: ServerState) -> bool {
        matches!(
            (self.state, to),
            (ServerState::Stopped, ServerState::Running) | (ServerState::Running, ServerState::Stopped)
        )
    }

    pub fn transition(&mut self, to: ServerState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), ServerState::Stopped);
        assert!(sm.transition(ServerState::Running).is_ok());
        assert!(sm.transition(ServerState::Stopped).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        let mut sm = StateMachine::new();
        // a second process can never be started over a running one
        sm.transition(ServerState::Running).unwrap();
        assert!(sm.transition(ServerState::Running).is_err());
        sm.transition(ServerState::Stopped).unwrap();
        assert!(sm.transition(ServerState::Stopped).is_err());
    }
}
