//! Pipeline run state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorKind;

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsing,
    Resolving,
    Prompting,
    Completing,
    Composing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parsing => "parsing",
            Self::Resolving => "resolving",
            Self::Prompting => "prompting",
            Self::Completing => "completing",
            Self::Composing => "composing",
        };
        write!(f, "{s}")
    }
}

/// State of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Parsing,
    Resolving,
    Prompting,
    Completing,
    Composing,
    /// Reply handed to the transport.
    Done,
    /// Automated sender; nothing to answer.
    Skipped,
    Failed { stage: Stage, kind: ErrorKind },
}

impl RunState {
    /// Check if this state allows transitioning to another state.
    ///
    /// Stages only move forward. `Failed` is reachable from any running
    /// stage, `Skipped` only from `Resolving`.
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;

        if let Failed { stage, .. } = target {
            return self.stage() == Some(stage);
        }

        matches!(
            (self, target),
            (Parsing, Resolving)
                | (Resolving, Prompting)
                | (Resolving, Skipped)
                | (Prompting, Completing)
                | (Completing, Composing)
                | (Composing, Done)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed { .. })
    }

    /// The running stage this state represents, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Parsing => Some(Stage::Parsing),
            Self::Resolving => Some(Stage::Resolving),
            Self::Prompting => Some(Stage::Prompting),
            Self::Completing => Some(Stage::Completing),
            Self::Composing => Some(Stage::Composing),
            Self::Done | Self::Skipped | Self::Failed { .. } => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed { stage, kind } => write!(f, "failed({stage}: {kind})"),
            other => match other.stage() {
                Some(stage) => write!(f, "{stage}"),
                None => Ok(()),
            },
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub timestamp: DateTime<Utc>,
}

/// Bookkeeping for one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::Parsing,
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: RunState) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
        });
        self.state = new_state;
        if new_state.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Move to `Failed` from the current stage.
    pub fn fail(&mut self, kind: ErrorKind) -> Result<Stage, String> {
        let stage = self
            .state
            .stage()
            .ok_or_else(|| format!("Cannot fail from terminal state {}", self.state))?;
        self.transition_to(RunState::Failed { stage, kind })?;
        Ok(stage)
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut ctx = RunContext::new();
        for next in [
            RunState::Resolving,
            RunState::Prompting,
            RunState::Completing,
            RunState::Composing,
            RunState::Done,
        ] {
            ctx.transition_to(next).unwrap();
        }
        assert!(ctx.state.is_terminal());
        assert_eq!(ctx.transitions.len(), 5);
        assert!(ctx.finished_at.is_some());
    }

    #[test]
    fn no_skipping_or_revisiting() {
        let mut ctx = RunContext::new();
        assert!(ctx.transition_to(RunState::Completing).is_err());
        ctx.transition_to(RunState::Resolving).unwrap();
        assert!(ctx.transition_to(RunState::Parsing).is_err());
        assert!(ctx.transition_to(RunState::Resolving).is_err());
    }

    #[test]
    fn failed_must_name_current_stage() {
        let mut ctx = RunContext::new();
        ctx.transition_to(RunState::Resolving).unwrap();
        assert!(
            ctx.transition_to(RunState::Failed {
                stage: Stage::Parsing,
                kind: ErrorKind::MalformedMessage,
            })
            .is_err()
        );
        let stage = ctx.fail(ErrorKind::NoAssistantMatched).unwrap();
        assert_eq!(stage, Stage::Resolving);
        assert!(ctx.fail(ErrorKind::NoAssistantMatched).is_err());
    }

    #[test]
    fn skipped_only_from_resolving() {
        assert!(RunState::Resolving.can_transition_to(RunState::Skipped));
        assert!(!RunState::Parsing.can_transition_to(RunState::Skipped));
        assert!(!RunState::Composing.can_transition_to(RunState::Skipped));
    }

    #[test]
    fn terminal_states_go_nowhere() {
        for terminal in [
            RunState::Done,
            RunState::Skipped,
            RunState::Failed {
                stage: Stage::Completing,
                kind: ErrorKind::AiBackendUnavailable,
            },
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(RunState::Parsing));
            assert!(!terminal.can_transition_to(RunState::Done));
        }
    }

    #[test]
    fn display() {
        assert_eq!(RunState::Completing.to_string(), "completing");
        assert_eq!(
            RunState::Failed {
                stage: Stage::Completing,
                kind: ErrorKind::AiBackendEmptyResponse,
            }
            .to_string(),
            "failed(completing: AIBackendEmptyResponse)"
        );
    }
}
