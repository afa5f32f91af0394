use thiserror::Error;

/// Per-operation failures surfaced by the scoring engine.
///
/// None of these are fatal to the process and none are retried internally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Malformed vote, rating, document or registration input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Transition attempted from an incompatible state.
    #[error("state conflict on {subject}: cannot {action} while {state}")]
    StateConflict {
        subject: String,
        action: String,
        state: String,
    },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(
        subject: impl Into<String>,
        action: impl Into<String>,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::StateConflict {
            subject: subject.into(),
            action: action.into(),
            state: state.to_string(),
        }
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
