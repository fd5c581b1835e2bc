use rust_decimal::Decimal;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} already exists (id {existing_id})")]
    Conflict { entity: String, existing_id: u64 },

    #[error("Insufficient leave balance. Available: {available}, Required: {required}")]
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot {action}: requires state '{required}', found '{actual}'")]
    InvalidState {
        action: &'static str,
        required: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] envy::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    pub(crate) fn conflict(entity: &str, existing_id: u64) -> Self {
        EngineError::Conflict {
            entity: entity.to_string(),
            existing_id,
        }
    }

    pub(crate) fn invalid_state(
        action: &'static str,
        required: impl ToString,
        actual: impl ToString,
    ) -> Self {
        EngineError::InvalidState {
            action,
            required: required.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Import and daily jobs count these and keep going; everything else
    /// is still logged, but this is the set an operator can act on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_) | EngineError::InsufficientBalance { .. }
        )
    }
}
