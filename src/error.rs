use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Invalid schedule expression '{expression}': {reason}")]
    Schedule { expression: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
