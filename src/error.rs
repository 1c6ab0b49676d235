//! Error types for the scheduling subsystem
//!
//! Nothing here reaches players: per-subject faults drop the subject from the
//! scheduler that hit them, scheduling failures disable one timer.

/// Fault raised while updating a single subject
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Subject fault: {0}")]
    Fault(String),
    #[error("Persistence failed: {0}")]
    Persistence(String),
    #[error("Panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn fault(msg: impl Into<String>) -> Self {
        TaskError::Fault(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        TaskError::Persistence(msg.into())
    }

    /// Convert a `catch_unwind` payload into an error value
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskError::Panicked(msg)
    }
}

/// Recurring-task registration failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("No tokio runtime available")]
    RuntimeUnavailable,
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}
