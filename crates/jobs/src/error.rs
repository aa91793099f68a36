use thiserror::Error;

use crate::state::JobKind;

/// Failure of a single call to the compute service.
#[derive(Debug, Clone, Error)]
pub enum ServiceCallError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with an error payload or a body of the wrong shape.
    /// `message` is shown to the user as-is.
    #[error("{message}")]
    Service { status: Option<u16>, message: String },
}

impl ServiceCallError {
    pub fn service(status: Option<u16>, message: impl Into<String>) -> Self {
        ServiceCallError::Service {
            status,
            message: message.into(),
        }
    }

    /// Text for the failed job's status line.
    pub fn user_message(&self) -> String {
        match self {
            ServiceCallError::Transport(_) => "Unable to reach the compute service.".to_string(),
            ServiceCallError::Service { message, .. } => message.clone(),
        }
    }
}

impl From<reqwest::Error> for ServiceCallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ServiceCallError::service(e.status().map(|s| s.as_u16()), format!("unexpected response: {e}"))
        } else {
            ServiceCallError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    /// Refused locally before anything was sent.
    #[error("{0}")]
    Validation(String),

    #[error("a {0} job is already in progress")]
    Busy(JobKind),

    /// The job was reset away before the service answered; its response was discarded.
    #[error("job {0} was abandoned before the service answered")]
    Superseded(u64),

    #[error(transparent)]
    Service(#[from] ServiceCallError),
}
