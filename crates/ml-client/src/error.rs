use thiserror::Error;

#[derive(Error, Debug)]
pub enum MLError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MLError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            MLError::RequestFailed(e) => !(e.is_decode() || e.is_builder()),
            MLError::ServiceUnavailable(_) | MLError::Timeout => true,
            MLError::Rejected(_)
            | MLError::InvalidResponse(_)
            | MLError::Model(_)
            | MLError::Serialization(_) => false,
        }
    }
}

pub type MLResult<T> = Result<T, MLError>;
