use thiserror::Error;

pub type JourneyResult<T> = Result<T, JourneyError>;

#[derive(Error, Debug)]
pub enum JourneyError {
    /// The content store returned an unexpected or incomplete shape. Retrying
    /// reproduces the same error, so the message is dead-lettered.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("Content store error: {0}")]
    Content(String),

    #[error("Rule evaluation error: {0}")]
    RuleEvaluation(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Marker cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl JourneyError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for errors that will reproduce on every redelivery.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::NotFound { .. } | Self::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_classification() {
        assert!(JourneyError::config("missing contacts").is_config());
        assert!(JourneyError::NotFound { entity: "journey step", id: 7 }.is_config());
        assert!(!JourneyError::Content("connection refused".into()).is_config());
        assert!(!JourneyError::Broker("channel closed".into()).is_config());
    }

    #[test]
    fn test_not_found_message() {
        let err = JourneyError::NotFound { entity: "journey", id: 42 };
        assert_eq!(err.to_string(), "journey 42 not found");
    }
}
