use steward_core::errors::ApplicationError;
use steward_db::RepositoryError;
use thiserror::Error;

/// Failures that end a turn. Tool failures never surface here.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model configuration error: {0}")]
    Configuration(String),
    #[error("model call failed: {0}")]
    Model(String),
    #[error(transparent)]
    Persistence(#[from] RepositoryError),
    #[error("settings unavailable: {0}")]
    Settings(#[source] ApplicationError),
    #[error("turn cancelled")]
    Cancelled,
    #[error("turn exceeded the limit of {0} steps")]
    StepLimitExceeded(u32),
}

impl From<AgentError> for ApplicationError {
    fn from(value: AgentError) -> Self {
        match value {
            AgentError::Configuration(message) => ApplicationError::Configuration(message),
            AgentError::Persistence(error) => ApplicationError::Persistence(error.to_string()),
            AgentError::Settings(error) => error,
            AgentError::Cancelled => ApplicationError::Cancelled,
            error @ (AgentError::Model(_) | AgentError::StepLimitExceeded(_)) => {
                ApplicationError::Integration(error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use steward_core::errors::ApplicationError;
    use steward_db::RepositoryError;

    use super::AgentError;

    #[test]
    fn agent_errors_keep_their_layer_in_the_application_taxonomy() {
        assert_eq!(
            ApplicationError::from(AgentError::Configuration("no api key".into())),
            ApplicationError::Configuration("no api key".into())
        );
        assert_eq!(ApplicationError::from(AgentError::Cancelled), ApplicationError::Cancelled);
        assert!(matches!(
            ApplicationError::from(AgentError::Persistence(RepositoryError::Invariant("x".into()))),
            ApplicationError::Persistence(message) if message.contains("invariant violation")
        ));
        assert!(matches!(
            ApplicationError::from(AgentError::StepLimitExceeded(25)),
            ApplicationError::Integration(message) if message.contains("25 steps")
        ));
    }
}
