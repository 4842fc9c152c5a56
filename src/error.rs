use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

impl LLMError {
    /// Whether repeating the same request may succeed. Only a request that could
    /// not be built is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            LLMError::Http(error) => !error.is_builder(),
            LLMError::Serialization(_)
            | LLMError::Provider(_)
            | LLMError::InvalidResponse(_) => true,
        }
    }
}

/// Failures scoped to a single graph execution; sibling runs are unaffected.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("model call failed in node '{node}': {source}")]
    Model {
        node: String,
        #[source]
        source: LLMError,
    },

    #[error("router '{router}' returned unmapped label '{label}'")]
    UnmappedLabel { router: String, label: String },

    #[error("recursion limit of {limit} steps reached before END")]
    DepthLimit { limit: usize },

    #[error("run exceeded its time budget of {0:?}")]
    TimedOut(std::time::Duration),

    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),
}
