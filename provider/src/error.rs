use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected call ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("provider accepted the call but returned no execution id")]
    MissingExecutionId,
}

impl ProviderError {
    /// Stable message persisted as a queue item's failure reason.
    pub fn stable_message(&self) -> String {
        match self {
            ProviderError::Http(e) if e.is_timeout() => "provider timeout".to_string(),
            other => other.to_string(),
        }
    }
}
