use thiserror::Error;

/// Errors surfaced to interactive callers.
///
/// Precondition variants mean no slot was ever held. Capacity is never
/// an error: it travels as a `ReserveOutcome` value.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent {0} is not owned by user {1}")]
    AgentNotOwned(String, String),

    #[error("phone number not found: {0}")]
    PhoneNumberNotFound(String),

    #[error("phone number {0} is not owned by user {1}")]
    PhoneNumberNotOwned(String, String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            DispatchError::AgentNotFound(_)
                | DispatchError::AgentNotOwned(_, _)
                | DispatchError::PhoneNumberNotFound(_)
                | DispatchError::PhoneNumberNotOwned(_, _)
        )
    }
}
