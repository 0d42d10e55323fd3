use registry::model::{Agent, PhoneNumber};
use registry::repository::Directory;
use tracing::warn;

use crate::error::DispatchError;

/// Pick the number a call is placed from.
///
/// Priority: explicitly supplied id, then the agent's assigned number,
/// then the user's newest number. `None` lets the provider decide.
///
/// An explicit id must exist and belong to the user; a mismatch is
/// fatal for the current attempt.
pub async fn select_source_number(
    directory: &dyn Directory,
    user_id: &str,
    explicit_id: Option<&str>,
    agent: &Agent,
) -> Result<Option<PhoneNumber>, DispatchError> {
    if let Some(id) = explicit_id {
        let number = directory
            .phone_number(id)
            .await?
            .ok_or_else(|| DispatchError::PhoneNumberNotFound(id.to_string()))?;

        if number.user_id != user_id {
            return Err(DispatchError::PhoneNumberNotOwned(
                id.to_string(),
                user_id.to_string(),
            ));
        }

        return Ok(Some(number));
    }

    if let Some(assigned) = &agent.phone_number_id {
        match directory.phone_number(assigned).await? {
            Some(number) => return Ok(Some(number)),
            None => {
                warn!(
                    agent_id = %agent.id,
                    phone_number_id = %assigned,
                    "agent's assigned number is missing; falling back"
                );
            }
        }
    }

    Ok(directory.newest_phone_number(user_id).await?)
}
