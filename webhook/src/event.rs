use anyhow::bail;
use serde_json::Value;

/// Identification the provider gives us for a finished conversation.
///
/// Payloads carry either the execution id (`id`) or the provider agent
/// id; the execution id is preferred when both are present.
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub execution_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<String>,
    pub conversation_duration: Option<u64>,
}

impl TerminalEvent {
    pub fn from_payload(payload: &Value) -> anyhow::Result<Self> {
        let pick = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);

        let event = Self {
            execution_id: pick("id").or_else(|| pick("execution_id")),
            agent_id: pick("agent_id"),
            status: pick("status"),
            conversation_duration: payload.get("conversation_duration").and_then(Value::as_u64),
        };

        if event.execution_id.is_none() && event.agent_id.is_none() {
            bail!("terminal event carries neither id nor agent_id");
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_id_over_agent_id() {
        let e = TerminalEvent::from_payload(&json!({
            "id": "exec-1",
            "agent_id": "agent-1",
            "status": "completed",
            "conversation_duration": 42,
        }))
        .unwrap();

        assert_eq!(e.execution_id.as_deref(), Some("exec-1"));
        assert_eq!(e.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(e.conversation_duration, Some(42));
    }

    #[test]
    fn agent_only_payload_is_accepted() {
        let e = TerminalEvent::from_payload(&json!({ "agent_id": "agent-1" })).unwrap();
        assert!(e.execution_id.is_none());
        assert_eq!(e.agent_id.as_deref(), Some("agent-1"));
    }

    #[test]
    fn unidentifiable_payload_is_rejected() {
        assert!(TerminalEvent::from_payload(&json!({ "status": "completed" })).is_err());
        assert!(TerminalEvent::from_payload(&json!(null)).is_err());
    }
}
