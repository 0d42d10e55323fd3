use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lead details forwarded to the provider.
///
/// Upstream payloads mix several conventions (`name`/`lead_name`,
/// `company`/`business_name`). They are normalized here, once, with
/// empty-string defaults; no variant ever travels past this boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub lead_name: String,
    pub business_name: String,
    pub email: String,
}

impl UserData {
    pub fn normalize(raw: &Value) -> Self {
        let pick = |keys: &[&str]| -> String {
            keys.iter()
                .find_map(|k| raw.get(k).and_then(Value::as_str))
                .unwrap_or_default()
                .to_string()
        };

        Self {
            lead_name: pick(&["lead_name", "name"]),
            business_name: pick(&["business_name", "company"]),
            email: pick(&["email"]),
        }
    }
}

/// Correlation fields echoed back by the provider's terminal events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetadata {
    pub user_id: String,
    pub internal_agent_id: String,
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallRequest {
    /// Provider-assigned agent id, not our internal one.
    pub agent_id: String,
    pub recipient_phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_phone_number: Option<String>,
    pub user_data: UserData,
    pub metadata: CallMetadata,
}

/// Successful placement handle; terminal events reference this id.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRef {
    #[serde(alias = "id")]
    pub execution_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_canonical_fields() {
        let data = UserData::normalize(&json!({
            "lead_name": "Ada",
            "business_name": "Lovelace Ltd",
            "email": "ada@example.com",
        }));

        assert_eq!(data.lead_name, "Ada");
        assert_eq!(data.business_name, "Lovelace Ltd");
        assert_eq!(data.email, "ada@example.com");
    }

    #[test]
    fn normalizes_variant_fields() {
        let data = UserData::normalize(&json!({
            "name": "Grace",
            "company": "Hopper Inc",
        }));

        assert_eq!(data.lead_name, "Grace");
        assert_eq!(data.business_name, "Hopper Inc");
        assert_eq!(data.email, "");
    }

    #[test]
    fn canonical_fields_win_over_variants() {
        let data = UserData::normalize(&json!({
            "lead_name": "Ada",
            "name": "ignored",
            "business_name": "Lovelace Ltd",
            "company": "ignored",
        }));

        assert_eq!(data.lead_name, "Ada");
        assert_eq!(data.business_name, "Lovelace Ltd");
    }

    #[test]
    fn missing_or_non_object_payloads_default_to_empty() {
        assert_eq!(UserData::normalize(&json!({})), UserData::default());
        assert_eq!(UserData::normalize(&json!(null)), UserData::default());
        assert_eq!(UserData::normalize(&json!("junk")), UserData::default());
    }

    #[test]
    fn execution_ref_accepts_id_alias() {
        let r: ExecutionRef = serde_json::from_value(json!({ "id": "ex-1" })).unwrap();
        assert_eq!(r.execution_id, "ex-1");

        let r: ExecutionRef =
            serde_json::from_value(json!({ "execution_id": "ex-2" })).unwrap();
        assert_eq!(r.execution_id, "ex-2");
    }
}
