use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Wire status of an action that still awaits a decision.
pub const STATUS_PENDING: i32 = 1;
/// Wire status submitted when approving an action.
pub const STATUS_APPROVE: i32 = 3;
/// Wire status submitted when rejecting an action.
pub const STATUS_REJECT: i32 = 4;

/// Ready state of the upstream feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending authorization request received on the upstream feed.
///
/// `messages` carries the payload bytes, base64 encoded on the wire; the
/// first entry is the one that gets signed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default, with = "base64_messages")]
    pub messages: Vec<Vec<u8>>,
    #[serde(rename = "expireTime", default)]
    pub expire_time: i64,
}

mod base64_messages {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(messages: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(messages.iter().map(|m| BASE64.encode(m)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        raw.into_iter()
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

impl ActionInfo {
    /// An action whose expiry is at or before the current wall-clock second
    /// must not be signed.
    pub fn is_expired(&self) -> bool {
        self.expire_time <= Utc::now().timestamp()
    }

    pub fn is_pending(&self) -> bool {
        self.status == STATUS_PENDING
    }
}

/// The registered identity of this agent, persisted once at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(rename = "blsPrivateKey")]
    pub bls_private_key: String,
    #[serde(rename = "ecPrivateKey")]
    pub ec_private_key: String,
    #[serde(rename = "workspaceID")]
    pub workspace_id: String,
    #[serde(rename = "APIKeyID")]
    pub api_key_id: String,
    #[serde(rename = "APIKeySecret")]
    pub api_key_secret: String,
}

/// Path prefix of the local API.
pub const PATH_PREFIX: &str = "/api/v2";

pub fn url_api_key(base_url: &str, workspace_id: &str, api_key_id: &str) -> String {
    format!("{}/workspaces/{}/apikeys/{}", base_url, workspace_id, api_key_id)
}

pub fn url_token(base_url: &str, workspace_id: &str) -> String {
    format!("{}/workspaces/{}/token", base_url, workspace_id)
}

pub fn url_token_refresh(base_url: &str, workspace_id: &str) -> String {
    format!("{}/workspaces/{}/token/refresh", base_url, workspace_id)
}

pub fn url_action(base_url: &str, action_id: &str) -> String {
    format!("{}/actions/{}", base_url, action_id)
}

pub fn url_local_feed(http_addr: &str) -> String {
    format!("ws://{}{}/client/feed", http_addr, PATH_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_expiry_boundary() {
        let now = Utc::now().timestamp();

        // expireTime == now counts as expired
        let action = ActionInfo {
            id: "a".to_string(),
            status: STATUS_PENDING,
            messages: vec![],
            expire_time: now,
        };
        assert!(action.is_expired());

        let live = ActionInfo {
            expire_time: now + 60,
            ..action.clone()
        };
        assert!(!live.is_expired());
    }

    #[test]
    fn test_action_parses_wire_json() {
        // messages are base64 on the wire
        let raw = r#"{"id":"action-1","status":1,"messages":["cGF5bG9hZA=="],"expireTime":4102444800}"#;
        let action: ActionInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(action.id, "action-1");
        assert!(action.is_pending());
        assert_eq!(action.messages[0], b"payload");
    }

    #[test]
    fn test_action_rejects_non_base64_messages() {
        let raw = r#"{"id":"a","status":1,"messages":["%%%"],"expireTime":4102444800}"#;
        assert!(serde_json::from_str::<ActionInfo>(raw).is_err());
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            url_action("https://api.example.net", "a1"),
            "https://api.example.net/actions/a1"
        );
        assert_eq!(
            url_token("https://api.example.net", "w1"),
            "https://api.example.net/workspaces/w1/token"
        );
        assert_eq!(
            url_api_key("https://api.example.net", "w1", "k1"),
            "https://api.example.net/workspaces/w1/apikeys/k1"
        );
        assert_eq!(
            url_local_feed("127.0.0.1:8007"),
            "ws://127.0.0.1:8007/api/v2/client/feed"
        );
    }
}
