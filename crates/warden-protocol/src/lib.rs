//! Wire types exchanged between a warden agent and the fleet control
//! service: server-issued actions, acknowledgement events, and the
//! check-in request/response pair.
//!
//! Actions arrive as a tagged JSON object (`{"id": ..., "type": ...,
//! "data": {...}}`). Unrecognized types are preserved verbatim so an
//! older agent can acknowledge actions it does not understand yet.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub mod ack;

pub use ack::{AckEvent, AckRequest, AckResponse};

/// Discriminant for an [`Action`], used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PolicyChange,
    PolicyReassign,
    Unenroll,
    Upgrade,
    Settings,
    Cancel,
    App,
    Unknown,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PolicyChange => "POLICY_CHANGE",
            ActionKind::PolicyReassign => "POLICY_REASSIGN",
            ActionKind::Unenroll => "UNENROLL",
            ActionKind::Upgrade => "UPGRADE",
            ActionKind::Settings => "SETTINGS",
            ActionKind::Cancel => "CANCEL",
            ActionKind::App => "APP_ACTION",
            ActionKind::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an application-targeted action. The response slot is filled
/// by the handler exactly once before the action is acknowledged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppActionData {
    #[serde(default)]
    pub input_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Typed payload of a server-issued action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    /// A new effective policy document for this agent.
    PolicyChange { policy: Value },
    /// Reassignment to another policy; the new document follows later.
    PolicyReassign { policy_id: String },
    Unenroll,
    Upgrade {
        version: String,
        source_uri: Option<String>,
    },
    Settings { log_level: String },
    Cancel { target_id: String },
    App(AppActionData),
    /// Forward-compatibility: the original tag and payload are kept as-is.
    Unknown { original_type: String, data: Value },
}

/// A server-issued directive with a unique id and a typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: String,
    pub created_at: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub expiration: Option<DateTime<Utc>>,
    pub payload: ActionPayload,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match &self.payload {
            ActionPayload::PolicyChange { .. } => ActionKind::PolicyChange,
            ActionPayload::PolicyReassign { .. } => ActionKind::PolicyReassign,
            ActionPayload::Unenroll => ActionKind::Unenroll,
            ActionPayload::Upgrade { .. } => ActionKind::Upgrade,
            ActionPayload::Settings { .. } => ActionKind::Settings,
            ActionPayload::Cancel { .. } => ActionKind::Cancel,
            ActionPayload::App(_) => ActionKind::App,
            ActionPayload::Unknown { .. } => ActionKind::Unknown,
        }
    }

    /// Wire tag: the original string for unknown actions, the canonical
    /// one otherwise.
    pub fn type_str(&self) -> &str {
        match &self.payload {
            ActionPayload::Unknown { original_type, .. } => original_type,
            _ => self.kind().as_str(),
        }
    }

    /// True once `now` is at or past the scheduled start time. Actions
    /// without a start time are due immediately.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        match self.start_time {
            Some(start) => start <= now,
            None => true,
        }
    }

    /// True once `now` is past the expiration, if one was set.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(exp) => exp < now,
            None => false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawAction {
    id: String,
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

fn parse_time<E: serde::de::Error>(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, E> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| E::custom(format!("invalid {field} timestamp {s:?}: {e}"))),
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawAction::deserialize(deserializer)?;
        let payload = match raw.action_type.as_str() {
            "POLICY_CHANGE" => ActionPayload::PolicyChange {
                policy: raw.data.get("policy").cloned().unwrap_or(raw.data.clone()),
            },
            "POLICY_REASSIGN" => ActionPayload::PolicyReassign {
                policy_id: raw
                    .data
                    .get("policy_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "UNENROLL" => ActionPayload::Unenroll,
            "UPGRADE" => {
                let version = raw
                    .data
                    .get("version")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| D::Error::custom("UPGRADE action missing data.version"))?
                    .to_string();
                let source_uri = raw
                    .data
                    .get("source_uri")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string());
                ActionPayload::Upgrade { version, source_uri }
            }
            "SETTINGS" => ActionPayload::Settings {
                log_level: raw
                    .data
                    .get("log_level")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "CANCEL" => {
                let target_id = raw
                    .data
                    .get("target_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| D::Error::custom("CANCEL action missing data.target_id"))?
                    .to_string();
                ActionPayload::Cancel { target_id }
            }
            "APP_ACTION" => {
                let app: AppActionData = serde_json::from_value(raw.data.clone())
                    .map_err(|e| D::Error::custom(format!("invalid APP_ACTION data: {e}")))?;
                ActionPayload::App(app)
            }
            other => ActionPayload::Unknown {
                original_type: other.to_string(),
                data: raw.data,
            },
        };
        Ok(Action {
            id: raw.id,
            created_at: raw.created_at,
            start_time: parse_time("start_time", raw.start_time.as_deref())?,
            expiration: parse_time("expiration", raw.expiration.as_deref())?,
            payload,
        })
    }
}

impl Serialize for Action {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = match &self.payload {
            ActionPayload::PolicyChange { policy } => serde_json::json!({ "policy": policy }),
            ActionPayload::PolicyReassign { policy_id } => {
                serde_json::json!({ "policy_id": policy_id })
            }
            ActionPayload::Unenroll => Value::Null,
            ActionPayload::Upgrade { version, source_uri } => {
                serde_json::json!({ "version": version, "source_uri": source_uri })
            }
            ActionPayload::Settings { log_level } => {
                serde_json::json!({ "log_level": log_level })
            }
            ActionPayload::Cancel { target_id } => serde_json::json!({ "target_id": target_id }),
            ActionPayload::App(app) => serde_json::to_value(app).map_err(serde::ser::Error::custom)?,
            ActionPayload::Unknown { data, .. } => data.clone(),
        };
        let raw = RawAction {
            id: self.id.clone(),
            action_type: self.type_str().to_string(),
            created_at: self.created_at.clone(),
            start_time: self
                .start_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            expiration: self
                .expiration
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            data,
        };
        raw.serialize(serializer)
    }
}

/// Local agent state reported on every check-in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalMetadata {
    #[serde(default)]
    pub host: Value,
    #[serde(default)]
    pub agent: Value,
}

/// Body of `POST /api/fleet/agents/{id}/checkin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
    pub status: String,
    #[serde(default)]
    pub local_metadata: LocalMetadata,
}

/// Response to a check-in: a new ack token and the pending action batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upgrade_action_roundtrip() {
        let body = json!({
            "id": "a1",
            "type": "UPGRADE",
            "created_at": "2024-03-01T10:00:00Z",
            "data": {"version": "0.7.0", "source_uri": "https://artifacts.example/downloads"}
        });
        let action: Action = serde_json::from_value(body).unwrap();
        assert_eq!(action.kind(), ActionKind::Upgrade);
        match &action.payload {
            ActionPayload::Upgrade { version, source_uri } => {
                assert_eq!(version, "0.7.0");
                assert_eq!(source_uri.as_deref(), Some("https://artifacts.example/downloads"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        let back = serde_json::to_value(&action).unwrap();
        assert_eq!(back["type"], "UPGRADE");
        assert_eq!(back["data"]["version"], "0.7.0");
    }

    #[test]
    fn unknown_action_preserves_payload() {
        let body = json!({
            "id": "z9",
            "type": "FUTURE_THING",
            "data": {"anything": [1, 2, 3]}
        });
        let action: Action = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(action.kind(), ActionKind::Unknown);
        assert_eq!(action.type_str(), "FUTURE_THING");
        let back = serde_json::to_value(&action).unwrap();
        assert_eq!(back["type"], "FUTURE_THING");
        assert_eq!(back["data"], body["data"]);
    }

    #[test]
    fn scheduled_action_due_and_expiry() {
        let body = json!({
            "id": "s1",
            "type": "POLICY_CHANGE",
            "start_time": "2024-03-01T10:00:00Z",
            "expiration": "2024-03-01T11:00:00Z",
            "data": {"policy": {"outputs": {}}}
        });
        let action: Action = serde_json::from_value(body).unwrap();
        let before = "2024-03-01T09:59:00Z".parse::<DateTime<Utc>>().unwrap();
        let between = "2024-03-01T10:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let after = "2024-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(!action.due(before));
        assert!(action.due(between));
        assert!(!action.expired(between));
        assert!(action.expired(after));
    }

    #[test]
    fn cancel_requires_target() {
        let body = json!({"id": "c1", "type": "CANCEL", "data": {}});
        assert!(serde_json::from_value::<Action>(body).is_err());
    }

    #[test]
    fn checkin_response_parses_mixed_batch() {
        let body = json!({
            "ack_token": "t-2",
            "actions": [
                {"id": "a", "type": "POLICY_CHANGE", "data": {"policy": {"rev": 4}}},
                {"id": "b", "type": "CANCEL", "data": {"target_id": "a"}},
                {"id": "c", "type": "SOMETHING_NEW", "data": {"x": true}}
            ]
        });
        let resp: CheckinResponse = serde_json::from_value(body).unwrap();
        assert_eq!(resp.ack_token.as_deref(), Some("t-2"));
        let kinds: Vec<ActionKind> = resp.actions.iter().map(|a| a.kind()).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::PolicyChange, ActionKind::Cancel, ActionKind::Unknown]
        );
    }
}
