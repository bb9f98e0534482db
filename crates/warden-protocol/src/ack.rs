//! Acknowledgement events posted to `POST /api/fleet/agents/{id}/acks`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Action, ActionPayload};

pub const EVENT_TYPE_ACTION_RESULT: &str = "ACTION_RESULT";
pub const SUBTYPE_ACKNOWLEDGED: &str = "ACKNOWLEDGED";

/// Fleet expects ISO-8601 with a numeric offset and hundred-thousandths
/// of a second, e.g. `2024-03-01T10:00:00.12345+00:00`.
pub fn format_fleet_time(t: DateTime<Utc>) -> String {
    let frac = t.timestamp_subsec_micros() / 10;
    format!("{}.{:05}+00:00", t.format("%Y-%m-%dT%H:%M:%S"), frac)
}

/// One acknowledgement for one action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckEvent {
    pub event_type: String,
    pub sub_type: String,
    pub timestamp: String,
    pub action_id: String,
    pub agent_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckEvent {
    /// Build the acknowledgement event for `action`. App actions carry
    /// their input, data, and response alongside the result.
    pub fn acknowledged(action: &Action, agent_id: &str, now: DateTime<Utc>) -> Self {
        let mut ev = AckEvent {
            event_type: EVENT_TYPE_ACTION_RESULT.to_string(),
            sub_type: SUBTYPE_ACKNOWLEDGED.to_string(),
            timestamp: format_fleet_time(now),
            action_id: action.id.clone(),
            agent_id: agent_id.to_string(),
            message: format!(
                "Action '{}' of type '{}' acknowledged.",
                action.id,
                action.type_str()
            ),
            action_input_type: None,
            action_data: None,
            action_response: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        if let ActionPayload::App(app) = &action.payload {
            ev.action_input_type = Some(app.input_type.clone());
            ev.action_data = Some(app.data.clone());
            ev.action_response = app.response.clone();
            ev.started_at = app.started_at.clone();
            ev.completed_at = app.completed_at.clone();
            ev.error = app.error.clone();
        }
        ev
    }
}

/// Body of the acks request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckRequest {
    pub events: Vec<AckEvent>,
}

/// Fleet's reply; `errors` is set when any item was rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckResponse {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub errors: bool,
}
