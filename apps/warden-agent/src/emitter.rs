//! Turns an effective policy document into per-output worker
//! configurations: validate, decorate, group by output, hand to the
//! router.
//!
//! Policy shape (server-defined):
//! ```json
//! {
//!   "outputs": { "default": {...}, "monitoring": {...} },
//!   "inputs":  [ {"type": "...", "use_output": "default", ...}, ... ]
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use warden_events::{topics, Bus};

use crate::agent_info::AgentInfo;
use crate::errors::AgentError;
use crate::router::Router;

const DEFAULT_OUTPUT: &str = "default";

/// Mutates each grouped configuration before it is routed.
pub type Decorator = fn(&crate::agent_info::AgentSnapshot, &str, &mut Value);

/// Rejects a policy document before any grouping happens.
pub type Filter = fn(&Value) -> Result<(), AgentError>;

pub struct Emitter {
    agent_info: AgentInfo,
    router: Arc<Router>,
    bus: Bus,
    decorators: Vec<Decorator>,
    filters: Vec<Filter>,
}

impl Emitter {
    pub fn new(agent_info: AgentInfo, router: Arc<Router>, bus: Bus) -> Self {
        Self {
            agent_info,
            router,
            bus,
            decorators: vec![inject_agent_meta],
            filters: vec![require_outputs],
        }
    }

    pub fn with_decorator(mut self, d: Decorator) -> Self {
        self.decorators.push(d);
        self
    }

    pub fn with_filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    /// Validate and fan the policy out to the router.
    pub async fn emit(&self, policy: &Value) -> Result<(), AgentError> {
        for filter in &self.filters {
            filter(policy)?;
        }

        let mut grouped = group_by_output(policy);
        let snapshot = self.agent_info.snapshot();
        for (output, config) in grouped.iter_mut() {
            for decorator in &self.decorators {
                decorator(&snapshot, output, config);
            }
        }

        debug!(outputs = grouped.len(), "routing policy configuration");
        self.router.route(grouped).await?;
        self.bus.publish(
            topics::TOPIC_POLICY_APPLIED,
            &json!({
                "revision": policy.get("revision").cloned().unwrap_or(Value::Null),
            }),
        );
        Ok(())
    }
}

/// Decorator enabling self-monitoring collection on every worker.
pub fn inject_monitoring(
    _snapshot: &crate::agent_info::AgentSnapshot,
    _output: &str,
    config: &mut Value,
) {
    if let Some(obj) = config.as_object_mut() {
        obj.entry("monitoring").or_insert_with(|| {
            json!({
                "enabled": true,
                "logs": true,
                "metrics": true,
            })
        });
    }
}

/// Filter rejecting policies with untyped inputs; workers cannot route
/// an input that does not say what it is.
pub fn input_type_checker(policy: &Value) -> Result<(), AgentError> {
    let inputs = policy
        .get("inputs")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();
    for input in inputs {
        if input.get("type").and_then(|t| t.as_str()).is_none() {
            return Err(AgentError::config("policy input is missing a type"));
        }
    }
    Ok(())
}

fn require_outputs(policy: &Value) -> Result<(), AgentError> {
    if !policy.is_object() {
        return Err(AgentError::config("policy document is not an object"));
    }
    match policy.get("outputs").and_then(|o| o.as_object()) {
        Some(outputs) if !outputs.is_empty() => Ok(()),
        _ => Err(AgentError::config("policy document has no outputs")),
    }
}

fn inject_agent_meta(
    snapshot: &crate::agent_info::AgentSnapshot,
    _output: &str,
    config: &mut Value,
) {
    if let Some(obj) = config.as_object_mut() {
        obj.insert(
            "agent".to_string(),
            json!({
                "id": snapshot.agent_id,
                "version": snapshot.version,
                "log_level": snapshot.log_level,
            }),
        );
    }
}

/// Group inputs under the output they reference; inputs with no
/// `use_output` go to the default output.
fn group_by_output(policy: &Value) -> BTreeMap<String, Value> {
    let outputs = policy
        .get("outputs")
        .and_then(|o| o.as_object())
        .cloned()
        .unwrap_or_default();
    let inputs = policy
        .get("inputs")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();

    let mut grouped = BTreeMap::new();
    for (name, output) in outputs {
        let matching: Vec<Value> = inputs
            .iter()
            .filter(|input| {
                input
                    .get("use_output")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_OUTPUT)
                    == name.as_str()
            })
            .cloned()
            .collect();
        let mut named_output = serde_json::Map::new();
        named_output.insert(name.clone(), output);
        grouped.insert(
            name,
            json!({
                "output": Value::Object(named_output),
                "inputs": matching,
            }),
        );
    }
    grouped
}
