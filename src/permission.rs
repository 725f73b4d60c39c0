//! Tool-call permission gating: fingerprints, policy modes, and the
//! per-session decision memory.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::session::SessionId;

pub const OPTION_ALLOW_ONCE: &str = "allow_once";
pub const OPTION_ALLOW_ALWAYS: &str = "allow_always";
pub const OPTION_REJECT_ONCE: &str = "reject_once";
pub const OPTION_REJECT_ALWAYS: &str = "reject_always";

/// A source location a tool call touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallLocation {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl ToolCallLocation {
    fn render(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{line}", self.path),
            None => self.path.clone(),
        }
    }
}

/// What a tool call is, for permission purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDescriptor {
    pub kind: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ToolCallLocation>,
    pub raw_input: Value,
}

impl ToolCallDescriptor {
    /// Canonical fingerprint: identical semantic content always produces
    /// the same string, regardless of JSON key order or location order.
    pub fn fingerprint(&self) -> String {
        let mut locations: Vec<String> = self.locations.iter().map(|l| l.render()).collect();
        locations.sort();

        let mut input = String::new();
        write_canonical_json(&self.raw_input, &mut input);

        format!(
            "{}\n{}\n{}\n{}",
            self.kind,
            self.title,
            locations.join(","),
            input
        )
    }
}

/// Render a JSON value with recursively key-sorted objects.
fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical_json(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// One choice offered to the user alongside a permission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: String,
}

fn standard_options() -> Vec<PermissionOption> {
    vec![
        PermissionOption {
            option_id: OPTION_ALLOW_ONCE.into(),
            name: "Allow once".into(),
            kind: "allow_once".into(),
        },
        PermissionOption {
            option_id: OPTION_ALLOW_ALWAYS.into(),
            name: "Always allow".into(),
            kind: "allow_always".into(),
        },
        PermissionOption {
            option_id: OPTION_REJECT_ONCE.into(),
            name: "Reject".into(),
            kind: "reject_once".into(),
        },
        PermissionOption {
            option_id: OPTION_REJECT_ALWAYS.into(),
            name: "Always reject".into(),
            kind: "reject_always".into(),
        },
    ]
}

/// Parameters of a `session/request_permission` reverse request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    pub session_id: SessionId,
    pub tool_call: ToolCallDescriptor,
    pub options: Vec<PermissionOption>,
}

impl PermissionRequestParams {
    pub fn for_call(session_id: &SessionId, call: &ToolCallDescriptor) -> Self {
        Self {
            session_id: session_id.clone(),
            tool_call: call.clone(),
            options: standard_options(),
        }
    }
}

/// The user's verdict: a selected option, or a cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    #[serde(rename_all = "camelCase")]
    Selected { option_id: String },
    Cancelled,
}

impl PermissionOutcome {
    /// Whether this outcome lets the gated work proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionOutcome::Selected { option_id }
            if option_id == OPTION_ALLOW_ONCE || option_id == OPTION_ALLOW_ALWAYS)
    }
}

/// Delivers a permission request to whoever can answer it (normally the
/// bridge, which relays it to the client).
#[async_trait]
pub trait PermissionRequester: Send + Sync {
    async fn request(&self, params: PermissionRequestParams) -> Result<PermissionOutcome, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    /// Bypass the bridge; every call is allowed once.
    Allow,
    /// Bypass the bridge; every call surfaces as cancelled.
    Deny,
    /// Ask the client through the bridge.
    #[default]
    Ask,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub mode: PermissionMode,
    /// In `ask` mode, convert a bridge failure (timeout/RPC error) into a
    /// fallback `allow_once` instead of surfacing it.
    pub fallback_allow_when_unavailable: bool,
}

/// Permission policy plus the per-session decision memory.
pub struct PermissionPolicy {
    config: PolicyConfig,
    memory: Mutex<HashMap<(String, String), String>>,
}

impl PermissionPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `call` may proceed in `session_id`.
    ///
    /// Memory is consulted before the bridge. A remembered `allow_always`
    /// replays as its original selected option; a remembered
    /// `reject_always` deliberately replays as *cancelled*; client code
    /// depends on that asymmetry.
    pub async fn evaluate(
        &self,
        session_id: &SessionId,
        call: &ToolCallDescriptor,
        requester: &dyn PermissionRequester,
    ) -> Result<PermissionOutcome, Error> {
        match self.config.mode {
            PermissionMode::Allow => Ok(PermissionOutcome::Selected {
                option_id: OPTION_ALLOW_ONCE.into(),
            }),
            PermissionMode::Deny => Ok(PermissionOutcome::Cancelled),
            PermissionMode::Ask => {
                let fingerprint = call.fingerprint();
                if let Some(remembered) = self.recall(session_id, &fingerprint) {
                    tracing::debug!(%session_id, option = %remembered, "replaying remembered permission");
                    return Ok(if remembered == OPTION_REJECT_ALWAYS {
                        PermissionOutcome::Cancelled
                    } else {
                        PermissionOutcome::Selected {
                            option_id: remembered,
                        }
                    });
                }

                let params = PermissionRequestParams::for_call(session_id, call);
                match requester.request(params).await {
                    Ok(outcome) => {
                        self.remember(session_id, &fingerprint, &outcome);
                        Ok(outcome)
                    }
                    Err(error) if self.config.fallback_allow_when_unavailable => {
                        tracing::warn!(%error, "permission bridge unavailable, falling back to allow");
                        Ok(PermissionOutcome::Selected {
                            option_id: OPTION_ALLOW_ONCE.into(),
                        })
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    fn recall(&self, session_id: &SessionId, fingerprint: &str) -> Option<String> {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory
            .get(&(session_id.to_string(), fingerprint.to_string()))
            .cloned()
    }

    /// Persist a decision, but only the sticky ones.
    pub fn remember(
        &self,
        session_id: &SessionId,
        fingerprint: &str,
        outcome: &PermissionOutcome,
    ) {
        let PermissionOutcome::Selected { option_id } = outcome else {
            return;
        };
        if option_id != OPTION_ALLOW_ALWAYS && option_id != OPTION_REJECT_ALWAYS {
            return;
        }
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory.insert(
            (session_id.to_string(), fingerprint.to_string()),
            option_id.clone(),
        );
    }

    /// Forget everything remembered for a session (delete / logout).
    pub fn clear(&self, session_id: &SessionId) {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory.retain(|(sid, _), _| sid != session_id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(raw_input: Value, locations: Vec<ToolCallLocation>) -> ToolCallDescriptor {
        ToolCallDescriptor {
            kind: "execute".into(),
            title: "run build".into(),
            locations,
            raw_input,
        }
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = call(json!({"cmd": "make", "env": {"b": 1, "a": 2}}), vec![]);
        let b = call(json!({"env": {"a": 2, "b": 1}, "cmd": "make"}), vec![]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_location_order() {
        let loc = |path: &str, line| ToolCallLocation {
            path: path.into(),
            line: Some(line),
        };
        let a = call(json!({}), vec![loc("a.rs", 1), loc("b.rs", 2)]);
        let b = call(json!({}), vec![loc("b.rs", 2), loc("a.rs", 1)]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_content() {
        let a = call(json!({"cmd": "make"}), vec![]);
        let b = call(json!({"cmd": "make clean"}), vec![]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
