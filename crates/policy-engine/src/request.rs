use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher;
use crate::schema::{Action, TargetFamily};

/// Rejection of a request before evaluation starts.  Distinct from a deny
/// decision, which is a valid result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("bad request: {reason}")]
    BadRequest { reason: String },
}

impl EvalError {
    pub(crate) fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }
}

/// Runtime facts consulted by rule conditions.  Every field is optional; a
/// condition that needs a missing field simply fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvalContext {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub risk_level: Option<f64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub payload_size_mb: Option<f64>,
    /// Tool driving a non-tool action (e.g. a resource read made by a tool run).
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub resource_namespace: Option<String>,
    /// Nesting depth of agent/tool invocations.
    #[serde(default)]
    pub call_depth: Option<u32>,
    #[serde(default)]
    pub budget_left_cents: Option<i64>,
    #[serde(default)]
    pub ttl_valid: Option<bool>,
    /// IANA zone for `time_window` conditions; UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// A single access question: may this actor perform `action` on `target`?
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalRequest {
    pub action: Action,
    pub target: String,
    /// Verified subject, e.g. `user:123`.
    #[serde(default)]
    pub subject: Option<String>,
    pub organization_id: String,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub tool_id: Option<String>,
    /// Roles resolved for the subject by the authentication layer.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub explain: bool,
    #[serde(default)]
    pub context: EvalContext,
}

impl EvalRequest {
    pub fn new(action: Action, target: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            subject: None,
            organization_id: organization_id.into(),
            environment_id: None,
            agent_id: None,
            tool_id: None,
            roles: Vec::new(),
            explain: false,
            context: EvalContext::default(),
        }
    }

    pub fn with_environment(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_context(mut self, context: EvalContext) -> Self {
        self.context = context;
        self
    }

    pub fn explained(mut self) -> Self {
        self.explain = true;
        self
    }

    /// Decode a request from the JSON shape the console and middleware send.
    pub fn from_json(value: serde_json::Value) -> Result<Self, EvalError> {
        serde_json::from_value(value).map_err(|e| EvalError::bad_request(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self, EvalError> {
        serde_json::from_str(s).map_err(|e| EvalError::bad_request(e.to_string()))
    }

    /// Shape checks performed before any policy is consulted.
    pub fn validate(&self) -> Result<(), EvalError> {
        if self.target.is_empty() {
            return Err(EvalError::bad_request("missing target"));
        }
        if self.organization_id.is_empty() {
            return Err(EvalError::bad_request("missing organization_id"));
        }
        matcher::validate_target(self.action, &self.target)
            .map_err(|e| EvalError::bad_request(e.to_string()))
    }

    /// Namespace used for `resource_ns` bindings and `allowed_resource_ns`.
    ///
    /// An explicit context value wins; otherwise resource targets supply it.
    pub fn resource_namespace(&self) -> Option<&str> {
        if let Some(ns) = self.context.resource_namespace.as_deref() {
            return Some(ns);
        }
        if self.action.family() == TargetFamily::Resource {
            return matcher::resource_namespace(&self.target);
        }
        None
    }
}
