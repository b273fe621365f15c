use serde::{Deserialize, Serialize};

use crate::schema::{Effect, ScopeType};

/// Final outcome of an evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl From<Effect> for Decision {
    fn from(effect: Effect) -> Self {
        match effect {
            Effect::Allow => Decision::Allow,
            Effect::Deny => Decision::Deny,
        }
    }
}

/// A rule whose action and target matched, recorded for the explanation
/// trace whether or not its conditions held.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchedRule {
    pub rule_id: String,
    pub policy_name: String,
    pub effect: Effect,
    pub target: String,
    /// Priority of the binding the policy was reached through.
    pub priority: i32,
    pub conditions_met: bool,
}

/// One entry of the candidate list, in evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingTrace {
    pub binding_id: String,
    pub policy_name: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub priority: i32,
}

/// The outcome of evaluating a request against one store snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalResult {
    pub decision: Decision,
    /// Rule that decided the outcome; `None` for a default deny.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Human-readable reason explaining the decision.
    pub reason: String,
    /// Populated only when the request asked for an explanation.
    #[serde(default)]
    pub matched_rules: Vec<MatchedRule>,
    #[serde(default)]
    pub bindings_order: Vec<BindingTrace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Generation of the snapshot the request was evaluated against.
    pub snapshot_generation: u64,
}

impl EvalResult {
    /// Deny because nothing matched.
    pub fn default_deny(reason: impl Into<String>, snapshot_generation: u64) -> Self {
        Self {
            decision: Decision::Deny,
            rule_id: None,
            reason: reason.into(),
            matched_rules: Vec::new(),
            bindings_order: Vec::new(),
            warnings: Vec::new(),
            snapshot_generation,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}
