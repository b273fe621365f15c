use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A named, enable-able container of rules, owned by an organization and
/// optionally pinned to one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: String,
    pub organization_id: String,
    /// `None` means the policy applies organization-wide.
    #[serde(default)]
    pub environment_id: Option<String>,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bumped on every edit of the policy, its rules or its bindings.
    #[serde(default = "default_version")]
    pub version: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> u64 {
    1
}

/// A single `(action, target, effect, conditions)` tuple belonging to one
/// policy.  Rules are scanned in the order they were declared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub id: String,
    pub policy_id: String,
    pub action: Declared<Action>,
    /// Namespaced target pattern, e.g. `tool:finance/*`.
    pub target: String,
    pub effect: Declared<Effect>,
    /// Condition key → operand.  All entries must hold (AND).
    #[serde(default)]
    pub conditions: BTreeMap<String, serde_json::Value>,
}

/// Attaches a policy to a concrete scope.  Lower `priority` is evaluated
/// first; ties keep creation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyBinding {
    pub id: String,
    pub policy_id: String,
    pub scope_type: Declared<ScopeType>,
    pub scope_id: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

pub(crate) fn default_priority() -> i32 {
    100
}

/// An enum-valued field read from stored definitions.
///
/// Names this build does not know are kept verbatim instead of failing the
/// whole document, so a reload can reject just the policy that uses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared<T> {
    Known(T),
    Unknown(String),
}

impl<T: Copy> Declared<T> {
    pub fn known(&self) -> Option<T> {
        match self {
            Declared::Known(value) => Some(*value),
            Declared::Unknown(_) => None,
        }
    }
}

impl<T> From<T> for Declared<T> {
    fn from(value: T) -> Self {
        Declared::Known(value)
    }
}

impl<T: fmt::Display> fmt::Display for Declared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declared::Known(value) => value.fmt(f),
            Declared::Unknown(raw) => f.write_str(raw),
        }
    }
}

impl<T: fmt::Display> Serialize for Declared<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: FromStr> Deserialize<'de> for Declared<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.parse() {
            Ok(value) => Declared::Known(value),
            Err(_) => Declared::Unknown(raw),
        })
    }
}

/// A name that is not one of an enum's wire values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{name}'")]
pub struct UnknownName {
    pub kind: &'static str,
    pub name: String,
}

impl UnknownName {
    fn new(kind: &'static str, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

/// The operation a request wants to perform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Action {
    #[serde(rename = "tool.invoke")]
    ToolInvoke,
    #[serde(rename = "agent.invoke")]
    AgentInvoke,
    #[serde(rename = "resource.read")]
    ResourceRead,
    #[serde(rename = "resource.write")]
    ResourceWrite,
}

impl Action {
    pub fn family(self) -> TargetFamily {
        match self {
            Action::ToolInvoke => TargetFamily::Tool,
            Action::AgentInvoke => TargetFamily::Agent,
            Action::ResourceRead | Action::ResourceWrite => TargetFamily::Resource,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::ToolInvoke => "tool.invoke",
            Action::AgentInvoke => "agent.invoke",
            Action::ResourceRead => "resource.read",
            Action::ResourceWrite => "resource.write",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool.invoke" => Ok(Action::ToolInvoke),
            "agent.invoke" => Ok(Action::AgentInvoke),
            "resource.read" => Ok(Action::ResourceRead),
            "resource.write" => Ok(Action::ResourceWrite),
            other => Err(UnknownName::new("action", other)),
        }
    }
}

/// Namespace grammar a target belongs to, derived from the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFamily {
    /// `tool:{namespace}/{name}`
    Tool,
    /// `agent:{slug}`
    Agent,
    /// `resource:{namespace}/{path...}`
    Resource,
}

impl TargetFamily {
    pub fn prefix(self) -> &'static str {
        match self {
            TargetFamily::Tool => "tool",
            TargetFamily::Agent => "agent",
            TargetFamily::Resource => "resource",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => f.write_str("allow"),
            Effect::Deny => f.write_str("deny"),
        }
    }
}

impl FromStr for Effect {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            other => Err(UnknownName::new("effect", other)),
        }
    }
}

/// The dimension a binding is anchored to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Org,
    Env,
    Agent,
    Tool,
    Role,
    User,
    ResourceNs,
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScopeType::Org => "org",
            ScopeType::Env => "env",
            ScopeType::Agent => "agent",
            ScopeType::Tool => "tool",
            ScopeType::Role => "role",
            ScopeType::User => "user",
            ScopeType::ResourceNs => "resource_ns",
        };
        f.write_str(s)
    }
}

impl FromStr for ScopeType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "org" => Ok(ScopeType::Org),
            "env" => Ok(ScopeType::Env),
            "agent" => Ok(ScopeType::Agent),
            "tool" => Ok(ScopeType::Tool),
            "role" => Ok(ScopeType::Role),
            "user" => Ok(ScopeType::User),
            "resource_ns" => Ok(ScopeType::ResourceNs),
            other => Err(UnknownName::new("scope_type", other)),
        }
    }
}

/// Everything needed to rebuild a store snapshot, in the flat shapes the
/// management surface hands out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Schema version; currently must be "1.0".
    pub version: String,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub bindings: Vec<PolicyBinding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_bundle() {
        let yaml = r#"
version: "1.0"
"#;
        let bundle: PolicyBundle = serde_yml::from_str(yaml).unwrap();
        assert_eq!(bundle.version, "1.0");
        assert!(bundle.policies.is_empty());
        assert!(bundle.rules.is_empty());
        assert!(bundle.bindings.is_empty());
    }

    #[test]
    fn policy_defaults() {
        let yaml = r#"
id: p1
organization_id: org-1
name: "finance lockdown"
"#;
        let policy: Policy = serde_yml::from_str(yaml).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.version, 1);
        assert!(policy.environment_id.is_none());
    }

    #[test]
    fn deserialize_rule_with_conditions() {
        let yaml = r#"
id: r1
policy_id: p1
action: tool.invoke
target: "tool:finance/*"
effect: deny
conditions:
  "risk_level<=": 3
  tags: ["trusted", "reviewed"]
"#;
        let rule: PolicyRule = serde_yml::from_str(yaml).unwrap();
        assert_eq!(rule.action.known(), Some(Action::ToolInvoke));
        assert_eq!(rule.effect.known(), Some(Effect::Deny));
        assert_eq!(rule.conditions.len(), 2);
        assert_eq!(rule.conditions["risk_level<="], serde_json::json!(3));
    }

    #[test]
    fn binding_default_priority_is_100() {
        let yaml = r#"
id: b1
policy_id: p1
scope_type: resource_ns
scope_id: "data/*"
"#;
        let binding: PolicyBinding = serde_yml::from_str(yaml).unwrap();
        assert_eq!(binding.priority, 100);
        assert_eq!(binding.scope_type.known(), Some(ScopeType::ResourceNs));
    }

    #[test]
    fn unknown_names_are_kept_verbatim() {
        let yaml = r#"
id: r1
policy_id: p1
action: tool.delete
target: "tool:*"
effect: maybe
"#;
        let rule: PolicyRule = serde_yml::from_str(yaml).unwrap();
        assert_eq!(rule.action, Declared::Unknown("tool.delete".into()));
        assert_eq!(rule.effect.known(), None);

        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["action"], "tool.delete");
        assert_eq!(back["effect"], "maybe");
    }

    #[test]
    fn known_names_serialize_as_wire_values() {
        let binding = PolicyBinding {
            id: "b1".into(),
            policy_id: "p1".into(),
            scope_type: ScopeType::ResourceNs.into(),
            scope_id: "data".into(),
            priority: 10,
        };
        let value = serde_json::to_value(&binding).unwrap();
        assert_eq!(value["scope_type"], "resource_ns");
        assert_eq!("resource.write".parse::<Action>(), Ok(Action::ResourceWrite));
        assert!("resource.delete".parse::<Action>().is_err());
    }

    #[test]
    fn requests_stay_strict_about_actions() {
        assert!(serde_json::from_str::<Action>(r#""tool.delete""#).is_err());
    }

    #[test]
    fn action_families() {
        assert_eq!(Action::ToolInvoke.family(), TargetFamily::Tool);
        assert_eq!(Action::AgentInvoke.family(), TargetFamily::Agent);
        assert_eq!(Action::ResourceRead.family(), TargetFamily::Resource);
        assert_eq!(Action::ResourceWrite.family().prefix(), "resource");
        assert_eq!(Action::ResourceWrite.to_string(), "resource.write");
    }
}
