//! In-memory model of the management surface: create, update, delete and
//! list for policies, rules and bindings.
//!
//! The catalog owns the editable definitions; [`PolicyCatalog::publish`]
//! pushes them into a [`PolicyStore`] as a new snapshot.  Collections keep
//! creation order, which the store uses to break binding priority ties.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::condition::{ConditionError, ConditionSet};
use crate::matcher::{PatternError, TargetPattern};
use crate::schema::{
    default_priority, Action, Declared, Effect, Policy, PolicyBinding, PolicyBundle, PolicyRule,
    ScopeType, UnknownName,
};
use crate::store::{PolicyStore, ReloadReport};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("policy '{0}' not found")]
    PolicyNotFound(String),

    #[error("rule '{0}' not found")]
    RuleNotFound(String),

    #[error("binding '{0}' not found")]
    BindingNotFound(String),

    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("invalid target: {0}")]
    InvalidTarget(#[from] PatternError),

    #[error("invalid condition: {0}")]
    InvalidCondition(#[from] ConditionError),

    #[error(transparent)]
    UnknownName(#[from] UnknownName),
}

// ---------------------------------------------------------------------------
// Input shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub organization_id: String,
    pub environment_id: Option<String>,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyPatch {
    pub name: Option<String>,
    /// `Some(None)` makes the policy organization-wide.
    pub environment_id: Option<Option<String>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub policy_id: String,
    pub action: Action,
    pub target: String,
    pub effect: Effect,
    pub conditions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub action: Option<Action>,
    pub target: Option<String>,
    pub effect: Option<Effect>,
    pub conditions: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct NewBinding {
    pub policy_id: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub priority: i32,
}

impl NewBinding {
    /// A binding with the default priority of 100.
    pub fn new(policy_id: impl Into<String>, scope_type: ScopeType, scope_id: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            scope_type,
            scope_id: scope_id.into(),
            priority: default_priority(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindingPatch {
    pub scope_type: Option<ScopeType>,
    pub scope_id: Option<String>,
    pub priority: Option<i32>,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Editable policy definitions.
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    policies: Vec<Policy>,
    rules: Vec<PolicyRule>,
    bindings: Vec<PolicyBinding>,
}

impl PolicyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a catalog from a bundle, keeping its ids and order.
    pub fn from_bundle(bundle: PolicyBundle) -> Self {
        Self {
            policies: bundle.policies,
            rules: bundle.rules,
            bindings: bundle.bindings,
        }
    }

    pub fn to_bundle(&self) -> PolicyBundle {
        PolicyBundle {
            version: "1.0".to_string(),
            policies: self.policies.clone(),
            rules: self.rules.clone(),
            bindings: self.bindings.clone(),
        }
    }

    /// Publish the current definitions as a new store snapshot.
    pub fn publish(&self, store: &PolicyStore) -> ReloadReport {
        store.reload(&self.policies, &self.rules, &self.bindings)
    }

    // -- Policies ------------------------------------------------------------

    pub fn create_policy(&mut self, new: NewPolicy) -> Result<Policy, CatalogError> {
        non_empty("organization_id", &new.organization_id)?;
        non_empty("name", &new.name)?;
        let policy = Policy {
            id: new_id(),
            organization_id: new.organization_id,
            environment_id: new.environment_id,
            name: new.name,
            enabled: new.enabled,
            version: 1,
        };
        debug!(policy_id = %policy.id, name = %policy.name, "policy created");
        self.policies.push(policy.clone());
        Ok(policy)
    }

    pub fn update_policy(&mut self, id: &str, patch: PolicyPatch) -> Result<Policy, CatalogError> {
        if let Some(name) = &patch.name {
            non_empty("name", name)?;
        }
        let policy = self.policy_mut(id)?;
        if let Some(name) = patch.name {
            policy.name = name;
        }
        if let Some(environment_id) = patch.environment_id {
            policy.environment_id = environment_id;
        }
        if let Some(enabled) = patch.enabled {
            policy.enabled = enabled;
        }
        policy.version += 1;
        Ok(policy.clone())
    }

    /// Delete a policy together with its rules and bindings.
    pub fn delete_policy(&mut self, id: &str) -> Result<Policy, CatalogError> {
        let pos = self
            .policies
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| CatalogError::PolicyNotFound(id.to_string()))?;
        let policy = self.policies.remove(pos);
        let rules_before = self.rules.len();
        let bindings_before = self.bindings.len();
        self.rules.retain(|r| r.policy_id != id);
        self.bindings.retain(|b| b.policy_id != id);
        debug!(
            policy_id = id,
            rules = rules_before - self.rules.len(),
            bindings = bindings_before - self.bindings.len(),
            "policy deleted with its rules and bindings"
        );
        Ok(policy)
    }

    pub fn get_policy(&self, id: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.id == id)
    }

    pub fn list_policies(&self, organization_id: Option<&str>) -> Vec<&Policy> {
        self.policies
            .iter()
            .filter(|p| organization_id.map_or(true, |org| p.organization_id == org))
            .collect()
    }

    // -- Rules ---------------------------------------------------------------

    pub fn create_rule(&mut self, new: NewRule) -> Result<PolicyRule, CatalogError> {
        check_rule(&Declared::Known(new.action), &new.target, &new.conditions)?;
        self.touch(&new.policy_id)?;
        let rule = PolicyRule {
            id: new_id(),
            policy_id: new.policy_id,
            action: new.action.into(),
            target: new.target,
            effect: new.effect.into(),
            conditions: new.conditions,
        };
        self.rules.push(rule.clone());
        Ok(rule)
    }

    pub fn update_rule(&mut self, id: &str, patch: RulePatch) -> Result<PolicyRule, CatalogError> {
        let current = self.rule(id)?;
        let mut updated = current.clone();
        if let Some(action) = patch.action {
            updated.action = action.into();
        }
        if let Some(target) = patch.target {
            updated.target = target;
        }
        if let Some(effect) = patch.effect {
            updated.effect = effect.into();
        }
        if let Some(conditions) = patch.conditions {
            updated.conditions = conditions;
        }
        check_rule(&updated.action, &updated.target, &updated.conditions)?;
        if let Declared::Unknown(name) = &updated.effect {
            return Err(UnknownName {
                kind: "effect",
                name: name.clone(),
            }
            .into());
        }

        self.touch(&updated.policy_id)?;
        if let Some(slot) = self.rules.iter_mut().find(|r| r.id == id) {
            *slot = updated.clone();
        }
        Ok(updated)
    }

    pub fn delete_rule(&mut self, id: &str) -> Result<PolicyRule, CatalogError> {
        let pos = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| CatalogError::RuleNotFound(id.to_string()))?;
        let rule = self.rules.remove(pos);
        self.touch(&rule.policy_id)?;
        Ok(rule)
    }

    /// Rules in declaration order, optionally for one policy.
    pub fn list_rules(&self, policy_id: Option<&str>) -> Vec<&PolicyRule> {
        self.rules
            .iter()
            .filter(|r| policy_id.map_or(true, |id| r.policy_id == id))
            .collect()
    }

    // -- Bindings ------------------------------------------------------------

    pub fn create_binding(&mut self, new: NewBinding) -> Result<PolicyBinding, CatalogError> {
        non_empty("scope_id", &new.scope_id)?;
        self.touch(&new.policy_id)?;
        let binding = PolicyBinding {
            id: new_id(),
            policy_id: new.policy_id,
            scope_type: new.scope_type.into(),
            scope_id: new.scope_id,
            priority: new.priority,
        };
        self.bindings.push(binding.clone());
        Ok(binding)
    }

    /// Update a binding in place; it keeps its creation order.
    pub fn update_binding(&mut self, id: &str, patch: BindingPatch) -> Result<PolicyBinding, CatalogError> {
        if let Some(scope_id) = &patch.scope_id {
            non_empty("scope_id", scope_id)?;
        }
        let binding = self
            .bindings
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| CatalogError::BindingNotFound(id.to_string()))?;
        if let Some(scope_type) = patch.scope_type {
            binding.scope_type = scope_type.into();
        }
        if let Some(scope_id) = patch.scope_id {
            binding.scope_id = scope_id;
        }
        if let Some(priority) = patch.priority {
            binding.priority = priority;
        }
        let updated = binding.clone();
        self.touch(&updated.policy_id)?;
        Ok(updated)
    }

    pub fn delete_binding(&mut self, id: &str) -> Result<PolicyBinding, CatalogError> {
        let pos = self
            .bindings
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| CatalogError::BindingNotFound(id.to_string()))?;
        let binding = self.bindings.remove(pos);
        self.touch(&binding.policy_id)?;
        Ok(binding)
    }

    /// Bindings in creation order, optionally for one policy.
    pub fn list_bindings(&self, policy_id: Option<&str>) -> Vec<&PolicyBinding> {
        self.bindings
            .iter()
            .filter(|b| policy_id.map_or(true, |id| b.policy_id == id))
            .collect()
    }

    // -- Helpers -------------------------------------------------------------

    fn policy_mut(&mut self, id: &str) -> Result<&mut Policy, CatalogError> {
        self.policies
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CatalogError::PolicyNotFound(id.to_string()))
    }

    fn rule(&self, id: &str) -> Result<&PolicyRule, CatalogError> {
        self.rules
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| CatalogError::RuleNotFound(id.to_string()))
    }

    /// Bump the owning policy's version after an edit of its contents.
    fn touch(&mut self, policy_id: &str) -> Result<(), CatalogError> {
        let policy = self.policy_mut(policy_id)?;
        policy.version += 1;
        Ok(())
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn non_empty(field: &'static str, value: &str) -> Result<(), CatalogError> {
    if value.is_empty() {
        Err(CatalogError::EmptyField { field })
    } else {
        Ok(())
    }
}

fn check_rule(
    action: &Declared<Action>,
    target: &str,
    conditions: &BTreeMap<String, serde_json::Value>,
) -> Result<(), CatalogError> {
    let action = match action {
        Declared::Known(action) => *action,
        Declared::Unknown(name) => {
            return Err(UnknownName {
                kind: "action",
                name: name.clone(),
            }
            .into())
        }
    };
    TargetPattern::parse(action, target)?;
    if let Err(mut errors) = ConditionSet::compile(conditions) {
        return Err(CatalogError::InvalidCondition(errors.remove(0)));
    }
    Ok(())
}
