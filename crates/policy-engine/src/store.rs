//! Versioned, copy-on-write store of compiled policies.
//!
//! A reload validates and compiles everything into a fresh [`PolicySet`]
//! outside any lock, then publishes it with a single pointer swap.  Readers
//! clone the current `Arc` and evaluate against it for as long as they like;
//! a concurrent reload never changes what they see.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

use crate::condition::{ConditionError, ConditionSet};
use crate::matcher::{Pattern, PatternError, TargetPattern};
use crate::schema::{
    Action, Declared, Effect, Policy, PolicyBinding, PolicyBundle, PolicyRule, ScopeType,
};

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// What a validation error is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationSubject {
    Policy,
    Rule(String),
    Binding(String),
}

impl fmt::Display for ValidationSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationSubject::Policy => f.write_str("definition"),
            ValidationSubject::Rule(id) => write!(f, "rule '{id}'"),
            ValidationSubject::Binding(id) => write!(f, "binding '{id}'"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationErrorKind {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("references a policy that does not exist")]
    UnknownPolicy,

    #[error("duplicate id")]
    DuplicateId,

    #[error("scope_id must not be empty")]
    EmptyScope,

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("unknown effect '{0}'")]
    UnknownEffect(String),

    #[error("unknown scope_type '{0}'")]
    UnknownScopeType(String),
}

/// A configuration problem found while loading one policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("policy '{policy_id}' {subject}: {kind}")]
pub struct ValidationError {
    pub policy_id: String,
    pub subject: ValidationSubject,
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    fn new(
        policy_id: impl Into<String>,
        subject: ValidationSubject,
        kind: impl Into<ValidationErrorKind>,
    ) -> Self {
        Self {
            policy_id: policy_id.into(),
            subject,
            kind: kind.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled snapshot
// ---------------------------------------------------------------------------

/// A rule with its target pattern and conditions pre-compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: PolicyRule,
    pub action: Action,
    pub effect: Effect,
    pub(crate) pattern: TargetPattern,
    pub(crate) conditions: ConditionSet,
}

/// A valid policy and its rules in declaration order.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: Policy,
    pub rules: Vec<CompiledRule>,
}

/// A binding of a valid policy.
#[derive(Debug, Clone)]
pub struct CompiledBinding {
    pub binding: PolicyBinding,
    /// Position in the reload input; breaks priority ties.
    pub seq: usize,
    pub scope_type: ScopeType,
    pub(crate) policy_index: usize,
    /// Parsed `scope_id` for `resource_ns` bindings.
    pub(crate) namespace_pattern: Option<Pattern>,
}

/// A binding whose policy failed validation.  Kept so explanations can say
/// why a policy that would have applied was skipped.
#[derive(Debug, Clone)]
pub struct QuarantinedBinding {
    pub binding: PolicyBinding,
    pub policy: Policy,
}

/// Immutable evaluation snapshot.
#[derive(Debug, Default)]
pub struct PolicySet {
    generation: u64,
    policies: Vec<CompiledPolicy>,
    /// Sorted ascending by `(priority, seq)`.
    bindings: Vec<CompiledBinding>,
    quarantined: Vec<QuarantinedBinding>,
    rejected: HashSet<String>,
    errors: Vec<ValidationError>,
}

impl PolicySet {
    /// Validate and compile a full set of definitions.
    ///
    /// An invalid rule or binding rejects only its own policy; every other
    /// policy is still compiled.
    pub fn build(
        generation: u64,
        policies: &[Policy],
        rules: &[PolicyRule],
        bindings: &[PolicyBinding],
    ) -> Self {
        let mut errors = Vec::new();

        // Policies, first definition wins.
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut unique: Vec<&Policy> = Vec::with_capacity(policies.len());
        for policy in policies {
            if index.contains_key(policy.id.as_str()) {
                errors.push(ValidationError::new(
                    &policy.id,
                    ValidationSubject::Policy,
                    ValidationErrorKind::DuplicateId,
                ));
                continue;
            }
            index.insert(&policy.id, unique.len());
            unique.push(policy);
        }

        let mut invalid: HashSet<usize> = HashSet::new();
        let mut compiled_rules: Vec<Vec<CompiledRule>> = vec![Vec::new(); unique.len()];
        let mut rule_ids: HashSet<&str> = HashSet::new();

        for rule in rules {
            let Some(&pi) = index.get(rule.policy_id.as_str()) else {
                errors.push(ValidationError::new(
                    &rule.policy_id,
                    ValidationSubject::Rule(rule.id.clone()),
                    ValidationErrorKind::UnknownPolicy,
                ));
                continue;
            };
            let subject = || ValidationSubject::Rule(rule.id.clone());

            if !rule_ids.insert(&rule.id) {
                errors.push(ValidationError::new(
                    &rule.policy_id,
                    subject(),
                    ValidationErrorKind::DuplicateId,
                ));
                invalid.insert(pi);
                continue;
            }

            let (action, effect) = match (&rule.action, &rule.effect) {
                (Declared::Known(action), Declared::Known(effect)) => (*action, *effect),
                (action, effect) => {
                    if let Declared::Unknown(name) = action {
                        errors.push(ValidationError::new(
                            &rule.policy_id,
                            subject(),
                            ValidationErrorKind::UnknownAction(name.clone()),
                        ));
                    }
                    if let Declared::Unknown(name) = effect {
                        errors.push(ValidationError::new(
                            &rule.policy_id,
                            subject(),
                            ValidationErrorKind::UnknownEffect(name.clone()),
                        ));
                    }
                    invalid.insert(pi);
                    continue;
                }
            };

            let pattern = TargetPattern::parse(action, &rule.target);
            let conditions = ConditionSet::compile(&rule.conditions);
            match (pattern, conditions) {
                (Ok(pattern), Ok(conditions)) => compiled_rules[pi].push(CompiledRule {
                    rule: rule.clone(),
                    action,
                    effect,
                    pattern,
                    conditions,
                }),
                (pattern, conditions) => {
                    if let Err(e) = pattern {
                        errors.push(ValidationError::new(&rule.policy_id, subject(), e));
                    }
                    if let Err(errs) = conditions {
                        errors.extend(
                            errs.into_iter()
                                .map(|e| ValidationError::new(&rule.policy_id, subject(), e)),
                        );
                    }
                    invalid.insert(pi);
                }
            }
        }

        let mut pending: Vec<CompiledBinding> = Vec::with_capacity(bindings.len());
        let mut failed: Vec<(usize, &PolicyBinding)> = Vec::new();
        let mut binding_ids: HashSet<&str> = HashSet::new();
        for (seq, binding) in bindings.iter().enumerate() {
            let Some(&pi) = index.get(binding.policy_id.as_str()) else {
                errors.push(ValidationError::new(
                    &binding.policy_id,
                    ValidationSubject::Binding(binding.id.clone()),
                    ValidationErrorKind::UnknownPolicy,
                ));
                continue;
            };
            match compile_binding(binding, seq, pi, &mut binding_ids) {
                Ok(cb) => pending.push(cb),
                Err(kind) => {
                    errors.push(ValidationError::new(
                        &binding.policy_id,
                        ValidationSubject::Binding(binding.id.clone()),
                        kind,
                    ));
                    invalid.insert(pi);
                    // Still quarantine it so explanations can mention the policy.
                    failed.push((pi, binding));
                }
            }
        }

        // Split into live and quarantined policies; remap binding indices.
        let mut live_index: Vec<Option<usize>> = vec![None; unique.len()];
        let mut compiled = Vec::new();
        let mut rejected = HashSet::new();
        for (pi, (policy, rules)) in unique.iter().zip(compiled_rules).enumerate() {
            if invalid.contains(&pi) {
                warn!(policy_id = %policy.id, policy = %policy.name, "policy rejected; excluded from evaluation");
                rejected.insert(policy.id.clone());
                continue;
            }
            live_index[pi] = Some(compiled.len());
            compiled.push(CompiledPolicy {
                policy: (*policy).clone(),
                rules,
            });
        }

        let mut live = Vec::new();
        let mut quarantined: Vec<QuarantinedBinding> = failed
            .into_iter()
            .map(|(pi, binding)| QuarantinedBinding {
                policy: unique[pi].clone(),
                binding: binding.clone(),
            })
            .collect();
        for mut cb in pending {
            match live_index[cb.policy_index] {
                Some(li) => {
                    cb.policy_index = li;
                    live.push(cb);
                }
                None => quarantined.push(QuarantinedBinding {
                    policy: unique[cb.policy_index].clone(),
                    binding: cb.binding,
                }),
            }
        }
        live.sort_by_key(|cb| (cb.binding.priority, cb.seq));
        quarantined.sort_by_key(|qb| qb.binding.priority);

        Self {
            generation,
            policies: compiled,
            bindings: live,
            quarantined,
            rejected,
            errors,
        }
    }

    /// Monotonic reload counter; 0 is the empty initial snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn policies(&self) -> &[CompiledPolicy] {
        &self.policies
    }

    pub fn policy(&self, id: &str) -> Option<&CompiledPolicy> {
        self.policies.iter().find(|p| p.policy.id == id)
    }

    /// Live bindings in evaluation order.
    pub fn bindings(&self) -> &[CompiledBinding] {
        &self.bindings
    }

    pub(crate) fn policy_at(&self, index: usize) -> &CompiledPolicy {
        &self.policies[index]
    }

    pub fn quarantined(&self) -> &[QuarantinedBinding] {
        &self.quarantined
    }

    /// Configuration errors found when this snapshot was built.
    pub fn validation_errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn is_rejected(&self, policy_id: &str) -> bool {
        self.rejected.contains(policy_id)
    }

    fn report(&self) -> ReloadReport {
        let mut rejected: Vec<String> = self.rejected.iter().cloned().collect();
        rejected.sort();
        ReloadReport {
            generation: self.generation,
            accepted: self.policies.len(),
            rejected,
            errors: self.errors.clone(),
        }
    }
}

fn compile_binding<'a>(
    binding: &'a PolicyBinding,
    seq: usize,
    policy_index: usize,
    seen: &mut HashSet<&'a str>,
) -> Result<CompiledBinding, ValidationErrorKind> {
    if !seen.insert(&binding.id) {
        return Err(ValidationErrorKind::DuplicateId);
    }
    let scope_type = match &binding.scope_type {
        Declared::Known(scope_type) => *scope_type,
        Declared::Unknown(name) => return Err(ValidationErrorKind::UnknownScopeType(name.clone())),
    };
    if binding.scope_id.is_empty() {
        return Err(ValidationErrorKind::EmptyScope);
    }
    let namespace_pattern = match scope_type {
        ScopeType::ResourceNs => Some(Pattern::parse(&binding.scope_id)?),
        _ => None,
    };
    Ok(CompiledBinding {
        binding: binding.clone(),
        seq,
        scope_type,
        policy_index,
        namespace_pattern,
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Summary of one reload, for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadReport {
    pub generation: u64,
    pub accepted: usize,
    /// Ids of policies excluded from evaluation, sorted.
    pub rejected: Vec<String>,
    pub errors: Vec<ValidationError>,
}

impl ReloadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Holder of the current [`PolicySet`].  Share it behind an `Arc`.
pub struct PolicyStore {
    current: RwLock<Arc<PolicySet>>,
    writer: Mutex<()>,
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PolicyStore")
            .field("generation", &snapshot.generation)
            .field("num_policies", &snapshot.policies.len())
            .field("num_bindings", &snapshot.bindings.len())
            .finish()
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    /// An empty store; every evaluation denies until the first reload.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicySet::default())),
            writer: Mutex::new(()),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        Arc::clone(&self.current.read())
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Rebuild the snapshot from full definitions and publish it.
    pub fn reload(
        &self,
        policies: &[Policy],
        rules: &[PolicyRule],
        bindings: &[PolicyBinding],
    ) -> ReloadReport {
        let _writer = self.writer.lock();
        let generation = self.generation() + 1;
        let set = PolicySet::build(generation, policies, rules, bindings);
        let report = set.report();
        *self.current.write() = Arc::new(set);

        info!(
            generation,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            "published policy snapshot"
        );
        for error in &report.errors {
            warn!(generation, %error, "policy validation error");
        }
        report
    }

    pub fn reload_bundle(&self, bundle: &PolicyBundle) -> ReloadReport {
        self.reload(&bundle.policies, &bundle.rules, &bundle.bindings)
    }
}
