use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::condition::ConditionInput;
use crate::decision::{BindingTrace, Decision, EvalResult, MatchedRule};
use crate::request::{EvalError, EvalRequest};
use crate::resolver::{resolve_candidates, skipped_bindings, Candidate};
use crate::store::{CompiledRule, PolicySet, PolicyStore};

// ---------------------------------------------------------------------------
// Explanation trace
// ---------------------------------------------------------------------------

/// Audit trail collected while scanning.  Only filled when the request
/// asked for an explanation; warnings are always kept.
#[derive(Default)]
struct Trace {
    enabled: bool,
    matched_rules: Vec<MatchedRule>,
    bindings_order: Vec<BindingTrace>,
    warnings: Vec<String>,
}

impl Trace {
    fn finish(self, mut result: EvalResult) -> EvalResult {
        result.matched_rules = self.matched_rules;
        result.bindings_order = self.bindings_order;
        result.warnings = self.warnings;
        result
    }
}

// ---------------------------------------------------------------------------
// PolicyEvaluator
// ---------------------------------------------------------------------------

/// Evaluates access requests against the snapshots of one [`PolicyStore`].
///
/// The store is injected, so several evaluators over distinct stores can
/// live in one process.  Evaluation takes no locks beyond grabbing the
/// current snapshot and performs no I/O.
pub struct PolicyEvaluator {
    store: Arc<PolicyStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvaluator")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PolicyEvaluator {
    /// Evaluator using wall-clock time for `time_window` conditions.
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<PolicyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Evaluate `req` against the store's current snapshot.
    pub fn evaluate(&self, req: &EvalRequest) -> Result<EvalResult, EvalError> {
        let snapshot = self.store.snapshot();
        self.evaluate_against(&snapshot, req)
    }

    /// Decode and evaluate a request in its JSON wire shape.
    pub fn evaluate_json(&self, value: serde_json::Value) -> Result<EvalResult, EvalError> {
        let req = EvalRequest::from_json(value)?;
        self.evaluate(&req)
    }

    /// Evaluate `req` against a specific snapshot.
    ///
    /// Candidates are walked in binding order; inside each policy the rules
    /// are scanned in declaration order.  The first rule whose action,
    /// target and conditions all match decides.  Nothing matching is a deny.
    pub fn evaluate_against(&self, set: &PolicySet, req: &EvalRequest) -> Result<EvalResult, EvalError> {
        req.validate()?;
        debug!(
            action = %req.action,
            target = %req.target,
            organization = %req.organization_id,
            environment = req.environment_id.as_deref().unwrap_or("-"),
            generation = set.generation(),
            "evaluating request against policy"
        );

        let candidates = resolve_candidates(set, req);
        let mut trace = Trace {
            enabled: req.explain,
            ..Default::default()
        };
        if trace.enabled {
            record_bindings(set, req, &candidates, &mut trace);
        }

        if candidates.is_empty() {
            debug!("no binding matched; default deny");
            return Ok(trace.finish(EvalResult::default_deny(
                "no policy binding matched the request scope",
                set.generation(),
            )));
        }

        let input = ConditionInput {
            environment_id: req.environment_id.as_deref(),
            context: &req.context,
            now: self.clock.now(),
        };

        let mut scanned: HashSet<&str> = HashSet::new();
        let mut winner: Option<(&CompiledRule, &Candidate<'_>)> = None;
        for candidate in &candidates {
            // A policy reached through several bindings is scanned once, at
            // its most specific binding.
            if !scanned.insert(candidate.policy.policy.id.as_str()) {
                continue;
            }
            if let Some(rule) = scan_policy(candidate, req, &input, &mut trace) {
                if winner.is_none() {
                    winner = Some((rule, candidate));
                }
                if !trace.enabled {
                    break;
                }
            }
        }

        let result = match winner {
            Some((compiled, candidate)) => {
                let rule = &compiled.rule;
                debug!(
                    rule = %rule.id,
                    policy = %candidate.policy.policy.name,
                    effect = %compiled.effect,
                    "rule decided request"
                );
                EvalResult {
                    decision: Decision::from(compiled.effect),
                    rule_id: Some(rule.id.clone()),
                    reason: format!(
                        "rule '{}' of policy '{}' matched via binding '{}' (priority {})",
                        rule.id,
                        candidate.policy.policy.name,
                        candidate.binding.binding.id,
                        candidate.binding.binding.priority
                    ),
                    matched_rules: Vec::new(),
                    bindings_order: Vec::new(),
                    warnings: Vec::new(),
                    snapshot_generation: set.generation(),
                }
            }
            None => {
                debug!("no rule matched; default deny");
                EvalResult::default_deny(
                    format!("no rule matched {} on '{}'", req.action, req.target),
                    set.generation(),
                )
            }
        };
        Ok(trace.finish(result))
    }
}

/// Scan one policy's rules in declaration order and return the first rule
/// whose action, target and conditions all match.
///
/// With tracing enabled the scan continues past the winner so every rule
/// that matched action and target is recorded.
fn scan_policy<'s>(
    candidate: &Candidate<'s>,
    req: &EvalRequest,
    input: &ConditionInput<'_>,
    trace: &mut Trace,
) -> Option<&'s CompiledRule> {
    let policy = candidate.policy;
    let mut first: Option<&'s CompiledRule> = None;
    for compiled in &policy.rules {
        if compiled.action != req.action || !compiled.pattern.matches(&req.target) {
            continue;
        }

        let outcome = compiled.conditions.evaluate(input);
        trace.warnings.extend(outcome.warnings);
        if trace.enabled {
            trace.matched_rules.push(MatchedRule {
                rule_id: compiled.rule.id.clone(),
                policy_name: policy.policy.name.clone(),
                effect: compiled.effect,
                target: compiled.rule.target.clone(),
                priority: candidate.binding.binding.priority,
                conditions_met: outcome.holds,
            });
        }

        if outcome.holds && first.is_none() {
            trace!(rule = %compiled.rule.id, "rule matched request");
            first = Some(compiled);
            if !trace.enabled {
                break;
            }
        }
    }
    first
}

fn record_bindings(set: &PolicySet, req: &EvalRequest, candidates: &[Candidate<'_>], trace: &mut Trace) {
    trace.bindings_order = candidates
        .iter()
        .map(|c| BindingTrace {
            binding_id: c.binding.binding.id.clone(),
            policy_name: c.policy.policy.name.clone(),
            scope_type: c.binding.scope_type,
            scope_id: c.binding.binding.scope_id.clone(),
            priority: c.binding.binding.priority,
        })
        .collect();

    for skipped in skipped_bindings(set, req) {
        let reasons: Vec<String> = set
            .validation_errors()
            .iter()
            .filter(|e| e.policy_id == skipped.policy.id)
            .map(|e| e.to_string())
            .collect();
        trace.warnings.push(format!(
            "policy '{}' (binding '{}', priority {}) skipped: {}",
            skipped.policy.name,
            skipped.binding.id,
            skipped.binding.priority,
            reasons.join("; ")
        ));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
