//! Selects the policies that apply to a request, in evaluation order.

use tracing::trace;

use crate::matcher::{self, Pattern};
use crate::request::EvalRequest;
use crate::schema::{Policy, PolicyBinding, ScopeType};
use crate::store::{CompiledBinding, CompiledPolicy, PolicySet, QuarantinedBinding};

/// A policy reached through one of its bindings.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'s> {
    pub policy: &'s CompiledPolicy,
    pub binding: &'s CompiledBinding,
}

/// Bindings from `set` that match the request's scope, ordered by ascending
/// priority and then creation order.
///
/// Only enabled policies of the request's organization qualify, and only
/// when they are organization-wide or pinned to the request's environment.
pub fn resolve_candidates<'s>(set: &'s PolicySet, req: &EvalRequest) -> Vec<Candidate<'s>> {
    // `set.bindings()` is already sorted by (priority, seq); filtering keeps it so.
    set.bindings()
        .iter()
        .filter_map(|cb| {
            let policy = set.policy_at(cb.policy_index);
            if !policy_applies(&policy.policy, req) {
                return None;
            }
            let namespace = cb.namespace_pattern.as_ref();
            if !scope_matches(Some(cb.scope_type), &cb.binding, namespace, req) {
                return None;
            }
            trace!(
                binding = %cb.binding.id,
                policy = %policy.policy.name,
                priority = cb.binding.priority,
                "binding selected"
            );
            Some(Candidate {
                policy,
                binding: cb,
            })
        })
        .collect()
}

/// Bindings of rejected policies that would otherwise have been candidates.
pub fn skipped_bindings<'s>(set: &'s PolicySet, req: &EvalRequest) -> Vec<&'s QuarantinedBinding> {
    set.quarantined()
        .iter()
        .filter(|qb| {
            policy_applies(&qb.policy, req)
                && scope_matches(qb.binding.scope_type.known(), &qb.binding, None, req)
        })
        .collect()
}

fn policy_applies(policy: &Policy, req: &EvalRequest) -> bool {
    if !policy.enabled || policy.organization_id != req.organization_id {
        return false;
    }
    match policy.environment_id.as_deref() {
        None => true,
        Some(env) => req.environment_id.as_deref() == Some(env),
    }
}

fn scope_matches(
    scope_type: Option<ScopeType>,
    binding: &PolicyBinding,
    namespace: Option<&Pattern>,
    req: &EvalRequest,
) -> bool {
    let Some(scope_type) = scope_type else {
        return false;
    };
    let scope_id = binding.scope_id.as_str();
    match scope_type {
        ScopeType::Org => req.organization_id == scope_id,
        ScopeType::Env => req.environment_id.as_deref() == Some(scope_id),
        ScopeType::Agent => req.agent_id.as_deref() == Some(scope_id),
        ScopeType::Tool => req.tool_id.as_deref() == Some(scope_id),
        ScopeType::Role => req.roles.iter().any(|r| r == scope_id),
        ScopeType::User => req.subject.as_deref().is_some_and(|s| subject_is(s, scope_id)),
        ScopeType::ResourceNs => match req.resource_namespace() {
            None => false,
            Some(ns) => match namespace {
                Some(pattern) => pattern.matches(ns),
                None => matcher::matches(scope_id, ns),
            },
        },
    }
}

/// A user binding may name the full subject (`user:123`) or the bare id.
fn subject_is(subject: &str, scope_id: &str) -> bool {
    subject == scope_id || subject.strip_prefix("user:") == Some(scope_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_bundle_from_str;
    use crate::request::EvalContext;
    use crate::schema::Action;
    use crate::store::PolicyStore;
    use std::sync::Arc;

    fn snapshot(yaml: &str) -> Arc<PolicySet> {
        let store = PolicyStore::new();
        store.reload_bundle(&load_bundle_from_str(yaml).expect("test YAML should parse"));
        store.snapshot()
    }

    fn ids(candidates: &[Candidate<'_>]) -> Vec<String> {
        candidates.iter().map(|c| c.binding.binding.id.clone()).collect()
    }

    const SCOPES: &str = r#"
version: "1.0"
policies:
  - { id: p, organization_id: org-1, name: p }
bindings:
  - { id: org, policy_id: p, scope_type: org, scope_id: org-1, priority: 70 }
  - { id: env, policy_id: p, scope_type: env, scope_id: prod, priority: 60 }
  - { id: agent, policy_id: p, scope_type: agent, scope_id: a-1, priority: 50 }
  - { id: tool, policy_id: p, scope_type: tool, scope_id: t-1, priority: 40 }
  - { id: role, policy_id: p, scope_type: role, scope_id: auditor, priority: 30 }
  - { id: user, policy_id: p, scope_type: user, scope_id: "123", priority: 20 }
  - { id: ns, policy_id: p, scope_type: resource_ns, scope_id: "data", priority: 10 }
"#;

    #[test]
    fn org_binding_only() {
        let set = snapshot(SCOPES);
        let req = EvalRequest::new(Action::ToolInvoke, "tool:x/y", "org-1");
        assert_eq!(ids(&resolve_candidates(&set, &req)), vec!["org"]);
    }

    #[test]
    fn every_scope_kind_matches_in_priority_order() {
        let set = snapshot(SCOPES);
        let req = EvalRequest::new(Action::ResourceRead, "resource:data/a/b", "org-1")
            .with_environment("prod")
            .with_agent("a-1")
            .with_tool("t-1")
            .with_role("auditor")
            .with_subject("user:123");
        assert_eq!(
            ids(&resolve_candidates(&set, &req)),
            vec!["ns", "user", "role", "tool", "agent", "env", "org"]
        );
    }

    #[test]
    fn non_matching_scopes_are_ignored() {
        let set = snapshot(SCOPES);
        let req = EvalRequest::new(Action::ResourceRead, "resource:other/a", "org-1")
            .with_environment("staging")
            .with_agent("a-2")
            .with_role("viewer")
            .with_subject("user:1234");
        assert_eq!(ids(&resolve_candidates(&set, &req)), vec!["org"]);
    }

    #[test]
    fn other_organization_sees_nothing() {
        let set = snapshot(SCOPES);
        let req = EvalRequest::new(Action::ToolInvoke, "tool:x/y", "org-2").with_environment("prod");
        assert!(resolve_candidates(&set, &req).is_empty());
    }

    #[test]
    fn namespace_pattern_and_context_override() {
        let set = snapshot(
            r#"
version: "1.0"
policies:
  - { id: p, organization_id: org-1, name: p }
bindings:
  - { id: eu, policy_id: p, scope_type: resource_ns, scope_id: "data/*" }
"#,
        );
        let plain = EvalRequest::new(Action::ResourceRead, "resource:data/a", "org-1");
        assert!(resolve_candidates(&set, &plain).is_empty());

        let nested = plain.with_context(EvalContext {
            resource_namespace: Some("data/eu".into()),
            ..Default::default()
        });
        assert_eq!(ids(&resolve_candidates(&set, &nested)), vec!["eu"]);
    }

    #[test]
    fn disabled_and_foreign_environment_policies_are_excluded() {
        let set = snapshot(
            r#"
version: "1.0"
policies:
  - { id: off, organization_id: org-1, name: off, enabled: false }
  - { id: staging, organization_id: org-1, name: staging, environment_id: staging }
  - { id: prod, organization_id: org-1, name: prod, environment_id: prod }
bindings:
  - { id: b-off, policy_id: off, scope_type: org, scope_id: org-1 }
  - { id: b-staging, policy_id: staging, scope_type: org, scope_id: org-1 }
  - { id: b-prod, policy_id: prod, scope_type: org, scope_id: org-1 }
"#,
        );
        let req = EvalRequest::new(Action::AgentInvoke, "agent:bot", "org-1").with_environment("prod");
        assert_eq!(ids(&resolve_candidates(&set, &req)), vec!["b-prod"]);

        // Without an environment only organization-wide policies qualify.
        let req = EvalRequest::new(Action::AgentInvoke, "agent:bot", "org-1");
        assert!(resolve_candidates(&set, &req).is_empty());
    }

    #[test]
    fn skipped_bindings_of_rejected_policies() {
        let set = snapshot(
            r#"
version: "1.0"
policies:
  - { id: broken, organization_id: org-1, name: broken }
rules:
  - { id: r1, policy_id: broken, action: agent.invoke, target: "agent:a/b", effect: deny }
bindings:
  - { id: b1, policy_id: broken, scope_type: org, scope_id: org-1 }
"#,
        );
        let req = EvalRequest::new(Action::AgentInvoke, "agent:bot", "org-1");
        assert!(resolve_candidates(&set, &req).is_empty());
        let skipped = skipped_bindings(&set, &req);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].policy.name, "broken");
    }

    #[test]
    fn user_scope_accepts_bare_or_prefixed_id() {
        assert!(subject_is("user:123", "123"));
        assert!(subject_is("user:123", "user:123"));
        assert!(!subject_is("user:1234", "123"));
        assert!(!subject_is("svc:123", "123"));
    }
}
