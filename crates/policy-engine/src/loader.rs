use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::schema::PolicyBundle;

/// Load a [`PolicyBundle`] from a YAML file on disk.
///
/// Only the bundle's shape is checked here (version, non-empty and unique
/// ids).  Target patterns and conditions are validated per policy when the
/// bundle is handed to [`PolicyStore::reload_bundle`](crate::PolicyStore::reload_bundle).
pub fn load_bundle(path: impl AsRef<Path>) -> Result<PolicyBundle> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy bundle: {}", path.display()))?;
    load_bundle_from_str(&contents)
        .with_context(|| format!("failed to parse policy bundle: {}", path.display()))
}

/// Parse and check a [`PolicyBundle`] from a YAML string.
pub fn load_bundle_from_str(yaml: &str) -> Result<PolicyBundle> {
    let bundle: PolicyBundle = serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    validate(&bundle)?;
    Ok(bundle)
}

fn validate(bundle: &PolicyBundle) -> Result<()> {
    if bundle.version != "1.0" {
        bail!(
            "unsupported bundle version '{}'; only '1.0' is supported",
            bundle.version
        );
    }

    let mut seen = HashSet::new();
    for policy in &bundle.policies {
        if policy.id.is_empty() {
            bail!("policy id must not be empty");
        }
        if !seen.insert(&policy.id) {
            bail!("duplicate policy id: '{}'", policy.id);
        }
    }
    if let Some(rule) = bundle.rules.iter().find(|r| r.id.is_empty()) {
        bail!("rule id must not be empty (policy '{}')", rule.policy_id);
    }
    if let Some(binding) = bundle.bindings.iter().find(|b| b.id.is_empty()) {
        bail!("binding id must not be empty (policy '{}')", binding.policy_id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_minimal_bundle() {
        let bundle = load_bundle_from_str(
            r#"
version: "1.0"
policies: []
"#,
        )
        .unwrap();
        assert_eq!(bundle.version, "1.0");
        assert!(bundle.policies.is_empty());
    }

    #[test]
    fn reject_wrong_version() {
        let err = load_bundle_from_str(
            r#"
version: "2.0"
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("unsupported bundle version"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn reject_duplicate_policy_ids() {
        let err = load_bundle_from_str(
            r#"
version: "1.0"
policies:
  - { id: dup, organization_id: org-1, name: a }
  - { id: dup, organization_id: org-1, name: b }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate policy id"), "unexpected error: {err}");
    }

    #[test]
    fn reject_empty_ids() {
        let err = load_bundle_from_str(
            r#"
version: "1.0"
policies:
  - { id: p1, organization_id: org-1, name: a }
rules:
  - { id: "", policy_id: p1, action: agent.invoke, target: "agent:*", effect: allow }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must not be empty"), "unexpected error: {err}");
    }

    #[test]
    fn unknown_action_excludes_only_its_policy() {
        use crate::evaluator::PolicyEvaluator;
        use crate::schema::Action;
        use crate::store::PolicyStore;
        use crate::{Decision, EvalRequest};
        use std::sync::Arc;

        let bundle = load_bundle_from_str(
            r#"
version: "1.0"
policies:
  - { id: good, organization_id: org-1, name: good }
  - { id: bad, organization_id: org-1, name: bad }
rules:
  - { id: r1, policy_id: good, action: tool.invoke, target: "tool:*", effect: allow }
  - { id: r2, policy_id: bad, action: tool.delete, target: "tool:*", effect: deny }
bindings:
  - { id: b1, policy_id: good, scope_type: org, scope_id: org-1 }
  - { id: b2, policy_id: bad, scope_type: org, scope_id: org-1, priority: 1 }
"#,
        )
        .unwrap();
        let store = Arc::new(PolicyStore::new());
        let report = store.reload_bundle(&bundle);
        assert_eq!(report.rejected, vec!["bad".to_string()]);
        assert_eq!(report.accepted, 1);

        let evaluator = PolicyEvaluator::new(store);
        let r = evaluator
            .evaluate(&EvalRequest::new(Action::ToolInvoke, "tool:ops/restart", "org-1"))
            .unwrap();
        assert_eq!(r.decision, Decision::Allow);
        assert_eq!(r.rule_id.as_deref(), Some("r1"));
    }

    #[test]
    fn load_from_nonexistent_file() {
        let err = load_bundle("/does/not/exist.yaml").unwrap_err();
        assert!(
            err.to_string().contains("failed to read policy bundle"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn load_full_bundle() {
        let bundle = load_bundle_from_str(
            r#"
version: "1.0"
policies:
  - id: p1
    organization_id: org-1
    environment_id: prod
    name: "finance lockdown"
    version: 7
rules:
  - id: r1
    policy_id: p1
    action: tool.invoke
    target: "tool:finance/*"
    effect: deny
  - id: r2
    policy_id: p1
    action: resource.write
    target: "resource:ledger/*"
    effect: allow
    conditions:
      "budget_left_cents>=": 100
      ttl_valid: true
bindings:
  - { id: b1, policy_id: p1, scope_type: env, scope_id: prod, priority: 50 }
"#,
        )
        .unwrap();
        assert_eq!(bundle.policies[0].version, 7);
        assert_eq!(bundle.rules.len(), 2);
        assert_eq!(bundle.rules[1].conditions.len(), 2);
        assert_eq!(bundle.bindings[0].priority, 50);
    }
}
