use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource, DecisionRecord};
use policy_engine::{
    loader, Decision, EvalError, EvalRequest, EvalResult, PolicyEvaluator, PolicyStore,
    ReloadReport,
};

const COMPONENT: &str = "policy-gate";

/// Load a bundle from disk into a fresh store and audit the outcome.
pub fn load_store(
    bundle_path: &Path,
    audit: Option<&AuditSink>,
) -> Result<(Arc<PolicyStore>, ReloadReport)> {
    let bundle = loader::load_bundle(bundle_path)?;
    let store = Arc::new(PolicyStore::new());
    let report = store.reload_bundle(&bundle);

    info!(
        bundle = %bundle_path.display(),
        generation = report.generation,
        accepted = report.accepted,
        rejected = report.rejected.len(),
        "policy bundle loaded"
    );
    if let Some(audit) = audit {
        audit_report(audit, bundle_path, &report);
    }
    Ok((store, report))
}

fn audit_report(audit: &AuditSink, bundle_path: &Path, report: &ReloadReport) {
    audit.try_log(AuditEntry::new(
        AuditEventType::SnapshotPublished,
        AuditSource::new(COMPONENT),
        json!({
            "bundle": bundle_path.display().to_string(),
            "generation": report.generation,
            "accepted": report.accepted,
            "rejected": report.rejected.len(),
        }),
    ));
    for policy_id in &report.rejected {
        let errors: Vec<String> = report
            .errors
            .iter()
            .filter(|e| &e.policy_id == policy_id)
            .map(ToString::to_string)
            .collect();
        audit.try_log(AuditEntry::new(
            AuditEventType::PolicyRejected,
            AuditSource::new(COMPONENT),
            json!({
                "policy_id": policy_id,
                "generation": report.generation,
                "errors": errors,
            }),
        ));
    }
}

/// Human-readable validation report.
pub fn write_report(report: &ReloadReport, out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "generation {}: {} policies accepted, {} rejected",
        report.generation,
        report.accepted,
        report.rejected.len()
    )?;
    for error in &report.errors {
        writeln!(out, "  error: {error}")?;
    }
    if !report.rejected.is_empty() {
        writeln!(out, "  rejected: {}", report.rejected.join(", "))?;
    }
    Ok(())
}

/// Tally of one `eval` run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvalSummary {
    pub allowed: usize,
    pub denied: usize,
    pub rejected: usize,
}

/// Evaluates JSON requests and writes one JSON result line per request.
pub struct Gate {
    evaluator: PolicyEvaluator,
    audit: Option<AuditSink>,
    default_timezone: Option<String>,
    explain: bool,
}

impl Gate {
    pub fn new(evaluator: PolicyEvaluator, audit: Option<AuditSink>) -> Self {
        Self {
            evaluator,
            audit,
            default_timezone: None,
            explain: false,
        }
    }

    /// Zone used for requests whose context does not name one.
    pub fn with_default_timezone(mut self, timezone: Option<String>) -> Self {
        self.default_timezone = timezone;
        self
    }

    /// Force an explanation on every request.
    pub fn with_explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    /// Evaluate a single JSON document.
    pub fn run_document(&self, document: &str, mut out: impl Write) -> Result<EvalSummary> {
        let mut summary = EvalSummary::default();
        self.evaluate_into(document.trim(), &mut out, &mut summary)?;
        out.flush()?;
        Ok(summary)
    }

    /// Evaluate JSON lines; blank lines are skipped.
    pub fn run_lines(&self, input: impl BufRead, mut out: impl Write) -> Result<EvalSummary> {
        let mut summary = EvalSummary::default();
        for line in input.lines() {
            let line = line.context("failed to read request stream")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.evaluate_into(line, &mut out, &mut summary)?;
        }
        out.flush()?;
        Ok(summary)
    }

    fn evaluate_into(&self, input: &str, out: &mut impl Write, summary: &mut EvalSummary) -> Result<()> {
        match self.evaluate(input) {
            Ok((req, result)) => {
                match result.decision {
                    Decision::Allow => summary.allowed += 1,
                    Decision::Deny => summary.denied += 1,
                }
                self.audit_decision(&req, &result);
                serde_json::to_writer(&mut *out, &result)?;
            }
            Err(err) => {
                summary.rejected += 1;
                debug!(%err, "request rejected");
                self.audit_rejection(&err);
                serde_json::to_writer(&mut *out, &json!({ "error": err.to_string() }))?;
            }
        }
        writeln!(out)?;
        Ok(())
    }

    fn evaluate(&self, input: &str) -> Result<(EvalRequest, EvalResult), EvalError> {
        let mut req = EvalRequest::from_json_str(input)?;
        if self.explain {
            req.explain = true;
        }
        if req.context.timezone.is_none() {
            req.context.timezone = self.default_timezone.clone();
        }
        let result = self.evaluator.evaluate(&req)?;
        Ok((req, result))
    }

    fn audit_decision(&self, req: &EvalRequest, result: &EvalResult) {
        let Some(audit) = &self.audit else {
            return;
        };
        let (event_type, decision) = match result.decision {
            Decision::Allow => (AuditEventType::DecisionAllowed, "allow"),
            Decision::Deny => (AuditEventType::DecisionDenied, "deny"),
        };
        let source = AuditSource::new(COMPONENT)
            .with_organization(&req.organization_id)
            .with_subject(req.subject.clone());
        let details = json!({
            "action": req.action,
            "target": req.target,
            "environment_id": req.environment_id,
        });
        audit.try_log(AuditEntry::new(event_type, source, details).with_decision(DecisionRecord {
            decision: decision.to_string(),
            rule_id: result.rule_id.clone(),
            reason: result.reason.clone(),
            snapshot_generation: result.snapshot_generation,
        }));
    }

    fn audit_rejection(&self, err: &EvalError) {
        if let Some(audit) = &self.audit {
            audit.try_log(AuditEntry::new(
                AuditEventType::RequestRejected,
                AuditSource::new(COMPONENT),
                json!({ "error": err.to_string() }),
            ));
        }
    }
}
