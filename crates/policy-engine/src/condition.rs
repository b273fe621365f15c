//! Declarative rule conditions.
//!
//! A rule's condition map is compiled into a closed set of [`Condition`]
//! kinds.  Every condition must hold (AND); an empty set always holds.
//! A condition whose context field is absent fails without raising an error.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};

use crate::request::EvalContext;

static TIME_WINDOW_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{2}):(\d{2})-(\d{2}):(\d{2})$").ok());

/// A condition key or operand that cannot be evaluated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("unknown condition key '{key}'")]
    UnknownKey { key: String },

    #[error("condition '{key}' expects {expected}, got {found}")]
    InvalidOperand {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("time window '{value}' must be HH:MM-HH:MM with distinct start and end")]
    InvalidTimeWindow { value: String },
}

/// One compiled condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `env==`
    EnvEquals(String),
    /// `time_window`
    TimeWindow(TimeWindow),
    /// `tags`: every listed tag must be present.
    Tags(Vec<String>),
    /// `risk_level<=`
    RiskLevelAtMost(f64),
    /// `content_type`
    ContentType(Vec<String>),
    /// `max_size_mb<=`
    MaxSizeMb(f64),
    /// `allowed_tools`
    AllowedTools(Vec<String>),
    /// `allowed_resource_ns`
    AllowedResourceNs(Vec<String>),
    /// `depth<=`
    DepthAtMost(i64),
    /// `budget_left_cents>=`
    BudgetLeftAtLeast(i64),
    /// `ttl_valid`
    TtlValid,
    /// A key or operand that could not be compiled.  Never holds.
    Unsupported { key: String, reason: String },
}

/// Half-open time-of-day range `[start, end)`.  When `start > end` the
/// window wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(value: &str) -> Result<Self, ConditionError> {
        let invalid = || ConditionError::InvalidTimeWindow {
            value: value.to_string(),
        };
        let caps = TIME_WINDOW_RE
            .as_ref()
            .and_then(|re| re.captures(value))
            .ok_or_else(invalid)?;
        let num = |i: usize| caps[i].parse::<u32>().map_err(|_| invalid());
        let start = NaiveTime::from_hms_opt(num(1)?, num(2)?, 0).ok_or_else(invalid)?;
        let end = NaiveTime::from_hms_opt(num(3)?, num(4)?, 0).ok_or_else(invalid)?;
        if start == end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Everything a condition may consult.
#[derive(Debug, Clone, Copy)]
pub struct ConditionInput<'a> {
    pub environment_id: Option<&'a str>,
    pub context: &'a EvalContext,
    pub now: DateTime<Utc>,
}

/// Result of evaluating a condition set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionOutcome {
    pub holds: bool,
    pub warnings: Vec<String>,
}

/// A compiled, ordered list of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
}

impl ConditionSet {
    /// Strict compilation used at policy-load time: any unknown key or bad
    /// operand is reported.
    pub fn compile(map: &BTreeMap<String, Value>) -> Result<Self, Vec<ConditionError>> {
        let mut conditions = Vec::with_capacity(map.len());
        let mut errors = Vec::new();
        for (key, value) in map {
            match Condition::compile(key, value) {
                Ok(c) => conditions.push(c),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(Self { conditions })
        } else {
            Err(errors)
        }
    }

    /// Lenient compilation for ad-hoc evaluation: problems become
    /// [`Condition::Unsupported`] entries, which fail and warn.
    pub fn compile_lenient(map: &BTreeMap<String, Value>) -> Self {
        let conditions = map
            .iter()
            .map(|(key, value)| {
                Condition::compile(key, value).unwrap_or_else(|e| Condition::Unsupported {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })
            .collect();
        Self { conditions }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Evaluate every condition.  All are visited so that every warning is
    /// reported, not just the first failure.
    pub fn evaluate(&self, input: &ConditionInput<'_>) -> ConditionOutcome {
        let mut outcome = ConditionOutcome {
            holds: true,
            warnings: Vec::new(),
        };
        for condition in &self.conditions {
            if let Condition::Unsupported { key, reason } = condition {
                warn!(key = %key, reason = %reason, "unsupported condition treated as non-matching");
                outcome.warnings.push(format!("condition '{key}' ignored as non-matching: {reason}"));
                outcome.holds = false;
                continue;
            }
            if !condition.holds(input) {
                trace!(?condition, "condition failed");
                outcome.holds = false;
            }
        }
        outcome
    }
}

/// Evaluate a raw condition map against `input`.
pub fn evaluate(conditions: &BTreeMap<String, Value>, input: &ConditionInput<'_>) -> bool {
    ConditionSet::compile_lenient(conditions).evaluate(input).holds
}

impl Condition {
    /// Compile one `key: value` pair.
    pub fn compile(key: &str, value: &Value) -> Result<Self, ConditionError> {
        let condition = match key {
            "env==" => Condition::EnvEquals(expect_str(key, value)?.to_string()),
            "time_window" => Condition::TimeWindow(TimeWindow::parse(expect_str(key, value)?)?),
            "tags" => Condition::Tags(expect_str_list(key, value)?),
            "risk_level<=" => Condition::RiskLevelAtMost(expect_number(key, value)?),
            "content_type" => Condition::ContentType(match value {
                Value::String(s) => vec![s.clone()],
                other => expect_str_list(key, other)?,
            }),
            "max_size_mb<=" => Condition::MaxSizeMb(expect_number(key, value)?),
            "allowed_tools" => Condition::AllowedTools(expect_str_list(key, value)?),
            "allowed_resource_ns" => Condition::AllowedResourceNs(expect_str_list(key, value)?),
            "depth<=" => Condition::DepthAtMost(expect_integer(key, value)?),
            "budget_left_cents>=" => Condition::BudgetLeftAtLeast(expect_integer(key, value)?),
            "ttl_valid" => match value {
                Value::Null | Value::Bool(true) => Condition::TtlValid,
                other => return Err(invalid_operand(key, "true or no operand", other)),
            },
            _ => {
                return Err(ConditionError::UnknownKey {
                    key: key.to_string(),
                })
            }
        };
        Ok(condition)
    }

    fn holds(&self, input: &ConditionInput<'_>) -> bool {
        let ctx = input.context;
        match self {
            Condition::EnvEquals(env) => input.environment_id == Some(env.as_str()),
            Condition::TimeWindow(window) => match local_time(input) {
                Some(t) => window.contains(t),
                None => false,
            },
            Condition::Tags(required) => required.iter().all(|t| ctx.tags.contains(t)),
            Condition::RiskLevelAtMost(max) => ctx.risk_level.is_some_and(|r| r <= *max),
            Condition::ContentType(types) => ctx
                .content_type
                .as_ref()
                .is_some_and(|ct| types.contains(ct)),
            Condition::MaxSizeMb(max) => ctx.payload_size_mb.is_some_and(|s| s <= *max),
            Condition::AllowedTools(tools) => ctx
                .tool_name
                .as_ref()
                .is_some_and(|t| tools.contains(t)),
            Condition::AllowedResourceNs(namespaces) => ctx
                .resource_namespace
                .as_ref()
                .is_some_and(|ns| namespaces.contains(ns)),
            Condition::DepthAtMost(max) => ctx.call_depth.is_some_and(|d| i64::from(d) <= *max),
            Condition::BudgetLeftAtLeast(min) => ctx.budget_left_cents.is_some_and(|b| b >= *min),
            Condition::TtlValid => ctx.ttl_valid == Some(true),
            Condition::Unsupported { .. } => false,
        }
    }
}

/// Time of day in the context's zone.  An unknown zone fails closed.
fn local_time(input: &ConditionInput<'_>) -> Option<NaiveTime> {
    let now = input.now;
    let time = match input.context.timezone.as_deref() {
        None => now.time(),
        Some(name) => match name.parse::<chrono_tz::Tz>() {
            Ok(tz) => now.with_timezone(&tz).time(),
            Err(_) => {
                trace!(timezone = name, "unknown timezone; time window fails closed");
                return None;
            }
        },
    };
    NaiveTime::from_hms_opt(time.hour(), time.minute(), time.second())
}

fn invalid_operand(key: &str, expected: &'static str, found: &Value) -> ConditionError {
    ConditionError::InvalidOperand {
        key: key.to_string(),
        expected,
        found: found.to_string(),
    }
}

fn expect_str<'v>(key: &str, value: &'v Value) -> Result<&'v str, ConditionError> {
    value.as_str().ok_or_else(|| invalid_operand(key, "a string", value))
}

fn expect_number(key: &str, value: &Value) -> Result<f64, ConditionError> {
    value.as_f64().ok_or_else(|| invalid_operand(key, "a number", value))
}

fn expect_integer(key: &str, value: &Value) -> Result<i64, ConditionError> {
    value.as_i64().ok_or_else(|| invalid_operand(key, "an integer", value))
}

fn expect_str_list(key: &str, value: &Value) -> Result<Vec<String>, ConditionError> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid_operand(key, "a list of strings", value))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid_operand(key, "a list of strings", value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn conditions(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn input<'a>(ctx: &'a EvalContext, env: Option<&'a str>) -> ConditionInput<'a> {
        ConditionInput {
            environment_id: env,
            context: ctx,
            now: noon(),
        }
    }

    #[test]
    fn empty_map_holds() {
        let ctx = EvalContext::default();
        assert!(evaluate(&BTreeMap::new(), &input(&ctx, None)));
    }

    #[test]
    fn risk_level_fails_closed() {
        let map = conditions(json!({ "risk_level<=": 3 }));

        let absent = EvalContext::default();
        assert!(!evaluate(&map, &input(&absent, None)));

        let high = EvalContext {
            risk_level: Some(5.0),
            ..Default::default()
        };
        assert!(!evaluate(&map, &input(&high, None)));

        let low = EvalContext {
            risk_level: Some(3.0),
            ..Default::default()
        };
        assert!(evaluate(&map, &input(&low, None)));
    }

    #[test]
    fn env_equals_uses_request_environment() {
        let map = conditions(json!({ "env==": "prod" }));
        let ctx = EvalContext::default();
        assert!(evaluate(&map, &input(&ctx, Some("prod"))));
        assert!(!evaluate(&map, &input(&ctx, Some("staging"))));
        assert!(!evaluate(&map, &input(&ctx, None)));
    }

    #[test]
    fn tags_require_every_listed_tag() {
        let map = conditions(json!({ "tags": ["trusted", "reviewed"] }));
        let some = EvalContext {
            tags: vec!["trusted".into()],
            ..Default::default()
        };
        assert!(!evaluate(&map, &input(&some, None)));

        let all = EvalContext {
            tags: vec!["reviewed".into(), "trusted".into(), "extra".into()],
            ..Default::default()
        };
        assert!(evaluate(&map, &input(&all, None)));
    }

    #[test]
    fn content_type_accepts_string_or_list() {
        let ctx = EvalContext {
            content_type: Some("application/pdf".into()),
            ..Default::default()
        };
        let single = conditions(json!({ "content_type": "application/pdf" }));
        let many = conditions(json!({ "content_type": ["text/csv", "application/pdf"] }));
        let other = conditions(json!({ "content_type": ["text/csv"] }));
        assert!(evaluate(&single, &input(&ctx, None)));
        assert!(evaluate(&many, &input(&ctx, None)));
        assert!(!evaluate(&other, &input(&ctx, None)));
    }

    #[test]
    fn numeric_bounds() {
        let map = conditions(json!({
            "max_size_mb<=": 10,
            "depth<=": 2,
            "budget_left_cents>=": 500
        }));
        let ok = EvalContext {
            payload_size_mb: Some(9.5),
            call_depth: Some(2),
            budget_left_cents: Some(500),
            ..Default::default()
        };
        assert!(evaluate(&map, &input(&ok, None)));

        let too_deep = EvalContext {
            call_depth: Some(3),
            ..ok.clone()
        };
        assert!(!evaluate(&map, &input(&too_deep, None)));

        let broke = EvalContext {
            budget_left_cents: Some(499),
            ..ok
        };
        assert!(!evaluate(&map, &input(&broke, None)));
    }

    #[test]
    fn allowed_lists_and_ttl() {
        let map = conditions(json!({
            "allowed_tools": ["exporter"],
            "allowed_resource_ns": ["data", "reports"],
            "ttl_valid": true
        }));
        let ctx = EvalContext {
            tool_name: Some("exporter".into()),
            resource_namespace: Some("reports".into()),
            ttl_valid: Some(true),
            ..Default::default()
        };
        assert!(evaluate(&map, &input(&ctx, None)));

        let expired = EvalContext {
            ttl_valid: Some(false),
            ..ctx.clone()
        };
        assert!(!evaluate(&map, &input(&expired, None)));

        let no_tool = EvalContext {
            tool_name: None,
            ..ctx
        };
        assert!(!evaluate(&map, &input(&no_tool, None)));
    }

    #[test]
    fn time_window_in_utc_and_zones() {
        let office = conditions(json!({ "time_window": "09:00-17:00" }));
        let ctx = EvalContext::default();
        assert!(evaluate(&office, &input(&ctx, None)));

        // 12:00 UTC is 21:00 in Tokyo.
        let tokyo = EvalContext {
            timezone: Some("Asia/Tokyo".into()),
            ..Default::default()
        };
        assert!(!evaluate(&office, &input(&tokyo, None)));

        let bogus = EvalContext {
            timezone: Some("Mars/Olympus".into()),
            ..Default::default()
        };
        assert!(!evaluate(&office, &input(&bogus, None)));
    }

    #[test]
    fn time_window_wraps_midnight() {
        let w = TimeWindow::parse("22:00-06:00").unwrap();
        assert!(w.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(w.contains(NaiveTime::from_hms_opt(5, 59, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(6, 0, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn time_window_syntax() {
        assert!(TimeWindow::parse("9:00-17:00").is_err());
        assert!(TimeWindow::parse("25:00-17:00").is_err());
        assert!(TimeWindow::parse("10:00-10:00").is_err());
        assert!(TimeWindow::parse("00:00-23:59").is_ok());
    }

    #[test]
    fn strict_compile_reports_every_problem() {
        let map = conditions(json!({
            "tags": "trusted",
            "risk_level<=": 3,
            "geo": "eu"
        }));
        let errors = ConditionSet::compile(&map).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ConditionError::UnknownKey { key: "geo".into() }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConditionError::InvalidOperand { key, .. } if key == "tags")));
    }

    #[test]
    fn unknown_key_fails_closed_with_warning() {
        let map = conditions(json!({ "geo": "eu" }));
        let set = ConditionSet::compile_lenient(&map);
        let ctx = EvalContext::default();
        let outcome = set.evaluate(&input(&ctx, None));
        assert!(!outcome.holds);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("geo"));
    }

    #[test]
    fn ttl_valid_rejects_false_operand() {
        assert!(Condition::compile("ttl_valid", &json!(false)).is_err());
        assert_eq!(Condition::compile("ttl_valid", &Value::Null).unwrap(), Condition::TtlValid);
    }

    #[test]
    fn depth_requires_integer() {
        assert!(Condition::compile("depth<=", &json!(2.5)).is_err());
        assert_eq!(
            Condition::compile("depth<=", &json!(2)).unwrap(),
            Condition::DepthAtMost(2)
        );
    }
}
