//! Segment-wise wildcard matching for namespaced target identifiers.
//!
//! Patterns and targets are split on `/` and `:` into ordered segments, so
//! `tool:finance/send_invoice` becomes `[tool, finance, send_invoice]`.  A
//! `*` segment matches exactly one target segment; a trailing `*` swallows
//! the whole remaining suffix.  Literal segments compare case-sensitively.

use thiserror::Error;

use crate::schema::{Action, TargetFamily};

const WILDCARD: &str = "*";

/// Why a pattern or target was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern must not be empty")]
    Empty,

    #[error("'{pattern}' contains an empty segment")]
    EmptySegment { pattern: String },

    #[error("'{pattern}' contains whitespace")]
    Whitespace { pattern: String },

    #[error("'{pattern}': segment '{segment}' mixes '*' with literal text; only whole-segment wildcards are supported")]
    PartialWildcard { pattern: String, segment: String },

    #[error("'{pattern}' must start with '{expected}:'")]
    FamilyMismatch {
        pattern: String,
        expected: &'static str,
    },

    #[error("'{pattern}' does not fit the {family} grammar ({grammar})")]
    Arity {
        pattern: String,
        family: &'static str,
        grammar: &'static str,
    },

    #[error("request target '{target}' must not contain wildcards")]
    WildcardInTarget { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A syntactically valid wildcard pattern, independent of any action family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parse `raw` into segments, rejecting empty segments, whitespace and
    /// partial wildcards such as `send_*`.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(PatternError::Whitespace {
                pattern: raw.to_string(),
            });
        }

        let mut segments = Vec::new();
        for seg in split_segments(raw) {
            if seg.is_empty() {
                return Err(PatternError::EmptySegment {
                    pattern: raw.to_string(),
                });
            }
            if seg == WILDCARD {
                segments.push(Segment::Wildcard);
            } else if seg.contains('*') {
                return Err(PatternError::PartialWildcard {
                    pattern: raw.to_string(),
                    segment: seg.to_string(),
                });
            } else {
                segments.push(Segment::Literal(seg.to_string()));
            }
        }
        Ok(Self { segments })
    }

    /// Test a concrete target against this pattern.
    pub fn matches(&self, target: &str) -> bool {
        if target.is_empty() {
            return false;
        }
        let target: Vec<&str> = split_segments(target).collect();
        segments_match(&self.segments, &target)
    }

    fn ends_with_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard))
    }

    fn is_bare_wildcard(&self) -> bool {
        self.segments == [Segment::Wildcard]
    }
}

/// A rule target pattern validated against its action's namespace grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPattern {
    raw: String,
    pattern: Pattern,
}

impl TargetPattern {
    /// Validate `raw` as a target pattern for rules with `action`.
    ///
    /// A bare `*` is accepted for every family.  Anything else must carry the
    /// family prefix and have a segment count the family grammar can match:
    /// `tool:{ns}/{name}`, `agent:{slug}`, `resource:{ns}/{path...}`.
    pub fn parse(action: Action, raw: &str) -> Result<Self, PatternError> {
        let pattern = Pattern::parse(raw)?;
        if !pattern.is_bare_wildcard() {
            check_family(action.family(), raw, &pattern)?;
        }
        Ok(Self {
            raw: raw.to_string(),
            pattern,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, target: &str) -> bool {
        self.pattern.matches(target)
    }
}

/// Match `target` against `pattern`.  Malformed patterns never match.
pub fn matches(pattern: &str, target: &str) -> bool {
    match Pattern::parse(pattern) {
        Ok(p) => p.matches(target),
        Err(e) => {
            tracing::debug!(pattern, error = %e, "malformed pattern treated as non-match");
            false
        }
    }
}

/// Check that a concrete request target is well formed for `action`.
pub fn validate_target(action: Action, target: &str) -> Result<(), PatternError> {
    if target.contains('*') {
        return Err(PatternError::WildcardInTarget {
            target: target.to_string(),
        });
    }
    let pattern = Pattern::parse(target)?;
    check_family(action.family(), target, &pattern)
}

/// Extract `{ns}` from a `resource:{ns}/{path}` target.
pub fn resource_namespace(target: &str) -> Option<&str> {
    let rest = target.strip_prefix("resource:")?;
    let (ns, path) = rest.split_once('/')?;
    if ns.is_empty() || path.is_empty() {
        return None;
    }
    Some(ns)
}

fn split_segments(s: &str) -> impl Iterator<Item = &str> {
    s.split(['/', ':'])
}

fn segments_match(pattern: &[Segment], target: &[&str]) -> bool {
    for (i, seg) in pattern.iter().enumerate() {
        let is_last = i + 1 == pattern.len();
        match seg {
            Segment::Wildcard if is_last => {
                let rest = &target[i.min(target.len())..];
                return !rest.is_empty() && rest.iter().all(|s| !s.is_empty());
            }
            Segment::Wildcard => match target.get(i) {
                Some(t) if !t.is_empty() => {}
                _ => return false,
            },
            Segment::Literal(lit) => match target.get(i) {
                Some(t) if t == lit => {}
                _ => return false,
            },
        }
    }
    pattern.len() == target.len()
}

fn check_family(family: TargetFamily, raw: &str, pattern: &Pattern) -> Result<(), PatternError> {
    let prefix = family.prefix();
    let has_prefix = raw
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with(':'));
    if !has_prefix {
        return Err(PatternError::FamilyMismatch {
            pattern: raw.to_string(),
            expected: prefix,
        });
    }

    let body = pattern.segments.len() - 1;
    let trailing = pattern.ends_with_wildcard();
    let (fits, grammar) = match family {
        TargetFamily::Tool => (body == 2 || (trailing && body <= 2), "tool:{namespace}/{name}"),
        TargetFamily::Agent => (body == 1, "agent:{slug}"),
        TargetFamily::Resource => (body >= 2 || (trailing && body >= 1), "resource:{namespace}/{path}"),
    };
    if fits {
        Ok(())
    } else {
        Err(PatternError::Arity {
            pattern: raw.to_string(),
            family: prefix,
            grammar,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- raw matching ----

    #[test]
    fn exact_match_is_case_sensitive() {
        assert!(matches("tool:finance/send_invoice", "tool:finance/send_invoice"));
        assert!(!matches("tool:finance/send_invoice", "tool:Finance/send_invoice"));
        assert!(!matches("tool:finance/send_invoice", "tool:finance/refund"));
    }

    #[test]
    fn trailing_wildcard_covers_suffix() {
        assert!(matches("tool:*", "tool:finance/send_invoice"));
        assert!(matches("resource:data/*", "resource:data/a/b"));
        assert!(matches("resource:data/*", "resource:data/a/b/c"));
        assert!(!matches("resource:data/*", "resource:other/a"));
        // The wildcard needs at least one segment to swallow.
        assert!(!matches("resource:data/*", "resource:data"));
    }

    #[test]
    fn inner_wildcard_is_single_segment() {
        assert!(matches("tool:*/send_invoice", "tool:finance/send_invoice"));
        assert!(!matches("tool:*/send_invoice", "tool:finance/eu/send_invoice"));
        assert!(!matches("resource:*/a", "resource:data/a/b"));
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        assert!(matches("*", "tool:finance/send_invoice"));
        assert!(matches("*", "agent:helper"));
        assert!(!matches("*", ""));
    }

    #[test]
    fn segment_counts_must_agree() {
        assert!(!matches("tool:finance", "tool:finance/send_invoice"));
        assert!(!matches("tool:finance/send_invoice/extra", "tool:finance/send_invoice"));
    }

    #[test]
    fn malformed_patterns_never_match() {
        assert!(!matches("", "tool:finance/x"));
        assert!(!matches("tool:fin*/x", "tool:finance/x"));
        assert!(!matches("tool:finance//x", "tool:finance//x"));
    }

    // ---- family validation ----

    #[test]
    fn valid_rule_targets() {
        for (action, raw) in [
            (Action::ToolInvoke, "tool:finance/send_invoice"),
            (Action::ToolInvoke, "tool:finance/*"),
            (Action::ToolInvoke, "tool:*"),
            (Action::ToolInvoke, "tool:*/send_invoice"),
            (Action::ToolInvoke, "*"),
            (Action::AgentInvoke, "agent:billing-bot"),
            (Action::AgentInvoke, "agent:*"),
            (Action::ResourceRead, "resource:data/reports/q1.csv"),
            (Action::ResourceWrite, "resource:data/*"),
            (Action::ResourceWrite, "resource:*"),
        ] {
            assert!(TargetPattern::parse(action, raw).is_ok(), "{action} {raw}");
        }
    }

    #[test]
    fn family_prefix_must_match_action() {
        let err = TargetPattern::parse(Action::ToolInvoke, "agent:helper").unwrap_err();
        assert!(matches!(err, PatternError::FamilyMismatch { expected: "tool", .. }));

        let err = TargetPattern::parse(Action::ResourceRead, "resourcedata/x").unwrap_err();
        assert!(matches!(err, PatternError::FamilyMismatch { .. }));
    }

    #[test]
    fn arity_errors() {
        for (action, raw) in [
            (Action::ToolInvoke, "tool:finance"),
            (Action::ToolInvoke, "tool:finance/send/*"),
            (Action::AgentInvoke, "agent:a/b"),
            (Action::ResourceRead, "resource:data"),
        ] {
            let err = TargetPattern::parse(action, raw).unwrap_err();
            assert!(matches!(err, PatternError::Arity { .. }), "{raw}: {err}");
        }
    }

    #[test]
    fn syntax_errors() {
        assert_eq!(
            TargetPattern::parse(Action::ToolInvoke, "").unwrap_err(),
            PatternError::Empty
        );
        assert!(matches!(
            TargetPattern::parse(Action::ToolInvoke, "tool:fin ance/x").unwrap_err(),
            PatternError::Whitespace { .. }
        ));
        assert!(matches!(
            TargetPattern::parse(Action::ToolInvoke, "tool:finance/send_*").unwrap_err(),
            PatternError::PartialWildcard { .. }
        ));
    }

    #[test]
    fn compiled_pattern_matches_like_raw() {
        let p = TargetPattern::parse(Action::ToolInvoke, "tool:finance/*").unwrap();
        assert_eq!(p.as_str(), "tool:finance/*");
        assert!(p.matches("tool:finance/send_invoice"));
        assert!(!p.matches("tool:hr/onboard"));
    }

    // ---- request targets ----

    #[test]
    fn request_target_validation() {
        assert!(validate_target(Action::ToolInvoke, "tool:finance/send_invoice").is_ok());
        assert!(validate_target(Action::ResourceRead, "resource:data/a/b").is_ok());
        assert!(matches!(
            validate_target(Action::ToolInvoke, "tool:finance/*").unwrap_err(),
            PatternError::WildcardInTarget { .. }
        ));
        assert!(matches!(
            validate_target(Action::AgentInvoke, "tool:finance/x").unwrap_err(),
            PatternError::FamilyMismatch { .. }
        ));
        assert!(validate_target(Action::ToolInvoke, "").is_err());
    }

    #[test]
    fn namespace_extraction() {
        assert_eq!(resource_namespace("resource:data/a/b"), Some("data"));
        assert_eq!(resource_namespace("resource:data"), None);
        assert_eq!(resource_namespace("tool:data/a"), None);
    }
}
