//! Filter trace types for debugging filter decisions.
//!
//! [`FilterEngine::filter_with_trace`](crate::FilterEngine::filter_with_trace)
//! returns the same surviving candidates as `filter()` plus a [`FilterTrace`]:
//! what every rule evaluated to, and which rule decided each candidate.
//!
//! # Example
//!
//! ```
//! use celfilter::{EvaluationContext, FilterEngine, Rule};
//! use std::collections::BTreeMap;
//!
//! let engine = FilterEngine::new().unwrap();
//! let rules = [Rule::new("db-.*", "false")];
//! let candidates = BTreeMap::from([("db-1".to_string(), ()), ("web".to_string(), ())]);
//!
//! let outcome = engine
//!     .filter_with_trace(&rules, candidates, &EvaluationContext::default())
//!     .unwrap();
//! assert_eq!(outcome.kept.len(), 1);
//! println!("{}", outcome.trace);
//! ```

use serde::Serialize;
use std::fmt;

/// Why a candidate was kept or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum DecisionReason {
    /// No rule's name pattern matched; the candidate is kept.
    NoMatchingRule,
    /// The first matching rule evaluated to `true`.
    Included {
        /// Index of the deciding rule.
        index: usize,
    },
    /// The first matching rule evaluated to `false`.
    Excluded {
        /// Index of the deciding rule.
        index: usize,
    },
}

impl DecisionReason {
    /// Does the candidate survive?
    #[must_use]
    pub fn kept(self) -> bool {
        !matches!(self, Self::Excluded { .. })
    }

    /// Index of the deciding rule, if any.
    #[must_use]
    pub fn rule(self) -> Option<usize> {
        match self {
            Self::NoMatchingRule => None,
            Self::Included { index } | Self::Excluded { index } => Some(index),
        }
    }
}

/// One rule's compiled outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleTrace {
    /// Position in the rule list (0-based).
    pub index: usize,
    /// Name pattern as written.
    pub name: String,
    /// Expression source.
    pub expression: String,
    /// What the expression evaluated to.
    pub result: bool,
}

/// One candidate's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateTrace {
    /// Candidate name.
    pub name: String,
    /// The decision.
    #[serde(flatten)]
    pub reason: DecisionReason,
}

/// Trace of a full filter pass.
///
/// `decisions` lists every input candidate in name order; exactly those with
/// [`DecisionReason::kept`] survive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterTrace {
    /// Every rule, in order.
    pub rules: Vec<RuleTrace>,
    /// Every candidate, in name order.
    pub decisions: Vec<CandidateTrace>,
}

impl FilterTrace {
    /// Names of removed candidates.
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.decisions
            .iter()
            .filter(|d| !d.reason.kept())
            .map(|d| d.name.as_str())
    }
}

impl fmt::Display for FilterTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rules:")?;
        for rule in &self.rules {
            writeln!(
                f,
                "  [{}] {} => {:?} = {}",
                rule.index, rule.name, rule.expression, rule.result
            )?;
        }
        writeln!(f, "candidates:")?;
        for decision in &self.decisions {
            let verdict = if decision.reason.kept() { "keep" } else { "remove" };
            match decision.reason.rule() {
                Some(index) => writeln!(f, "  {}: {verdict} (rule {index})", decision.name)?,
                None => writeln!(f, "  {}: {verdict} (no matching rule)", decision.name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> FilterTrace {
        FilterTrace {
            rules: vec![RuleTrace {
                index: 0,
                name: "db-.*".into(),
                expression: "false".into(),
                result: false,
            }],
            decisions: vec![
                CandidateTrace {
                    name: "db-1".into(),
                    reason: DecisionReason::Excluded { index: 0 },
                },
                CandidateTrace {
                    name: "web".into(),
                    reason: DecisionReason::NoMatchingRule,
                },
            ],
        }
    }

    #[test]
    fn reason_kept() {
        assert!(DecisionReason::NoMatchingRule.kept());
        assert!(DecisionReason::Included { index: 0 }.kept());
        assert!(!DecisionReason::Excluded { index: 0 }.kept());
        assert_eq!(DecisionReason::Included { index: 3 }.rule(), Some(3));
        assert_eq!(DecisionReason::NoMatchingRule.rule(), None);
    }

    #[test]
    fn removed_lists_excluded() {
        assert_eq!(trace().removed().collect::<Vec<_>>(), ["db-1"]);
    }

    #[test]
    fn display_format() {
        let rendered = trace().to_string();
        assert!(rendered.contains("[0] db-.* => \"false\" = false"));
        assert!(rendered.contains("db-1: remove (rule 0)"));
        assert!(rendered.contains("web: keep (no matching rule)"));
    }

    #[test]
    fn serializes_flat_reason() {
        let json = serde_json::to_value(&trace().decisions[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "db-1", "reason": "excluded", "index": 0})
        );
    }
}
