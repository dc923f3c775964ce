//! Conformance test fixture runner
//!
//! Loads YAML fixtures and runs them against the filter engine.
//!
//! ```yaml
//! name: first_match_wins
//! description: The first matching rule decides
//! rules:
//!   - name: matching-.*
//!     expression: "true"
//! cases:
//!   - name: kept
//!     candidates: [matching-a, other]
//!     expect:
//!       kept: [matching-a, other]
//! ```
//!
//! A case expects either the surviving candidate names (`kept`) or a request
//! error (`error` with the failing rule's `index` and `stage`).

use celfilter::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// A complete test fixture
#[derive(Debug, Deserialize)]
pub struct Fixture {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rules: Vec<Rule>,
    pub cases: Vec<TestCase>,
}

/// Test case
#[derive(Debug, Deserialize)]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub observed: State,
    #[serde(default)]
    pub desired: State,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub candidates: Vec<String>,
    pub expect: Expect,
}

/// Expected outcome: exactly one of `kept` or `error`.
#[derive(Debug, Deserialize)]
pub struct Expect {
    #[serde(default)]
    pub kept: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<ExpectedError>,
}

/// Expected request error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ExpectedError {
    pub index: usize,
    pub stage: Stage,
}

/// What a case produced (or should produce).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Kept(Vec<String>),
    Error(ExpectedError),
    /// The fixture's expectation names neither or both outcomes.
    Malformed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kept(names) => write!(f, "kept {names:?}"),
            Self::Error(e) => write!(f, "error at rule {} during {}", e.index, e.stage),
            Self::Malformed => write!(f, "malformed expectation"),
        }
    }
}

impl Expect {
    fn outcome(&self) -> Outcome {
        match (&self.kept, self.error) {
            (Some(kept), None) => Outcome::Kept(kept.clone()),
            (None, Some(error)) => Outcome::Error(error),
            _ => Outcome::Malformed,
        }
    }
}

impl TestCase {
    /// The state this case's expressions see.
    pub fn build_context(&self) -> EvaluationContext {
        EvaluationContext {
            observed: self.observed.clone(),
            desired: self.desired.clone(),
            context: self.context.clone(),
        }
    }

    /// This case's candidates, valued by position.
    pub fn build_candidates(&self) -> BTreeMap<String, usize> {
        self.candidates
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of running a single test case
#[derive(Debug)]
pub struct CaseResult {
    pub case_name: String,
    pub passed: bool,
    pub expected: Outcome,
    pub actual: Outcome,
    /// Full error message, when the request failed.
    pub message: Option<String>,
}

impl Fixture {
    /// Parse a fixture from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Parse multiple fixtures from a YAML file with `---` separators
    pub fn from_yaml_multi(yaml: &str) -> Result<Vec<Self>, serde_yaml::Error> {
        let mut fixtures = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            fixtures.push(Self::deserialize(doc)?);
        }
        Ok(fixtures)
    }

    /// Run all test cases against `engine` and return results
    pub fn run(&self, engine: &FilterEngine) -> Vec<CaseResult> {
        self.cases
            .iter()
            .map(|case| {
                let result =
                    engine.filter(&self.rules, case.build_candidates(), &case.build_context());
                let (actual, message) = match result {
                    Ok(kept) => (Outcome::Kept(kept.into_keys().collect()), None),
                    Err(err) => (
                        Outcome::Error(ExpectedError {
                            index: err.index(),
                            stage: err.stage(),
                        }),
                        Some(celfilter::error_chain(&err)),
                    ),
                };
                let expected = case.expect.outcome();
                CaseResult {
                    case_name: case.name.clone(),
                    passed: expected != Outcome::Malformed && actual == expected,
                    expected,
                    actual,
                    message,
                }
            })
            .collect()
    }

    /// Run all test cases and panic on first failure
    pub fn run_and_assert(&self, engine: &FilterEngine) {
        for result in self.run(engine) {
            assert!(
                result.passed,
                "Fixture '{}' case '{}' failed: expected {}, got {}{}",
                self.name,
                result.case_name,
                result.expected,
                result.actual,
                result
                    .message
                    .map(|m| format!(" ({m})"))
                    .unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_runs() {
        let fixture = Fixture::from_yaml(
            r#"
name: inline
rules:
  - name: "a"
    expression: "false"
cases:
  - name: removes a
    candidates: [a, b]
    expect:
      kept: [b]
  - name: malformed
    candidates: []
    expect: {}
"#,
        )
        .unwrap();
        let engine = FilterEngine::new().unwrap();
        let results = fixture.run(&engine);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[1].expected, Outcome::Malformed);
    }

    #[test]
    fn error_outcome() {
        let fixture = Fixture::from_yaml(
            r#"
name: inline
rules:
  - name: "("
    expression: "true"
cases:
  - name: bad pattern
    candidates: [a]
    expect:
      error: {index: 0, stage: pattern_compile}
"#,
        )
        .unwrap();
        let results = fixture.run(&FilterEngine::new().unwrap());
        assert!(results[0].passed, "{results:?}");
        assert!(results[0]
            .message
            .as_deref()
            .is_some_and(|m| m.starts_with("cannot compile regular expression")));
    }
}
