//! Filter engine: First-match-wins rule application
//!
//! A [`Rule`] pairs a name pattern with a boolean expression. For each
//! candidate, the first rule (in declared order) whose pattern matches the
//! candidate's name decides it: removed if the expression is `false`, kept if
//! `true`. Candidates no rule matches are kept.
//!
//! Filtering runs in two passes:
//!
//! 1. **Compile** every rule in order: name pattern, then expression, then
//!    evaluate the expression once against the shared
//!    [`EvaluationContext`]. The first failure aborts the whole request.
//! 2. **Apply** the precomputed outcomes to every candidate.
//!
//! Expressions never see the candidate itself, so one evaluation per rule
//! serves every candidate it matches.
//!
//! ```
//! use celfilter::{EvaluationContext, FilterEngine, Rule};
//! use std::collections::BTreeMap;
//!
//! let engine = FilterEngine::new().unwrap();
//! let rules = [
//!     Rule::new("cache-.*", "context.enableCache == true"),
//! ];
//! let candidates = BTreeMap::from([
//!     ("cache-redis".to_string(), 1),
//!     ("database".to_string(), 2),
//! ]);
//! let mut ctx = EvaluationContext::default();
//! ctx.context.insert("enableCache".into(), false.into());
//!
//! let kept = engine.filter(&rules, candidates, &ctx).unwrap();
//! assert_eq!(kept.into_keys().collect::<Vec<_>>(), ["database"]);
//! ```

use crate::env::{Environment, EnvironmentError};
use crate::name_matcher::{anchor, NameMatcher, PatternError};
use crate::program::{ExpressionError, Program};
use crate::state::EvaluationContext;
use crate::trace::{CandidateTrace, DecisionReason, FilterTrace, RuleTrace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A filter rule: which candidates it applies to, and whether they stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Regular expression matched against the whole candidate name.
    pub name: String,
    /// Boolean expression; `false` removes matching candidates.
    pub expression: String,
}

impl Rule {
    /// A rule from a name pattern and an expression.
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

/// The step at which a rule failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Compiling the name pattern.
    PatternCompile,
    /// Parsing the expression.
    Parse,
    /// Type-checking the expression.
    TypeCheck,
    /// Asserting the expression is boolean.
    ResultType,
    /// Evaluating the expression.
    Evaluate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PatternCompile => "pattern compile",
            Self::Parse => "parse",
            Self::TypeCheck => "type check",
            Self::ResultType => "result type",
            Self::Evaluate => "evaluate",
        })
    }
}

/// A rule failed; the whole request fails with it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    /// The rule's name pattern does not compile.
    #[error("cannot compile regular expression {:?} for filter {index}", anchor(.pattern))]
    PatternCompile {
        /// Rule index.
        index: usize,
        /// Name pattern as written.
        pattern: String,
        /// Cause.
        #[source]
        source: PatternError,
    },
    /// The rule's expression fails to parse, check or evaluate.
    #[error("cannot evaluate CEL expression {expression:?} for filter {index}")]
    Expression {
        /// Rule index.
        index: usize,
        /// Expression source.
        expression: String,
        /// Cause.
        #[source]
        source: ExpressionError,
    },
}

impl FilterError {
    /// Index of the failing rule.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::PatternCompile { index, .. } | Self::Expression { index, .. } => *index,
        }
    }

    /// The step that failed.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::PatternCompile { .. } => Stage::PatternCompile,
            Self::Expression { source, .. } => source.stage(),
        }
    }
}

/// A rule compiled and evaluated for one request.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    index: usize,
    expression: String,
    matcher: NameMatcher,
    include: bool,
}

impl CompiledRule {
    /// Position in the rule list.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name pattern as written.
    #[must_use]
    pub fn name(&self) -> &str {
        self.matcher.pattern()
    }

    /// Expression source.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Does this rule apply to `candidate`?
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.matcher.matches(candidate)
    }

    /// What the expression evaluated to.
    #[must_use]
    pub fn include(&self) -> bool {
        self.include
    }
}

/// The first rule matching `candidate` decides it.
///
/// # INV: First-match-wins
///
/// Later rules are never consulted once one matches, even if they would
/// decide differently.
#[must_use]
pub fn decide(rules: &[CompiledRule], candidate: &str) -> DecisionReason {
    match rules.iter().find(|r| r.matches(candidate)) {
        None => DecisionReason::NoMatchingRule,
        Some(rule) if rule.include => DecisionReason::Included { index: rule.index },
        Some(rule) => DecisionReason::Excluded { index: rule.index },
    }
}

/// Surviving candidates plus the decision trace.
#[derive(Debug, Clone)]
pub struct FilterOutcome<V> {
    /// Candidates that survived.
    pub kept: BTreeMap<String, V>,
    /// How each decision was made.
    pub trace: FilterTrace,
}

/// Applies rule sets to candidate sets.
///
/// Holds the shared [`Environment`]; cloning is cheap and clones may be used
/// from many threads at once.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    env: Arc<Environment>,
}

impl FilterEngine {
    /// An engine over [`Environment::standard`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] if the environment fails to build.
    pub fn new() -> Result<Self, EnvironmentError> {
        Ok(Self::with_environment(Arc::new(Environment::standard()?)))
    }

    /// An engine over a custom environment.
    #[must_use]
    pub fn with_environment(env: Arc<Environment>) -> Self {
        Self { env }
    }

    /// The shared environment.
    #[must_use]
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Compile every pattern and type-check every expression, without
    /// evaluating anything.
    ///
    /// # Errors
    ///
    /// Returns the [`FilterError`] of the first failing rule.
    pub fn check(&self, rules: &[Rule]) -> Result<(), FilterError> {
        for (index, rule) in rules.iter().enumerate() {
            compile_matcher(index, rule)?;
            Program::compile(&self.env, &rule.expression)
                .map_err(|source| expression_error(index, rule, source))?;
        }
        Ok(())
    }

    /// Compile and evaluate every rule, in order.
    ///
    /// Each expression is evaluated exactly once, whether it matches no
    /// candidate or many.
    ///
    /// # Errors
    ///
    /// Returns the [`FilterError`] of the first failing rule; later rules are
    /// not compiled.
    pub fn compile(
        &self,
        rules: &[Rule],
        ctx: &EvaluationContext,
    ) -> Result<Vec<CompiledRule>, FilterError> {
        let activation = ctx.activation(&self.env);
        rules
            .iter()
            .enumerate()
            .map(|(index, rule)| -> Result<CompiledRule, FilterError> {
                let matcher = compile_matcher(index, rule)?;
                let include = Program::compile(&self.env, &rule.expression)
                    .and_then(|program| program.evaluate_bool(&activation))
                    .map_err(|source| expression_error(index, rule, source))?;
                Ok(CompiledRule {
                    index,
                    expression: rule.expression.clone(),
                    matcher,
                    include,
                })
            })
            .collect()
    }

    /// Keep the candidates `rules` do not remove.
    ///
    /// # Errors
    ///
    /// Returns the [`FilterError`] of the first failing rule; no candidate is
    /// filtered in that case.
    pub fn filter<V>(
        &self,
        rules: &[Rule],
        candidates: BTreeMap<String, V>,
        ctx: &EvaluationContext,
    ) -> Result<BTreeMap<String, V>, FilterError> {
        let compiled = self.compile(rules, ctx)?;
        Ok(candidates
            .into_iter()
            .filter(|(name, _)| log_decision(&compiled, name, decide(&compiled, name)).kept())
            .collect())
    }

    /// Like [`filter`](Self::filter), also recording every decision.
    ///
    /// # Errors
    ///
    /// Same as [`filter`](Self::filter).
    pub fn filter_with_trace<V>(
        &self,
        rules: &[Rule],
        candidates: BTreeMap<String, V>,
        ctx: &EvaluationContext,
    ) -> Result<FilterOutcome<V>, FilterError> {
        let compiled = self.compile(rules, ctx)?;
        let mut trace = FilterTrace {
            rules: compiled
                .iter()
                .map(|r| RuleTrace {
                    index: r.index,
                    name: r.name().to_string(),
                    expression: r.expression.clone(),
                    result: r.include,
                })
                .collect(),
            decisions: Vec::with_capacity(candidates.len()),
        };
        let mut kept = BTreeMap::new();
        for (name, value) in candidates {
            let reason = log_decision(&compiled, &name, decide(&compiled, &name));
            if reason.kept() {
                kept.insert(name.clone(), value);
            }
            trace.decisions.push(CandidateTrace { name, reason });
        }
        Ok(FilterOutcome { kept, trace })
    }
}

fn compile_matcher(index: usize, rule: &Rule) -> Result<NameMatcher, FilterError> {
    NameMatcher::compile(&rule.name).map_err(|source| FilterError::PatternCompile {
        index,
        pattern: rule.name.clone(),
        source,
    })
}

fn expression_error(index: usize, rule: &Rule, source: ExpressionError) -> FilterError {
    FilterError::Expression {
        index,
        expression: rule.expression.clone(),
        source,
    }
}

fn log_decision(rules: &[CompiledRule], resource: &str, reason: DecisionReason) -> DecisionReason {
    let Some(rule) = reason.rule().and_then(|i| rules.get(i)) else {
        tracing::debug!(
            resource,
            "Not filtering desired composed resource: no filter name matches"
        );
        return reason;
    };
    if reason.kept() {
        tracing::debug!(
            resource,
            filter_index = rule.index,
            filter_name = rule.name(),
            filter_expression = rule.expression(),
            "Not filtering desired composed resource: CEL expression evaluated to true"
        );
    } else {
        tracing::info!(
            resource,
            filter_index = rule.index,
            filter_name = rule.name(),
            filter_expression = rule.expression(),
            "Filtering desired composed resource: CEL expression evaluated to false"
        );
    }
    reason
}
