//! celfilter - Filter desired composed resources with CEL expressions
//!
//! A composition pipeline step that removes desired composed resources.
//! Each [`Rule`] pairs a name pattern with a boolean expression over the
//! pipeline state; the first rule whose pattern matches a resource's name
//! decides whether the resource stays.
//!
//! # Architecture
//!
//! Leaf-first:
//!
//! - [`Environment`]: Variables, object types and functions expressions may
//!   use. Built and validated once, shared by `Arc`.
//! - [`NameMatcher`]: Anchored full-name regular expression.
//! - [`Program`]: Parse, type-check, assert `bool`, evaluate.
//! - [`FilterEngine`]: Compiles a rule list once per request, then applies
//!   it to every candidate with first-match-wins semantics.
//! - [`FilterFunction`]: Request/response envelope around the engine.
//!
//! # Key Design Insights
//!
//! 1. **Expressions see state, not candidates**: every rule is evaluated once
//!    per request against the same [`EvaluationContext`], so one result
//!    decides every candidate the rule matches.
//!
//! 2. **Fail-fast**: the first rule that fails to compile or evaluate fails
//!    the whole request. Nothing is silently kept or dropped.
//!
//! 3. **Exactly `bool`**: an expression whose checked type is `dyn` is
//!    rejected before evaluation, even if it would produce a boolean.
//!
//! # Example
//!
//! ```
//! use celfilter::prelude::*;
//! use std::collections::BTreeMap;
//!
//! let engine = FilterEngine::new().unwrap();
//! let rules = [
//!     Rule::new("watcher-.*", "observed.composite.resource.spec.watchers > 10"),
//! ];
//!
//! let mut composite = serde_json::Map::new();
//! composite.insert("spec".into(), serde_json::json!({"watchers": 3}));
//! let mut ctx = EvaluationContext::default();
//! ctx.observed.composite = Some(Resource::new(composite));
//!
//! let candidates = BTreeMap::from([
//!     ("watcher-1".to_string(), ()),
//!     ("api".to_string(), ()),
//! ]);
//! let kept = engine.filter(&rules, candidates, &ctx).unwrap();
//! assert_eq!(kept.into_keys().collect::<Vec<_>>(), ["api"]);
//! ```

// ═══════════════════════════════════════════════════════════════════════════════
// Modules
// ═══════════════════════════════════════════════════════════════════════════════

mod checker;
mod config;
mod env;
mod filter;
mod function;
mod functions;
mod name_matcher;
mod program;
mod runtime;
mod state;
mod trace;
mod types;

// ═══════════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════════

// Expression language
pub use cel_interpreter::Value;
pub use checker::{check, TypeError};
pub use functions::{operators, EvalError, Function, FunctionImpl, Library, Overload, Zone};
pub use runtime::{
    format_duration, json_object_to_value, json_to_value, type_name, value_to_json, Activation,
};
pub use types::Type;

// Environment
pub use env::{Environment, EnvironmentBuilder, EnvironmentError, ObjectDecl};

// Evaluation
pub use program::{evaluate, ExpressionError, ParseError, Program};

// Filtering
pub use filter::{decide, CompiledRule, FilterEngine, FilterError, FilterOutcome, Rule, Stage};
pub use name_matcher::{anchor, NameMatcher, PatternError};
pub use state::{
    EvaluationContext, Ready, Resource, State, CONTEXT, DESIRED, OBSERVED, RESOURCE_TYPE,
    STATE_TYPE,
};

// Trace types
pub use trace::{CandidateTrace, DecisionReason, FilterTrace, RuleTrace};

// Input and envelope
pub use config::{ConfigError, Filters, API_VERSION, KIND};
pub use function::{
    error_chain, FilterFunction, FunctionError, FunctionResult, RequestMeta, ResponseMeta,
    RunFunctionRequest, RunFunctionResponse, Severity, DEFAULT_TTL,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════════════════════════════════════════

/// Prelude module for convenient imports.
///
/// ```
/// use celfilter::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Envelope
        FilterFunction,
        RunFunctionRequest,
        RunFunctionResponse,
        // Environment
        Environment,
        EnvironmentError,
        // Filtering
        EvaluationContext,
        FilterEngine,
        FilterError,
        Filters,
        Resource,
        Rule,
        Stage,
        State,
        // Evaluation
        ExpressionError,
        Program,
        Value,
        // Trace types
        DecisionReason,
        FilterTrace,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum length for regex patterns, both rule names and `matches()`
/// arguments.
///
/// Compilation is linear in pattern size with the `regex` crate, but large
/// patterns still cost memory and time on every request.
pub const MAX_REGEX_PATTERN_LENGTH: usize = 4096;

/// Maximum length of an expression's source text, in bytes.
pub const MAX_EXPRESSION_LENGTH: usize = 16_384;

/// Maximum nesting depth of an expression.
///
/// The parser, checker and interpreter recurse on the syntax tree; this
/// bounds their stack use.
pub const MAX_EXPRESSION_DEPTH: usize = 128;

/// Largest list `lists.range()` may build.
pub const MAX_LIST_RANGE: i64 = 100_000;

/// Maximum number of rules in one [`Filters`] document.
///
/// Every rule is compiled and evaluated on every request, whether or not it
/// matches anything.
pub const MAX_RULES: usize = 256;
