//! celfilter-test: Test domain for conformance testing
//!
//! Builders for pipeline state and candidate sets, plus an environment with
//! an evaluation counter for asserting how often expressions run.
//!
//! # Example
//!
//! ```
//! use celfilter_test::prelude::*;
//! use serde_json::json;
//!
//! let ctx = ContextBuilder::new()
//!     .composite(json!({"spec": {"watchers": 42}}))
//!     .build();
//! let set = candidates(&["matching-1", "other"]);
//!
//! let engine = FilterEngine::new().unwrap();
//! let rules = [Rule::new("matching-.*", "observed.composite.resource.spec.watchers == 42")];
//! let kept = engine.filter(&rules, set, &ctx).unwrap();
//! assert_eq!(names(&kept), ["matching-1", "other"]);
//! ```

use celfilter::prelude::*;
use celfilter::{Function, Overload, Type};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "fixtures")]
pub mod fixture;

/// Builds an [`EvaluationContext`] from JSON fragments.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    ctx: EvaluationContext,
}

impl ContextBuilder {
    /// Empty observed and desired state, empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the observed composite resource body.
    #[must_use]
    pub fn composite(mut self, resource: serde_json::Value) -> Self {
        self.ctx.observed.composite = Some(Resource::new(object(resource)));
        self
    }

    /// Add an observed composed resource.
    #[must_use]
    pub fn observed_resource(mut self, name: impl Into<String>, resource: serde_json::Value) -> Self {
        self.ctx
            .observed
            .resources
            .insert(name.into(), Resource::new(object(resource)));
        self
    }

    /// Add a desired composed resource.
    #[must_use]
    pub fn desired_resource(mut self, name: impl Into<String>, resource: serde_json::Value) -> Self {
        self.ctx
            .desired
            .resources
            .insert(name.into(), Resource::new(object(resource)));
        self
    }

    /// Set a top-level context entry.
    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.ctx.context.insert(key.into(), value);
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> EvaluationContext {
        self.ctx
    }
}

/// The fields of a JSON object; anything else is treated as empty.
#[must_use]
pub fn object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(fields) => fields,
        _ => serde_json::Map::new(),
    }
}

/// A candidate set whose values are the names' positions in `names`.
#[must_use]
pub fn candidates(names: &[&str]) -> BTreeMap<String, usize> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| ((*name).to_string(), i))
        .collect()
}

/// Names in a candidate set, in order.
#[must_use]
pub fn names<V>(set: &BTreeMap<String, V>) -> Vec<&str> {
    set.keys().map(String::as_str).collect()
}

/// Counts calls to the zero-argument function `tick()`, which returns the
/// boolean it was built with.
#[derive(Debug, Clone, Default)]
pub struct TickCounter {
    calls: Arc<AtomicUsize>,
}

impl TickCounter {
    /// A counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The standard environment plus `tick() -> bool` returning `result`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] if the environment fails to build.
    pub fn environment(&self, result: bool) -> Result<Environment, EnvironmentError> {
        let calls = Arc::clone(&self.calls);
        Environment::standard_builder()
            .function(Function::new("tick").overload(Overload::global(
                "tick",
                vec![],
                Type::Bool,
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Bool(result))
                },
            )))
            .build()
    }

    /// A [`FilterEngine`] over [`environment`](Self::environment).
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] if the environment fails to build.
    pub fn engine(&self, result: bool) -> Result<FilterEngine, EnvironmentError> {
        Ok(FilterEngine::with_environment(Arc::new(
            self.environment(result)?,
        )))
    }
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{candidates, names, object, ContextBuilder, TickCounter};
    pub use celfilter::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_builder() {
        let ctx = ContextBuilder::new()
            .composite(json!({"spec": {"watchers": 1}}))
            .observed_resource("db", json!({"kind": "Database"}))
            .desired_resource("bucket", json!({"kind": "Bucket"}))
            .context("env", json!("prod"))
            .build();
        assert!(ctx.observed.composite.is_some());
        assert_eq!(ctx.observed.resources.len(), 1);
        assert_eq!(ctx.desired.resources.len(), 1);
        assert_eq!(ctx.context["env"], json!("prod"));
    }

    #[test]
    fn candidate_helpers() {
        let set = candidates(&["b", "a"]);
        assert_eq!(names(&set), ["a", "b"]);
        assert_eq!(set["b"], 0);
    }

    #[test]
    fn object_of_non_object_is_empty() {
        assert!(object(json!([1, 2])).is_empty());
    }

    #[test]
    fn tick_counts_evaluations() {
        let counter = TickCounter::new();
        let env = counter.environment(true).unwrap();
        let program = Program::compile(&env, "tick() && tick()").unwrap();
        assert_eq!(program.evaluate_bool(&EvaluationContext::default().activation(&env)), Ok(true));
        assert_eq!(counter.calls(), 2);
    }
}
