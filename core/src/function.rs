//! Function envelope: one pipeline step, request in, response out
//!
//! [`FilterFunction::run`] takes a [`RunFunctionRequest`] (pipeline state
//! plus a [`Filters`] input document), filters the desired composed
//! resources, and returns a [`RunFunctionResponse`].
//!
//! Errors never escape as `Err`: a request that cannot be served yields a
//! response carrying one `Fatal` result, with the desired state passed
//! through untouched.
//!
//! Request and response use the pipeline's JSON encoding (camelCase field
//! names, enum names as strings, durations as `"60s"`).

use crate::config::{ConfigError, Filters};
use crate::env::EnvironmentError;
use crate::filter::{FilterEngine, FilterError};
use crate::state::{EvaluationContext, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::time::Duration;

/// How long the pipeline may cache a response.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Request metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Opaque tag echoed in the response.
    #[serde(default)]
    pub tag: String,
}

/// A pipeline step invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFunctionRequest {
    /// Metadata.
    #[serde(default)]
    pub meta: RequestMeta,
    /// Observed state.
    #[serde(default)]
    pub observed: State,
    /// Desired state accumulated by earlier steps.
    #[serde(default)]
    pub desired: State,
    /// Pipeline context.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// The step's input document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

impl RunFunctionRequest {
    /// The state expressions are evaluated against.
    #[must_use]
    pub fn evaluation_context(&self) -> EvaluationContext {
        EvaluationContext {
            observed: self.observed.clone(),
            desired: self.desired.clone(),
            context: self.context.clone(),
        }
    }
}

/// Response metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Tag from the request.
    #[serde(default)]
    pub tag: String,
    /// Cache lifetime, e.g. `"60s"`.
    pub ttl: String,
}

/// Severity of a [`FunctionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// The pipeline must stop.
    #[serde(rename = "SEVERITY_FATAL")]
    Fatal,
    /// Worth surfacing; the pipeline continues.
    #[serde(rename = "SEVERITY_WARNING")]
    Warning,
    /// Informational.
    #[serde(rename = "SEVERITY_NORMAL")]
    Normal,
}

/// A message for the pipeline's caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionResult {
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
}

/// Result of one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFunctionResponse {
    /// Metadata.
    pub meta: ResponseMeta,
    /// Desired state after this step.
    #[serde(default)]
    pub desired: State,
    /// Pipeline context, passed through.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Results for the caller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<FunctionResult>,
}

impl RunFunctionResponse {
    /// A response passing the request's desired state and context through.
    #[must_use]
    pub fn to(req: &RunFunctionRequest, ttl: Duration) -> Self {
        Self {
            meta: ResponseMeta {
                tag: req.meta.tag.clone(),
                ttl: format!("{}s", ttl.as_secs()),
            },
            desired: req.desired.clone(),
            context: req.context.clone(),
            results: Vec::new(),
        }
    }

    /// Append a fatal result whose message is `err` and its causes.
    pub fn fatal(&mut self, err: &(dyn StdError + 'static)) {
        self.results.push(FunctionResult {
            severity: Severity::Fatal,
            message: error_chain(err),
        });
    }

    /// Does the response carry a fatal result?
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.results.iter().any(|r| r.severity == Severity::Fatal)
    }
}

/// Why a request could not be served.
#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    /// The input is not a valid [`Filters`] document.
    #[error("cannot get filters from RunFunctionRequest")]
    Input(#[source] ConfigError),
    /// A rule failed.
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Render an error and its sources as `outer: inner: root`.
#[must_use]
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// The filter pipeline step.
#[derive(Debug, Clone)]
pub struct FilterFunction {
    engine: FilterEngine,
}

impl FilterFunction {
    /// A function over the standard environment.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] if the environment fails to build.
    pub fn new() -> Result<Self, EnvironmentError> {
        Ok(Self::with_engine(FilterEngine::new()?))
    }

    /// A function over a given engine.
    #[must_use]
    pub fn with_engine(engine: FilterEngine) -> Self {
        Self { engine }
    }

    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &FilterEngine {
        &self.engine
    }

    /// Filter the request's desired composed resources.
    #[must_use]
    pub fn run(&self, req: &RunFunctionRequest) -> RunFunctionResponse {
        tracing::info!(tag = %req.meta.tag, "Running function");
        let mut rsp = RunFunctionResponse::to(req, DEFAULT_TTL);
        let resources = std::mem::take(&mut rsp.desired.resources);
        match self.filter(req, resources) {
            Ok(kept) => rsp.desired.resources = kept,
            Err(err) => {
                tracing::warn!(error = %error_chain(&err), "Cannot filter desired composed resources");
                rsp.desired.resources = req.desired.resources.clone();
                rsp.fatal(&err);
            }
        }
        rsp
    }

    fn filter<V>(
        &self,
        req: &RunFunctionRequest,
        resources: BTreeMap<String, V>,
    ) -> Result<BTreeMap<String, V>, FunctionError> {
        let filters = match &req.input {
            Some(input) => Filters::from_value(input.clone()).map_err(FunctionError::Input)?,
            None => Filters::new(Vec::new()),
        };
        Ok(self
            .engine
            .filter(&filters.filters, resources, &req.evaluation_context())?)
    }
}
