//! Runtime: bridge to the `cel-interpreter` evaluator
//!
//! Expressions are executed by `cel_interpreter`. This module owns
//! everything that touches its runtime API:
//!
//! - [`Activation`]: a `cel_interpreter::Context` with the environment's
//!   native functions registered and the request's variables bound.
//! - Conversions between JSON documents and runtime [`Value`]s.
//! - [`NativeFunction`]: dispatch from one interpreter function name to the
//!   declared overloads that share it.
//!
//! # Namespaces
//!
//! The interpreter calls `math.greatest(a, b)` as the function `greatest`
//! with receiver `math`. Each namespace is therefore bound as a variable
//! holding its own name, and a namespaced overload is chosen when the
//! receiver is that marker and the argument count fits. The checker has
//! already rejected every call that is not declared.
//!
//! # Numbers
//!
//! Free-form documents (`context`, resource bodies) are protobuf `Struct`s
//! upstream, where every number is a double. JSON numbers therefore always
//! become [`Value::Float`], integral or not.

use crate::env::Environment;
use crate::functions::{EvalError, Overload};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cel_interpreter::extractors::Arguments;
use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{Context, ExecutionError, FunctionContext, Value};
use chrono::{SecondsFormat, TimeDelta};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════════
// Activation
// ═══════════════════════════════════════════════════════════════════════════════

/// Functions and variable bindings for evaluating programs.
///
/// Build one per request and evaluate every rule against it.
pub struct Activation {
    context: Context<'static>,
    variables: Vec<String>,
}

impl Activation {
    /// The environment's functions and namespaces, with no variables bound.
    #[must_use]
    pub fn new(env: &Environment) -> Self {
        let mut context = Context::default();
        for function in env.natives() {
            register(&mut context, Arc::clone(function));
        }
        for namespace in env.namespaces() {
            context.add_variable_from_value(namespace, string(namespace));
        }
        Self {
            context,
            variables: Vec::new(),
        }
    }

    /// Bind a variable (builder pattern).
    #[must_use]
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    /// Bind a variable, replacing any earlier binding.
    pub fn bind(&mut self, name: &str, value: Value) {
        self.context.add_variable_from_value(name, value);
        if !self.variables.iter().any(|v| v == name) {
            self.variables.push(name.to_string());
        }
    }

    /// Names of the bound variables, in binding order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(String::as_str)
    }

    pub(crate) fn context(&self) -> &Context<'static> {
        &self.context
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Native functions
// ═══════════════════════════════════════════════════════════════════════════════

/// Declared overloads the interpreter reaches through one function name.
#[derive(Debug, Clone, Default)]
pub(crate) struct NativeFunction {
    name: String,
    plain: Vec<Overload>,
    namespaced: Vec<(String, Overload)>,
}

impl NativeFunction {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Name the interpreter calls.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn add(&mut self, namespace: Option<&str>, overload: Overload) {
        match namespace {
            Some(ns) => self.namespaced.push((ns.to_string(), overload)),
            None => self.plain.push(overload),
        }
    }

    /// Invoke the overload matching the receiver and arguments.
    pub(crate) fn call(&self, this: Option<Value>, args: &[Value]) -> Result<Value, EvalError> {
        if let Some(Value::String(receiver)) = &this {
            let namespaced = self
                .namespaced
                .iter()
                .filter(|(ns, _)| ns == receiver.as_str())
                .find(|(_, o)| o.fits(false, args.len()) && o.accepts(args));
            if let Some((ns, overload)) = namespaced {
                return overload.invoke(&format!("{ns}.{}", self.name), args);
            }
        }

        let receiver_style = this.is_some();
        let mut all = Vec::with_capacity(args.len() + 1);
        all.extend(this);
        all.extend_from_slice(args);
        self.plain
            .iter()
            .find(|o| o.fits(receiver_style, all.len()) && o.accepts(&all))
            .map_or_else(
                || Err(EvalError::no_overload(&self.name, &all)),
                |o| o.invoke(&self.name, &all),
            )
    }
}

fn register(context: &mut Context<'static>, function: Arc<NativeFunction>) {
    let name = function.name().to_string();
    context.add_function(
        name.as_str(),
        move |ftx: &FunctionContext, Arguments(args): Arguments| -> Result<Value, ExecutionError> {
            function
                .call(ftx.this.clone(), &args)
                .map_err(|e| ftx.error(e.to_string()))
        },
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Values
// ═══════════════════════════════════════════════════════════════════════════════

/// A string value.
pub fn string(s: impl Into<String>) -> Value {
    Value::String(Arc::new(s.into()))
}

/// A list value.
#[must_use]
pub fn list(items: Vec<Value>) -> Value {
    Value::List(Arc::new(items))
}

/// A bytes value.
#[must_use]
pub fn bytes(b: Vec<u8>) -> Value {
    Value::Bytes(Arc::new(b))
}

/// A string-keyed map value.
pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
    let entries: HashMap<Key, Value> = entries
        .into_iter()
        .map(|(k, v)| (Key::String(Arc::new(k.into())), v))
        .collect();
    Value::Map(Map {
        map: Arc::new(entries),
    })
}

/// CEL name of a value's runtime type.
#[must_use]
pub fn type_name(value: &Value) -> &'static str {
    #[allow(unreachable_patterns)]
    match value {
        Value::Null => "null_type",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::UInt(_) => "uint",
        Value::Float(_) => "double",
        Value::String(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        Value::Timestamp(_) => "google.protobuf.Timestamp",
        Value::Duration(_) => "google.protobuf.Duration",
        _ => "function",
    }
}

/// A JSON document as a runtime value.
#[must_use]
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => string(s.as_str()),
        serde_json::Value::Array(items) => list(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(fields) => json_object_to_value(fields),
    }
}

/// A JSON object as a string-keyed map value.
#[must_use]
pub fn json_object_to_value(fields: &serde_json::Map<String, serde_json::Value>) -> Value {
    map(fields.iter().map(|(k, v)| (k.as_str(), json_to_value(v))))
}

/// A runtime value as JSON, the way protojson renders it: bytes in base64,
/// timestamps in RFC 3339, durations as seconds with an `s` suffix.
#[must_use]
pub fn value_to_json(value: &Value) -> serde_json::Value {
    #[allow(unreachable_patterns)]
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::UInt(u) => serde_json::Value::from(*u),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => serde_json::Value::String(s.as_str().to_owned()),
        Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b.as_slice())),
        Value::List(items) => items.iter().map(value_to_json).collect(),
        Value::Map(m) => {
            let mut entries: Vec<(String, serde_json::Value)> = m
                .map
                .iter()
                .map(|(k, v)| (key_to_string(k), value_to_json(v)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(entries.into_iter().collect())
        }
        Value::Timestamp(t) => {
            serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        Value::Duration(d) => serde_json::Value::String(format_duration(*d)),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

fn key_to_string(key: &Key) -> String {
    #[allow(unreachable_patterns)]
    match key {
        Key::String(s) => s.as_str().to_owned(),
        Key::Int(i) => i.to_string(),
        Key::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

/// `1.5s`, `-0.25s`, `3600s`
#[must_use]
pub fn format_duration(d: TimeDelta) -> String {
    let sign = if d < TimeDelta::zero() { "-" } else { "" };
    let abs = d.abs();
    let (secs, nanos) = (abs.num_seconds(), abs.subsec_nanos());
    if nanos == 0 {
        return format!("{sign}{secs}s");
    }
    let fraction = format!("{nanos:09}");
    format!("{sign}{secs}.{}s", fraction.trim_end_matches('0'))
}
