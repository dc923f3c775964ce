//! Pipeline state: what filter expressions see
//!
//! A composition pipeline hands each function the *observed* state (what
//! exists), the *desired* state (what earlier functions asked for) and a
//! free-form *context* document. Expressions read them through three
//! variables:
//!
//! | Variable | Type |
//! |----------|------|
//! | `observed` | [`STATE_TYPE`] |
//! | `desired` | [`STATE_TYPE`] |
//! | `context` | `map(string, dyn)` |
//!
//! `State` and `Resource` are declared object types, so selecting an
//! undeclared field (`observed.composit`) fails type-checking, while the
//! contents of `resource` are free-form and checked only at evaluation.
//!
//! At runtime both objects are string-keyed maps. An absent composite is
//! left out, so `has(observed.composite)` reports it; every other field is
//! always present, holding its default when empty.

use crate::env::{Environment, ObjectDecl};
use crate::runtime::{self, json_object_to_value, Activation};
use crate::types::Type;
use cel_interpreter::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object type of `observed` and `desired`.
pub const STATE_TYPE: &str = "apiextensions.fn.proto.v1.State";

/// Object type of a composite or composed resource.
pub const RESOURCE_TYPE: &str = "apiextensions.fn.proto.v1.Resource";

/// Variable holding the observed state.
pub const OBSERVED: &str = "observed";
/// Variable holding the desired state.
pub const DESIRED: &str = "desired";
/// Variable holding the pipeline context.
pub const CONTEXT: &str = "context";

/// Readiness of a desired resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ready {
    /// Readiness is derived by the pipeline.
    #[default]
    #[serde(rename = "READY_UNSPECIFIED")]
    Unspecified,
    /// The resource is ready.
    #[serde(rename = "READY_TRUE")]
    True,
    /// The resource is not ready.
    #[serde(rename = "READY_FALSE")]
    False,
}

impl Ready {
    /// Enum number, as expressions see it.
    #[must_use]
    pub fn number(self) -> i64 {
        match self {
            Self::Unspecified => 0,
            Self::True => 1,
            Self::False => 2,
        }
    }

    fn is_unspecified(&self) -> bool {
        *self == Self::Unspecified
    }
}

/// A composite or composed resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// The resource body (`apiVersion`, `kind`, `metadata`, `spec`, …).
    #[serde(default)]
    pub resource: serde_json::Map<String, serde_json::Value>,
    /// Connection secrets, by key. Base64 in JSON, as protojson encodes
    /// `bytes`.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "base64_values"
    )]
    pub connection_details: BTreeMap<String, Vec<u8>>,
    /// Readiness override.
    #[serde(default, skip_serializing_if = "Ready::is_unspecified")]
    pub ready: Ready,
}

impl Resource {
    /// A resource with the given body.
    #[must_use]
    pub fn new(resource: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            resource,
            ..Self::default()
        }
    }

    /// This resource as an expression value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let details = self
            .connection_details
            .iter()
            .map(|(k, v)| (k.as_str(), runtime::bytes(v.clone())));
        runtime::map([
            ("resource", json_object_to_value(&self.resource)),
            ("connection_details", runtime::map(details)),
            ("ready", Value::Int(self.ready.number())),
        ])
    }
}

/// `bytes` map values in their protojson form.
mod base64_values {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub(super) fn serialize<S: Serializer>(
        values: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(values.iter().map(|(k, v)| (k, STANDARD.encode(v))))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| match STANDARD.decode(&v) {
                Ok(bytes) => Ok((k, bytes)),
                Err(e) => Err(D::Error::custom(format!(
                    "connection detail '{k}' is not base64: {e}"
                ))),
            })
            .collect()
    }
}

/// Observed or desired pipeline state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// The composite resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<Resource>,
    /// Composed resources, by name.
    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,
}

impl State {
    /// This state as an expression value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let resources = self
            .resources
            .iter()
            .map(|(name, r)| (name.as_str(), r.to_value()));
        let mut fields = vec![("resources", runtime::map(resources))];
        if let Some(composite) = &self.composite {
            fields.push(("composite", composite.to_value()));
        }
        runtime::map(fields)
    }
}

/// Everything a filter expression may read. Shared by every rule of a
/// request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// Observed state.
    #[serde(default)]
    pub observed: State,
    /// Desired state.
    #[serde(default)]
    pub desired: State,
    /// Pipeline context.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl EvaluationContext {
    /// The environment's functions, with `observed`, `desired` and
    /// `context` bound.
    #[must_use]
    pub fn activation(&self, env: &Environment) -> Activation {
        Activation::new(env)
            .with(OBSERVED, self.observed.to_value())
            .with(DESIRED, self.desired.to_value())
            .with(CONTEXT, json_object_to_value(&self.context))
    }
}

/// Object type declarations for [`STATE_TYPE`] and [`RESOURCE_TYPE`].
pub(crate) fn declarations() -> Vec<ObjectDecl> {
    vec![
        ObjectDecl::new(STATE_TYPE)
            .field_decl("composite", Type::object(RESOURCE_TYPE))
            .field_decl(
                "resources",
                Type::map(Type::String, Type::object(RESOURCE_TYPE)),
            ),
        ObjectDecl::new(RESOURCE_TYPE)
            .field_decl("resource", Type::map(Type::String, Type::Dyn))
            .field_decl(
                "connection_details",
                Type::map(Type::String, Type::Bytes),
            )
            .field_decl("ready", Type::Int),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::evaluate;
    use cel_interpreter::objects::Key;
    use serde_json::json;
    use std::sync::Arc;

    fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
        match value {
            Value::Map(m) => m.map.get(&Key::String(Arc::new(name.to_string()))),
            _ => None,
        }
    }

    fn pipeline_state() -> State {
        serde_json::from_value(json!({
            "composite": {
                "resource": {"apiVersion": "example.org/v1", "kind": "XR"},
                "connectionDetails": {"password": "aHVudGVyMg=="},
                "ready": "READY_TRUE"
            },
            "resources": {
                "bucket": {"resource": {"kind": "Bucket"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn decodes_pipeline_json() {
        let state = pipeline_state();
        let composite = state.composite.as_ref().unwrap();
        assert_eq!(composite.ready, Ready::True);
        assert_eq!(composite.connection_details["password"], b"hunter2");
        assert_eq!(state.resources["bucket"].ready, Ready::Unspecified);
    }

    #[test]
    fn connection_details_must_be_base64() {
        let err = serde_json::from_value::<Resource>(json!({
            "connectionDetails": {"password": "not base64!"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("password"), "{err}");
    }

    #[test]
    fn connection_details_are_bytes_in_expressions() {
        let env = Environment::standard().unwrap();
        let ctx = EvaluationContext {
            observed: pipeline_state(),
            ..EvaluationContext::default()
        };
        assert_eq!(
            evaluate(
                &env,
                "observed.composite.connection_details.password == b'hunter2'",
                &ctx
            ),
            Ok(true)
        );
        assert_eq!(
            evaluate(
                &env,
                "base64.encode(observed.composite.connection_details.password) == 'aHVudGVyMg=='",
                &ctx
            ),
            Ok(true)
        );
    }

    #[test]
    fn empty_state_shape() {
        let value = State::default().to_value();
        assert!(field(&value, "composite").is_none());
        assert_eq!(field(&value, "resources"), Some(&runtime::map::<&str>([])));

        let r = Resource::new(serde_json::Map::new()).to_value();
        assert_eq!(field(&r, "ready"), Some(&Value::Int(0)));
        assert_eq!(field(&r, "connection_details"), Some(&runtime::map::<&str>([])));
    }

    #[test]
    fn resource_value_shape() {
        let mut resource = Resource::new(
            json!({"kind": "Bucket"}).as_object().cloned().unwrap(),
        );
        resource.ready = Ready::False;
        resource
            .connection_details
            .insert("user".into(), b"admin".to_vec());
        let value = resource.to_value();
        assert_eq!(field(&value, "ready"), Some(&Value::Int(2)));
        let details = field(&value, "connection_details").unwrap();
        assert_eq!(
            field(details, "user"),
            Some(&runtime::bytes(b"admin".to_vec()))
        );
    }

    #[test]
    fn serializes_as_protojson() {
        let mut r = Resource::default();
        r.ready = Ready::True;
        r.connection_details.insert("user".into(), b"admin".to_vec());
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({
                "resource": {},
                "connectionDetails": {"user": "YWRtaW4="},
                "ready": "READY_TRUE"
            })
        );
    }

    #[test]
    fn activation_binds_three_variables() {
        let env = Environment::standard().unwrap();
        let ctx = EvaluationContext {
            context: json!({"env": "prod"}).as_object().cloned().unwrap(),
            ..EvaluationContext::default()
        };
        let activation = ctx.activation(&env);
        let bound: Vec<&str> = activation.variables().collect();
        assert_eq!(bound, [OBSERVED, DESIRED, CONTEXT]);
    }
}
