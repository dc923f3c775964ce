//! The `Filters` input document.
//!
//! Rules reach the engine as a KRM-style document, embedded as the function
//! input of a composition pipeline step:
//!
//! ```yaml
//! apiVersion: cel.fn.crossplane.io/v1beta1
//! kind: Filters
//! filters:
//!   - name: redis-.*
//!     expression: observed.composite.resource.spec.cache == true
//! ```
//!
//! Only the first matching filter applies to a resource. `apiVersion`,
//! `kind` and `metadata` are carried through but not interpreted.

use crate::filter::Rule;
use crate::MAX_RULES;
use serde::{Deserialize, Serialize};

/// API version of the input document.
pub const API_VERSION: &str = "cel.fn.crossplane.io/v1beta1";

/// Kind of the input document.
pub const KIND: &str = "Filters";

/// Errors decoding or validating a [`Filters`] document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid JSON for this shape.
    #[error("invalid JSON input")]
    Json(#[from] serde_json::Error),
    /// The document is not valid YAML for this shape.
    #[error("invalid YAML input")]
    Yaml(#[from] serde_yaml::Error),
    /// More rules than the engine accepts.
    #[error("input declares {count} filters, but maximum allowed is {max}")]
    TooManyRules {
        /// Declared rules.
        count: usize,
        /// The limit.
        max: usize,
    },
}

/// Function input: an ordered list of filter rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    /// `cel.fn.crossplane.io/v1beta1`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// `Filters`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Object metadata, uninterpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Rules, in priority order.
    #[serde(default)]
    pub filters: Vec<Rule>,
}

impl Filters {
    /// A document holding `filters`.
    #[must_use]
    pub fn new(filters: Vec<Rule>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: None,
            filters,
        }
    }

    /// Decode and validate a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the value has the wrong shape or too many
    /// rules.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let filters: Self = serde_json::from_value(value)?;
        filters.validate()?;
        Ok(filters)
    }

    /// Decode and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document is malformed or has too many
    /// rules.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let filters: Self = serde_json::from_str(json)?;
        filters.validate()?;
        Ok(filters)
    }

    /// Decode and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document is malformed or has too many
    /// rules.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let filters: Self = serde_yaml::from_str(yaml)?;
        filters.validate()?;
        Ok(filters)
    }

    /// Check limits the engine imposes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TooManyRules`] past [`MAX_RULES`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filters.len() > MAX_RULES {
            return Err(ConfigError::TooManyRules {
                count: self.filters.len(),
                max: MAX_RULES,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_yaml() {
        let filters = Filters::from_yaml(
            r"
apiVersion: cel.fn.crossplane.io/v1beta1
kind: Filters
metadata:
  name: example
filters:
  - name: redis-.*
    expression: observed.composite.resource.spec.cache == true
  - name: bucket
    expression: 'false'
",
        )
        .unwrap();
        assert_eq!(filters.api_version, API_VERSION);
        assert_eq!(filters.kind, KIND);
        assert!(filters.metadata.is_some());
        assert_eq!(
            filters.filters,
            vec![
                Rule::new("redis-.*", "observed.composite.resource.spec.cache == true"),
                Rule::new("bucket", "false"),
            ]
        );
    }

    #[test]
    fn decode_json() {
        let filters = Filters::from_json(
            r#"{"apiVersion": "cel.fn.crossplane.io/v1beta1", "kind": "Filters",
                "filters": [{"name": "a", "expression": "true"}]}"#,
        )
        .unwrap();
        assert_eq!(filters.filters, vec![Rule::new("a", "true")]);
    }

    #[test]
    fn missing_filters_is_empty() {
        let filters = Filters::from_json(r#"{"kind": "Filters"}"#).unwrap();
        assert!(filters.filters.is_empty());
    }

    #[test]
    fn rejects_wrong_shape() {
        let err = Filters::from_json(r#"{"filters": [{"name": "a"}]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
        let err = Filters::from_yaml("filters: 3").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn rejects_too_many_rules() {
        let rules = vec![Rule::new("a", "true"); MAX_RULES + 1];
        let err = Filters::new(rules).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TooManyRules { count, max } if count == MAX_RULES + 1 && max == MAX_RULES
        ));
    }

    #[test]
    fn new_round_trips() {
        let doc = Filters::new(vec![Rule::new("x", "true")]);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["apiVersion"], API_VERSION);
        assert_eq!(Filters::from_value(json).unwrap(), doc);
    }
}
