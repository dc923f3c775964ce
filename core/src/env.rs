//! Environment: the typed declarations expressions are checked against
//!
//! An [`Environment`] declares variables, object types, and functions. It is
//! built once through [`EnvironmentBuilder`], validated eagerly, and is
//! immutable afterwards: share it behind an `Arc` across requests.
//!
//! [`Environment::standard`] is the filter environment: `observed` and
//! `desired` as pipeline state objects, `context` as a free-form document,
//! and every extension library.
//!
//! ```
//! use celfilter::{Environment, Type};
//!
//! let env = Environment::standard().unwrap();
//! assert_eq!(env.variable("context"), Some(&Type::map(Type::String, Type::Dyn)));
//! ```

use crate::functions::{self, Function, Library, LibraryOptions, Zone, MACROS};
use crate::runtime::NativeFunction;
use crate::state;
use crate::types::Type;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Invalid environment declarations. Fatal at engine construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    /// Two variables share a name.
    #[error("variable '{name}' is declared more than once")]
    DuplicateVariable {
        /// Variable name.
        name: String,
    },
    /// Two object types share a name.
    #[error("object type '{name}' is declared more than once")]
    DuplicateObject {
        /// Object type name.
        name: String,
    },
    /// Two overloads of one function share an id.
    #[error("overload '{overload}' of function '{function}' is declared more than once")]
    DuplicateOverload {
        /// Function name.
        function: String,
        /// Overload id.
        overload: String,
    },
    /// A function was declared without overloads.
    #[error("function '{function}' declares no overloads")]
    EmptyFunction {
        /// Function name.
        function: String,
    },
    /// A declaration references an object type that is not declared.
    #[error("{declaration} references undeclared object type '{type_name}'")]
    UnknownObjectType {
        /// The referencing declaration, e.g. `variable 'observed'`.
        declaration: String,
        /// The missing type.
        type_name: String,
    },
    /// A variable shares its name with a function namespace.
    #[error("variable '{name}' shadows the function namespace '{name}.'")]
    NamespaceCollision {
        /// Variable name.
        name: String,
    },
    /// A function name with more than one namespace segment.
    #[error("function '{function}' is nested more than one namespace deep")]
    NestedNamespace {
        /// Function name.
        function: String,
    },
    /// A function that would replace a macro or an operator the evaluator
    /// implements itself.
    #[error("function '{function}' cannot override a built-in macro or operator")]
    BuiltinOverride {
        /// Function name.
        function: String,
    },
}

/// A declared object type: a name and typed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDecl {
    name: String,
    fields: BTreeMap<String, Type>,
}

impl ObjectDecl {
    /// An object type with no fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Declare a field (builder pattern).
    #[must_use]
    pub fn field_decl(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }

    /// Fully qualified type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type of a field, if declared.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Type> {
        self.fields.get(name)
    }

    /// All declared fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Type)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A validated, immutable set of declarations.
#[derive(Debug)]
pub struct Environment {
    variables: BTreeMap<String, Type>,
    objects: BTreeMap<String, ObjectDecl>,
    functions: HashMap<String, Function>,
    natives: Vec<Arc<NativeFunction>>,
    namespaces: BTreeSet<String>,
    libraries: BTreeSet<Library>,
    extended_validations: bool,
    time_zone: Zone,
}

impl Environment {
    /// Start building an environment. Only the standard library is enabled.
    #[must_use]
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// A builder preloaded with the filter declarations.
    ///
    /// Use this to extend the filter environment, e.g. with custom functions.
    #[must_use]
    pub fn standard_builder() -> EnvironmentBuilder {
        let mut builder = Self::builder()
            .libraries(Library::ALL)
            .cross_type_numeric_comparisons(true)
            .extended_validations(true);
        for decl in state::declarations() {
            builder = builder.object(decl);
        }
        builder
            .variable(state::OBSERVED, Type::object(state::STATE_TYPE))
            .variable(state::DESIRED, Type::object(state::STATE_TYPE))
            .variable(state::CONTEXT, Type::map(Type::String, Type::Dyn))
    }

    /// The filter environment.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] if the declarations are inconsistent.
    pub fn standard() -> Result<Self, EnvironmentError> {
        Self::standard_builder().build()
    }

    /// Type of a declared variable.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Type> {
        self.variables.get(name)
    }

    /// Declared variables, by name.
    pub fn variables(&self) -> impl Iterator<Item = (&str, &Type)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// A declared object type.
    #[must_use]
    pub fn object(&self, name: &str) -> Option<&ObjectDecl> {
        self.objects.get(name)
    }

    /// A declared function.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Enabled extension libraries.
    #[must_use]
    pub fn libraries(&self) -> &BTreeSet<Library> {
        &self.libraries
    }

    /// Are literal regexes, timestamps and durations validated while checking?
    #[must_use]
    pub fn extended_validations(&self) -> bool {
        self.extended_validations
    }

    /// Default time zone of timestamp accessors.
    #[must_use]
    pub fn time_zone(&self) -> Zone {
        self.time_zone
    }

    /// Function namespaces (`math`, `strings`, …).
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(String::as_str)
    }

    /// Natively implemented functions, keyed by the name the evaluator calls.
    pub(crate) fn natives(&self) -> impl Iterator<Item = &Arc<NativeFunction>> {
        self.natives.iter()
    }
}

/// Builder for [`Environment`].
#[derive(Debug)]
pub struct EnvironmentBuilder {
    variables: Vec<(String, Type)>,
    objects: Vec<ObjectDecl>,
    functions: Vec<Function>,
    libraries: BTreeSet<Library>,
    cross_type_numeric_comparisons: bool,
    extended_validations: bool,
    time_zone: Zone,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self {
            variables: Vec::new(),
            objects: Vec::new(),
            functions: Vec::new(),
            libraries: BTreeSet::new(),
            cross_type_numeric_comparisons: false,
            extended_validations: false,
            time_zone: Zone::UTC,
        }
    }
}

impl EnvironmentBuilder {
    /// Declare a variable.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.variables.push((name.into(), ty));
        self
    }

    /// Declare an object type.
    #[must_use]
    pub fn object(mut self, decl: ObjectDecl) -> Self {
        self.objects.push(decl);
        self
    }

    /// Declare a custom function. Overloads of a name already declared by a
    /// library are added to it.
    #[must_use]
    pub fn function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    /// Enable an extension library.
    #[must_use]
    pub fn library(mut self, library: Library) -> Self {
        self.libraries.insert(library);
        self
    }

    /// Enable several extension libraries.
    #[must_use]
    pub fn libraries(mut self, libraries: impl IntoIterator<Item = Library>) -> Self {
        self.libraries.extend(libraries);
        self
    }

    /// Allow ordering comparisons between `int`, `uint` and `double`.
    #[must_use]
    pub fn cross_type_numeric_comparisons(mut self, enabled: bool) -> Self {
        self.cross_type_numeric_comparisons = enabled;
        self
    }

    /// Validate literal regexes, timestamps and durations while checking.
    #[must_use]
    pub fn extended_validations(mut self, enabled: bool) -> Self {
        self.extended_validations = enabled;
        self
    }

    /// Default time zone of timestamp accessors (UTC unless set).
    #[must_use]
    pub fn time_zone(mut self, zone: Zone) -> Self {
        self.time_zone = zone;
        self
    }

    /// Validate every declaration and build the environment.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] on duplicate declarations, references to
    /// undeclared object types, empty custom functions, variables that
    /// collide with a function namespace, and functions that are nested
    /// namespaces deep or override a macro or operator.
    pub fn build(self) -> Result<Environment, EnvironmentError> {
        let mut objects = BTreeMap::new();
        for decl in self.objects {
            if objects.contains_key(&decl.name) {
                return Err(EnvironmentError::DuplicateObject { name: decl.name });
            }
            objects.insert(decl.name.clone(), decl);
        }
        for decl in objects.values() {
            for (field, ty) in &decl.fields {
                resolve_objects(&objects, ty, || format!("field '{}.{field}'", decl.name))?;
            }
        }

        let mut variables = BTreeMap::new();
        for (name, ty) in self.variables {
            resolve_objects(&objects, &ty, || format!("variable '{name}'"))?;
            if variables.contains_key(&name) {
                return Err(EnvironmentError::DuplicateVariable { name });
            }
            variables.insert(name, ty);
        }

        let options = LibraryOptions {
            cross_type_numeric_comparisons: self.cross_type_numeric_comparisons,
            time_zone: self.time_zone,
        };
        let mut declared = functions::standard(options);
        for library in &self.libraries {
            declared.extend(functions::library(*library));
        }
        for custom in &self.functions {
            if custom.overloads().is_empty() {
                return Err(EnvironmentError::EmptyFunction {
                    function: custom.name().to_string(),
                });
            }
        }
        declared.extend(self.functions);

        let mut functions: HashMap<String, Function> = HashMap::new();
        for function in declared {
            match functions.get_mut(function.name()) {
                Some(existing) => existing.extend(function),
                None => {
                    functions.insert(function.name().to_string(), function);
                }
            }
        }
        for function in functions.values() {
            let mut ids = HashSet::new();
            for overload in function.overloads() {
                if !ids.insert(overload.id()) {
                    return Err(EnvironmentError::DuplicateOverload {
                        function: function.name().to_string(),
                        overload: overload.id().to_string(),
                    });
                }
                for ty in overload.params().iter().chain([overload.result()]) {
                    resolve_objects(&objects, ty, || format!("overload '{}'", overload.id()))?;
                }
            }
        }

        for name in variables.keys() {
            let prefix = format!("{name}.");
            if functions.keys().any(|f| f.starts_with(&prefix)) {
                return Err(EnvironmentError::NamespaceCollision { name: name.clone() });
            }
        }

        let (natives, namespaces) = natives(&functions)?;

        Ok(Environment {
            variables,
            objects,
            functions,
            natives,
            namespaces,
            libraries: self.libraries,
            extended_validations: self.extended_validations,
            time_zone: self.time_zone,
        })
    }
}

/// Group native overloads by the short name the evaluator calls, and collect
/// the namespaces they live in.
fn natives(
    functions: &HashMap<String, Function>,
) -> Result<(Vec<Arc<NativeFunction>>, BTreeSet<String>), EnvironmentError> {
    let mut natives: BTreeMap<&str, NativeFunction> = BTreeMap::new();
    let mut namespaces = BTreeSet::new();
    let mut operators = HashSet::new();

    for function in functions.values() {
        let name = function.name();
        let native = function.overloads().iter().filter(|o| o.is_native()).count();
        if native == 0 {
            operators.insert(name);
            continue;
        }
        let override_err = || EnvironmentError::BuiltinOverride {
            function: name.to_string(),
        };
        if native != function.overloads().len() {
            return Err(override_err());
        }
        let (namespace, short) = match name.split_once('.') {
            Some((_, rest)) if rest.contains('.') => {
                return Err(EnvironmentError::NestedNamespace {
                    function: name.to_string(),
                })
            }
            Some((ns, short)) => (Some(ns), short),
            None => (None, name),
        };
        if MACROS.contains(&short) {
            return Err(override_err());
        }
        if let Some(ns) = namespace {
            namespaces.insert(ns.to_string());
        }
        let entry = natives
            .entry(short)
            .or_insert_with(|| NativeFunction::new(short));
        for overload in function.overloads() {
            entry.add(namespace, overload.clone());
        }
    }

    if let Some(clash) = natives.keys().find(|short| operators.contains(*short)) {
        return Err(EnvironmentError::BuiltinOverride {
            function: (*clash).to_string(),
        });
    }
    Ok((natives.into_values().map(Arc::new).collect(), namespaces))
}

/// Every object type `ty` mentions must be declared.
fn resolve_objects(
    objects: &BTreeMap<String, ObjectDecl>,
    ty: &Type,
    declaration: impl Fn() -> String,
) -> Result<(), EnvironmentError> {
    let mut missing = None;
    ty.for_each_object(&mut |name| {
        if missing.is_none() && !objects.contains_key(name) {
            missing = Some(name.to_string());
        }
    });
    match missing {
        Some(type_name) => Err(EnvironmentError::UnknownObjectType {
            declaration: declaration(),
            type_name,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::Overload;
    use cel_interpreter::Value;

    #[test]
    fn standard_declares_filter_variables() {
        let env = Environment::standard().unwrap();
        assert_eq!(env.variable("observed"), Some(&Type::object(state::STATE_TYPE)));
        assert_eq!(env.variable("desired"), Some(&Type::object(state::STATE_TYPE)));
        assert_eq!(env.variables().count(), 3);
        assert_eq!(env.libraries().len(), Library::ALL.len());
        assert!(env.function("math.greatest").is_some());
        assert!(env.function("size").is_some());
        assert!(env.extended_validations());
    }

    #[test]
    fn builder_without_libraries_has_only_standard_functions() {
        let env = Environment::builder().build().unwrap();
        assert!(env.function("size").is_some());
        assert!(env.function("math.greatest").is_none());
        assert!(env.function("charAt").is_none());
    }

    #[test]
    fn rejects_duplicate_variable() {
        let err = Environment::builder()
            .variable("x", Type::Int)
            .variable("x", Type::String)
            .build()
            .unwrap_err();
        assert_eq!(err, EnvironmentError::DuplicateVariable { name: "x".into() });
    }

    #[test]
    fn rejects_unknown_object_type() {
        let err = Environment::builder()
            .variable("x", Type::list(Type::object("acme.Widget")))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            EnvironmentError::UnknownObjectType {
                declaration: "variable 'x'".into(),
                type_name: "acme.Widget".into()
            }
        );

        let err = Environment::builder()
            .object(ObjectDecl::new("acme.A").field_decl("b", Type::object("acme.B")))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::UnknownObjectType { .. }));
    }

    #[test]
    fn rejects_duplicate_object() {
        let err = Environment::builder()
            .object(ObjectDecl::new("acme.A"))
            .object(ObjectDecl::new("acme.A"))
            .build()
            .unwrap_err();
        assert_eq!(err, EnvironmentError::DuplicateObject { name: "acme.A".into() });
    }

    #[test]
    fn rejects_duplicate_and_empty_functions() {
        let f = || Overload::global("size_string", vec![Type::String], Type::Int, |_| Ok(Value::Int(0)));
        let err = Environment::builder()
            .function(Function::new("size").overload(f()))
            .build()
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::DuplicateOverload { .. }));

        let err = Environment::builder()
            .function(Function::new("nothing"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            EnvironmentError::EmptyFunction {
                function: "nothing".into()
            }
        );
    }

    #[test]
    fn rejects_variable_shadowing_namespace() {
        let err = Environment::builder()
            .library(Library::Math)
            .variable("math", Type::Dyn)
            .build()
            .unwrap_err();
        assert_eq!(err, EnvironmentError::NamespaceCollision { name: "math".into() });
    }

    #[test]
    fn custom_function_extends_standard() {
        let env = Environment::standard_builder()
            .function(Function::new("double_it").overload(Overload::global(
                "double_it_int",
                vec![Type::Int],
                Type::Int,
                |args| match args {
                    [Value::Int(i)] => Ok(Value::Int(i * 2)),
                    _ => Err(crate::EvalError::invalid_argument("double_it", "expected int")),
                },
            )))
            .build()
            .unwrap();
        assert!(env.function("double_it").is_some());
    }

    #[test]
    fn namespaces_and_natives() {
        let env = Environment::standard().unwrap();
        let namespaces: Vec<&str> = env.namespaces().collect();
        assert_eq!(
            namespaces,
            ["base64", "lists", "math", "optional", "sets", "strings"]
        );
        assert!(env.natives().any(|f| f.name() == "greatest"));
        assert!(env.natives().any(|f| f.name() == "size"));
        assert!(!env.natives().any(|f| f.name() == "_+_"));
        assert_eq!(env.time_zone(), Zone::UTC);
    }

    #[test]
    fn rejects_builtin_overrides() {
        let f = |name: &str| {
            Function::new(name).overload(Overload::global(
                format!("{name}_custom"),
                vec![Type::Dyn],
                Type::Bool,
                |_| Ok(Value::Bool(true)),
            ))
        };
        let err = Environment::builder().function(f("has")).build().unwrap_err();
        assert_eq!(err, EnvironmentError::BuiltinOverride { function: "has".into() });

        let err = Environment::builder().function(f("_==_")).build().unwrap_err();
        assert_eq!(err, EnvironmentError::BuiltinOverride { function: "_==_".into() });

        let err = Environment::builder().function(f("acme._<_")).build().unwrap_err();
        assert_eq!(err, EnvironmentError::BuiltinOverride { function: "_<_".into() });
    }

    #[test]
    fn rejects_nested_namespaces() {
        let err = Environment::builder()
            .function(Function::new("acme.net.ping").overload(Overload::global(
                "acme_net_ping",
                vec![],
                Type::Bool,
                |_| Ok(Value::Bool(true)),
            )))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            EnvironmentError::NestedNamespace {
                function: "acme.net.ping".into()
            }
        );
    }

    #[test]
    fn encoders_library_is_optional() {
        let env = Environment::builder().library(Library::Encoders).build().unwrap();
        assert!(env.function("base64.encode").is_some());
        assert!(env.function("math.greatest").is_none());
        assert_eq!(env.namespaces().collect::<Vec<_>>(), ["base64"]);
    }
}
