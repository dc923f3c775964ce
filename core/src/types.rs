//! `Type`: Static types of the expression language
//!
//! The checker assigns a [`Type`] to every sub-expression. Types follow CEL:
//! primitives, parameterized containers, declared object types, and `dyn`
//! for values whose type is only known at evaluation time.
//!
//! # Type parameters
//!
//! Function overloads may be generic (`size(list(A)) -> int`). [`Type::Param`]
//! names a type parameter; [`Bindings`] records what each parameter was bound
//! to while one overload is being matched.

use std::fmt;

/// A static type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Dynamic: assignable to and from every type.
    Dyn,
    /// The type of `null`.
    Null,
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// Unsigned 64-bit integer.
    Uint,
    /// 64-bit IEEE float.
    Double,
    /// UTF-8 string.
    String,
    /// Byte sequence.
    Bytes,
    /// Point in time (`google.protobuf.Timestamp`).
    Timestamp,
    /// Signed span of time (`google.protobuf.Duration`).
    Duration,
    /// Homogeneous list.
    List(Box<Type>),
    /// Map from key type to value type.
    Map(Box<Type>, Box<Type>),
    /// Optional value of the inner type.
    Optional(Box<Type>),
    /// A declared object type, by fully qualified name.
    Object(String),
    /// A type parameter in a function signature.
    Param(&'static str),
}

impl Type {
    /// `list(elem)`
    #[must_use]
    pub fn list(elem: Type) -> Self {
        Self::List(Box::new(elem))
    }

    /// `map(key, value)`
    #[must_use]
    pub fn map(key: Type, value: Type) -> Self {
        Self::Map(Box::new(key), Box::new(value))
    }

    /// `optional_type(inner)`
    #[must_use]
    pub fn optional(inner: Type) -> Self {
        Self::Optional(Box::new(inner))
    }

    /// Declared object type.
    #[must_use]
    pub fn object(name: impl Into<String>) -> Self {
        Self::Object(name.into())
    }

    /// Returns `true` for `dyn`.
    #[inline]
    #[must_use]
    pub fn is_dyn(&self) -> bool {
        matches!(self, Self::Dyn)
    }

    /// Returns `true` for `int`, `uint` and `double`.
    #[inline]
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Uint | Self::Double)
    }

    /// Returns `true` if this type can key a map literal.
    #[must_use]
    pub fn is_valid_map_key(&self) -> bool {
        matches!(
            self,
            Self::Dyn | Self::Bool | Self::Int | Self::Uint | Self::String | Self::Param(_)
        )
    }

    /// Exact equality, with no `dyn` leniency.
    ///
    /// Used for the result-type assertion: `dyn` is *not* exactly `bool`.
    #[must_use]
    pub fn is_exact(&self, other: &Type) -> bool {
        self == other
    }

    /// Least common type of two branches (list elements, map values).
    ///
    /// Identical types join to themselves; anything else widens to `dyn`.
    #[must_use]
    pub fn join(&self, other: &Type) -> Type {
        if self == other {
            self.clone()
        } else {
            Self::Dyn
        }
    }

    /// Visit every object name referenced by this type.
    pub(crate) fn for_each_object<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Self::Object(name) => f(name),
            Self::List(elem) | Self::Optional(elem) => elem.for_each_object(f),
            Self::Map(k, v) => {
                k.for_each_object(f);
                v.for_each_object(f);
            }
            _ => {}
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dyn => write!(f, "dyn"),
            Self::Null => write!(f, "null_type"),
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Uint => write!(f, "uint"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::Timestamp => write!(f, "google.protobuf.Timestamp"),
            Self::Duration => write!(f, "google.protobuf.Duration"),
            Self::List(elem) => write!(f, "list({elem})"),
            Self::Map(k, v) => write!(f, "map({k}, {v})"),
            Self::Optional(inner) => write!(f, "optional_type({inner})"),
            Self::Object(name) => write!(f, "{name}"),
            Self::Param(name) => write!(f, "{name}"),
        }
    }
}

/// Type-parameter bindings collected while matching one overload.
#[derive(Debug, Default)]
pub(crate) struct Bindings {
    bound: Vec<(&'static str, Type)>,
}

impl Bindings {
    fn get(&self, name: &str) -> Option<&Type> {
        self.bound.iter().find(|(n, _)| *n == name).map(|(_, t)| t)
    }

    fn bind(&mut self, name: &'static str, ty: Type) {
        if let Some(slot) = self.bound.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = ty;
        } else {
            self.bound.push((name, ty));
        }
    }

    /// Can a value of type `arg` be passed where `param` is expected?
    ///
    /// Binds unbound type parameters as a side effect. A parameter first
    /// bound to `dyn` is narrowed when a concrete type shows up later.
    pub(crate) fn is_assignable(&mut self, param: &Type, arg: &Type) -> bool {
        match (param, arg) {
            (Type::Param(name), _) => match self.get(name).cloned() {
                None => {
                    self.bind(name, arg.clone());
                    true
                }
                Some(Type::Dyn) => {
                    if !arg.is_dyn() {
                        self.bind(name, arg.clone());
                    }
                    true
                }
                Some(bound) => self.is_assignable(&bound, arg),
            },
            (Type::Dyn, _) | (_, Type::Dyn) => true,
            (Type::Object(_), Type::Null) => true,
            (Type::List(p), Type::List(a)) | (Type::Optional(p), Type::Optional(a)) => {
                self.is_assignable(p, a)
            }
            (Type::Map(pk, pv), Type::Map(ak, av)) => {
                self.is_assignable(pk, ak) && self.is_assignable(pv, av)
            }
            _ => param == arg,
        }
    }

    /// Replace bound parameters in `ty`; unbound parameters become `dyn`.
    pub(crate) fn substitute(&self, ty: &Type) -> Type {
        match ty {
            Type::Param(name) => self.get(name).cloned().unwrap_or(Type::Dyn),
            Type::List(elem) => Type::list(self.substitute(elem)),
            Type::Optional(inner) => Type::optional(self.substitute(inner)),
            Type::Map(k, v) => Type::map(self.substitute(k), self.substitute(v)),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_cel_names() {
        assert_eq!(Type::map(Type::String, Type::Dyn).to_string(), "map(string, dyn)");
        assert_eq!(Type::list(Type::Int).to_string(), "list(int)");
        assert_eq!(
            Type::optional(Type::String).to_string(),
            "optional_type(string)"
        );
    }

    #[test]
    fn dyn_is_assignable_both_ways() {
        let mut b = Bindings::default();
        assert!(b.is_assignable(&Type::Int, &Type::Dyn));
        assert!(b.is_assignable(&Type::Dyn, &Type::String));
    }

    #[test]
    fn param_binds_then_constrains() {
        let mut b = Bindings::default();
        let a = Type::Param("A");
        assert!(b.is_assignable(&Type::list(a.clone()), &Type::list(Type::Int)));
        assert!(b.is_assignable(&a, &Type::Int));
        assert!(!b.is_assignable(&a, &Type::String));
        assert_eq!(b.substitute(&Type::list(a)), Type::list(Type::Int));
    }

    #[test]
    fn param_bound_to_dyn_narrows() {
        let mut b = Bindings::default();
        let a = Type::Param("A");
        assert!(b.is_assignable(&a, &Type::Dyn));
        assert!(b.is_assignable(&a, &Type::String));
        assert_eq!(b.substitute(&a), Type::String);
    }

    #[test]
    fn unbound_param_substitutes_dyn() {
        let b = Bindings::default();
        assert_eq!(b.substitute(&Type::Param("B")), Type::Dyn);
    }

    #[test]
    fn dyn_is_not_exactly_bool() {
        assert!(!Type::Dyn.is_exact(&Type::Bool));
        assert!(Type::Bool.is_exact(&Type::Bool));
    }

    #[test]
    fn join_widens_to_dyn() {
        assert_eq!(Type::Int.join(&Type::Int), Type::Int);
        assert_eq!(Type::Int.join(&Type::Double), Type::Dyn);
    }
}
