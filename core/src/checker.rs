//! Checker: static type inference for parsed expressions
//!
//! Assigns a [`Type`] to every sub-expression of a `cel_parser` syntax tree
//! against an [`Environment`]'s declarations and rejects expressions that
//! cannot be typed: undeclared identifiers and functions, unknown fields of
//! declared objects, calls with no matching overload, and malformed macros.
//!
//! Namespaced calls are resolved here. `math.greatest(a, b)` parses as a
//! member call on an identifier `math`; when `math` is not a variable and
//! `math.greatest` is a declared function, the call is typed as a global
//! call to `math.greatest`.
//!
//! # Overload resolution
//!
//! Every overload whose shape fits the call (global or member, arity) is
//! tried with fresh type-parameter bindings. If several match, which happens
//! with `dyn` arguments, their result types must agree or the call is typed
//! `dyn`.

use crate::env::Environment;
use crate::functions::{
    compile_regex, operators, parse_duration, parse_timestamp, MATH_EXTREMA,
};
use crate::types::{Bindings, Type};
use crate::MAX_EXPRESSION_DEPTH;
use cel_parser::{ArithmeticOp, Atom, Expression, Member, RelationOp, UnaryOp};

/// A type-check failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// Identifier is neither a declared variable nor a comprehension variable.
    #[error("undeclared reference to '{name}'")]
    UndeclaredReference {
        /// The identifier.
        name: String,
    },
    /// No function with this name is declared.
    #[error("undeclared reference to function '{function}'")]
    UndeclaredFunction {
        /// Function name.
        function: String,
    },
    /// The function exists but no overload accepts these argument types.
    #[error("found no matching overload for '{function}' applied to '({args})'")]
    NoMatchingOverload {
        /// Function name.
        function: String,
        /// Argument types, receiver first.
        args: String,
    },
    /// Selection of a field a declared object type does not have.
    #[error("undefined field '{field}' on type '{type_name}'")]
    UndefinedField {
        /// Object type name.
        type_name: String,
        /// Selected field.
        field: String,
    },
    /// Field selection on a type that has no fields.
    #[error("type '{operand}' does not support field selection of '{field}'")]
    InvalidSelect {
        /// Operand type.
        operand: Type,
        /// Selected field.
        field: String,
    },
    /// Comprehension over something that is neither a list nor a map.
    #[error("expression of type '{actual}' cannot be the range of a comprehension")]
    InvalidRange {
        /// Range type.
        actual: Type,
    },
    /// A macro predicate that is not boolean.
    #[error("{macro_name}() predicate must be of type bool, found '{actual}'")]
    InvalidPredicate {
        /// Macro name.
        macro_name: &'static str,
        /// Predicate type.
        actual: Type,
    },
    /// A comprehension macro whose first argument is not a variable name.
    #[error("{macro_name}() variable must be a simple identifier")]
    InvalidMacroVariable {
        /// Macro name.
        macro_name: &'static str,
    },
    /// `has()` applied to something other than a field selection.
    #[error("invalid argument to has() macro")]
    InvalidHasArgument,
    /// Map literal key of a type that cannot key a map.
    #[error("unsupported map key type '{actual}'")]
    InvalidMapKey {
        /// Key type.
        actual: Type,
    },
    /// A literal regular expression that does not compile.
    #[error("invalid regular expression '{pattern}': {message}")]
    InvalidRegex {
        /// The pattern.
        pattern: String,
        /// Compiler message.
        message: String,
    },
    /// A literal timestamp or duration string that does not parse.
    #[error("invalid {function}() literal: {message}")]
    InvalidLiteral {
        /// `timestamp` or `duration`.
        function: &'static str,
        /// Parser message.
        message: String,
    },
    /// Syntax the evaluator cannot run (message construction, computed
    /// function names, three-argument `map`).
    #[error("unsupported expression: {feature}")]
    Unsupported {
        /// What was used.
        feature: String,
    },
    /// The syntax tree nests deeper than [`MAX_EXPRESSION_DEPTH`].
    #[error("expression nesting exceeds the maximum depth of {MAX_EXPRESSION_DEPTH}")]
    TooDeep,
}

/// Type-check `expr`, returning its type.
///
/// # Errors
///
/// Returns the first [`TypeError`] found, in evaluation order.
pub fn check(env: &Environment, expr: &Expression) -> Result<Type, TypeError> {
    Checker {
        env,
        scopes: Vec::new(),
        depth: 0,
    }
    .check(expr)
}

struct Checker<'a> {
    env: &'a Environment,
    /// Comprehension variables, innermost last.
    scopes: Vec<(String, Type)>,
    depth: usize,
}

impl Checker<'_> {
    fn check(&mut self, expr: &Expression) -> Result<Type, TypeError> {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err(TypeError::TooDeep);
        }
        self.depth += 1;
        let ty = self.check_inner(expr);
        self.depth -= 1;
        ty
    }

    fn check_inner(&mut self, expr: &Expression) -> Result<Type, TypeError> {
        #[allow(unreachable_patterns)]
        match expr {
            Expression::Atom(atom) => Ok(atom_type(atom)),
            Expression::Ident(name) => self
                .resolve(name)
                .ok_or_else(|| TypeError::UndeclaredReference {
                    name: name.to_string(),
                }),
            Expression::Member(operand, member) => match member.as_ref() {
                Member::Attribute(field) => {
                    let operand_ty = self.check(operand)?;
                    self.select_type(&operand_ty, field)
                }
                Member::Index(index) => self.apply(operators::INDEX, false, &[&**operand, &**index]),
                Member::Fields(_) => Err(TypeError::Unsupported {
                    feature: "message construction".into(),
                }),
            },
            Expression::Unary(op, operand) => {
                let (function, times) = match op {
                    UnaryOp::Not => (operators::NOT, 1),
                    UnaryOp::DoubleNot => (operators::NOT, 2),
                    UnaryOp::Minus => (operators::NEGATE, 1),
                    UnaryOp::DoubleMinus => (operators::NEGATE, 2),
                };
                let mut ty = self.check(operand)?;
                for _ in 0..times {
                    ty = self.resolve_overload(function, false, &[ty])?;
                }
                Ok(ty)
            }
            Expression::Arithmetic(lhs, op, rhs) => {
                let function = match op {
                    ArithmeticOp::Add => operators::ADD,
                    ArithmeticOp::Subtract => operators::SUBTRACT,
                    ArithmeticOp::Multiply => operators::MULTIPLY,
                    ArithmeticOp::Divide => operators::DIVIDE,
                    ArithmeticOp::Modulus => operators::MODULO,
                };
                self.apply(function, false, &[&**lhs, &**rhs])
            }
            Expression::Relation(lhs, op, rhs) => {
                let function = match op {
                    RelationOp::LessThan => operators::LESS,
                    RelationOp::LessThanEq => operators::LESS_EQUALS,
                    RelationOp::GreaterThan => operators::GREATER,
                    RelationOp::GreaterThanEq => operators::GREATER_EQUALS,
                    RelationOp::Equals => operators::EQUALS,
                    RelationOp::NotEquals => operators::NOT_EQUALS,
                    RelationOp::In => operators::IN,
                };
                self.apply(function, false, &[&**lhs, &**rhs])
            }
            Expression::And(lhs, rhs) => self.apply(operators::LOGICAL_AND, false, &[&**lhs, &**rhs]),
            Expression::Or(lhs, rhs) => self.apply(operators::LOGICAL_OR, false, &[&**lhs, &**rhs]),
            Expression::Ternary(cond, then, otherwise) => {
                self.apply(operators::CONDITIONAL, false, &[&**cond, &**then, &**otherwise])
            }
            Expression::FunctionCall(name, target, args) => {
                let Expression::Ident(name) = name.as_ref() else {
                    return Err(TypeError::Unsupported {
                        feature: "computed function name".into(),
                    });
                };
                self.check_call(target.as_deref(), name, args)
            }
            Expression::List(items) => {
                let mut elem: Option<Type> = None;
                for item in items {
                    let ty = self.check(item)?;
                    elem = Some(elem.map_or(ty.clone(), |joined| joined.join(&ty)));
                }
                Ok(Type::list(elem.unwrap_or(Type::Dyn)))
            }
            Expression::Map(entries) => {
                let mut key_ty: Option<Type> = None;
                let mut value_ty: Option<Type> = None;
                for (k, v) in entries {
                    let kt = self.check(k)?;
                    if !kt.is_valid_map_key() {
                        return Err(TypeError::InvalidMapKey { actual: kt });
                    }
                    let vt = self.check(v)?;
                    key_ty = Some(key_ty.map_or(kt.clone(), |joined| joined.join(&kt)));
                    value_ty = Some(value_ty.map_or(vt.clone(), |joined| joined.join(&vt)));
                }
                Ok(Type::map(
                    key_ty.unwrap_or(Type::Dyn),
                    value_ty.unwrap_or(Type::Dyn),
                ))
            }
            _ => Err(TypeError::Unsupported {
                feature: "unrecognised syntax".into(),
            }),
        }
    }

    fn resolve(&self, name: &str) -> Option<Type> {
        self.scopes
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| ty.clone())
            .or_else(|| self.env.variable(name).cloned())
    }

    fn select_type(&self, operand: &Type, field: &str) -> Result<Type, TypeError> {
        match operand {
            Type::Object(name) => self
                .env
                .object(name)
                .and_then(|decl| decl.field(field))
                .cloned()
                .ok_or_else(|| TypeError::UndefinedField {
                    type_name: name.clone(),
                    field: field.to_string(),
                }),
            Type::Map(key, value) if matches!(**key, Type::String | Type::Dyn) => {
                Ok((**value).clone())
            }
            Type::Dyn => Ok(Type::Dyn),
            other => Err(TypeError::InvalidSelect {
                operand: other.clone(),
                field: field.to_string(),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Calls
    // ═══════════════════════════════════════════════════════════════════════

    /// Check the operands, then resolve `function` over their types.
    fn apply(
        &mut self,
        function: &str,
        receiver_style: bool,
        operands: &[&Expression],
    ) -> Result<Type, TypeError> {
        let mut arg_types = Vec::with_capacity(operands.len());
        for operand in operands {
            arg_types.push(self.check(operand)?);
        }
        self.resolve_overload(function, receiver_style, &arg_types)
    }

    fn check_call(
        &mut self,
        target: Option<&Expression>,
        function: &str,
        args: &[Expression],
    ) -> Result<Type, TypeError> {
        if let Some(ty) = self.check_macro(target, function, args)? {
            return Ok(ty);
        }
        if let Some(qualified) = target.and_then(|t| self.namespaced(t, function)) {
            return self.check_call(None, &qualified, args);
        }

        let mut operands: Vec<&Expression> = Vec::with_capacity(args.len() + 1);
        operands.extend(target);
        operands.extend(args);

        let result = if MATH_EXTREMA.contains(&function) && target.is_none() {
            let mut arg_types = Vec::with_capacity(args.len());
            for arg in args {
                arg_types.push(self.check(arg)?);
            }
            extremum_type(function, &arg_types)?
        } else {
            self.apply(function, target.is_some(), &operands)?
        };

        if self.env.extended_validations() {
            validate_literals(function, args)?;
        }
        Ok(result)
    }

    /// `ns.f(...)` where `ns` is a function namespace rather than a value.
    fn namespaced(&self, target: &Expression, function: &str) -> Option<String> {
        let Expression::Ident(ns) = target else {
            return None;
        };
        if self.resolve(ns).is_some() {
            return None;
        }
        let qualified = format!("{ns}.{function}");
        self.env.function(&qualified).map(|_| qualified)
    }

    fn resolve_overload(
        &self,
        function: &str,
        receiver_style: bool,
        arg_types: &[Type],
    ) -> Result<Type, TypeError> {
        let decl = self
            .env
            .function(function)
            .ok_or_else(|| TypeError::UndeclaredFunction {
                function: display_name(function).to_string(),
            })?;

        let mut result: Option<Type> = None;
        for overload in decl.overloads() {
            if !overload.fits(receiver_style, arg_types.len()) || overload.is_variadic() {
                continue;
            }
            let mut bindings = Bindings::default();
            let matched = overload
                .params()
                .iter()
                .zip(arg_types)
                .all(|(param, arg)| bindings.is_assignable(param, arg));
            if matched {
                let ty = bindings.substitute(overload.result());
                result = Some(match result {
                    None => ty,
                    Some(prev) if prev == ty => prev,
                    Some(_) => Type::Dyn,
                });
            }
        }
        result.ok_or_else(|| TypeError::NoMatchingOverload {
            function: display_name(function).to_string(),
            args: join_types(arg_types),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Macros
    // ═══════════════════════════════════════════════════════════════════════

    /// Type a macro call; `None` if the call is not a macro.
    fn check_macro(
        &mut self,
        target: Option<&Expression>,
        function: &str,
        args: &[Expression],
    ) -> Result<Option<Type>, TypeError> {
        let macro_name: &'static str = match (function, target, args.len()) {
            ("has", None, 1) => return self.check_has(&args[0]).map(Some),
            ("all", Some(_), 2) => "all",
            ("exists", Some(_), 2) => "exists",
            ("exists_one", Some(_), 2) => "exists_one",
            ("map", Some(_), 2) => "map",
            ("filter", Some(_), 2) => "filter",
            ("map", Some(_), 3) => {
                return Err(TypeError::Unsupported {
                    feature: "map() with a filter predicate".into(),
                })
            }
            _ => return Ok(None),
        };
        let Some(range) = target else {
            return Ok(None);
        };
        let Expression::Ident(var) = &args[0] else {
            return Err(TypeError::InvalidMacroVariable { macro_name });
        };

        let range_ty = self.check(range)?;
        let elem = match &range_ty {
            Type::List(elem) => (**elem).clone(),
            Type::Map(key, _) => (**key).clone(),
            Type::Dyn => Type::Dyn,
            other => return Err(TypeError::InvalidRange { actual: other.clone() }),
        };

        self.scopes.push((var.to_string(), elem.clone()));
        let body_ty = self.check(&args[1]);
        self.scopes.pop();
        let body_ty = body_ty?;

        let ty = match macro_name {
            "map" => Type::list(body_ty),
            "filter" => {
                expect_predicate(macro_name, &body_ty)?;
                Type::list(elem)
            }
            _ => {
                expect_predicate(macro_name, &body_ty)?;
                Type::Bool
            }
        };
        Ok(Some(ty))
    }

    /// `has(e.f)`: `e` must type-check and, if it is a declared object,
    /// declare `f`.
    fn check_has(&mut self, arg: &Expression) -> Result<Type, TypeError> {
        let Expression::Member(operand, member) = arg else {
            return Err(TypeError::InvalidHasArgument);
        };
        let Member::Attribute(field) = member.as_ref() else {
            return Err(TypeError::InvalidHasArgument);
        };
        let operand_ty = self.check(operand)?;
        self.select_type(&operand_ty, field)?;
        Ok(Type::Bool)
    }
}

fn atom_type(atom: &Atom) -> Type {
    match atom {
        Atom::Null => Type::Null,
        Atom::Bool(_) => Type::Bool,
        Atom::Int(_) => Type::Int,
        Atom::UInt(_) => Type::Uint,
        Atom::Float(_) => Type::Double,
        Atom::String(_) => Type::String,
        Atom::Bytes(_) => Type::Bytes,
    }
}

fn join_types(types: &[Type]) -> String {
    types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Operators read better in errors as their source symbols.
fn display_name(function: &str) -> &str {
    match function {
        operators::ADD => "+",
        operators::SUBTRACT => "-",
        operators::MULTIPLY => "*",
        operators::DIVIDE => "/",
        operators::MODULO => "%",
        operators::NEGATE => "unary -",
        operators::NOT => "!",
        operators::EQUALS => "==",
        operators::NOT_EQUALS => "!=",
        operators::LESS => "<",
        operators::LESS_EQUALS => "<=",
        operators::GREATER => ">",
        operators::GREATER_EQUALS => ">=",
        operators::IN => "in",
        operators::LOGICAL_AND => "&&",
        operators::LOGICAL_OR => "||",
        operators::CONDITIONAL => "?:",
        operators::INDEX => "[]",
        other => other,
    }
}

/// `math.greatest` / `math.least`: numeric arguments, or one list of them.
fn extremum_type(function: &str, args: &[Type]) -> Result<Type, TypeError> {
    let elems: &[Type] = match args {
        [Type::List(elem)] => std::slice::from_ref(elem.as_ref()),
        other => other,
    };
    let no_match = || TypeError::NoMatchingOverload {
        function: function.to_string(),
        args: join_types(args),
    };
    let first = elems.first().ok_or_else(no_match)?;
    if !elems.iter().all(|t| t.is_numeric() || t.is_dyn()) {
        return Err(no_match());
    }
    Ok(elems
        .iter()
        .skip(1)
        .fold(first.clone(), |joined, t| joined.join(t)))
}

fn expect_predicate(macro_name: &'static str, ty: &Type) -> Result<(), TypeError> {
    if matches!(ty, Type::Bool | Type::Dyn) {
        Ok(())
    } else {
        Err(TypeError::InvalidPredicate {
            macro_name,
            actual: ty.clone(),
        })
    }
}

/// Reject literal regexes, timestamps and durations that can never succeed.
fn validate_literals(function: &str, args: &[Expression]) -> Result<(), TypeError> {
    let Some(Expression::Atom(Atom::String(text))) = args.last() else {
        return Ok(());
    };
    match function {
        "matches" => compile_regex(text)
            .map(|_| ())
            .map_err(|message| TypeError::InvalidRegex {
                pattern: text.to_string(),
                message,
            }),
        "timestamp" if args.len() == 1 => parse_timestamp(text)
            .map(|_| ())
            .map_err(|message| TypeError::InvalidLiteral {
                function: "timestamp",
                message,
            }),
        "duration" if args.len() == 1 => parse_duration(text)
            .map(|_| ())
            .map_err(|message| TypeError::InvalidLiteral {
                function: "duration",
                message,
            }),
        _ => Ok(()),
    }
}
