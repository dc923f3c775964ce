//! Function declarations and their native implementations
//!
//! Every callable (operators included) is a [`Function`]: a name plus a list
//! of [`Overload`]s. An overload carries its static signature, used by the
//! checker, and optionally a native implementation.
//!
//! Overloads without an implementation are evaluated by the interpreter
//! itself: operators, indexing and `in`. Everything else (conversions,
//! `size`, string tests, time accessors, the extension libraries) is native,
//! registered on each [`Activation`](crate::Activation) and dispatched to the
//! first overload whose parameter kinds accept the argument values.
//!
//! # Libraries
//!
//! The standard library is always present. [`Library`] names the optional
//! extension sets: strings, lists, math, sets, optional values and encoders.

use crate::runtime::{self, type_name};
use crate::types::Type;
use crate::{MAX_LIST_RANGE, MAX_REGEX_PATTERN_LENGTH};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use cel_interpreter::Value;
use chrono::{DateTime, Datelike, FixedOffset, SecondsFormat, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Operator function names, as the checker resolves them.
pub mod operators {
    /// `a + b`
    pub const ADD: &str = "_+_";
    /// `a - b`
    pub const SUBTRACT: &str = "_-_";
    /// `a * b`
    pub const MULTIPLY: &str = "_*_";
    /// `a / b`
    pub const DIVIDE: &str = "_/_";
    /// `a % b`
    pub const MODULO: &str = "_%_";
    /// `-a`
    pub const NEGATE: &str = "-_";
    /// `!a`
    pub const NOT: &str = "!_";
    /// `a == b`
    pub const EQUALS: &str = "_==_";
    /// `a != b`
    pub const NOT_EQUALS: &str = "_!=_";
    /// `a < b`
    pub const LESS: &str = "_<_";
    /// `a <= b`
    pub const LESS_EQUALS: &str = "_<=_";
    /// `a > b`
    pub const GREATER: &str = "_>_";
    /// `a >= b`
    pub const GREATER_EQUALS: &str = "_>=_";
    /// `a in b`
    pub const IN: &str = "@in";
    /// `a && b`
    pub const LOGICAL_AND: &str = "_&&_";
    /// `a || b`
    pub const LOGICAL_OR: &str = "_||_";
    /// `c ? a : b`
    pub const CONDITIONAL: &str = "_?_:_";
    /// `a[b]`
    pub const INDEX: &str = "_[_]";
}

/// Macro names. The checker expands these; they cannot be redeclared.
pub(crate) const MACROS: [&str; 6] = ["has", "all", "exists", "exists_one", "map", "filter"];

/// A runtime evaluation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// No overload accepts the runtime argument kinds.
    #[error("no matching overload for '{function}' applied to ({args})")]
    NoSuchOverload {
        /// Function name.
        function: String,
        /// Runtime argument type names.
        args: String,
    },
    /// Arithmetic or conversion result out of range.
    #[error("{operation} overflow")]
    Overflow {
        /// Operation that overflowed.
        operation: &'static str,
    },
    /// `.value()` on `optional.none()`.
    #[error("optional.none() dereference")]
    EmptyOptional,
    /// A function rejected its arguments (bad regex, unparsable timestamp, …).
    #[error("{function}: {message}")]
    InvalidArgument {
        /// Function name.
        function: String,
        /// What was wrong.
        message: String,
    },
    /// The interpreter failed: absent key, division by zero, unbound
    /// variable, or a native function error surfacing through it.
    #[error("{message}")]
    Execution {
        /// The interpreter's message.
        message: String,
    },
}

impl EvalError {
    /// Error for custom function implementations rejecting their input.
    pub fn invalid_argument(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            function: function.into(),
            message: message.into(),
        }
    }

    pub(crate) fn no_overload(function: &str, args: &[Value]) -> Self {
        Self::NoSuchOverload {
            function: function.to_string(),
            args: args.iter().map(type_name).collect::<Vec<_>>().join(", "),
        }
    }
}

/// Implementation of one overload. Receives the receiver (for member-style
/// overloads) followed by the arguments.
pub type FunctionImpl = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Overload / Function
// ═══════════════════════════════════════════════════════════════════════════════

/// One signature of a function, with its implementation.
#[derive(Clone)]
pub struct Overload {
    id: String,
    receiver_style: bool,
    params: Vec<Type>,
    result: Type,
    variadic: bool,
    implementation: Option<FunctionImpl>,
}

impl Overload {
    /// A global overload: `f(a, b)`.
    pub fn global(
        id: impl Into<String>,
        params: Vec<Type>,
        result: Type,
        implementation: impl Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            receiver_style: false,
            params,
            result,
            variadic: false,
            implementation: Some(Arc::new(implementation)),
        }
    }

    /// A member overload: `a.f(b)`. `params[0]` is the receiver type.
    pub fn member(
        id: impl Into<String>,
        params: Vec<Type>,
        result: Type,
        implementation: impl Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            receiver_style: true,
            ..Self::global(id, params, result, implementation)
        }
    }

    /// A signature the interpreter evaluates itself.
    pub(crate) fn operator(id: impl Into<String>, params: Vec<Type>, result: Type) -> Self {
        Self {
            id: id.into(),
            receiver_style: false,
            params,
            result,
            variadic: false,
            implementation: None,
        }
    }

    /// Accept any number of arguments; the checker types such calls itself.
    fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Unique overload identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parameter types (receiver first for member overloads).
    #[must_use]
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    /// Result type.
    #[must_use]
    pub fn result(&self) -> &Type {
        &self.result
    }

    /// Is this a member (`a.f()`) overload?
    #[must_use]
    pub fn is_receiver_style(&self) -> bool {
        self.receiver_style
    }

    /// Does this overload carry a native implementation?
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.implementation.is_some()
    }

    pub(crate) fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// Does this overload apply to a call of this shape?
    pub(crate) fn fits(&self, receiver_style: bool, arg_count: usize) -> bool {
        self.receiver_style == receiver_style && (self.variadic || self.params.len() == arg_count)
    }

    /// Do the runtime argument kinds fit the parameter types?
    pub(crate) fn accepts(&self, args: &[Value]) -> bool {
        self.variadic
            || self
                .params
                .iter()
                .zip(args)
                .all(|(param, arg)| kind_matches(param, arg))
    }

    pub(crate) fn invoke(&self, function: &str, args: &[Value]) -> Result<Value, EvalError> {
        match &self.implementation {
            Some(implementation) => implementation(args),
            None => Err(EvalError::no_overload(function, args)),
        }
    }
}

impl fmt::Debug for Overload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overload")
            .field("id", &self.id)
            .field("receiver_style", &self.receiver_style)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("native", &self.is_native())
            .finish_non_exhaustive()
    }
}

/// A named function and its overloads.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    overloads: Vec<Overload>,
}

impl Function {
    /// A function with no overloads yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overloads: Vec::new(),
        }
    }

    /// Add an overload (builder pattern).
    #[must_use]
    pub fn overload(mut self, overload: Overload) -> Self {
        self.overloads.push(overload);
        self
    }

    /// Function name, including any namespace (`math.greatest`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared overloads.
    #[must_use]
    pub fn overloads(&self) -> &[Overload] {
        &self.overloads
    }

    pub(crate) fn extend(&mut self, other: Function) {
        self.overloads.extend(other.overloads);
    }
}

/// Runtime kind check: does `value` inhabit `ty`, ignoring element types?
///
/// Optional values are lists of at most one element; declared objects are
/// string-keyed maps.
fn kind_matches(ty: &Type, value: &Value) -> bool {
    match (ty, value) {
        (Type::Dyn | Type::Param(_), _)
        | (Type::Null, Value::Null)
        | (Type::Bool, Value::Bool(_))
        | (Type::Int, Value::Int(_))
        | (Type::Uint, Value::UInt(_))
        | (Type::Double, Value::Float(_))
        | (Type::String, Value::String(_))
        | (Type::Bytes, Value::Bytes(_))
        | (Type::Timestamp, Value::Timestamp(_))
        | (Type::Duration, Value::Duration(_))
        | (Type::List(_), Value::List(_))
        | (Type::Map(..) | Type::Object(_), Value::Map(_))
        | (Type::Object(_), Value::Null) => true,
        (Type::Optional(_), Value::List(items)) => items.len() <= 1,
        _ => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Time zones
// ═══════════════════════════════════════════════════════════════════════════════

/// Time zone of a timestamp accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// A fixed UTC offset such as `+05:30`.
    Fixed(FixedOffset),
    /// An IANA zone such as `America/New_York`.
    Named(Tz),
}

impl Zone {
    /// Coordinated Universal Time.
    pub const UTC: Zone = Zone::Named(Tz::UTC);

    /// Parse an IANA zone name, `UTC`, `Z`, or a fixed offset such as
    /// `+05:30` or `-08:00`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the zone if it is not recognised.
    pub fn parse(zone: &str) -> Result<Self, String> {
        if matches!(zone, "UTC" | "utc" | "Z") {
            return Ok(Self::UTC);
        }
        if let Ok(tz) = zone.parse::<Tz>() {
            return Ok(Self::Named(tz));
        }
        parse_offset(zone)
            .map(Self::Fixed)
            .ok_or_else(|| format!("unsupported time zone '{zone}'"))
    }

    /// `t` as wall-clock time in this zone.
    #[must_use]
    pub fn localize(&self, t: &DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        match self {
            Self::Fixed(offset) => t.with_timezone(offset),
            Self::Named(tz) => t.with_timezone(tz).fixed_offset(),
        }
    }
}

impl Default for Zone {
    fn default() -> Self {
        Self::UTC
    }
}

fn parse_offset(zone: &str) -> Option<FixedOffset> {
    let (sign, rest) = match zone.as_bytes().first() {
        Some(b'+') => (1, &zone[1..]),
        Some(b'-') => (-1, &zone[1..]),
        _ => (1, zone),
    };
    let (hours, minutes) = rest.split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Libraries
// ═══════════════════════════════════════════════════════════════════════════════

/// Optional extension libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Library {
    /// `charAt`, `indexOf`, `split`, `strings.quote`, …
    Strings,
    /// `slice`, `flatten`, `distinct`, `sort`, `lists.range`, …
    Lists,
    /// `math.greatest`, `math.abs`, `math.ceil`, bit operations, …
    Math,
    /// `sets.contains`, `sets.equivalent`, `sets.intersects`
    Sets,
    /// `optional.of`, `optional.none`, `.hasValue()`, `.orValue()`, …
    Optional,
    /// `base64.encode`, `base64.decode`
    Encoders,
}

impl Library {
    /// Every extension library.
    pub const ALL: [Library; 6] = [
        Self::Strings,
        Self::Lists,
        Self::Math,
        Self::Sets,
        Self::Optional,
        Self::Encoders,
    ];

    /// Function namespace introduced by this library.
    #[must_use]
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Strings => "strings",
            Self::Lists => "lists",
            Self::Math => "math",
            Self::Sets => "sets",
            Self::Optional => "optional",
            Self::Encoders => "base64",
        }
    }
}

/// Settings that shape library declarations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LibraryOptions {
    pub cross_type_numeric_comparisons: bool,
    pub time_zone: Zone,
}

/// Accumulates overloads, grouping them by function name.
#[derive(Default)]
struct Declarations {
    functions: Vec<Function>,
}

type Native = fn(&[Value]) -> Result<Value, EvalError>;

impl Declarations {
    fn push(&mut self, name: &str, overload: Overload) {
        if let Some(f) = self.functions.iter_mut().find(|f| f.name == name) {
            f.overloads.push(overload);
        } else {
            self.functions.push(Function::new(name).overload(overload));
        }
    }

    fn global(&mut self, name: &str, id: &str, params: Vec<Type>, result: Type, f: Native) {
        self.push(name, Overload::global(id, params, result, f));
    }

    fn member(&mut self, name: &str, id: &str, params: Vec<Type>, result: Type, f: Native) {
        self.push(name, Overload::member(id, params, result, f));
    }

    fn operator(&mut self, name: &str, id: &str, params: Vec<Type>, result: Type) {
        self.push(name, Overload::operator(id, params, result));
    }
}

const A: Type = Type::Param("A");
const K: Type = Type::Param("K");
const V: Type = Type::Param("V");

fn list_a() -> Type {
    Type::list(A)
}

fn map_kv() -> Type {
    Type::map(K, V)
}

/// The standard library.
pub(crate) fn standard(options: LibraryOptions) -> Vec<Function> {
    let mut d = Declarations::default();
    declare_logic(&mut d);
    declare_comparisons(&mut d, options.cross_type_numeric_comparisons);
    declare_arithmetic(&mut d);
    declare_containers(&mut d);
    declare_strings_core(&mut d);
    declare_conversions(&mut d);
    declare_time(&mut d, options.time_zone);
    d.functions
}

/// One extension library.
pub(crate) fn library(library: Library) -> Vec<Function> {
    let mut d = Declarations::default();
    match library {
        Library::Strings => declare_strings_ext(&mut d),
        Library::Lists => declare_lists_ext(&mut d),
        Library::Math => declare_math_ext(&mut d),
        Library::Sets => declare_sets_ext(&mut d),
        Library::Optional => declare_optional_ext(&mut d),
        Library::Encoders => declare_encoders_ext(&mut d),
    }
    d.functions
}

// ═══════════════════════════════════════════════════════════════════════════════
// Argument helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn unary<'a>(function: &str, args: &'a [Value]) -> Result<&'a Value, EvalError> {
    match args {
        [a] => Ok(a),
        _ => Err(EvalError::no_overload(function, args)),
    }
}

fn binary<'a>(function: &str, args: &'a [Value]) -> Result<(&'a Value, &'a Value), EvalError> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(EvalError::no_overload(function, args)),
    }
}

fn string_arg<'a>(function: &str, value: &'a Value) -> Result<&'a str, EvalError> {
    match value {
        Value::String(s) => Ok(s.as_str()),
        other => Err(EvalError::no_overload(function, std::slice::from_ref(other))),
    }
}

fn int_arg(function: &str, value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(EvalError::no_overload(function, std::slice::from_ref(other))),
    }
}

fn list_arg<'a>(function: &str, value: &'a Value) -> Result<&'a [Value], EvalError> {
    match value {
        Value::List(items) => Ok(items.as_slice()),
        other => Err(EvalError::no_overload(function, std::slice::from_ref(other))),
    }
}

fn overflow(operation: &'static str) -> EvalError {
    EvalError::Overflow { operation }
}

fn is_number(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::UInt(_) | Value::Float(_))
}

/// CEL timestamps span years 0001 through 9999.
fn check_timestamp(t: DateTime<Utc>) -> Result<Value, EvalError> {
    if (1..=9999).contains(&t.year()) {
        Ok(Value::Timestamp(t.fixed_offset()))
    } else {
        Err(overflow("timestamp conversion"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Standard library: operators
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_logic(d: &mut Declarations) {
    d.operator(operators::NOT, "logical_not", vec![Type::Bool], Type::Bool);
    d.operator(
        operators::LOGICAL_AND,
        "logical_and",
        vec![Type::Bool, Type::Bool],
        Type::Bool,
    );
    d.operator(
        operators::LOGICAL_OR,
        "logical_or",
        vec![Type::Bool, Type::Bool],
        Type::Bool,
    );
    d.operator(operators::CONDITIONAL, "conditional", vec![Type::Bool, A, A], A);
}

fn declare_comparisons(d: &mut Declarations, cross_type: bool) {
    d.operator(operators::EQUALS, "equals", vec![A, A], Type::Bool);
    d.operator(operators::NOT_EQUALS, "not_equals", vec![A, A], Type::Bool);

    let ordered = [
        ("bool", Type::Bool),
        ("int64", Type::Int),
        ("uint64", Type::Uint),
        ("double", Type::Double),
        ("string", Type::String),
        ("bytes", Type::Bytes),
        ("timestamp", Type::Timestamp),
        ("duration", Type::Duration),
    ];
    let numeric = [
        ("int64", Type::Int),
        ("uint64", Type::Uint),
        ("double", Type::Double),
    ];
    let relations = [
        (operators::LESS, "less"),
        (operators::LESS_EQUALS, "less_equals"),
        (operators::GREATER, "greater"),
        (operators::GREATER_EQUALS, "greater_equals"),
    ];
    for (op, prefix) in relations {
        for (suffix, ty) in &ordered {
            d.operator(op, &format!("{prefix}_{suffix}"), vec![ty.clone(), ty.clone()], Type::Bool);
        }
        if cross_type {
            for (ls, lt) in &numeric {
                for (rs, rt) in &numeric {
                    if ls != rs {
                        d.operator(
                            op,
                            &format!("{prefix}_{ls}_{rs}"),
                            vec![lt.clone(), rt.clone()],
                            Type::Bool,
                        );
                    }
                }
            }
        }
    }
}

fn declare_arithmetic(d: &mut Declarations) {
    use Type::{Bytes, Double, Duration, Int, String, Timestamp, Uint};

    for (suffix, ty) in [("int64", Int), ("uint64", Uint), ("double", Double)] {
        for (op, prefix) in [
            (operators::ADD, "add"),
            (operators::SUBTRACT, "subtract"),
            (operators::MULTIPLY, "multiply"),
            (operators::DIVIDE, "divide"),
        ] {
            d.operator(op, &format!("{prefix}_{suffix}"), vec![ty.clone(), ty.clone()], ty.clone());
        }
    }
    d.operator(operators::ADD, "add_string", vec![String, String], String);
    d.operator(operators::ADD, "add_bytes", vec![Bytes, Bytes], Bytes);
    d.operator(operators::ADD, "add_list", vec![list_a(), list_a()], list_a());
    d.operator(operators::ADD, "add_timestamp_duration", vec![Timestamp, Duration], Timestamp);
    d.operator(operators::ADD, "add_duration_timestamp", vec![Duration, Timestamp], Timestamp);
    d.operator(operators::ADD, "add_duration_duration", vec![Duration, Duration], Duration);
    d.operator(
        operators::SUBTRACT,
        "subtract_timestamp_timestamp",
        vec![Timestamp, Timestamp],
        Duration,
    );
    d.operator(
        operators::SUBTRACT,
        "subtract_timestamp_duration",
        vec![Timestamp, Duration],
        Timestamp,
    );
    d.operator(
        operators::SUBTRACT,
        "subtract_duration_duration",
        vec![Duration, Duration],
        Duration,
    );
    d.operator(operators::MODULO, "modulo_int64", vec![Int, Int], Int);
    d.operator(operators::MODULO, "modulo_uint64", vec![Uint, Uint], Uint);
    d.operator(operators::NEGATE, "negate_int64", vec![Int], Int);
    d.operator(operators::NEGATE, "negate_double", vec![Double], Double);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Standard library: containers
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_containers(d: &mut Declarations) {
    d.operator(operators::INDEX, "index_list", vec![list_a(), Type::Int], A);
    d.operator(operators::INDEX, "index_map", vec![map_kv(), K], V);
    d.operator(operators::IN, "in_list", vec![A, list_a()], Type::Bool);
    d.operator(operators::IN, "in_map", vec![K, map_kv()], Type::Bool);

    for (suffix, ty) in [
        ("string", Type::String),
        ("bytes", Type::Bytes),
        ("list", list_a()),
        ("map", map_kv()),
    ] {
        d.global("size", &format!("size_{suffix}"), vec![ty.clone()], Type::Int, size);
        d.member("size", &format!("{suffix}_size"), vec![ty], Type::Int, size);
    }
}

fn size(args: &[Value]) -> Result<Value, EvalError> {
    let len = match unary("size", args)? {
        Value::String(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::List(l) => l.len(),
        Value::Map(m) => m.map.len(),
        _ => return Err(EvalError::no_overload("size", args)),
    };
    i64::try_from(len).map(Value::Int).map_err(|_| overflow("size"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Standard library: strings and regular expressions
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_strings_core(d: &mut Declarations) {
    let ss = || vec![Type::String, Type::String];
    d.member("contains", "contains_string", ss(), Type::Bool, |args| {
        let (a, b) = binary("contains", args)?;
        Ok(Value::Bool(string_arg("contains", a)?.contains(string_arg("contains", b)?)))
    });
    d.member("startsWith", "starts_with_string", ss(), Type::Bool, |args| {
        let (a, b) = binary("startsWith", args)?;
        Ok(Value::Bool(
            string_arg("startsWith", a)?.starts_with(string_arg("startsWith", b)?),
        ))
    });
    d.member("endsWith", "ends_with_string", ss(), Type::Bool, |args| {
        let (a, b) = binary("endsWith", args)?;
        Ok(Value::Bool(string_arg("endsWith", a)?.ends_with(string_arg("endsWith", b)?)))
    });
    d.global("matches", "matches", ss(), Type::Bool, regex_matches);
    d.member("matches", "matches_string", ss(), Type::Bool, regex_matches);
}

/// Compile a regular expression for `matches()`.
pub(crate) fn compile_regex(pattern: &str) -> Result<regex::Regex, String> {
    if pattern.len() > MAX_REGEX_PATTERN_LENGTH {
        return Err(format!(
            "pattern length is {}, but maximum allowed is {MAX_REGEX_PATTERN_LENGTH}",
            pattern.len()
        ));
    }
    regex::Regex::new(pattern).map_err(|e| e.to_string())
}

fn regex_matches(args: &[Value]) -> Result<Value, EvalError> {
    let (text, pattern) = binary("matches", args)?;
    let re = compile_regex(string_arg("matches", pattern)?)
        .map_err(|message| EvalError::invalid_argument("matches", message))?;
    Ok(Value::Bool(re.is_match(string_arg("matches", text)?)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Standard library: type conversions
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_conversions(d: &mut Declarations) {
    use Type::{Bool, Bytes, Double, Duration, Int, String, Timestamp, Uint};

    for (suffix, ty) in [
        ("int64", Int),
        ("uint64", Uint),
        ("double", Double),
        ("string", String),
        ("timestamp", Timestamp),
    ] {
        d.global("int", &format!("{suffix}_to_int64"), vec![ty], Int, to_int);
    }
    for (suffix, ty) in [("int64", Int), ("uint64", Uint), ("double", Double), ("string", String)] {
        d.global("uint", &format!("{suffix}_to_uint64"), vec![ty.clone()], Uint, to_uint);
        d.global("double", &format!("{suffix}_to_double"), vec![ty], Double, to_double);
    }
    for (suffix, ty) in [
        ("string", String),
        ("int64", Int),
        ("uint64", Uint),
        ("double", Double),
        ("bool", Bool),
        ("bytes", Bytes),
        ("timestamp", Timestamp),
        ("duration", Duration),
    ] {
        d.global("string", &format!("{suffix}_to_string"), vec![ty], String, to_string);
    }
    d.global("bytes", "string_to_bytes", vec![String], Bytes, to_bytes);
    d.global("bytes", "bytes_to_bytes", vec![Bytes], Bytes, to_bytes);
    d.global("bool", "bool_to_bool", vec![Bool], Bool, to_bool);
    d.global("bool", "string_to_bool", vec![String], Bool, to_bool);
    d.global("dyn", "to_dyn", vec![A], Type::Dyn, |args| unary("dyn", args).cloned());
    d.global("timestamp", "string_to_timestamp", vec![String], Timestamp, to_timestamp);
    d.global("timestamp", "int64_to_timestamp", vec![Int], Timestamp, to_timestamp);
    d.global("timestamp", "timestamp_to_timestamp", vec![Timestamp], Timestamp, to_timestamp);
    d.global("duration", "string_to_duration", vec![String], Duration, to_duration);
    d.global("duration", "duration_to_duration", vec![Duration], Duration, to_duration);
}

// i64::MAX and u64::MAX are not representable as f64; these are the first
// doubles past each range.
const INT_RANGE_END: f64 = 9_223_372_036_854_775_808.0;
const UINT_RANGE_END: f64 = 18_446_744_073_709_551_616.0;

#[allow(clippy::cast_possible_truncation)]
fn to_int(args: &[Value]) -> Result<Value, EvalError> {
    match unary("int", args)? {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::UInt(u) => i64::try_from(*u).map(Value::Int).map_err(|_| overflow("int conversion")),
        Value::Float(d) if d.is_finite() && *d >= -INT_RANGE_END && *d < INT_RANGE_END => {
            Ok(Value::Int(d.trunc() as i64))
        }
        Value::Float(_) => Err(overflow("int conversion")),
        Value::String(s) => s
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| EvalError::invalid_argument("int", format!("cannot parse '{s}': {e}"))),
        Value::Timestamp(t) => Ok(Value::Int(t.timestamp())),
        _ => Err(EvalError::no_overload("int", args)),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_uint(args: &[Value]) -> Result<Value, EvalError> {
    match unary("uint", args)? {
        Value::UInt(u) => Ok(Value::UInt(*u)),
        Value::Int(i) => u64::try_from(*i).map(Value::UInt).map_err(|_| overflow("uint conversion")),
        Value::Float(d) if d.is_finite() && *d > -1.0 && *d < UINT_RANGE_END => {
            Ok(Value::UInt(d.trunc() as u64))
        }
        Value::Float(_) => Err(overflow("uint conversion")),
        Value::String(s) => s
            .parse::<u64>()
            .map(Value::UInt)
            .map_err(|e| EvalError::invalid_argument("uint", format!("cannot parse '{s}': {e}"))),
        _ => Err(EvalError::no_overload("uint", args)),
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_double(args: &[Value]) -> Result<Value, EvalError> {
    match unary("double", args)? {
        Value::Float(d) => Ok(Value::Float(*d)),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::UInt(u) => Ok(Value::Float(*u as f64)),
        Value::String(s) => s
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| EvalError::invalid_argument("double", format!("cannot parse '{s}': {e}"))),
        _ => Err(EvalError::no_overload("double", args)),
    }
}

fn to_string(args: &[Value]) -> Result<Value, EvalError> {
    let s = match unary("string", args)? {
        Value::String(s) => return Ok(Value::String(Arc::clone(s))),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(d) => d.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Bytes(b) => std::str::from_utf8(b.as_slice())
            .map_err(|e| EvalError::invalid_argument("string", format!("invalid UTF-8 in bytes: {e}")))?
            .to_string(),
        Value::Timestamp(t) => t
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        Value::Duration(d) => runtime::format_duration(*d),
        _ => return Err(EvalError::no_overload("string", args)),
    };
    Ok(runtime::string(s))
}

fn to_bytes(args: &[Value]) -> Result<Value, EvalError> {
    match unary("bytes", args)? {
        Value::String(s) => Ok(runtime::bytes(s.as_bytes().to_vec())),
        Value::Bytes(b) => Ok(Value::Bytes(Arc::clone(b))),
        _ => Err(EvalError::no_overload("bytes", args)),
    }
}

fn to_bool(args: &[Value]) -> Result<Value, EvalError> {
    match unary("bool", args)? {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::String(s) => match s.as_str() {
            "1" | "t" | "true" | "TRUE" | "True" => Ok(Value::Bool(true)),
            "0" | "f" | "false" | "FALSE" | "False" => Ok(Value::Bool(false)),
            other => Err(EvalError::invalid_argument("bool", format!("cannot parse '{other}'"))),
        },
        _ => Err(EvalError::no_overload("bool", args)),
    }
}

fn to_timestamp(args: &[Value]) -> Result<Value, EvalError> {
    match unary("timestamp", args)? {
        Value::Timestamp(t) => Ok(Value::Timestamp(*t)),
        Value::String(s) => parse_timestamp(s)
            .map(Value::Timestamp)
            .map_err(|message| EvalError::invalid_argument("timestamp", message)),
        Value::Int(secs) => DateTime::from_timestamp(*secs, 0)
            .ok_or(overflow("timestamp conversion"))
            .and_then(check_timestamp),
        _ => Err(EvalError::no_overload("timestamp", args)),
    }
}

fn to_duration(args: &[Value]) -> Result<Value, EvalError> {
    match unary("duration", args)? {
        Value::Duration(d) => Ok(Value::Duration(*d)),
        Value::String(s) => parse_duration(s)
            .map(Value::Duration)
            .map_err(|message| EvalError::invalid_argument("duration", message)),
        _ => Err(EvalError::no_overload("duration", args)),
    }
}

/// Parse an RFC 3339 timestamp, normalised to UTC.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>, String> {
    let t = DateTime::parse_from_rfc3339(s)
        .map_err(|e| format!("cannot parse timestamp '{s}': {e}"))?
        .with_timezone(&Utc);
    if (1..=9999).contains(&t.year()) {
        Ok(t.fixed_offset())
    } else {
        Err(format!("timestamp '{s}' is out of range"))
    }
}

/// Parse a duration such as `1h30m`, `1.5s`, `-250ms` or `0`.
pub(crate) fn parse_duration(s: &str) -> Result<TimeDelta, String> {
    let invalid = || format!("cannot parse duration '{s}'");
    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest == "0" {
        return Ok(TimeDelta::zero());
    }
    if rest.is_empty() {
        return Err(invalid());
    }
    let mut total: i128 = 0;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(digits_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale: i128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut nanos = whole.checked_mul(scale).ok_or_else(invalid)?;
        if !fraction.is_empty() {
            let digits = u32::try_from(fraction.len().min(18)).map_err(|_| invalid())?;
            let frac: i128 = fraction[..digits as usize].parse().map_err(|_| invalid())?;
            nanos += frac * scale / 10_i128.pow(digits);
        }
        total = total.checked_add(nanos).ok_or_else(invalid)?;
        rest = tail;
    }
    if negative {
        total = -total;
    }
    i64::try_from(total)
        .map(TimeDelta::nanoseconds)
        .map_err(|_| format!("duration '{s}' is out of range"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Standard library: timestamp and duration accessors
// ═══════════════════════════════════════════════════════════════════════════════

type TimestampField = fn(&DateTime<FixedOffset>) -> i64;

fn declare_time(d: &mut Declarations, default_zone: Zone) {
    let timestamp_fields: [(&str, TimestampField); 10] = [
        ("getFullYear", |t| i64::from(t.year())),
        ("getMonth", |t| i64::from(t.month0())),
        ("getDayOfMonth", |t| i64::from(t.day0())),
        ("getDate", |t| i64::from(t.day())),
        ("getDayOfWeek", |t| i64::from(t.weekday().num_days_from_sunday())),
        ("getDayOfYear", |t| i64::from(t.ordinal0())),
        ("getHours", |t| i64::from(t.hour())),
        ("getMinutes", |t| i64::from(t.minute())),
        ("getSeconds", |t| i64::from(t.second())),
        ("getMilliseconds", |t| i64::from(t.timestamp_subsec_millis())),
    ];
    for (name, field) in timestamp_fields {
        d.push(
            name,
            Overload::member(
                format!("timestamp_{name}"),
                vec![Type::Timestamp],
                Type::Int,
                move |args| timestamp_accessor(name, field, default_zone, args),
            ),
        );
        d.push(
            name,
            Overload::member(
                format!("timestamp_{name}_with_tz"),
                vec![Type::Timestamp, Type::String],
                Type::Int,
                move |args| timestamp_accessor(name, field, default_zone, args),
            ),
        );
    }

    let duration_fields: [(&str, fn(&TimeDelta) -> i64); 4] = [
        ("getHours", TimeDelta::num_hours),
        ("getMinutes", TimeDelta::num_minutes),
        ("getSeconds", TimeDelta::num_seconds),
        ("getMilliseconds", |d| i64::from(d.subsec_nanos() / 1_000_000)),
    ];
    for (name, field) in duration_fields {
        d.push(
            name,
            Overload::member(
                format!("duration_{name}"),
                vec![Type::Duration],
                Type::Int,
                move |args| match unary(name, args)? {
                    Value::Duration(d) => Ok(Value::Int(field(d))),
                    _ => Err(EvalError::no_overload(name, args)),
                },
            ),
        );
    }
}

fn timestamp_accessor(
    name: &str,
    field: TimestampField,
    default_zone: Zone,
    args: &[Value],
) -> Result<Value, EvalError> {
    let (t, zone) = match args {
        [Value::Timestamp(t)] => (t, default_zone),
        [Value::Timestamp(t), Value::String(z)] => (
            t,
            Zone::parse(z).map_err(|message| EvalError::invalid_argument(name, message))?,
        ),
        _ => return Err(EvalError::no_overload(name, args)),
    };
    Ok(Value::Int(field(&zone.localize(t))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Strings extension
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_strings_ext(d: &mut Declarations) {
    use Type::{Int, String};

    d.member("charAt", "string_char_at_int", vec![String, Int], String, char_at);
    d.member("indexOf", "string_index_of_string", vec![String, String], Int, index_of);
    d.member(
        "indexOf",
        "string_index_of_string_int",
        vec![String, String, Int],
        Int,
        index_of,
    );
    d.member(
        "lastIndexOf",
        "string_last_index_of_string",
        vec![String, String],
        Int,
        last_index_of,
    );
    d.member(
        "lastIndexOf",
        "string_last_index_of_string_int",
        vec![String, String, Int],
        Int,
        last_index_of,
    );
    d.member("lowerAscii", "string_lower_ascii", vec![String], String, |args| {
        let s = string_arg("lowerAscii", unary("lowerAscii", args)?)?;
        Ok(runtime::string(s.to_ascii_lowercase()))
    });
    d.member("upperAscii", "string_upper_ascii", vec![String], String, |args| {
        let s = string_arg("upperAscii", unary("upperAscii", args)?)?;
        Ok(runtime::string(s.to_ascii_uppercase()))
    });
    d.member(
        "replace",
        "string_replace_string_string",
        vec![String, String, String],
        String,
        replace,
    );
    d.member(
        "replace",
        "string_replace_string_string_int",
        vec![String, String, String, Int],
        String,
        replace,
    );
    d.member("split", "string_split_string", vec![String, String], Type::list(String), split);
    d.member(
        "split",
        "string_split_string_int",
        vec![String, String, Int],
        Type::list(String),
        split,
    );
    d.member("substring", "string_substring_int", vec![String, Int], String, substring);
    d.member(
        "substring",
        "string_substring_int_int",
        vec![String, Int, Int],
        String,
        substring,
    );
    d.member("trim", "string_trim", vec![String], String, |args| {
        let s = string_arg("trim", unary("trim", args)?)?;
        Ok(runtime::string(s.trim()))
    });
    d.member("join", "list_join", vec![Type::list(String)], String, join);
    d.member("join", "list_join_string", vec![Type::list(String), String], String, join);
    d.member("reverse", "string_reverse", vec![String], String, |args| {
        let s = string_arg("reverse", unary("reverse", args)?)?;
        Ok(runtime::string(s.chars().rev().collect::<std::string::String>()))
    });
    d.global("strings.quote", "strings_quote", vec![String], String, |args| {
        let s = string_arg("strings.quote", unary("strings.quote", args)?)?;
        Ok(runtime::string(quote(s)))
    });
}

fn code_point_index(function: &str, i: i64, len: usize) -> Result<usize, EvalError> {
    usize::try_from(i)
        .ok()
        .filter(|&p| p <= len)
        .ok_or_else(|| EvalError::invalid_argument(function, format!("index out of range: {i}")))
}

fn char_at(args: &[Value]) -> Result<Value, EvalError> {
    let (s, i) = binary("charAt", args)?;
    let chars: Vec<char> = string_arg("charAt", s)?.chars().collect();
    let p = code_point_index("charAt", int_arg("charAt", i)?, chars.len())?;
    Ok(runtime::string(chars.get(p).map(|c| c.to_string()).unwrap_or_default()))
}

/// Code-point position of `needle` in `haystack` at or after `from`.
fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from);
    }
    (from..=haystack.len().saturating_sub(needle.len()))
        .find(|&p| haystack.get(p..p + needle.len()) == Some(needle))
}

fn index_of(args: &[Value]) -> Result<Value, EvalError> {
    let (s, sub, start) = match args {
        [s, sub] => (s, sub, 0),
        [s, sub, start] => (s, sub, int_arg("indexOf", start)?),
        _ => return Err(EvalError::no_overload("indexOf", args)),
    };
    let hay: Vec<char> = string_arg("indexOf", s)?.chars().collect();
    let needle: Vec<char> = string_arg("indexOf", sub)?.chars().collect();
    let from = code_point_index("indexOf", start, hay.len())?;
    let found = find_chars(&hay, &needle, from).map_or(-1, |p| i64::try_from(p).unwrap_or(-1));
    Ok(Value::Int(found))
}

fn last_index_of(args: &[Value]) -> Result<Value, EvalError> {
    let (s, sub) = match args {
        [s, sub] | [s, sub, _] => (s, sub),
        _ => return Err(EvalError::no_overload("lastIndexOf", args)),
    };
    let hay: Vec<char> = string_arg("lastIndexOf", s)?.chars().collect();
    let needle: Vec<char> = string_arg("lastIndexOf", sub)?.chars().collect();
    let last_start = match args {
        [_, _, end] => code_point_index("lastIndexOf", int_arg("lastIndexOf", end)?, hay.len())?,
        _ => hay.len(),
    };
    if needle.len() > hay.len() {
        return Ok(Value::Int(-1));
    }
    let upper = last_start.min(hay.len() - needle.len());
    let found = (0..=upper)
        .rev()
        .find(|&p| hay[p..p + needle.len()] == needle[..])
        .map_or(-1, |p| i64::try_from(p).unwrap_or(-1));
    Ok(Value::Int(found))
}

fn replace(args: &[Value]) -> Result<Value, EvalError> {
    let (s, from, to, limit) = match args {
        [s, from, to] => (s, from, to, -1),
        [s, from, to, n] => (s, from, to, int_arg("replace", n)?),
        _ => return Err(EvalError::no_overload("replace", args)),
    };
    let (s, from, to) = (
        string_arg("replace", s)?,
        string_arg("replace", from)?,
        string_arg("replace", to)?,
    );
    let out = match usize::try_from(limit) {
        Ok(n) => s.replacen(from, to, n),
        Err(_) => s.replace(from, to),
    };
    Ok(runtime::string(out))
}

fn split(args: &[Value]) -> Result<Value, EvalError> {
    let (s, sep, limit) = match args {
        [s, sep] => (s, sep, -1),
        [s, sep, n] => (s, sep, int_arg("split", n)?),
        _ => return Err(EvalError::no_overload("split", args)),
    };
    let (s, sep) = (string_arg("split", s)?, string_arg("split", sep)?);
    if limit == 0 {
        return Ok(runtime::list(Vec::new()));
    }
    let parts: Vec<Value> = if sep.is_empty() {
        let chars: Vec<std::string::String> = s.chars().map(String::from).collect();
        match usize::try_from(limit) {
            Ok(n) if n < chars.len() => {
                let mut head: Vec<Value> =
                    chars[..n - 1].iter().map(|c| runtime::string(c.as_str())).collect();
                head.push(runtime::string(chars[n - 1..].concat()));
                head
            }
            _ => chars.into_iter().map(runtime::string).collect(),
        }
    } else {
        match usize::try_from(limit) {
            Ok(n) => s.splitn(n, sep).map(runtime::string).collect(),
            Err(_) => s.split(sep).map(runtime::string).collect(),
        }
    };
    Ok(runtime::list(parts))
}

fn substring(args: &[Value]) -> Result<Value, EvalError> {
    let (s, start, end) = match args {
        [s, start] => (s, int_arg("substring", start)?, None),
        [s, start, end] => (s, int_arg("substring", start)?, Some(int_arg("substring", end)?)),
        _ => return Err(EvalError::no_overload("substring", args)),
    };
    let chars: Vec<char> = string_arg("substring", s)?.chars().collect();
    let start = code_point_index("substring", start, chars.len())?;
    let end = match end {
        Some(e) => code_point_index("substring", e, chars.len())?,
        None => chars.len(),
    };
    if start > end {
        return Err(EvalError::invalid_argument(
            "substring",
            format!("invalid substring range: start {start} > end {end}"),
        ));
    }
    Ok(runtime::string(chars[start..end].iter().collect::<std::string::String>()))
}

fn join(args: &[Value]) -> Result<Value, EvalError> {
    let (list, sep) = match args {
        [list] => (list, ""),
        [list, sep] => (list, string_arg("join", sep)?),
        _ => return Err(EvalError::no_overload("join", args)),
    };
    let parts = list_arg("join", list)?
        .iter()
        .map(|v| string_arg("join", v))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runtime::string(parts.join(sep)))
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{07}' => out.push_str("\\a"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\u{0B}' => out.push_str("\\v"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lists extension
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_lists_ext(d: &mut Declarations) {
    d.member(
        "slice",
        "list_slice",
        vec![list_a(), Type::Int, Type::Int],
        list_a(),
        |args| match args {
            [list, start, end] => {
                let items = list_arg("slice", list)?;
                let start = code_point_index("slice", int_arg("slice", start)?, items.len())?;
                let end = code_point_index("slice", int_arg("slice", end)?, items.len())?;
                if start > end {
                    return Err(EvalError::invalid_argument(
                        "slice",
                        format!("start index {start} must be less than or equal to end index {end}"),
                    ));
                }
                Ok(runtime::list(items[start..end].to_vec()))
            }
            _ => Err(EvalError::no_overload("slice", args)),
        },
    );
    d.member("flatten", "list_flatten", vec![Type::list(list_a())], list_a(), |args| {
        Ok(runtime::list(flatten(list_arg("flatten", unary("flatten", args)?)?, 1)))
    });
    d.member(
        "flatten",
        "list_flatten_int",
        vec![list_a(), Type::Int],
        Type::list(Type::Dyn),
        |args| {
            let (list, depth) = binary("flatten", args)?;
            let depth = usize::try_from(int_arg("flatten", depth)?)
                .map_err(|_| EvalError::invalid_argument("flatten", "level must be non-negative"))?;
            Ok(runtime::list(flatten(list_arg("flatten", list)?, depth)))
        },
    );
    d.member("distinct", "list_distinct", vec![list_a()], list_a(), |args| {
        let mut out: Vec<Value> = Vec::new();
        for v in list_arg("distinct", unary("distinct", args)?)? {
            if !out.contains(v) {
                out.push(v.clone());
            }
        }
        Ok(runtime::list(out))
    });
    d.member("reverse", "list_reverse", vec![list_a()], list_a(), |args| {
        let items = list_arg("reverse", unary("reverse", args)?)?;
        Ok(runtime::list(items.iter().rev().cloned().collect()))
    });
    d.member("sort", "list_sort", vec![list_a()], list_a(), sort);
    d.member("first", "list_first", vec![list_a()], Type::optional(A), |args| {
        let items = list_arg("first", unary("first", args)?)?;
        Ok(optional(items.first().cloned()))
    });
    d.member("last", "list_last", vec![list_a()], Type::optional(A), |args| {
        let items = list_arg("last", unary("last", args)?)?;
        Ok(optional(items.last().cloned()))
    });
    d.global("lists.range", "lists_range", vec![Type::Int], Type::list(Type::Int), |args| {
        let n = int_arg("lists.range", unary("lists.range", args)?)?;
        if n > MAX_LIST_RANGE {
            return Err(EvalError::invalid_argument(
                "lists.range",
                format!("size {n} exceeds the maximum of {MAX_LIST_RANGE}"),
            ));
        }
        Ok(runtime::list((0..n.max(0)).map(Value::Int).collect()))
    });
}

fn flatten(items: &[Value], depth: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len());
    for v in items {
        match v {
            Value::List(inner) if depth > 0 => out.extend(flatten(inner, depth - 1)),
            other => out.push(other.clone()),
        }
    }
    out
}

fn sort(args: &[Value]) -> Result<Value, EvalError> {
    let items = list_arg("sort", unary("sort", args)?)?;
    let mut sorted = items.to_vec();
    if let Some(first) = sorted.first() {
        let comparable = |v: &Value| {
            type_name(first) == type_name(v) || (is_number(first) && is_number(v))
        };
        if let Some(bad) = sorted.iter().find(|v| !comparable(v)) {
            return Err(EvalError::invalid_argument(
                "sort",
                format!(
                    "list elements must have the same type: found '{}' and '{}'",
                    type_name(first),
                    type_name(bad)
                ),
            ));
        }
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Ok(runtime::list(sorted))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Math extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Functions whose calls the checker types with a dedicated rule.
pub(crate) const MATH_EXTREMA: [&str; 2] = ["math.greatest", "math.least"];

fn declare_math_ext(d: &mut Declarations) {
    use Type::{Bool, Double, Int, Uint};

    d.push(
        "math.greatest",
        Overload::global("math_greatest", vec![Type::Dyn], Type::Dyn, |args| {
            extremum("math.greatest", args, Ordering::Greater)
        })
        .variadic(),
    );
    d.push(
        "math.least",
        Overload::global("math_least", vec![Type::Dyn], Type::Dyn, |args| {
            extremum("math.least", args, Ordering::Less)
        })
        .variadic(),
    );

    for (suffix, ty) in [("int", Int), ("uint", Uint), ("double", Double)] {
        d.global("math.abs", &format!("math_abs_{suffix}"), vec![ty.clone()], ty.clone(), |args| {
            match unary("math.abs", args)? {
                Value::Int(i) => i.checked_abs().map(Value::Int).ok_or(overflow("math.abs")),
                Value::UInt(u) => Ok(Value::UInt(*u)),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                _ => Err(EvalError::no_overload("math.abs", args)),
            }
        });
        d.global("math.sign", &format!("math_sign_{suffix}"), vec![ty.clone()], ty.clone(), |args| {
            match unary("math.sign", args)? {
                Value::Int(i) => Ok(Value::Int(i.signum())),
                Value::UInt(u) => Ok(Value::UInt(u64::from(*u != 0))),
                Value::Float(f) if f.is_nan() || *f == 0.0 => Ok(Value::Float(*f)),
                Value::Float(f) => Ok(Value::Float(f.signum())),
                _ => Err(EvalError::no_overload("math.sign", args)),
            }
        });
        d.global("math.sqrt", &format!("math_sqrt_{suffix}"), vec![ty], Double, |args| {
            match to_double(args)? {
                Value::Float(f) => Ok(Value::Float(f.sqrt())),
                _ => Err(EvalError::no_overload("math.sqrt", args)),
            }
        });
    }

    let rounding: [(&str, fn(f64) -> f64); 4] = [
        ("math.ceil", f64::ceil),
        ("math.floor", f64::floor),
        ("math.round", f64::round),
        ("math.trunc", f64::trunc),
    ];
    for (name, op) in rounding {
        d.push(
            name,
            Overload::global(name.replace('.', "_"), vec![Double], Double, move |args| {
                match unary(name, args)? {
                    Value::Float(f) => Ok(Value::Float(op(*f))),
                    _ => Err(EvalError::no_overload(name, args)),
                }
            }),
        );
    }

    let tests: [(&str, fn(f64) -> bool); 3] = [
        ("math.isNaN", f64::is_nan),
        ("math.isInf", f64::is_infinite),
        ("math.isFinite", f64::is_finite),
    ];
    for (name, test) in tests {
        d.push(
            name,
            Overload::global(name.replace('.', "_"), vec![Double], Bool, move |args| {
                match unary(name, args)? {
                    Value::Float(f) => Ok(Value::Bool(test(*f))),
                    _ => Err(EvalError::no_overload(name, args)),
                }
            }),
        );
    }

    declare_bit_ops(d);
}

fn extremum(function: &str, args: &[Value], want: Ordering) -> Result<Value, EvalError> {
    let values = match args {
        [Value::List(items)] => items.as_slice(),
        _ => args,
    };
    let mut best: Option<&Value> = None;
    for v in values {
        if !is_number(v) {
            return Err(EvalError::no_overload(function, std::slice::from_ref(v)));
        }
        best = match best {
            Some(b) if v.partial_cmp(b) != Some(want) => Some(b),
            _ => Some(v),
        };
    }
    best.cloned()
        .ok_or_else(|| EvalError::invalid_argument(function, "requires at least one argument"))
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn declare_bit_ops(d: &mut Declarations) {
    use Type::{Int, Uint};

    let binary_ops: [(&str, fn(u64, u64) -> u64); 3] = [
        ("math.bitAnd", |a, b| a & b),
        ("math.bitOr", |a, b| a | b),
        ("math.bitXor", |a, b| a ^ b),
    ];
    for (name, op) in binary_ops {
        for (suffix, ty) in [("int", Int), ("uint", Uint)] {
            d.push(
                name,
                Overload::global(
                    format!("{}_{suffix}", name.replace('.', "_")),
                    vec![ty.clone(), ty.clone()],
                    ty,
                    move |args| match binary(name, args)? {
                        (Value::Int(a), Value::Int(b)) => {
                            Ok(Value::Int(op(*a as u64, *b as u64) as i64))
                        }
                        (Value::UInt(a), Value::UInt(b)) => Ok(Value::UInt(op(*a, *b))),
                        _ => Err(EvalError::no_overload(name, args)),
                    },
                ),
            );
        }
    }
    d.global("math.bitNot", "math_bitNot_int", vec![Int], Int, bit_not);
    d.global("math.bitNot", "math_bitNot_uint", vec![Uint], Uint, bit_not);

    for (name, left) in [("math.bitShiftLeft", true), ("math.bitShiftRight", false)] {
        for (suffix, ty) in [("int", Int), ("uint", Uint)] {
            d.push(
                name,
                Overload::global(
                    format!("{}_{suffix}", name.replace('.', "_")),
                    vec![ty.clone(), Int],
                    ty,
                    move |args| {
                        let (value, by) = binary(name, args)?;
                        let by = u32::try_from(int_arg(name, by)?)
                            .map_err(|_| EvalError::invalid_argument(name, "negative offset"))?;
                        let shift = |bits: u64| {
                            if by >= 64 {
                                0
                            } else if left {
                                bits << by
                            } else {
                                bits >> by
                            }
                        };
                        match value {
                            Value::Int(i) => Ok(Value::Int(shift(*i as u64) as i64)),
                            Value::UInt(u) => Ok(Value::UInt(shift(*u))),
                            _ => Err(EvalError::no_overload(name, args)),
                        }
                    },
                ),
            );
        }
    }
}

fn bit_not(args: &[Value]) -> Result<Value, EvalError> {
    match unary("math.bitNot", args)? {
        Value::Int(i) => Ok(Value::Int(!i)),
        Value::UInt(u) => Ok(Value::UInt(!u)),
        _ => Err(EvalError::no_overload("math.bitNot", args)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sets extension
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_sets_ext(d: &mut Declarations) {
    let lists = || vec![list_a(), list_a()];
    d.global("sets.contains", "list_sets_contains_list", lists(), Type::Bool, |args| {
        let (a, b) = binary("sets.contains", args)?;
        let (a, b) = (list_arg("sets.contains", a)?, list_arg("sets.contains", b)?);
        Ok(Value::Bool(is_subset(b, a)))
    });
    d.global("sets.equivalent", "list_sets_equivalent_list", lists(), Type::Bool, |args| {
        let (a, b) = binary("sets.equivalent", args)?;
        let (a, b) = (list_arg("sets.equivalent", a)?, list_arg("sets.equivalent", b)?);
        Ok(Value::Bool(is_subset(a, b) && is_subset(b, a)))
    });
    d.global("sets.intersects", "list_sets_intersects_list", lists(), Type::Bool, |args| {
        let (a, b) = binary("sets.intersects", args)?;
        let (a, b) = (list_arg("sets.intersects", a)?, list_arg("sets.intersects", b)?);
        Ok(Value::Bool(b.iter().any(|x| a.contains(x))))
    });
}

fn is_subset(sub: &[Value], of: &[Value]) -> bool {
    sub.iter().all(|x| of.contains(x))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Optional types
// ═══════════════════════════════════════════════════════════════════════════════

/// An optional value: an empty list for `none`, a singleton for a value.
fn optional(value: Option<Value>) -> Value {
    runtime::list(value.into_iter().collect())
}

fn optional_arg<'a>(function: &str, value: &'a Value) -> Result<Option<&'a Value>, EvalError> {
    match value {
        Value::List(items) if items.len() <= 1 => Ok(items.first()),
        other => Err(EvalError::no_overload(function, std::slice::from_ref(other))),
    }
}

/// The zero value of each kind: `0`, `""`, `[]`, `false`, `null`, …
fn is_zero(v: &Value) -> bool {
    #[allow(unreachable_patterns)]
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Int(i) => *i == 0,
        Value::UInt(u) => *u == 0,
        Value::Float(f) => *f == 0.0,
        Value::String(s) => s.is_empty(),
        Value::Bytes(b) => b.is_empty(),
        Value::List(l) => l.is_empty(),
        Value::Map(m) => m.map.is_empty(),
        Value::Duration(d) => d.is_zero(),
        Value::Timestamp(t) => t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0,
        _ => false,
    }
}

fn declare_optional_ext(d: &mut Declarations) {
    d.global("optional.of", "optional_of", vec![A], Type::optional(A), |args| {
        Ok(optional(Some(unary("optional.of", args)?.clone())))
    });
    d.global("optional.none", "optional_none", vec![], Type::optional(A), |_| {
        Ok(optional(None))
    });
    d.global(
        "optional.ofNonZeroValue",
        "optional_of_non_zero_value",
        vec![A],
        Type::optional(A),
        |args| {
            let v = unary("optional.ofNonZeroValue", args)?;
            Ok(optional(Some(v.clone()).filter(|v| !is_zero(v))))
        },
    );
    d.member("hasValue", "optional_has_value", vec![Type::optional(A)], Type::Bool, |args| {
        let o = optional_arg("hasValue", unary("hasValue", args)?)?;
        Ok(Value::Bool(o.is_some()))
    });
    d.member("value", "optional_value", vec![Type::optional(A)], A, |args| {
        optional_arg("value", unary("value", args)?)?
            .cloned()
            .ok_or(EvalError::EmptyOptional)
    });
    d.member(
        "orValue",
        "optional_or_value",
        vec![Type::optional(A), A],
        A,
        |args| {
            let (o, alternative) = binary("orValue", args)?;
            Ok(optional_arg("orValue", o)?.unwrap_or(alternative).clone())
        },
    );
    d.member(
        "or",
        "optional_or_optional",
        vec![Type::optional(A), Type::optional(A)],
        Type::optional(A),
        |args| {
            let (o, alternative) = binary("or", args)?;
            match optional_arg("or", o)? {
                Some(_) => Ok(o.clone()),
                None => optional_arg("or", alternative).map(|_| alternative.clone()),
            }
        },
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Encoders extension
// ═══════════════════════════════════════════════════════════════════════════════

fn declare_encoders_ext(d: &mut Declarations) {
    d.global("base64.encode", "base64_encode_bytes", vec![Type::Bytes], Type::String, |args| {
        match unary("base64.encode", args)? {
            Value::Bytes(b) => Ok(runtime::string(STANDARD.encode(b.as_slice()))),
            _ => Err(EvalError::no_overload("base64.encode", args)),
        }
    });
    d.global("base64.decode", "base64_decode_string", vec![Type::String], Type::Bytes, |args| {
        let s = string_arg("base64.decode", unary("base64.decode", args)?)?;
        STANDARD
            .decode(s)
            .or_else(|_| STANDARD_NO_PAD.decode(s))
            .map(runtime::bytes)
            .map_err(|e| EvalError::invalid_argument("base64.decode", e.to_string()))
    });
}
