//! `Program`: Parse, check and evaluate one expression
//!
//! Evaluating a filter expression runs four ordered stages, each failing
//! with its own [`ExpressionError`] variant:
//!
//! 1. **Parse**: source text to syntax tree, by `cel_parser`
//! 2. **Type-check**: against the [`Environment`]
//! 3. **Result type**: the checked type must be exactly `bool`; `dyn` is
//!    rejected because it could only be confirmed at evaluation time
//! 4. **Evaluate**: by `cel_interpreter`, against an [`Activation`]
//!
//! Stages 1–3 happen once in [`Program::compile`]; a compiled program can be
//! evaluated any number of times.
//!
//! ```
//! use celfilter::{evaluate, Environment, EvaluationContext};
//!
//! let env = Environment::standard().unwrap();
//! let ctx = EvaluationContext::default();
//! assert_eq!(evaluate(&env, "size(desired.resources) == 0", &ctx).unwrap(), true);
//! ```

use crate::checker::{self, TypeError};
use crate::env::Environment;
use crate::filter::Stage;
use crate::functions::EvalError;
use crate::runtime::{type_name, Activation};
use crate::state::EvaluationContext;
use crate::types::Type;
use crate::{MAX_EXPRESSION_DEPTH, MAX_EXPRESSION_LENGTH};
use cel_interpreter::Value;
use std::fmt;

/// The source is not a syntactically valid expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Rejected by the parser.
    #[error("syntax error: {message}")]
    Syntax {
        /// Parser message.
        message: String,
    },
    /// Longer than [`MAX_EXPRESSION_LENGTH`] bytes.
    #[error("expression length is {length}, but maximum allowed is {MAX_EXPRESSION_LENGTH}")]
    TooLong {
        /// Source length in bytes.
        length: usize,
    },
    /// Brackets nest deeper than [`MAX_EXPRESSION_DEPTH`].
    #[error("expression nesting exceeds the maximum depth of {MAX_EXPRESSION_DEPTH}")]
    TooDeep,
}

/// Reject sources the parser should never see.
fn check_limits(source: &str) -> Result<(), ParseError> {
    if source.len() > MAX_EXPRESSION_LENGTH {
        return Err(ParseError::TooLong {
            length: source.len(),
        });
    }
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in source.chars() {
        if let Some(q) = quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                _ if c == q => quote = None,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => {
                depth += 1;
                if depth > MAX_EXPRESSION_DEPTH {
                    return Err(ParseError::TooDeep);
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

fn parse(source: &str) -> Result<cel_parser::Expression, ParseError> {
    check_limits(source)?;
    cel_parser::parse(source).map_err(|e| ParseError::Syntax {
        message: e.to_string(),
    })
}

/// An expression failed one of the four stages.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    /// The source is not syntactically valid.
    #[error("cannot parse expression")]
    Parse(#[source] ParseError),
    /// The expression does not type-check.
    #[error("cannot type-check expression")]
    Check(#[source] TypeError),
    /// The expression type-checks but is not a boolean expression.
    #[error("expression must return a boolean, but will return {actual} instead")]
    ResultType {
        /// The checked result type.
        actual: Type,
    },
    /// Evaluation failed.
    #[error("cannot evaluate CEL program")]
    Eval(#[source] EvalError),
    /// Evaluation produced a non-boolean value.
    #[error("expression did not return a bool, but {actual}")]
    NotBool {
        /// Runtime type of the result.
        actual: String,
    },
}

impl ExpressionError {
    /// The stage that failed.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Parse(_) => Stage::Parse,
            Self::Check(_) => Stage::TypeCheck,
            Self::ResultType { .. } => Stage::ResultType,
            Self::Eval(_) | Self::NotBool { .. } => Stage::Evaluate,
        }
    }
}

/// A parsed and type-checked expression.
pub struct Program {
    source: String,
    program: cel_interpreter::Program,
    result_type: Type,
}

impl Program {
    /// Parse and type-check `source`, accepting any result type.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Parse`] or [`ExpressionError::Check`].
    pub fn check(env: &Environment, source: &str) -> Result<Self, ExpressionError> {
        let parsed = parse(source).map_err(ExpressionError::Parse)?;
        let result_type = checker::check(env, &parsed).map_err(ExpressionError::Check)?;
        let program = cel_interpreter::Program::compile(source).map_err(|e| {
            ExpressionError::Parse(ParseError::Syntax {
                message: e.to_string(),
            })
        })?;
        Ok(Self {
            source: source.to_string(),
            program,
            result_type,
        })
    }

    /// Parse and type-check `source`, requiring a `bool` result.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Parse`], [`ExpressionError::Check`] or
    /// [`ExpressionError::ResultType`].
    pub fn compile(env: &Environment, source: &str) -> Result<Self, ExpressionError> {
        let program = Self::check(env, source)?;
        if program.result_type != Type::Bool {
            return Err(ExpressionError::ResultType {
                actual: program.result_type,
            });
        }
        Ok(program)
    }

    /// Source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Checked result type.
    #[must_use]
    pub fn result_type(&self) -> &Type {
        &self.result_type
    }

    /// Evaluate to a value of any type.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Eval`] on runtime errors.
    pub fn evaluate(&self, activation: &Activation) -> Result<Value, ExpressionError> {
        self.program
            .execute(activation.context())
            .map_err(|e| {
                ExpressionError::Eval(EvalError::Execution {
                    message: e.to_string(),
                })
            })
    }

    /// Evaluate to a boolean.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Eval`] on runtime errors and
    /// [`ExpressionError::NotBool`] if the value is not a `bool`.
    pub fn evaluate_bool(&self, activation: &Activation) -> Result<bool, ExpressionError> {
        match self.evaluate(activation)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBool {
                actual: type_name(&other).to_string(),
            }),
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source", &self.source)
            .field("result_type", &self.result_type)
            .finish_non_exhaustive()
    }
}

/// Compile `source` and evaluate it against `ctx`.
///
/// # Errors
///
/// Returns the [`ExpressionError`] of the first stage that fails.
pub fn evaluate(
    env: &Environment,
    source: &str,
    ctx: &EvaluationContext,
) -> Result<bool, ExpressionError> {
    Program::compile(env, source)?.evaluate_bool(&ctx.activation(env))
}
