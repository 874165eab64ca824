//! Small expression language used to drive latency and error injection.
//!
//! Expressions are compiled once at startup and evaluated per request against
//! an [`EvalContext`]. The namespace is fixed:
//!
//! - variables: `active_requests`, `t` (whole seconds since start), `pi`
//! - functions: `rand()` (uniform in `[0, 1)`), `sin(x)`
//!
//! Literals are numbers, single or double quoted strings and `true`/`false`.

mod context;
mod lexer;
mod parser;

pub use context::{ActiveGuard, ActiveRequests, ContextSource, EvalContext};

use lexer::Operator;
use parser::Node;
use rand::Rng;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("expression is empty")]
    Empty,
    #[error("unexpected character '{found}' at position {position}")]
    UnexpectedCharacter { position: usize, found: char },
    #[error("unterminated string starting at position {position}")]
    UnterminatedString { position: usize },
    #[error("invalid number '{text}' at position {position}")]
    InvalidNumber { position: usize, text: String },
    #[error("unexpected token '{found}' at position {position}")]
    UnexpectedToken { position: usize, found: String },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown function: {0}")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("unknown variable name: {0}")]
    UnknownVariable(String),
    #[error("{function}() expects {expected} argument(s), got {found}")]
    Arity {
        function: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{operation} expects {expected}, got {found}")]
    Type {
        operation: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{0}")]
    UnexpectedResult(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
        }
    }

    fn number(self, operation: impl Into<String>) -> Result<f64, EvalError> {
        match self {
            Value::Number(n) => Ok(n),
            other => Err(type_error(operation, "a number", &other)),
        }
    }

    fn boolean(self, operation: impl Into<String>) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(type_error(operation, "a boolean", &other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => f.write_str(s),
        }
    }
}

fn type_error(operation: impl Into<String>, expected: &'static str, found: &Value) -> EvalError {
    EvalError::Type {
        operation: operation.into(),
        expected,
        found: found.type_name(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Rand,
    Sin,
}

impl Function {
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        match name {
            "rand" => Some(Function::Rand),
            "sin" => Some(Function::Sin),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Function::Rand => "rand",
            Function::Sin => "sin",
        }
    }

    fn arity(self) -> usize {
        match self {
            Function::Rand => 0,
            Function::Sin => 1,
        }
    }

    fn call(self, args: Vec<Value>) -> Result<Value, EvalError> {
        if args.len() != self.arity() {
            return Err(EvalError::Arity {
                function: self.name(),
                expected: self.arity(),
                found: args.len(),
            });
        }

        match self {
            Function::Rand => Ok(Value::Number(rand::thread_rng().gen::<f64>())),
            Function::Sin => {
                let x = args[0].clone().number("sin()")?;
                Ok(Value::Number(x.sin()))
            }
        }
    }
}

/// A compiled expression. Cheap to clone and safe to evaluate from many
/// tasks at once; evaluation never mutates it.
#[derive(Debug, Clone)]
pub struct Expression {
    source: Arc<str>,
    root: Arc<Node>,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let root = parser::parse(source)?;
        Ok(Self {
            source: Arc::from(source),
            root: Arc::new(root),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, context: &EvalContext) -> Result<Value, EvalError> {
        eval(&self.root, context)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(node: &Node, context: &EvalContext) -> Result<Value, EvalError> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Variable(name) => context
            .variable(name)
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        Node::Call { function, args } => {
            let args = args
                .iter()
                .map(|arg| eval(arg, context))
                .collect::<Result<Vec<_>, _>>()?;
            function.call(args)
        }
        Node::Unary { op, operand } => {
            let value = eval(operand, context)?;
            match op {
                Operator::Sub => Ok(Value::Number(-value.number("unary -")?)),
                Operator::Not => Ok(Value::Bool(!value.boolean("!")?)),
                other => unreachable!("parser never emits unary {}", other.symbol()),
            }
        }
        Node::Binary { op: Operator::And, lhs, rhs } => {
            if !eval(lhs, context)?.boolean("&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(rhs, context)?.boolean("&&")?))
        }
        Node::Binary { op: Operator::Or, lhs, rhs } => {
            if eval(lhs, context)?.boolean("||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(rhs, context)?.boolean("||")?))
        }
        Node::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, context)?;
            let rhs = eval(rhs, context)?;
            binary(*op, lhs, rhs)
        }
        Node::Ternary { condition, then, otherwise } => {
            if eval(condition, context)?.boolean("?:")? {
                eval(then, context)
            } else {
                eval(otherwise, context)
            }
        }
    }
}

fn binary(op: Operator, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    let symbol = op.symbol();
    match op {
        Operator::Eq => Ok(Value::Bool(lhs == rhs)),
        Operator::Ne => Ok(Value::Bool(lhs != rhs)),
        Operator::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (a @ Value::Str(_), b) | (a, b @ Value::Str(_)) => Ok(Value::Str(format!("{}{}", a, b))),
            (a, _) => Err(type_error(symbol, "numbers or strings", &a)),
        },
        Operator::Sub | Operator::Mul | Operator::Div | Operator::Rem | Operator::Pow => {
            let a = lhs.number(symbol)?;
            let b = rhs.number(symbol)?;
            Ok(Value::Number(match op {
                Operator::Sub => a - b,
                Operator::Mul => a * b,
                Operator::Div => a / b,
                Operator::Rem => a % b,
                _ => a.powf(b),
            }))
        }
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            let ordering = match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                (Value::Number(_), other) | (Value::Str(_), other) | (other, _) => {
                    return Err(type_error(symbol, "two numbers or two strings", other));
                }
            };
            let result = match ordering {
                None => false,
                Some(ordering) => match op {
                    Operator::Lt => ordering.is_lt(),
                    Operator::Le => ordering.is_le(),
                    Operator::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
            };
            Ok(Value::Bool(result))
        }
        Operator::And | Operator::Or | Operator::Not => {
            unreachable!("{} is handled before operands are evaluated", symbol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx() -> EvalContext {
        EvalContext::new(Duration::from_millis(12_700), 4)
    }

    fn eval_str(source: &str) -> Result<Value, EvalError> {
        Expression::compile(source).unwrap().evaluate(&ctx())
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_str("1 + 2 * 3"), Ok(Value::Number(7.0)));
        assert_eq!(eval_str("(1 + 2) * 3"), Ok(Value::Number(9.0)));
        assert_eq!(eval_str("7 % 4 - -1"), Ok(Value::Number(4.0)));
        assert_eq!(eval_str("2 ** 10 / 4"), Ok(Value::Number(256.0)));
        assert_eq!(eval_str("-2 ** 2"), Ok(Value::Number(-4.0)));
        assert_eq!(eval_str("2 ** -1"), Ok(Value::Number(0.5)));
    }

    #[test]
    fn test_variables() {
        assert_eq!(eval_str("active_requests * 10"), Ok(Value::Number(40.0)));
        assert_eq!(eval_str("t"), Ok(Value::Number(12.0)));
        assert_eq!(eval_str("pi"), Ok(Value::Number(std::f64::consts::PI)));
        assert_eq!(eval_str("nope + 1"), Err(EvalError::UnknownVariable("nope".into())));
    }

    #[test]
    fn test_boolean_logic() {
        assert_eq!(eval_str("active_requests > 3 && t < 60"), Ok(Value::Bool(true)));
        assert_eq!(eval_str("!(1 == 1) || 2 >= 3"), Ok(Value::Bool(false)));
        assert_eq!(eval_str("'a' < 'b'"), Ok(Value::Bool(true)));
        assert_eq!(eval_str("1 == 'x'"), Ok(Value::Bool(false)));
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        assert_eq!(eval_str("false && missing"), Ok(Value::Bool(false)));
        assert_eq!(eval_str("true || missing"), Ok(Value::Bool(true)));
        assert_eq!(eval_str("true && missing"), Err(EvalError::UnknownVariable("missing".into())));
    }

    #[test]
    fn test_ternary_and_strings() {
        assert_eq!(eval_str("active_requests > 2 ? 'CLOSE' : false"), Ok(Value::Str("CLOSE".into())));
        assert_eq!(eval_str("active_requests > 10 ? 503 : false"), Ok(Value::Bool(false)));
        assert_eq!(eval_str("'n=' + active_requests"), Ok(Value::Str("n=4".into())));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval_str("sin(0)"), Ok(Value::Number(0.0)));
        match eval_str("sin(pi / 2)") {
            Ok(Value::Number(n)) => assert!((n - 1.0).abs() < 1e-12),
            other => panic!("unexpected {:?}", other),
        }
        for _ in 0..100 {
            match eval_str("rand()") {
                Ok(Value::Number(n)) => assert!((0.0..1.0).contains(&n)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_function_arity_and_type_checked_at_evaluation() {
        assert_eq!(
            eval_str("sin(1, 2)"),
            Err(EvalError::Arity { function: "sin", expected: 1, found: 2 })
        );
        assert_eq!(
            eval_str("rand(1)"),
            Err(EvalError::Arity { function: "rand", expected: 0, found: 1 })
        );
        assert_eq!(
            eval_str("sin('x')"),
            Err(EvalError::Type {
                operation: "sin()".into(),
                expected: "a number",
                found: "string",
            })
        );
    }

    #[test]
    fn test_type_errors() {
        assert!(matches!(eval_str("true * 2"), Err(EvalError::Type { .. })));
        assert!(matches!(eval_str("1 && true"), Err(EvalError::Type { .. })));
        assert!(matches!(eval_str("1 < 'a'"), Err(EvalError::Type { .. })));
        assert!(matches!(eval_str("1 ? 2 : 3"), Err(EvalError::Type { .. })));
    }

    #[test]
    fn test_compile_errors() {
        assert_eq!(
            Expression::compile("tan(1)").unwrap_err(),
            CompileError::UnknownFunction("tan".into())
        );
        assert!(Expression::compile("1 +* 2").is_err());
    }

    #[test]
    fn test_concurrent_evaluation_of_shared_expression() {
        let expr = Expression::compile("active_requests * 2 + sin(0)").unwrap();
        std::thread::scope(|scope| {
            for n in 0..8u32 {
                let expr = &expr;
                scope.spawn(move || {
                    let context = EvalContext::new(Duration::ZERO, n);
                    for _ in 0..1000 {
                        assert_eq!(expr.evaluate(&context), Ok(Value::Number(n as f64 * 2.0)));
                    }
                });
            }
        });
        assert_eq!(expr.source(), "active_requests * 2 + sin(0)");
    }
}
