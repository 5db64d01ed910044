use crate::{ExecutionContext, Value};
use thiserror::Error;

/// Guard expression attached to an edge, evaluated against the execution
/// context to decide whether the edge is taken.
///
/// Grammar (no parentheses, `&&` only):
///   clause ::= path | exists(path) | path OP literal
///   OP     ::= == | != | <= | >= | < | >
///   literal ::= "string" | number | true | false | null
///
/// A bare path is a truthiness test. Paths are dot-separated context
/// lookups such as `classify.intent`.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    Truthy(String),
    Exists(String),
    Compare {
        path: String,
        op: CompareOp,
        literal: Value,
    },
    All(Vec<Guard>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("empty guard expression")]
    Empty,

    #[error("invalid literal: {0}")]
    BadLiteral(String),

    #[error("invalid path: {0}")]
    BadPath(String),

    #[error("malformed clause: {0}")]
    Malformed(String),
}

impl Guard {
    pub fn parse(src: &str) -> Result<Guard, GuardError> {
        let clauses: Vec<&str> = src.split("&&").map(str::trim).collect();
        if clauses.iter().any(|c| c.is_empty()) {
            return Err(GuardError::Empty);
        }
        let mut parsed = Vec::with_capacity(clauses.len());
        for clause in clauses {
            parsed.push(parse_clause(clause)?);
        }
        if parsed.len() == 1 {
            Ok(parsed.pop().unwrap_or(Guard::Truthy(String::new())))
        } else {
            Ok(Guard::All(parsed))
        }
    }

    pub fn eval(&self, ctx: &ExecutionContext) -> bool {
        match self {
            Guard::Truthy(path) => ctx.get(path).map(|v| truthy(&v)).unwrap_or(false),
            Guard::Exists(path) => ctx.contains(path),
            Guard::Compare { path, op, literal } => match ctx.get(path) {
                Some(value) => compare(&value, *op, literal),
                None => false,
            },
            Guard::All(clauses) => clauses.iter().all(|c| c.eval(ctx)),
        }
    }
}

fn parse_clause(clause: &str) -> Result<Guard, GuardError> {
    if let Some(inner) = clause
        .strip_prefix("exists(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let path = inner.trim();
        validate_path(path)?;
        return Ok(Guard::Exists(path.to_string()));
    }

    // Two-character operators have to win over their one-character prefixes.
    // Only the text before the first quote is scanned, so an operator
    // sequence inside a string literal is never mistaken for the operator.
    let scan_end = clause.find('"').unwrap_or(clause.len());
    for (token, op) in [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        ("<=", CompareOp::Le),
        (">=", CompareOp::Ge),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
    ] {
        if let Some(pos) = clause[..scan_end].find(token) {
            let path = clause[..pos].trim();
            let raw = clause[pos + token.len()..].trim();
            validate_path(path)?;
            return Ok(Guard::Compare {
                path: path.to_string(),
                op,
                literal: parse_literal(raw)?,
            });
        }
    }

    validate_path(clause)?;
    Ok(Guard::Truthy(clause.to_string()))
}

fn validate_path(path: &str) -> Result<(), GuardError> {
    let ok = !path.is_empty()
        && path.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if ok {
        Ok(())
    } else {
        Err(GuardError::BadPath(path.to_string()))
    }
}

fn parse_literal(raw: &str) -> Result<Value, GuardError> {
    if raw.is_empty() {
        return Err(GuardError::BadLiteral(raw.to_string()));
    }
    if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Ok(Value::String(inner.to_string()));
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    raw.parse::<f64>()
        .map(Value::Number)
        .map_err(|_| GuardError::BadLiteral(raw.to_string()))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Json(j) => match j {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            serde_json::Value::String(s) => !s.is_empty(),
            _ => true,
        },
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(value: &Value, op: CompareOp, literal: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_eq(value, literal),
        CompareOp::Ne => !loosely_eq(value, literal),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let (Some(lhs), Some(rhs)) = (value.as_f64(), literal.as_f64()) else {
                return false;
            };
            match op {
                CompareOp::Lt => lhs < rhs,
                CompareOp::Le => lhs <= rhs,
                CompareOp::Gt => lhs > rhs,
                CompareOp::Ge => lhs >= rhs,
                _ => unreachable!(),
            }
        }
    }
}

/// Equality that sees through the `Value::Json` wrapper so that guard
/// literals match values produced by JSON-speaking gateways.
fn loosely_eq(value: &Value, literal: &Value) -> bool {
    if let (Some(a), Some(b)) = (value.as_str(), literal.as_str()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (value.as_f64(), literal.as_f64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (value.as_bool(), literal.as_bool()) {
        return a == b;
    }
    if literal.is_null() {
        return value.is_null();
    }
    value == literal
}
