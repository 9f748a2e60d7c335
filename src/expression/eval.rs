//! Tree-walking evaluation of parsed expressions.
//!
//! Values are `Option<serde_json::Value>`: `None` is "undefined" (a missing
//! variable), `Some(Value::Null)` is an explicit null.

use serde_json::{Number, Value};
use std::cmp::Ordering;

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::ExpressionError;
use crate::types::Variables;

/// Walk a dotted path. Missing segments and null intermediates yield `None`;
/// a null leaf is returned as `Some(Null)`.
pub fn lookup_path<S: AsRef<str>>(variables: &Variables, segments: &[S]) -> Option<Value> {
    let (head, rest) = segments.split_first()?;
    let mut current = variables.get(head.as_ref())?;
    for segment in rest {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Boolean coercion used by conditions: undefined, null, false, 0, NaN and
/// the empty string are false.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

pub fn evaluate(expr: &Expr, variables: &Variables) -> Result<Option<Value>, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(Some(v.clone())),
        Expr::Path(segments) => Ok(lookup_path(variables, segments)),
        Expr::Unary(op, inner) => {
            let v = evaluate(inner, variables)?;
            match op {
                UnaryOp::Not => Ok(Some(Value::Bool(!is_truthy(v.as_ref())))),
                UnaryOp::Neg => {
                    let n = as_number(v.as_ref(), "-")?;
                    Ok(Some(negate(n)?))
                }
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let l = evaluate(lhs, variables)?;
            if !is_truthy(l.as_ref()) {
                return Ok(Some(Value::Bool(false)));
            }
            let r = evaluate(rhs, variables)?;
            Ok(Some(Value::Bool(is_truthy(r.as_ref()))))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let l = evaluate(lhs, variables)?;
            if is_truthy(l.as_ref()) {
                return Ok(Some(Value::Bool(true)));
            }
            let r = evaluate(rhs, variables)?;
            Ok(Some(Value::Bool(is_truthy(r.as_ref()))))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = evaluate(lhs, variables)?;
            let r = evaluate(rhs, variables)?;
            binary(*op, l.as_ref(), r.as_ref()).map(Some)
        }
    }
}

fn binary(op: BinaryOp, l: Option<&Value>, r: Option<&Value>) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ordering) = compare(op, l, r)? else {
                // Missing operands never satisfy an ordering.
                return Ok(Value::Bool(false));
            };
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (l, r) {
            (Some(Value::String(a)), other) => Ok(Value::String(format!("{a}{}", display(other)))),
            (other, Some(Value::String(b))) => Ok(Value::String(format!("{}{b}", display(other)))),
            _ => arithmetic(op, as_number(l, "+")?, as_number(r, "+")?),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let sym = symbol(op);
            arithmetic(op, as_number(l, sym)?, as_number(r, sym)?)
        }
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(match op {
            BinaryOp::And => is_truthy(l) && is_truthy(r),
            _ => is_truthy(l) || is_truthy(r),
        })),
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Or => "||",
        BinaryOp::And => "&&",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
    }
}

fn type_name(v: Option<&Value>) -> &'static str {
    match v {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

fn display(v: Option<&Value>) -> String {
    match v {
        None => "undefined".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn as_number<'v>(v: Option<&'v Value>, op: &str) -> Result<&'v Number, ExpressionError> {
    match v {
        Some(Value::Number(n)) => Ok(n),
        other => Err(ExpressionError::Type(format!(
            "operator '{op}' expects numbers, got {}",
            type_name(other)
        ))),
    }
}

fn loose_eq(l: Option<&Value>, r: Option<&Value>) -> bool {
    match (l, r) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (Some(Value::Number(a)), Some(Value::Number(b))) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(
    op: BinaryOp,
    l: Option<&Value>,
    r: Option<&Value>,
) -> Result<Option<Ordering>, ExpressionError> {
    match (l, r) {
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => Ok(None),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                return Ok(Some(x.cmp(&y)));
            }
            let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            Ok(x.partial_cmp(&y))
        }
        (Some(Value::String(a)), Some(Value::String(b))) => Ok(Some(a.cmp(b))),
        (a, b) => Err(ExpressionError::Type(format!(
            "cannot compare {} {} {}",
            type_name(a),
            symbol(op),
            type_name(b)
        ))),
    }
}

fn negate(n: &Number) -> Result<Value, ExpressionError> {
    if let Some(i) = n.as_i64() {
        if let Some(neg) = i.checked_neg() {
            return Ok(Value::Number(neg.into()));
        }
    }
    float(-n.as_f64().unwrap_or(f64::NAN))
}

fn float(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type(format!("non-finite result: {f}")))
}

fn arithmetic(op: BinaryOp, a: &Number, b: &Number) -> Result<Value, ExpressionError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div | BinaryOp::Mod if y == 0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Div if x.checked_rem(y) == Some(0) => x.checked_div(y),
            BinaryOp::Mod => x.checked_rem(y),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::Number(v.into()));
        }
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::Mod if y == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => x / y,
        BinaryOp::Mod => x % y,
        other => {
            return Err(ExpressionError::Type(format!(
                "'{}' is not an arithmetic operator",
                symbol(other)
            )))
        }
    };
    float(result)
}
