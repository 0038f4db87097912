//! Operand normalization: the equality-vs-ordering comparison rules, plus
//! the stringification used for templating, the global store, and dependency
//! checks. Objects/arrays stringify canonically via JSON; values normalize
//! before comparing.

use super::parser::CmpOp;
use serde_json::Value;

/// One operand on the evaluator's stack: either a resolved JSON value or the
/// result of a placeholder lookup that found nothing.
#[derive(Debug, Clone)]
pub enum Operand {
    Json(Value),
    Undefined,
}

impl Operand {
    /// Non-empty string is true; otherwise the standard boolean cast.
    /// Undefined is always falsy.
    pub fn truthy(&self) -> bool {
        match self {
            Operand::Undefined => false,
            Operand::Json(Value::Bool(b)) => *b,
            Operand::Json(Value::String(s)) => !s.is_empty(),
            Operand::Json(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Operand::Json(Value::Null) => false,
            Operand::Json(Value::Array(_) | Value::Object(_)) => true,
        }
    }
}

/// A normalized operand, used for equality: strings `"true"`/`"false"`
/// (case-insensitive) become booleans, otherwise numeric-castable strings
/// become numbers; everything else keeps its type.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Bool(bool),
    Num(f64),
    Str(String),
    Null,
    Undefined,
}

pub fn normalize_for_equality(value: Option<&Value>) -> Normalized {
    match value {
        None => Normalized::Undefined,
        Some(Value::Null) => Normalized::Null,
        Some(Value::Bool(b)) => Normalized::Bool(*b),
        Some(Value::Number(n)) => Normalized::Num(n.as_f64().unwrap_or(f64::NAN)),
        Some(Value::String(s)) => {
            if s.eq_ignore_ascii_case("true") {
                Normalized::Bool(true)
            } else if s.eq_ignore_ascii_case("false") {
                Normalized::Bool(false)
            } else if let Ok(f) = s.parse::<f64>() {
                if f.is_finite() {
                    Normalized::Num(f)
                } else {
                    Normalized::Str(s.clone())
                }
            } else {
                Normalized::Str(s.clone())
            }
        }
        Some(v @ (Value::Array(_) | Value::Object(_))) => {
            Normalized::Str(serde_json::to_string(v).unwrap_or_default())
        }
    }
}

fn normalize_operand(operand: &Operand) -> Normalized {
    match operand {
        Operand::Undefined => Normalized::Undefined,
        Operand::Json(v) => normalize_for_equality(Some(v)),
    }
}

fn stringify_normalized(n: &Normalized) -> String {
    match n {
        Normalized::Bool(b) => b.to_string(),
        Normalized::Num(f) => format_number(*f),
        Normalized::Str(s) => s.clone(),
        Normalized::Null => "null".to_string(),
        Normalized::Undefined => "undefined".to_string(),
    }
}

/// Format a number the way the engine's stringification does throughout:
/// integral values print without a trailing `.0`.
pub fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        let mut s = format!("{f}");
        if !s.contains('.') && !s.contains('e') {
            s.push_str(".0");
        }
        s
    }
}

/// If `value` is eligible to be compared numerically for *ordering*: a
/// finite number, or a non-empty string that parses as one. Booleans, null,
/// and the empty string are excluded even though they might be "numeric" in
/// the equality sense.
fn orderable_number(value: &Operand) -> Option<f64> {
    match value {
        Operand::Json(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()),
        Operand::Json(Value::String(s)) if !s.is_empty() => {
            s.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        _ => None,
    }
}

/// The string form used for *lexicographic* ordering comparisons: not the
/// normalized equality form, just each value's natural text.
fn display_string(value: &Operand) -> String {
    match value {
        Operand::Undefined => "undefined".to_string(),
        Operand::Json(Value::String(s)) => s.clone(),
        Operand::Json(Value::Bool(b)) => b.to_string(),
        Operand::Json(Value::Number(n)) => n.to_string(),
        Operand::Json(Value::Null) => String::new(),
        Operand::Json(v @ (Value::Array(_) | Value::Object(_))) => {
            serde_json::to_string(v).unwrap_or_default()
        }
    }
}

pub fn compare(op: &CmpOp, a: &Operand, b: &Operand) -> bool {
    if matches!(a, Operand::Undefined) || matches!(b, Operand::Undefined) {
        return false;
    }

    match op {
        CmpOp::Eq => stringify_normalized(&normalize_operand(a)) == stringify_normalized(&normalize_operand(b)),
        CmpOp::Ne => stringify_normalized(&normalize_operand(a)) != stringify_normalized(&normalize_operand(b)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            if let (Some(x), Some(y)) = (orderable_number(a), orderable_number(b)) {
                match op {
                    CmpOp::Lt => x < y,
                    CmpOp::Le => x <= y,
                    CmpOp::Gt => x > y,
                    CmpOp::Ge => x >= y,
                    _ => unreachable!(),
                }
            } else {
                let (x, y) = (display_string(a), display_string(b));
                match op {
                    CmpOp::Lt => x < y,
                    CmpOp::Le => x <= y,
                    CmpOp::Gt => x > y,
                    CmpOp::Ge => x >= y,
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// How a resolved placeholder value renders into template output:
/// objects/arrays as JSON text, `null`/undefined as the empty string.
pub fn stringify_for_template(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        Some(v @ (Value::Array(_) | Value::Object(_))) => serde_json::to_string(v).unwrap_or_default(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
