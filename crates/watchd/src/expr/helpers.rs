//! The placeholder helper table: string/number transforms chained after
//! a `${…}` base lookup. An unknown helper name is a no-op that returns
//! its input untouched.

use super::value::format_number;
use serde_json::Value;

/// The value flowing through a helper chain: either text or a number,
/// converted back to text/number as each helper demands.
#[derive(Debug, Clone)]
pub enum HelperValue {
    Str(String),
    Num(f64),
}

impl HelperValue {
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => HelperValue::Str(String::new()),
            Some(Value::String(s)) => HelperValue::Str(s.clone()),
            Some(Value::Number(n)) => HelperValue::Num(n.as_f64().unwrap_or(f64::NAN)),
            Some(Value::Bool(b)) => HelperValue::Str(b.to_string()),
            Some(v @ (Value::Array(_) | Value::Object(_))) => {
                HelperValue::Str(serde_json::to_string(v).unwrap_or_default())
            }
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            HelperValue::Str(s) => Value::String(s),
            HelperValue::Num(f) => Value::from(f),
        }
    }

    fn as_str(&self) -> String {
        match self {
            HelperValue::Str(s) => s.clone(),
            HelperValue::Num(f) => format_number(*f),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            HelperValue::Num(f) => *f,
            HelperValue::Str(s) => s.parse().unwrap_or(f64::NAN),
        }
    }
}

/// Parse one raw argument token: a quoted string, `true`/`false`, a decimal
/// number, or a bare word taken as a string literal.
enum Arg {
    Str(String),
    Num(f64),
    Bool(bool),
}

fn parse_arg(raw: &str) -> Arg {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"')) || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        return Arg::Str(raw[1..raw.len() - 1].to_string());
    }
    if raw.eq_ignore_ascii_case("true") {
        return Arg::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Arg::Bool(false);
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Arg::Num(n);
    }
    Arg::Str(raw.to_string())
}

fn arg_usize(args: &[&str], idx: usize, default: usize) -> usize {
    args.get(idx)
        .map(|raw| match parse_arg(raw) {
            Arg::Num(n) if n >= 0.0 => n as usize,
            _ => default,
        })
        .unwrap_or(default)
}

fn arg_string(args: &[&str], idx: usize, default: &str) -> String {
    args.get(idx)
        .map(|raw| match parse_arg(raw) {
            Arg::Str(s) => s,
            Arg::Num(n) => format_number(n),
            Arg::Bool(b) => b.to_string(),
        })
        .unwrap_or_else(|| default.to_string())
}

fn arg_opt_usize(args: &[&str], idx: usize) -> Option<usize> {
    args.get(idx).and_then(|raw| match parse_arg(raw) {
        Arg::Num(n) if n >= 0.0 => Some(n as usize),
        _ => None,
    })
}

pub fn apply(name: &str, args: &[&str], value: HelperValue) -> HelperValue {
    match name {
        "upper" => HelperValue::Str(value.as_str().to_uppercase()),
        "lower" => HelperValue::Str(value.as_str().to_lowercase()),
        "trim" => HelperValue::Str(value.as_str().trim().to_string()),
        "len" => HelperValue::Num(value.as_str().chars().count() as f64),
        "sub" => {
            let chars: Vec<char> = value.as_str().chars().collect();
            let start = arg_usize(args, 0, 0).min(chars.len());
            let len = arg_opt_usize(args, 1).unwrap_or(chars.len() - start);
            let end = (start + len).min(chars.len());
            HelperValue::Str(chars[start..end].iter().collect())
        }
        "slice" => {
            let chars: Vec<char> = value.as_str().chars().collect();
            let start = arg_usize(args, 0, 0).min(chars.len());
            let end = arg_opt_usize(args, 1).unwrap_or(chars.len()).clamp(start, chars.len());
            HelperValue::Str(chars[start..end].iter().collect())
        }
        "cat" => HelperValue::Str(format!("{}{}", value.as_str(), arg_string(args, 0, ""))),
        "padStart" => pad(&value.as_str(), args, true),
        "padEnd" => pad(&value.as_str(), args, false),
        "round" => {
            let dec = arg_usize(args, 0, 0);
            let factor = 10f64.powi(dec as i32);
            HelperValue::Num((value.as_f64() * factor).round() / factor)
        }
        "toFixed" => {
            let dec = arg_usize(args, 0, 0);
            HelperValue::Str(format!("{:.*}", dec, value.as_f64()))
        }
        "bytes" => HelperValue::Str(human_bytes(value.as_f64())),
        "pct" => {
            // With an explicit decimal count, reformat like `toFixed`. With
            // none, suffix the incoming string form as-is rather than
            // re-rounding it to 0 decimals — a preceding `toFixed(n)` in the
            // chain has already decided the precision.
            let text = match args.first() {
                Some(_) => {
                    let dec = arg_usize(args, 0, 0);
                    format!("{:.*}", dec, value.as_f64())
                }
                None => value.as_str(),
            };
            HelperValue::Str(format!("{text}%"))
        }
        _ => value,
    }
}

fn pad(s: &str, args: &[&str], start: bool) -> HelperValue {
    let target = arg_usize(args, 0, 0);
    let fill = arg_string(args, 1, " ");
    let current_len = s.chars().count();
    if fill.is_empty() || current_len >= target {
        return HelperValue::Str(s.to_string());
    }
    let fill_chars: Vec<char> = fill.chars().collect();
    let needed = target - current_len;
    let padding: String = (0..needed).map(|i| fill_chars[i % fill_chars.len()]).collect();
    if start {
        HelperValue::Str(format!("{padding}{s}"))
    } else {
        HelperValue::Str(format!("{s}{padding}"))
    }
}

/// Human binary size, 1024-based: 0 decimals when the scaled value is
/// >= 10 or integral, otherwise 1 decimal.
fn human_bytes(n: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = n;
    let mut unit = 0usize;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let decimals = if value.abs() >= 10.0 || value.fract() == 0.0 { 0 } else { 1 };
    format!("{:.*} {}", decimals, value, UNITS[unit])
}

// ===========================================================================
// Tests
// ===========================================================================
