//! The expression/template engine shared by the rule engine: a tokenizer, a
//! recursive-descent parser that lowers to postfix, and a stack-machine
//! evaluator over tagged operand variants. Also hosts template interpolation,
//! which resolves the same `${…}` placeholder grammar.
//!
//! Kept side-effect free except for the one read through `GlobalStore` that
//! `${store.w.s}` placeholders require.

mod helpers;
mod lexer;
mod parser;
mod value;

use crate::store::GlobalStore;
use serde_json::Value;
use tracing::warn;
use value::Operand;

pub use value::{normalize_for_equality, stringify_for_template};

/// Evaluate a boolean expression against one payload/value pair. Total:
/// malformed input is logged and evaluates to `false`.
pub async fn eval_expression(
    expr: &str,
    current_value: Option<&Value>,
    payload: &Value,
    store: &GlobalStore,
) -> bool {
    let tokens = match lexer::tokenize(expr) {
        Ok(tokens) => tokens,
        Err(err) => {
            warn!(expr, %err, "malformed expression (lex)");
            return false;
        }
    };
    let rpn = match parser::parse(&tokens) {
        Ok(rpn) => rpn,
        Err(err) => {
            warn!(expr, %err, "malformed expression (parse)");
            return false;
        }
    };

    match eval_rpn(&rpn, current_value, payload, store).await {
        Ok(result) => result,
        Err(err) => {
            warn!(expr, %err, "malformed expression (eval)");
            false
        }
    }
}

/// Resolve every `${…}` occurrence in `template` and substitute. Non-`${`
/// text passes through unchanged; a template with no placeholders returns
/// byte-identical to its input.
pub async fn interpolate(
    template: &str,
    current_value: Option<&Value>,
    payload: &Value,
    store: &GlobalStore,
) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = find_matching_brace(template, i + 2) {
                let spec = &template[i + 2..end];
                let resolved = resolve_placeholder(spec, current_value, payload, store).await;
                out.push_str(&value::stringify_for_template(resolved.as_ref()));
                i = end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap_or('\u{FFFD}');
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

/// Find the `}` matching the `${` that opened at `start` (the index right
/// after `${`), counting nested `{`/`}` so a helper arg containing braces
/// doesn't truncate the placeholder early.
fn find_matching_brace(s: &str, start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut idx = start;
    let bytes = s.as_bytes();
    while idx < bytes.len() {
        match bytes[idx] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
        idx += 1;
    }
    None
}

/// Resolve one placeholder spec (the text between `${` and `}`, not
/// including the braces) to a JSON value, applying any helper chain.
/// `None` means the base lookup was undefined.
async fn resolve_placeholder(
    spec: &str,
    current_value: Option<&Value>,
    payload: &Value,
    store: &GlobalStore,
) -> Option<Value> {
    let (base_spec, chain) = split_helper_chain(spec);
    let base = resolve_base(base_spec.trim(), current_value, payload, store).await;
    if chain.is_empty() {
        return base;
    }

    let mut current = helpers::HelperValue::from_json(base.as_ref());
    for link in chain {
        let (name, args) = parse_helper_call(link);
        current = helpers::apply(name, &args, current);
    }
    Some(current.into_json())
}

/// Split `base:fn(args):fn2(args)` on colons, but only colons outside of
/// parentheses — colons inside parenthesized argument lists do not split
/// the chain.
fn split_helper_chain(spec: &str) -> (&str, Vec<&str>) {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let bytes = spec.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b':' if depth == 0 => {
                parts.push(&spec[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&spec[start..]);

    let mut iter = parts.into_iter();
    let base = iter.next().unwrap_or("");
    (base, iter.collect())
}

/// Parse one `fn(args)` or bare `fn` helper call into its name and raw
/// argument list text (still unparsed).
fn parse_helper_call(call: &str) -> (&str, Vec<&str>) {
    let call = call.trim();
    let Some(open) = call.find('(') else {
        return (call, Vec::new());
    };
    let Some(close) = call.rfind(')') else {
        return (call, Vec::new());
    };
    if close < open {
        return (call, Vec::new());
    }
    let name = call[..open].trim();
    let inner = &call[open + 1..close];
    if inner.trim().is_empty() {
        return (name, Vec::new());
    }
    (name, split_args(inner))
}

/// Split a helper's argument list on top-level commas (quoted strings may
/// contain commas; those stay intact).
fn split_args(inner: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut start = 0usize;
    let mut quote: Option<u8> = None;
    let bytes = inner.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b',' => {
                    args.push(inner[start..idx].trim());
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }
    args.push(inner[start..].trim());
    args
}

async fn resolve_base(
    spec: &str,
    current_value: Option<&Value>,
    payload: &Value,
    store: &GlobalStore,
) -> Option<Value> {
    if spec == "value" {
        return current_value.cloned();
    }
    if let Some(rest) = spec.strip_prefix("store.") {
        let mut parts = rest.splitn(2, '.');
        let watcher_id = parts.next()?;
        let subject = parts.next()?;
        return store.get(watcher_id, subject).await;
    }
    dotted_lookup(payload, spec)
}

/// Walk `path` one segment at a time through `root`'s object properties. A
/// missing segment anywhere yields `None`.
fn dotted_lookup<'a>(root: &'a Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

async fn eval_rpn(
    rpn: &[parser::RpnItem],
    current_value: Option<&Value>,
    payload: &Value,
    store: &GlobalStore,
) -> Result<bool, EvalError> {
    let mut stack: Vec<Operand> = Vec::new();

    for item in rpn {
        match item {
            parser::RpnItem::Operand(tok) => {
                let operand = resolve_operand(tok, current_value, payload, store).await;
                stack.push(operand);
            }
            parser::RpnItem::Not => {
                let a = stack.pop().ok_or(EvalError::StackUnderflow)?;
                stack.push(Operand::Bool(!a.truthy()));
            }
            parser::RpnItem::Cmp(op) => {
                let b = stack.pop().ok_or(EvalError::StackUnderflow)?;
                let a = stack.pop().ok_or(EvalError::StackUnderflow)?;
                stack.push(Operand::Bool(value::compare(op, &a, &b)));
            }
            parser::RpnItem::And => {
                let b = stack.pop().ok_or(EvalError::StackUnderflow)?;
                let a = stack.pop().ok_or(EvalError::StackUnderflow)?;
                stack.push(Operand::Bool(a.truthy() && b.truthy()));
            }
            parser::RpnItem::Or => {
                let b = stack.pop().ok_or(EvalError::StackUnderflow)?;
                let a = stack.pop().ok_or(EvalError::StackUnderflow)?;
                stack.push(Operand::Bool(a.truthy() || b.truthy()));
            }
        }
    }

    match stack.len() {
        1 => Ok(stack.pop().unwrap().truthy()),
        0 => Err(EvalError::EmptyExpression),
        _ => Err(EvalError::TrailingOperands),
    }
}

async fn resolve_operand(
    tok: &parser::OperandTok,
    current_value: Option<&Value>,
    payload: &Value,
    store: &GlobalStore,
) -> Operand {
    match tok {
        parser::OperandTok::Num(n) => Operand::Json(Value::from(*n)),
        parser::OperandTok::Bool(b) => Operand::Json(Value::Bool(*b)),
        parser::OperandTok::Str(s) => Operand::Json(Value::String(s.clone())),
        parser::OperandTok::ValueKw => match current_value {
            Some(v) => Operand::Json(v.clone()),
            None => Operand::Undefined,
        },
        parser::OperandTok::Placeholder(spec) => {
            match resolve_placeholder(spec, current_value, payload, store).await {
                Some(v) => Operand::Json(v),
                None => Operand::Undefined,
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("empty expression")]
    EmptyExpression,
    #[error("trailing operands")]
    TrailingOperands,
}

/// Typed equality between a condition's declared `value` and an extracted
/// payload value: undefined/null always match; bool/number/string
/// cast-then-compare; anything else never matches.
pub fn typed_value_match(condition_value: Option<&Value>, extracted: &Value) -> bool {
    match condition_value {
        None | Some(Value::Null) => true,
        Some(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => {
            normalize_for_equality(Some(v)) == normalize_for_equality(Some(extracted))
        }
        Some(_) => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> std::sync::Arc<GlobalStore> {
        GlobalStore::new()
    }

    #[tokio::test]
    async fn template_with_no_placeholders_round_trips() {
        let payload = json!({});
        let s = store();
        let out = interpolate("plain text, no braces here", None, &payload, &s).await;
        assert_eq!(out, "plain text, no braces here");
    }

    #[tokio::test]
    async fn template_resolves_dotted_path() {
        let payload = json!({"tags": {"host": "srv"}});
        let s = store();
        let out = interpolate("host=${tags.host}", None, &payload, &s).await;
        assert_eq!(out, "host=srv");
    }

    #[tokio::test]
    async fn template_resolves_value_keyword() {
        let payload = json!({});
        let value = json!(false);
        let s = store();
        let out = interpolate("v=${value}", Some(&value), &payload, &s).await;
        assert_eq!(out, "v=false");
    }

    #[tokio::test]
    async fn template_missing_path_resolves_to_empty_string() {
        let payload = json!({});
        let s = store();
        let out = interpolate("x=${missing.path}", None, &payload, &s).await;
        assert_eq!(out, "x=");
    }

    #[tokio::test]
    async fn template_object_resolves_to_json_text() {
        let payload = json!({"obj": {"a": 1}});
        let s = store();
        let out = interpolate("${obj}", None, &payload, &s).await;
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn template_helper_chain_with_colon_in_args_not_split() {
        let payload = json!({"t": "12:30:00"});
        let s = store();
        let out = interpolate("${t:sub(0,2)}", None, &payload, &s).await;
        assert_eq!(out, "12");
    }

    #[tokio::test]
    async fn scenario_s2_message_template() {
        let payload = json!({"fields": {"used_percent": 91.234}, "tags": {"host": "srv", "path": "/"}});
        let s = store();
        let out = interpolate(
            "ALERT ${tags.path} ${fields.used_percent:toFixed(1):pct()} on ${tags.host:upper}",
            None,
            &payload,
            &s,
        )
        .await;
        assert_eq!(out, "ALERT / 91.2% on SRV");
    }

    #[tokio::test]
    async fn store_placeholder_resolves_through_global_store() {
        let payload = json!({});
        let s = store();
        s.update("lock", "contact", json!(true)).await;
        let out = interpolate("${store.lock.contact}", None, &payload, &s).await;
        assert_eq!(out, "true");
    }

    #[tokio::test]
    async fn scenario_s6_numeric_equality_on_string_payload() {
        let payload = json!({"x": "42"});
        let s = store();
        assert!(eval_expression("${x} == 42", None, &payload, &s).await);
    }

    #[tokio::test]
    async fn scenario_s6_numeric_ordering_branch() {
        let payload = json!({"x": "42"});
        let s = store();
        assert!(eval_expression(r#"${x} > "9""#, None, &payload, &s).await);
    }

    #[tokio::test]
    async fn scenario_s6_string_true_equals_boolean_true() {
        let payload = json!({});
        let s = store();
        assert!(eval_expression(r#""true" == true"#, None, &payload, &s).await);
    }

    #[tokio::test]
    async fn scenario_s6_not_on_empty_value_is_true() {
        let payload = json!({});
        let value = json!("");
        let s = store();
        assert!(eval_expression("!value", Some(&value), &payload, &s).await);
    }

    #[tokio::test]
    async fn malformed_expression_evaluates_false_not_panic() {
        let payload = json!({});
        let s = store();
        assert!(!eval_expression("${x} ==", None, &payload, &s).await);
        assert!(!eval_expression("((", None, &payload, &s).await);
        assert!(!eval_expression("", None, &payload, &s).await);
    }

    #[tokio::test]
    async fn and_or_precedence_and_associativity() {
        let payload = json!({});
        let s = store();
        assert!(eval_expression("false || true && true", None, &payload, &s).await);
        assert!(!eval_expression("false && true || false", None, &payload, &s).await);
    }

    #[tokio::test]
    async fn comparison_against_undefined_is_false() {
        let payload = json!({});
        let s = store();
        assert!(!eval_expression("${missing} == 1", None, &payload, &s).await);
        assert!(!eval_expression("${missing} == ${also_missing}", None, &payload, &s).await);
    }

    #[tokio::test]
    async fn typed_value_match_undefined_condition_always_matches() {
        assert!(typed_value_match(None, &json!("anything")));
        assert!(typed_value_match(Some(&json!(null)), &json!(123)));
    }

    #[tokio::test]
    async fn typed_value_match_casts_then_compares() {
        assert!(typed_value_match(Some(&json!(false)), &json!(false)));
        assert!(!typed_value_match(Some(&json!(true)), &json!(false)));
        assert!(typed_value_match(Some(&json!("42")), &json!(42)));
    }

    #[tokio::test]
    async fn typed_value_match_object_condition_never_matches() {
        assert!(!typed_value_match(Some(&json!({"a": 1})), &json!({"a": 1})));
    }
}
