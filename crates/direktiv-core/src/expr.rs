//! Workflow expression evaluation.
//!
//! Expressions are `{{ ... }}` snippets embedded in workflow definitions and
//! evaluated against instance data:
//!
//! - a string that is exactly one `{{ expr }}` evaluates to a typed JSON value
//! - a string with embedded snippets renders to a string
//! - objects and arrays are evaluated recursively
//! - anything else is a literal
//!
//! Every top-level key of the data document is a variable. The whole document
//! is additionally bound as `data` unless a top-level key shadows it.

use minijinja::Environment;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{codes, DirektivError, Result};

static ENV: Lazy<Environment<'static>> = Lazy::new(Environment::new);

static SINGLE_EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*\{\{(.*)\}\}\s*$").expect("valid expression pattern"));

/// Evaluate an expression against instance data.
pub fn evaluate(expr: &Value, data: &Value) -> Result<Value> {
    evaluate_with(expr, data, &[])
}

/// Evaluate an expression with extra variables bound next to the data.
pub fn evaluate_with(expr: &Value, data: &Value, extra: &[(&str, &Value)]) -> Result<Value> {
    let ctx = context(data, extra);
    eval_value(expr, &ctx)
}

/// Evaluate an expression that must produce a single object.
pub fn evaluate_object(expr: &Value, data: &Value) -> Result<Map<String, Value>> {
    match evaluate(expr, data)? {
        Value::Object(map) => Ok(map),
        other => Err(DirektivError::catchable(
            codes::NOT_OBJECT,
            format!(
                "the expression produced {} where a single object was required",
                describe(&other)
            ),
        )),
    }
}

/// Evaluate an expression and interpret the result as a condition.
pub fn evaluate_condition(expr: &Value, data: &Value) -> Result<bool> {
    Ok(truthy(&evaluate(expr, data)?))
}

/// Truthiness used by switch conditions.
///
/// `null`, `false`, the empty string, zero and empty arrays or objects are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Render a value for log output: strings verbatim, everything else as JSON.
pub fn render_log(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn context(data: &Value, extra: &[(&str, &Value)]) -> Map<String, Value> {
    let mut ctx = match data {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if !ctx.contains_key("data") {
        ctx.insert("data".to_string(), data.clone());
    }
    for (name, value) in extra {
        ctx.insert((*name).to_string(), (*value).clone());
    }
    ctx
}

fn eval_value(expr: &Value, ctx: &Map<String, Value>) -> Result<Value> {
    match expr {
        Value::String(s) => eval_string(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| eval_value(item, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), eval_value(value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn eval_string(source: &str, ctx: &Map<String, Value>) -> Result<Value> {
    if let Some(inner) = single_expression(source) {
        let compiled = ENV
            .compile_expression(inner.trim())
            .map_err(|e| expression_error(source, e))?;
        let value = compiled.eval(ctx).map_err(|e| expression_error(source, e))?;
        return Ok(serde_json::to_value(&value)?);
    }

    if source.contains("{{") || source.contains("{%") {
        let rendered = ENV
            .render_str(source, ctx)
            .map_err(|e| expression_error(source, e))?;
        return Ok(Value::String(rendered));
    }

    Ok(Value::String(source.to_string()))
}

fn single_expression(source: &str) -> Option<&str> {
    let caps = SINGLE_EXPRESSION.captures(source)?;
    let inner = caps.get(1)?.as_str();
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

fn expression_error(source: &str, err: minijinja::Error) -> DirektivError {
    DirektivError::catchable(
        codes::BAD_EXPRESSION,
        format!("failed to evaluate '{}': {}", source, err),
    )
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literals_pass_through() {
        let data = json!({"a": 1});
        assert_eq!(evaluate(&json!(5), &data).unwrap(), json!(5));
        assert_eq!(evaluate(&json!("plain"), &data).unwrap(), json!("plain"));
        assert_eq!(evaluate(&json!(true), &data).unwrap(), json!(true));
    }

    #[test]
    fn test_single_expression_is_typed() {
        let data = json!({"count": 3, "items": [1, 2]});
        assert_eq!(evaluate(&json!("{{ count + 1 }}"), &data).unwrap(), json!(4));
        assert_eq!(evaluate(&json!("{{ items }}"), &data).unwrap(), json!([1, 2]));
        assert_eq!(evaluate(&json!("{{ count > 2 }}"), &data).unwrap(), json!(true));
    }

    #[test]
    fn test_template_renders_string() {
        let data = json!({"name": "world"});
        assert_eq!(
            evaluate(&json!("hello {{ name }}!"), &data).unwrap(),
            json!("hello world!")
        );
    }

    #[test]
    fn test_objects_evaluate_recursively() {
        let data = json!({"user": {"id": 7}});
        let result = evaluate(&json!({"id": "{{ user.id }}", "fixed": [1, "{{ user.id }}"]}), &data)
            .unwrap();
        assert_eq!(result, json!({"id": 7, "fixed": [1, 7]}));
    }

    #[test]
    fn test_whole_document_binding() {
        let data = json!({"x": 1});
        assert_eq!(evaluate(&json!("{{ data }}"), &data).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_extra_variables() {
        let data = json!({"x": 1});
        let item = json!("element");
        assert_eq!(
            evaluate_with(&json!("{{ item }}"), &data, &[("item", &item)]).unwrap(),
            json!("element")
        );
    }

    #[test]
    fn test_evaluate_object_rejects_non_objects() {
        let data = json!({"list": [1]});
        let err = evaluate_object(&json!("{{ list }}"), &data).unwrap_err();
        assert_eq!(err.code(), Some(codes::NOT_OBJECT));
        assert!(evaluate_object(&json!({"k": "{{ list }}"}), &data).is_ok());
    }

    #[test]
    fn test_bad_expression_is_catchable() {
        let err = evaluate(&json!("{{ 1 + }}"), &json!({})).unwrap_err();
        assert_eq!(err.code(), Some(codes::BAD_EXPRESSION));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(0.0)));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!("no")));
        assert!(truthy(&json!(-1)));
        assert!(truthy(&json!([0])));
        assert!(truthy(&json!({"a": null})));
    }
}
