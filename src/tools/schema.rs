//! Argument validation against a tool's parameter schema
//!
//! Covers the subset of JSON Schema that function tools use: an object
//! with `properties`, `required` and `additionalProperties`, and primitive
//! `type`s (a single name or a list such as `["string", "null"]`).

use serde_json::Value;

use super::{ToolDescriptor, ToolError};

/// Check `arguments` against the descriptor's parameter schema
pub fn validate_arguments(descriptor: &ToolDescriptor, arguments: &Value) -> Result<(), ToolError> {
    let schema = &descriptor.parameters;
    let args = arguments
        .as_object()
        .ok_or_else(|| invalid(format!("expected a JSON object, got {}", type_name(arguments))))?;

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(key) {
                return Err(invalid(format!("missing required argument `{}`", key)));
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
    for (key, value) in args {
        let Some(property) = properties.and_then(|p| p.get(key)) else {
            if closed {
                return Err(invalid(format!("unexpected argument `{}`", key)));
            }
            continue;
        };
        if let Some(expected) = property.get("type") {
            if !type_matches(expected, value) {
                return Err(invalid(format!(
                    "argument `{}` must be {}, got {}",
                    key,
                    describe_type(expected),
                    type_name(value)
                )));
            }
        }
    }
    Ok(())
}

fn invalid(message: String) -> ToolError {
    ToolError::InvalidArguments(message)
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => matches_name(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| matches_name(name, value)),
        _ => true,
    }
}

fn matches_name(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
