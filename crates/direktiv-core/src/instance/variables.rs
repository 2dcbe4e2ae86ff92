use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{codes, DirektivError, Result};
use crate::model::VarScope;

/// Content type used when a setter declares none.
pub const DEFAULT_MIME_TYPE: &str = "application/json";

/// A stored variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableRecord {
    pub scope: VarScope,
    /// Instance, workflow or namespace id, depending on the scope.
    pub owner: Uuid,
    pub key: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// Whether writing `value` deletes the variable instead.
pub fn is_delete_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Encode a workflow value for storage under `mime_type`.
///
/// JSON types store the serialized value, `text/*` stores strings verbatim and
/// anything else expects a base64 string holding the raw bytes.
pub fn encode_variable(value: &Value, mime_type: &str) -> Result<Vec<u8>> {
    if is_json(mime_type) {
        return Ok(serde_json::to_vec(value)?);
    }
    if is_text(mime_type) {
        return Ok(match value {
            Value::String(s) => s.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        });
    }
    match value {
        Value::String(s) => STANDARD.decode(s.as_bytes()).map_err(|e| {
            DirektivError::catchable(
                codes::VARIABLE_ENCODING,
                format!("value for '{}' is not valid base64: {}", mime_type, e),
            )
        }),
        _ => Err(DirektivError::catchable(
            codes::VARIABLE_ENCODING,
            format!("value for '{}' must be a base64 string", mime_type),
        )),
    }
}

/// Decode a stored variable into a workflow value.
pub fn decode_variable(data: &[u8], mime_type: &str) -> Result<Value> {
    if is_json(mime_type) {
        return serde_json::from_slice(data).map_err(|e| {
            DirektivError::catchable(
                codes::VARIABLE_ENCODING,
                format!("stored variable is not valid JSON: {}", e),
            )
        });
    }
    if is_text(mime_type) {
        return Ok(Value::String(String::from_utf8_lossy(data).into_owned()));
    }
    Ok(Value::String(STANDARD.encode(data)))
}

fn is_json(mime_type: &str) -> bool {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    essence.is_empty() || essence == DEFAULT_MIME_TYPE || essence.ends_with("+json")
}

fn is_text(mime_type: &str) -> bool {
    mime_type.trim_start().starts_with("text/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_variables() {
        let value = json!({"a": [1, 2]});
        let bytes = encode_variable(&value, DEFAULT_MIME_TYPE).unwrap();
        assert_eq!(decode_variable(&bytes, DEFAULT_MIME_TYPE).unwrap(), value);
        assert_eq!(
            decode_variable(&bytes, "application/json; charset=utf-8").unwrap(),
            value
        );
    }

    #[test]
    fn test_text_variables_are_raw() {
        let bytes = encode_variable(&json!("hello"), "text/plain").unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(decode_variable(b"hello", "text/plain").unwrap(), json!("hello"));
    }

    #[test]
    fn test_binary_variables_use_base64() {
        let bytes = encode_variable(&json!("AAEC"), "application/octet-stream").unwrap();
        assert_eq!(bytes, vec![0, 1, 2]);
        assert_eq!(
            decode_variable(&bytes, "application/octet-stream").unwrap(),
            json!("AAEC")
        );

        let err = encode_variable(&json!(5), "image/png").unwrap_err();
        assert_eq!(err.code(), Some(codes::VARIABLE_ENCODING));
        assert!(encode_variable(&json!("%%%"), "image/png").is_err());
    }

    #[test]
    fn test_delete_values() {
        assert!(is_delete_value(&Value::Null));
        assert!(is_delete_value(&json!("")));
        assert!(!is_delete_value(&json!(0)));
        assert!(!is_delete_value(&json!({})));
    }
}
