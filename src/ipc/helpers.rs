use serde_json::Value;

use super::error::HandlerErr;

pub fn str_param(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn opt_str_param(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn bool_param(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

pub fn i64_param(params: &Value, key: &str, default: i64) -> i64 {
    params.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

pub fn f64_param(params: &Value, key: &str, default: f64) -> f64 {
    params.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

pub fn str_list_param(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// A numeric score field: present and finite, or rejected. Absent fields
/// default to 0 like a blank form field.
pub fn score_field(obj: &Value, key: &str, label: &str) -> Result<f64, HandlerErr> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(0.0),
        Some(v) => {
            let Some(n) = v.as_f64() else {
                return Err(HandlerErr::bad_params(format!("{} must be a number", label)));
            };
            if !n.is_finite() {
                return Err(HandlerErr::bad_params(format!("{} is invalid", label)));
            }
            Ok(n)
        }
    }
}
