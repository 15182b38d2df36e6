use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
  #[error("payload is not valid JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("payload is empty")]
  Empty
}

/// Decodes a service answer. Bindings hand back either the JSON object itself or an envelope
/// `{ "raw": "<json>" }`; both are accepted, and a `raw` that is already an object is unwrapped.
pub fn decode(text: &str) -> Result<Value, PayloadError> {
  let trimmed = text.trim();
  if trimmed.is_empty() {
    return Err(PayloadError::Empty);
  }
  let value: Value = serde_json::from_str(trimmed)?;
  unwrap_envelope(value)
}

/// Same as [`decode`] for an already parsed value.
pub fn unwrap_envelope(value: Value) -> Result<Value, PayloadError> {
  match value {
    Value::String(inner) => decode(&inner),
    Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("raw") => {
      match obj.remove("raw").unwrap_or(Value::Null) {
        Value::String(inner) => decode(&inner),
        Value::Null => Err(PayloadError::Empty),
        other => Ok(other)
      }
    }
    other => Ok(other)
  }
}

/// `@type` with a fallback to `type` when it is a plain string.
pub fn type_name(v: &Value) -> &str {
  v.get("@type")
    .and_then(|t| t.as_str())
    .or_else(|| v.get("type").and_then(|t| t.as_str()))
    .unwrap_or("")
}

/// Integer that may arrive as a JSON number or a numeric string.
pub fn as_i64_loose(v: &Value) -> Option<i64> {
  match v {
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
    Value::String(s) => s.trim().parse::<i64>().ok(),
    _ => None
  }
}

/// Walks a dotted path through nested objects, returning `None` on the first missing step.
pub fn path<'a>(v: &'a Value, dotted: &str) -> Option<&'a Value> {
  let mut cur = v;
  for key in dotted.split('.') {
    cur = cur.get(key)?;
  }
  Some(cur)
}

/// Nullish coalescing over several paths: the first one that exists and is not `null`.
pub fn first_present<'a>(v: &'a Value, paths: &[&str]) -> Option<&'a Value> {
  paths
    .iter()
    .filter_map(|p| path(v, p))
    .find(|found| !found.is_null())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn decodes_direct_and_enveloped_payloads() {
    let direct = decode(r#"{"@type":"file","id":7}"#).unwrap();
    assert_eq!(direct["id"], 7);

    let envelope = json!({ "raw": r#"{"@type":"file","id":8}"# }).to_string();
    assert_eq!(decode(&envelope).unwrap()["id"], 8);

    let nested = json!({ "raw": { "id": 9 } }).to_string();
    assert_eq!(decode(&nested).unwrap()["id"], 9);
  }

  #[test]
  fn rejects_empty_and_broken_text() {
    assert!(matches!(decode("  "), Err(PayloadError::Empty)));
    assert!(matches!(decode("{not json"), Err(PayloadError::Json(_))));
  }

  #[test]
  fn objects_with_more_fields_than_raw_are_kept() {
    let v = unwrap_envelope(json!({ "raw": "x", "id": 3 })).unwrap();
    assert_eq!(v["id"], 3);
  }

  #[test]
  fn first_present_skips_nulls() {
    let v = json!({ "a": null, "b": { "c": 4 } });
    assert_eq!(first_present(&v, &["a", "b.c"]), Some(&json!(4)));
    assert_eq!(first_present(&v, &["x", "a"]), None);
    assert_eq!(as_i64_loose(&json!("-100123")), Some(-100123));
  }
}
