//! The realm's `JSON` namespace.
//!
//! `stringify` runs over the guest value model with cycle detection;
//! `parse` applies its own depth cap during conversion instead of trusting
//! the underlying parser.

use indexmap::IndexMap;

use super::{NativeFn, NativeId};
use crate::error::{EngineError, EngineResult};
use crate::value::Value;
use warden_core::constants::JSON_PARSE_MAX_DEPTH;

/// Builds the frozen `JSON` namespace object.
pub fn namespace() -> Value {
    let mut entries = IndexMap::new();
    entries.insert(
        "stringify".to_string(),
        Value::Native(NativeFn::new("stringify", NativeId::JsonStringify)),
    );
    entries.insert(
        "parse".to_string(),
        Value::Native(NativeFn::new("parse", NativeId::JsonParse)),
    );
    Value::object(entries)
}

/// `JSON.stringify`. Callables serialize as null, the way the guest
/// language drops them; cycles are an error.
pub fn stringify(value: &Value, space: Option<u32>) -> EngineResult<Value> {
    if matches!(value, Value::Undefined | Value::Function(_) | Value::Native(_)) {
        return Ok(Value::Undefined);
    }
    let mut ancestors = Vec::new();
    let json = to_json_lossy(value, &mut ancestors)?;
    let text = match space {
        Some(_) => serde_json::to_string_pretty(&json),
        None => serde_json::to_string(&json),
    }
    .map_err(|e| EngineError::guest(format!("JSON.stringify failed: {e}")))?;
    Ok(Value::Str(text))
}

fn to_json_lossy(value: &Value, ancestors: &mut Vec<usize>) -> EngineResult<serde_json::Value> {
    match value {
        Value::Function(_) | Value::Native(_) | Value::Symbol(_) | Value::Undefined => {
            Ok(serde_json::Value::Null)
        }
        Value::Array(items) => {
            let ptr = std::sync::Arc::as_ptr(items) as usize;
            if ancestors.contains(&ptr) {
                return Err(EngineError::guest("Converting circular structure to JSON"));
            }
            ancestors.push(ptr);
            let items = items.read();
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(to_json_lossy(item, ancestors)?);
            }
            ancestors.pop();
            Ok(serde_json::Value::Array(out))
        }
        Value::Object(entries) => {
            let ptr = std::sync::Arc::as_ptr(entries) as usize;
            if ancestors.contains(&ptr) {
                return Err(EngineError::guest("Converting circular structure to JSON"));
            }
            ancestors.push(ptr);
            let entries = entries.read();
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries.iter() {
                // Dropped members keep stringify total, like the original.
                if matches!(
                    item,
                    Value::Undefined | Value::Function(_) | Value::Native(_) | Value::Symbol(_)
                ) {
                    continue;
                }
                map.insert(key.clone(), to_json_lossy(item, ancestors)?);
            }
            ancestors.pop();
            Ok(serde_json::Value::Object(map))
        }
        Value::Guarded(g) => to_json_lossy(&g.inner, ancestors),
        other => other.to_json(),
    }
}

/// `JSON.parse` with the engine's own depth cap.
pub fn parse(text: &str) -> EngineResult<Value> {
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::guest(format!("JSON.parse failed: {e}")))?;
    from_json_checked(&json, 1)
}

fn from_json_checked(json: &serde_json::Value, depth: usize) -> EngineResult<Value> {
    if depth > JSON_PARSE_MAX_DEPTH {
        return Err(EngineError::guest(format!(
            "JSON.parse input exceeds depth limit {JSON_PARSE_MAX_DEPTH}"
        )));
    }
    match json {
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json_checked(item, depth + 1)?);
            }
            Ok(Value::array(out))
        }
        serde_json::Value::Object(map) => {
            let mut entries = IndexMap::with_capacity(map.len());
            for (key, item) in map {
                entries.insert(key.clone(), from_json_checked(item, depth + 1)?);
            }
            Ok(Value::object(entries))
        }
        other => Ok(Value::from_json(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stringify_round_trip() {
        let mut entries = IndexMap::new();
        entries.insert("a".to_string(), Value::Number(1.0));
        entries.insert("b".to_string(), Value::array(vec![Value::Bool(true)]));
        let out = stringify(&Value::object(entries), None).unwrap();
        assert_eq!(out, Value::str(r#"{"a":1,"b":[true]}"#));
    }

    #[test]
    fn test_stringify_drops_undefined_members() {
        let mut entries = IndexMap::new();
        entries.insert("gone".to_string(), Value::Undefined);
        entries.insert("kept".to_string(), Value::Null);
        let out = stringify(&Value::object(entries), None).unwrap();
        assert_eq!(out, Value::str(r#"{"kept":null}"#));
    }

    #[test]
    fn test_stringify_rejects_cycles() {
        let arr = Value::array(vec![]);
        if let Value::Array(items) = &arr {
            items.write().push(arr.clone());
        }
        assert!(stringify(&arr, None).is_err());
    }

    #[test]
    fn test_parse_depth_cap() {
        let mut nested = String::from("1");
        for _ in 0..(JSON_PARSE_MAX_DEPTH + 5) {
            nested = format!("[{nested}]");
        }
        assert!(parse(&nested).is_err());
        assert!(parse("[[1, 2], {\"a\": 3}]").is_ok());
    }

    #[test]
    fn test_parse_builds_guest_values() {
        let value = parse(r#"{"n": 1.5, "s": "x"}"#).unwrap();
        let Value::Object(entries) = value else {
            panic!("expected object")
        };
        assert_eq!(entries.read()["n"], Value::Number(1.5));
    }
}
