//! Safe-value normalization at the trust boundary.
//!
//! Every value that crosses between the realms and the host goes through
//! here: tool results on the way in, the guest's final value on the way out.
//! The output is a tree of primitives, plain records and arrays, with dates
//! and errors normalized. Nothing callable, symbolic or prototype-bearing
//! survives.

use indexmap::IndexMap;

use crate::error::{EngineError, EngineResult};
use crate::value::Value;
use warden_core::constants::SERIALIZED_SIZE_CAP_BYTES;

/// Keys never copied onto sanitized records.
const SKIPPED_KEYS: [&str; 2] = ["__proto__", "constructor"];

/// Literal inserted where a cycle is detected.
const CIRCULAR_MARKER: &str = "[Circular]";

/// Recursive sanitizer with depth and property budgets.
#[derive(Debug, Clone, Copy)]
pub struct Sanitizer {
    max_depth: u32,
    max_properties: u32,
}

impl Sanitizer {
    /// The caller passes already-clamped limits; the orchestrator owns the
    /// clamping.
    pub fn new(max_depth: u32, max_properties: u32) -> Self {
        Self {
            max_depth,
            max_properties,
        }
    }

    /// Sanitizes a value into the canonical tree.
    pub fn sanitize(&self, value: &Value) -> EngineResult<Value> {
        let mut properties = 0u32;
        let mut ancestors = Vec::new();
        self.walk(value, 1, &mut properties, &mut ancestors)
    }

    fn walk(
        &self,
        value: &Value,
        depth: u32,
        properties: &mut u32,
        ancestors: &mut Vec<usize>,
    ) -> EngineResult<Value> {
        match value {
            Value::Undefined => Ok(Value::Undefined),
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Number(*n)),
            Value::BigInt(i) => Ok(Value::BigInt(i.clone())),
            Value::Str(s) => Ok(Value::Str(s.clone())),
            Value::Function(_) | Value::Native(_) => Err(EngineError::FunctionReturned),
            Value::Symbol(_) => Err(EngineError::SymbolReturned),
            // Dates clone to a fresh instant; errors flatten with the stack
            // omitted; regexes reduce to their source text.
            Value::Date(d) => Ok(Value::Date(*d)),
            Value::Sealed(e) => {
                let mut entries = IndexMap::new();
                entries.insert("name".to_string(), Value::Str(e.name.clone()));
                entries.insert("message".to_string(), Value::Str(e.message.clone()));
                Ok(Value::object(entries))
            }
            Value::Regex(r) => Ok(Value::Str(r.source.clone())),
            Value::Guarded(g) => self.walk(&g.inner, depth, properties, ancestors),
            Value::Array(items) => {
                if depth > self.max_depth {
                    return Err(EngineError::SanitizeDepthExceeded {
                        limit: self.max_depth,
                    });
                }
                let ptr = std::sync::Arc::as_ptr(items) as usize;
                if ancestors.contains(&ptr) {
                    return Ok(Value::str(CIRCULAR_MARKER));
                }
                ancestors.push(ptr);
                let items = items.read();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    *properties += 1;
                    if *properties > self.max_properties {
                        return Err(EngineError::SanitizePropertiesExceeded {
                            limit: self.max_properties,
                        });
                    }
                    out.push(self.walk(item, depth + 1, properties, ancestors)?);
                }
                ancestors.pop();
                Ok(Value::array(out))
            }
            Value::Object(entries) => {
                if depth > self.max_depth {
                    return Err(EngineError::SanitizeDepthExceeded {
                        limit: self.max_depth,
                    });
                }
                let ptr = std::sync::Arc::as_ptr(entries) as usize;
                if ancestors.contains(&ptr) {
                    return Ok(Value::str(CIRCULAR_MARKER));
                }
                ancestors.push(ptr);
                let entries = entries.read();
                let mut out = IndexMap::with_capacity(entries.len());
                for (key, item) in entries.iter() {
                    if SKIPPED_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    *properties += 1;
                    if *properties > self.max_properties {
                        return Err(EngineError::SanitizePropertiesExceeded {
                            limit: self.max_properties,
                        });
                    }
                    out.insert(key.clone(), self.walk(item, depth + 1, properties, ancestors)?);
                }
                ancestors.pop();
                Ok(Value::object(out))
            }
        }
    }
}

/// Estimates the JSON-serialized size of a value, as a monotone upper bound
/// on the actual output. Every reference is counted, so aliased values expand
/// to their full serialized cost.
pub fn estimate_serialized_size(value: &Value) -> u64 {
    let mut ancestors = Vec::new();
    estimate(value, &mut ancestors)
}

fn estimate(value: &Value, ancestors: &mut Vec<usize>) -> u64 {
    match value {
        // `undefined` serializes as null at the boundary.
        Value::Undefined | Value::Null => 4,
        Value::Bool(_) => 5,
        // A shortest-representation double never exceeds 25 characters.
        Value::Number(_) => 25,
        Value::BigInt(i) => i.to_string().len() as u64 + 2,
        Value::Str(s) => estimate_string(s),
        Value::Date(_) => 24 + 2,
        Value::Regex(r) => estimate_string(&r.source),
        Value::Symbol(_) => 4,
        Value::Function(_) | Value::Native(_) => 4,
        Value::Sealed(e) => {
            2 + 7 + estimate_string(&e.name) + 1 + 10 + estimate_string(&e.message) + 2
        }
        Value::Guarded(g) => estimate(&g.inner, ancestors),
        Value::Array(items) => {
            let ptr = std::sync::Arc::as_ptr(items) as usize;
            if ancestors.contains(&ptr) {
                return estimate_string(CIRCULAR_MARKER);
            }
            ancestors.push(ptr);
            let items = items.read();
            let mut total = 2;
            for item in items.iter() {
                total += estimate(item, ancestors) + 1;
            }
            ancestors.pop();
            total
        }
        Value::Object(entries) => {
            let ptr = std::sync::Arc::as_ptr(entries) as usize;
            if ancestors.contains(&ptr) {
                return estimate_string(CIRCULAR_MARKER);
            }
            ancestors.push(ptr);
            let entries = entries.read();
            let mut total = 2;
            for (key, item) in entries.iter() {
                total += estimate_string(key) + 1 + estimate(item, ancestors) + 1;
            }
            ancestors.pop();
            total
        }
    }
}

/// String cost: the quotes plus per-code-unit escape accounting. Astral
/// characters cost their full 4 UTF-8 bytes.
fn estimate_string(s: &str) -> u64 {
    let mut total = 2u64;
    for ch in s.chars() {
        total += match ch {
            '"' | '\\' => 2,
            c if (c as u32) < 0x20 => 6,
            c => c.len_utf8() as u64,
        };
    }
    total
}

/// Enforces the serialized-size ceiling on a sanitized final value.
pub fn enforce_serialized_size(value: &Value, memory_limit_bytes: u64) -> EngineResult<u64> {
    let cap = if memory_limit_bytes > 0 {
        memory_limit_bytes.min(SERIALIZED_SIZE_CAP_BYTES)
    } else {
        SERIALIZED_SIZE_CAP_BYTES
    };
    let estimated = estimate_serialized_size(value);
    if estimated > cap {
        return Err(EngineError::serialization_limit(estimated, cap));
    }
    Ok(estimated)
}
