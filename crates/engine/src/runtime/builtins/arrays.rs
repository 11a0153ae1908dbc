//! Array methods for the inner realm.
//!
//! `join` and `fill` estimate and charge the accountant before producing
//! anything. The higher-order methods (`map`, `filter`, …) need to call back
//! into guest code and are driven by the interpreter instead.

use crate::error::{EngineError, EngineResult};
use crate::memory_accountant::MemoryAccountant;
use crate::runtime::FrozenRegistry;
use crate::value::{ArrayRef, Value};

fn arg_num(args: &[Value], index: usize) -> f64 {
    args.get(index).map(|v| v.to_number()).unwrap_or(f64::NAN)
}

fn resolve_index(raw: f64, len: usize) -> usize {
    if raw.is_nan() {
        return 0;
    }
    if raw < 0.0 {
        len.saturating_sub((-raw) as usize)
    } else {
        (raw as usize).min(len)
    }
}

const MUTATORS: [&str; 7] = ["push", "pop", "shift", "unshift", "fill", "reverse", "sort"];

/// Dispatches one array method. Returns `None` for unknown names.
pub fn call_method(
    accountant: &MemoryAccountant,
    frozen: &FrozenRegistry,
    items: &ArrayRef,
    method: &str,
    args: &[Value],
) -> EngineResult<Option<Value>> {
    if MUTATORS.contains(&method) && frozen.is_frozen(&Value::Array(items.clone())) {
        return Err(EngineError::guest(format!(
            "Cannot {method} a frozen array"
        )));
    }

    let value = match method {
        "join" => {
            let parts: Vec<String> = items
                .read()
                .iter()
                .map(|v| match v {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_display_string(),
                })
                .collect();
            let sep = args
                .get(0)
                .map(|v| v.to_display_string())
                .unwrap_or_else(|| ",".to_string());
            let element_sum: u64 = parts.iter().map(|p| p.chars().count() as u64).sum();
            accountant.track(MemoryAccountant::estimate_join(
                element_sum,
                sep.chars().count() as u64,
                parts.len() as u64,
            ))?;
            Value::Str(parts.join(&sep))
        }
        "fill" => {
            let fill_value = args.get(0).cloned().unwrap_or(Value::Undefined);
            let len = items.read().len();
            let start = match args.get(1) {
                Some(v) => resolve_index(v.to_number(), len),
                None => 0,
            };
            let end = match args.get(2) {
                Some(v) => resolve_index(v.to_number(), len),
                None => len,
            };
            accountant.track(MemoryAccountant::estimate_fill(start as u64, end as u64))?;
            {
                let mut items = items.write();
                for slot in items[start.min(len)..end.min(len)].iter_mut() {
                    *slot = fill_value.clone();
                }
            }
            Value::Array(items.clone())
        }
        "push" => {
            let mut guard = items.write();
            for arg in args {
                guard.push(arg.clone());
            }
            Value::Number(guard.len() as f64)
        }
        "pop" => items.write().pop().unwrap_or(Value::Undefined),
        "shift" => {
            let mut guard = items.write();
            if guard.is_empty() {
                Value::Undefined
            } else {
                guard.remove(0)
            }
        }
        "unshift" => {
            let mut guard = items.write();
            for (offset, arg) in args.iter().enumerate() {
                guard.insert(offset, arg.clone());
            }
            Value::Number(guard.len() as f64)
        }
        "slice" => {
            let guard = items.read();
            let len = guard.len();
            let start = match args.get(0) {
                Some(v) => resolve_index(v.to_number(), len),
                None => 0,
            };
            let end = match args.get(1) {
                Some(v) => resolve_index(v.to_number(), len),
                None => len,
            };
            let out = if start < end {
                guard[start..end].to_vec()
            } else {
                Vec::new()
            };
            Value::array(out)
        }
        "indexOf" => {
            let needle = args.get(0).cloned().unwrap_or(Value::Undefined);
            let guard = items.read();
            match guard.iter().position(|v| v.strict_equals(&needle)) {
                Some(index) => Value::Number(index as f64),
                None => Value::Number(-1.0),
            }
        }
        "includes" => {
            let needle = args.get(0).cloned().unwrap_or(Value::Undefined);
            Value::Bool(items.read().iter().any(|v| v.strict_equals(&needle)))
        }
        "concat" => {
            let mut out = items.read().clone();
            for arg in args {
                match arg.unguard() {
                    Value::Array(other) => out.extend(other.read().iter().cloned()),
                    _ => out.push(arg.clone()),
                }
            }
            Value::array(out)
        }
        "reverse" => {
            items.write().reverse();
            Value::Array(items.clone())
        }
        "flat" => {
            let depth = match args.get(0) {
                Some(v) => {
                    let n = v.to_number();
                    if n.is_nan() || n < 0.0 {
                        0
                    } else {
                        n as usize
                    }
                }
                None => 1,
            };
            let mut out = Vec::new();
            flatten(&items.read(), depth, &mut out);
            Value::array(out)
        }
        "sort" => {
            // Only the default ordering; comparator callbacks go through the
            // interpreter-driven path.
            if args.iter().any(|a| a.is_callable()) {
                return Ok(None);
            }
            let mut guard = items.write();
            guard.sort_by(|a, b| {
                a.to_display_string()
                    .cmp(&b.to_display_string())
            });
            drop(guard);
            Value::Array(items.clone())
        }
        "at" => {
            let raw = arg_num(args, 0);
            let guard = items.read();
            let index = if raw < 0.0 {
                guard.len().checked_sub((-raw) as usize)
            } else {
                Some(raw as usize)
            };
            index
                .and_then(|i| guard.get(i).cloned())
                .unwrap_or(Value::Undefined)
        }
        "toString" => Value::Str(Value::Array(items.clone()).to_display_string()),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn flatten(items: &[Value], depth: usize, out: &mut Vec<Value>) {
    for item in items {
        match item.unguard() {
            Value::Array(inner) if depth > 0 => flatten(&inner.read(), depth - 1, out),
            _ => out.push(item.clone()),
        }
    }
}

/// `Array.isArray`, `Array.from`, `Array.of` and the `Array(...)` call.
pub fn is_array(value: &Value) -> Value {
    Value::Bool(matches!(value.unguard(), Value::Array(_)))
}

/// Materializes `Array.from(source)` for arrays and strings.
pub fn from(accountant: &MemoryAccountant, source: &Value) -> EngineResult<Value> {
    let out = match source.unguard() {
        Value::Array(items) => items.read().clone(),
        Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
        Value::Undefined | Value::Null => {
            return Err(EngineError::guest("Array.from source is not iterable"))
        }
        _ => Vec::new(),
    };
    accountant.track(MemoryAccountant::estimate_array(out.len() as u64))?;
    Ok(Value::array(out))
}
