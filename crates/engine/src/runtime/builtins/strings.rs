//! String methods for the inner realm.
//!
//! The growth methods (`repeat`, `padStart`, `padEnd`) estimate their result
//! size and charge the memory accountant before allocating anything; an
//! over-budget result never gets built.

use crate::error::{EngineError, EngineResult};
use crate::memory_accountant::MemoryAccountant;
use crate::value::Value;

fn units(s: &str) -> u64 {
    s.chars().count() as u64
}

/// Resolves a possibly-negative index against a length, clamping into range.
fn resolve_index(raw: f64, len: usize) -> usize {
    if raw.is_nan() {
        return 0;
    }
    if raw < 0.0 {
        let back = (-raw) as usize;
        len.saturating_sub(back)
    } else {
        (raw as usize).min(len)
    }
}

fn arg_num(args: &[Value], index: usize) -> f64 {
    args.get(index).map(|v| v.to_number()).unwrap_or(f64::NAN)
}

fn arg_str(args: &[Value], index: usize) -> Option<String> {
    args.get(index).map(|v| v.to_display_string())
}

/// Dispatches one string method. Returns `None` for unknown names so the
/// caller can raise the guest-side type error.
pub fn call_method(
    accountant: &MemoryAccountant,
    s: &str,
    method: &str,
    args: &[Value],
) -> EngineResult<Option<Value>> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let value = match method {
        "repeat" => {
            let raw = arg_num(args, 0);
            if raw.is_nan() || raw < 0.0 || raw.is_infinite() {
                return Err(EngineError::guest("Invalid count value for repeat"));
            }
            let count = raw as u64;
            accountant.track(MemoryAccountant::estimate_repeat(units(s), count))?;
            Value::Str(s.repeat(count as usize))
        }
        "padStart" | "padEnd" => {
            let target = arg_num(args, 0);
            let target = if target.is_nan() || target < 0.0 {
                0
            } else {
                target as u64
            };
            accountant.track(MemoryAccountant::estimate_pad(units(s), target))?;
            let filler = arg_str(args, 1).unwrap_or_else(|| " ".to_string());
            let target = target as usize;
            if target <= len || filler.is_empty() {
                Value::Str(s.to_string())
            } else {
                let mut pad = String::new();
                let needed = target - len;
                while pad.chars().count() < needed {
                    pad.push_str(&filler);
                }
                let pad: String = pad.chars().take(needed).collect();
                if method == "padStart" {
                    Value::Str(format!("{pad}{s}"))
                } else {
                    Value::Str(format!("{s}{pad}"))
                }
            }
        }
        "slice" => {
            let start = resolve_index(if args.is_empty() { 0.0 } else { arg_num(args, 0) }, len);
            let end = match args.get(1) {
                Some(v) => resolve_index(v.to_number(), len),
                None => len,
            };
            let slice: String = if start < end {
                chars[start..end].iter().collect()
            } else {
                String::new()
            };
            Value::Str(slice)
        }
        "substring" => {
            let mut start = resolve_index(arg_num(args, 0).max(0.0), len);
            let mut end = match args.get(1) {
                Some(v) => resolve_index(v.to_number().max(0.0), len),
                None => len,
            };
            if start > end {
                std::mem::swap(&mut start, &mut end);
            }
            Value::Str(chars[start..end].iter().collect())
        }
        "indexOf" => {
            let needle = arg_str(args, 0).unwrap_or_default();
            match s.find(&needle) {
                Some(byte_pos) => Value::Number(s[..byte_pos].chars().count() as f64),
                None => Value::Number(-1.0),
            }
        }
        "includes" => {
            let needle = arg_str(args, 0).unwrap_or_default();
            Value::Bool(s.contains(&needle))
        }
        "startsWith" => {
            let needle = arg_str(args, 0).unwrap_or_default();
            Value::Bool(s.starts_with(&needle))
        }
        "endsWith" => {
            let needle = arg_str(args, 0).unwrap_or_default();
            Value::Bool(s.ends_with(&needle))
        }
        "toUpperCase" => Value::Str(s.to_uppercase()),
        "toLowerCase" => Value::Str(s.to_lowercase()),
        "trim" => Value::Str(s.trim().to_string()),
        "trimStart" => Value::Str(s.trim_start().to_string()),
        "trimEnd" => Value::Str(s.trim_end().to_string()),
        "charAt" => {
            let index = arg_num(args, 0);
            let index = if index.is_nan() { 0 } else { index as usize };
            Value::Str(chars.get(index).map(|c| c.to_string()).unwrap_or_default())
        }
        "charCodeAt" => {
            let index = arg_num(args, 0);
            let index = if index.is_nan() { 0 } else { index as usize };
            match chars.get(index) {
                Some(c) => Value::Number(*c as u32 as f64),
                None => Value::Number(f64::NAN),
            }
        }
        "split" => {
            let sep = arg_str(args, 0);
            // Worst case every unit becomes its own part; charge that before
            // materializing anything.
            accountant.track(
                MemoryAccountant::estimate_array(units(s) + 1)
                    + MemoryAccountant::estimate_string(units(s)),
            )?;
            let parts: Vec<Value> = match sep.as_deref() {
                None => vec![Value::Str(s.to_string())],
                Some("") => chars.iter().map(|c| Value::Str(c.to_string())).collect(),
                Some(sep) => s.split(sep).map(|p| Value::Str(p.to_string())).collect(),
            };
            Value::array(parts)
        }
        "replace" => {
            let needle = arg_str(args, 0).unwrap_or_default();
            let replacement = arg_str(args, 1).unwrap_or_default();
            Value::Str(s.replacen(&needle, &replacement, 1))
        }
        "replaceAll" => {
            let needle = arg_str(args, 0).unwrap_or_default();
            let replacement = arg_str(args, 1).unwrap_or_default();
            if needle.is_empty() {
                Value::Str(s.to_string())
            } else {
                Value::Str(s.replace(&needle, &replacement))
            }
        }
        "at" => {
            let raw = arg_num(args, 0);
            let index = if raw < 0.0 {
                len.checked_sub((-raw) as usize)
            } else {
                Some(raw as usize)
            };
            match index.and_then(|i| chars.get(i)) {
                Some(c) => Value::Str(c.to_string()),
                None => Value::Undefined,
            }
        }
        "toString" => Value::Str(s.to_string()),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// `String.fromCharCode(...)`.
pub fn from_char_code(args: &[Value]) -> Value {
    let out: String = args
        .iter()
        .filter_map(|v| {
            let code = v.to_number();
            if code.is_nan() || code < 0.0 {
                None
            } else {
                char::from_u32(code as u32)
            }
        })
        .collect();
    Value::Str(out)
}
