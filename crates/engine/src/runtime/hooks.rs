//! Runtime hooks backing the transformer's rewritten forms.
//!
//! Loops run through a shared bounded driver; `concat` and `template` carry
//! the reference-handle composite gating and the string-growth accounting.

use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::is_reference_handle;
use crate::error::{EngineError, EngineResult};
use crate::memory_accountant::MemoryAccountant;
use crate::value::Value;
use warden_core::stats::{AbortFlag, SharedStats};

/// Per-iteration instrumentation shared by `forOf`, `for`, `while` and
/// `doWhile`: abort poll, deadline poll, iteration count, iteration cap.
pub struct LoopGuard {
    stats: Arc<SharedStats>,
    abort: AbortFlag,
    deadline: Instant,
    max_iterations: u64,
    timeout_ms: u64,
}

impl LoopGuard {
    pub fn new(
        stats: Arc<SharedStats>,
        abort: AbortFlag,
        deadline: Instant,
        max_iterations: u64,
        timeout_ms: u64,
    ) -> Self {
        Self {
            stats,
            abort,
            deadline,
            max_iterations,
            timeout_ms,
        }
    }

    /// Charges one iteration. Called at the top of every loop body.
    pub fn tick(&self) -> EngineResult<()> {
        if self.abort.is_set() {
            return Err(EngineError::ExecutionAborted);
        }
        if Instant::now() > self.deadline {
            return Err(EngineError::timeout(self.timeout_ms));
        }
        let executed = self.stats.record_iteration();
        if executed > self.max_iterations {
            // Consume the increment that tripped the cap; the reported count
            // never exceeds the budget.
            self.stats.unrecord_iteration();
            return Err(EngineError::iteration_limit(executed, self.max_iterations));
        }
        Ok(())
    }
}

fn units(s: &str) -> u64 {
    s.chars().count() as u64
}

/// Builds a composite-handle value: `{ kind: "composite", op, parts }`.
fn composite(op: &str, parts: Vec<Value>) -> Value {
    let mut entries = IndexMap::new();
    entries.insert("kind".to_string(), Value::str("composite"));
    entries.insert("op".to_string(), Value::str(op));
    entries.insert("parts".to_string(), Value::array(parts));
    Value::object(entries)
}

fn handle_str(value: &Value) -> Option<&str> {
    match value {
        Value::Str(s) if is_reference_handle(s) => Some(s),
        _ => None,
    }
}

/// The `concat` hook: the transformer's rewrite of `+` on possibly-string
/// operands.
pub fn concat_values(
    left: &Value,
    right: &Value,
    accountant: &MemoryAccountant,
    allow_composites: bool,
) -> EngineResult<Value> {
    let left = left.unguard();
    let right = right.unguard();

    if let (Value::Number(a), Value::Number(b)) = (left, right) {
        return Ok(Value::Number(a + b));
    }
    if let (Value::BigInt(a), Value::BigInt(b)) = (left, right) {
        return Ok(Value::BigInt(a + b));
    }

    // Reference handles never concatenate into plain strings; they either
    // form a composite or fail.
    if handle_str(left).is_some() || handle_str(right).is_some() {
        if !allow_composites {
            return Err(EngineError::CompositeDisallowed);
        }
        return Ok(composite("concat", vec![left.clone(), right.clone()]));
    }

    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        accountant.track(MemoryAccountant::estimate_string(units(b)))?;
        let mut out = String::with_capacity(a.len() + b.len());
        out.push_str(a);
        out.push_str(b);
        return Ok(Value::Str(out));
    }

    // Default addition semantics for the remaining shapes: numeric when both
    // sides coerce cleanly, string concatenation otherwise.
    let string_like = |v: &Value| {
        matches!(
            v,
            Value::Str(_) | Value::Array(_) | Value::Object(_) | Value::Date(_) | Value::Sealed(_)
        )
    };
    if !string_like(left) && !string_like(right) {
        return Ok(Value::Number(left.to_number() + right.to_number()));
    }
    let a = left.to_display_string();
    let b = right.to_display_string();
    accountant.track(MemoryAccountant::estimate_string(units(&a) + units(&b)))?;
    Ok(Value::Str(format!("{a}{b}")))
}

/// The `template` hook: the transformer's rewrite of template literals.
/// `quasis` always has one more element than `values`.
pub fn template_values(
    quasis: &[String],
    values: &[Value],
    accountant: &MemoryAccountant,
    allow_composites: bool,
) -> EngineResult<Value> {
    let rendered: Vec<String> = values
        .iter()
        .map(|v| v.unguard().to_display_string())
        .collect();

    if rendered.iter().any(|s| is_reference_handle(s)) {
        if !allow_composites {
            return Err(EngineError::CompositeDisallowed);
        }
        let mut parts = Vec::with_capacity(quasis.len() + values.len());
        for (index, quasi) in quasis.iter().enumerate() {
            if !quasi.is_empty() {
                parts.push(Value::str(quasi.clone()));
            }
            if let Some(value) = rendered.get(index) {
                parts.push(Value::str(value.clone()));
            }
        }
        return Ok(composite("template", parts));
    }

    let total: u64 = quasis.iter().map(|q| units(q)).sum::<u64>()
        + rendered.iter().map(|r| units(r)).sum::<u64>();
    accountant.track(MemoryAccountant::estimate_string(total))?;

    let mut out = String::new();
    for (index, quasi) in quasis.iter().enumerate() {
        out.push_str(quasi);
        if let Some(value) = rendered.get(index) {
            out.push_str(value);
        }
    }
    Ok(Value::Str(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::generate_handle;

    fn unlimited() -> Arc<MemoryAccountant> {
        MemoryAccountant::new(0)
    }

    #[test]
    fn test_numeric_concat_adds() {
        let out = concat_values(
            &Value::Number(2.0),
            &Value::Number(3.0),
            &unlimited(),
            false,
        )
        .unwrap();
        assert_eq!(out, Value::Number(5.0));
    }

    #[test]
    fn test_string_concat_tracks_the_right_operand() {
        let accountant = MemoryAccountant::new(0);
        let out = concat_values(
            &Value::str("foo"),
            &Value::str("bar"),
            &accountant,
            false,
        )
        .unwrap();
        assert_eq!(out, Value::str("foobar"));
        assert_eq!(
            accountant.snapshot().tracked_bytes,
            MemoryAccountant::estimate_string(3)
        );
    }

    #[test]
    fn test_handle_concat_is_gated() {
        let handle = generate_handle();
        let err = concat_values(
            &Value::Str(handle.clone()),
            &Value::str("-suffix"),
            &unlimited(),
            false,
        )
        .unwrap_err();
        assert_eq!(err.code(), "COMPOSITE_DISALLOWED");

        let out = concat_values(
            &Value::Str(handle.clone()),
            &Value::str("-suffix"),
            &unlimited(),
            true,
        )
        .unwrap();
        let json = out.to_json().unwrap();
        assert_eq!(json["kind"], "composite");
        assert_eq!(json["op"], "concat");
        assert_eq!(json["parts"][0], handle);
    }

    #[test]
    fn test_mixed_concat_falls_back() {
        let out = concat_values(
            &Value::Bool(true),
            &Value::Number(1.0),
            &unlimited(),
            false,
        )
        .unwrap();
        assert_eq!(out, Value::Number(2.0));

        let out = concat_values(
            &Value::str("n="),
            &Value::Number(4.0),
            &unlimited(),
            false,
        )
        .unwrap();
        assert_eq!(out, Value::str("n=4"));
    }

    #[test]
    fn test_template_interleaves() {
        let out = template_values(
            &["a=".to_string(), ", b=".to_string(), "!".to_string()],
            &[Value::Number(1.0), Value::str("two")],
            &unlimited(),
            false,
        )
        .unwrap();
        assert_eq!(out, Value::str("a=1, b=two!"));
    }

    #[test]
    fn test_template_with_handle_is_gated() {
        let handle = generate_handle();
        let err = template_values(
            &["prefix-".to_string(), String::new()],
            &[Value::Str(handle.clone())],
            &unlimited(),
            false,
        )
        .unwrap_err();
        assert_eq!(err.code(), "COMPOSITE_DISALLOWED");

        let out = template_values(
            &["prefix-".to_string(), String::new()],
            &[Value::Str(handle)],
            &unlimited(),
            true,
        )
        .unwrap();
        assert_eq!(out.to_json().unwrap()["op"], "template");
    }

    #[test]
    fn test_loop_guard_counts_and_caps() {
        let stats = SharedStats::new();
        let guard = LoopGuard::new(
            stats.clone(),
            AbortFlag::new(),
            Instant::now() + std::time::Duration::from_secs(60),
            3,
            60_000,
        );
        guard.tick().unwrap();
        guard.tick().unwrap();
        guard.tick().unwrap();
        let err = guard.tick().unwrap_err();
        assert_eq!(err.code(), "ITERATION_LIMIT_EXCEEDED");
        assert_eq!(stats.iteration_count(), 3);
    }

    #[test]
    fn test_loop_guard_zero_budget_fails_first_tick() {
        let guard = LoopGuard::new(
            SharedStats::new(),
            AbortFlag::new(),
            Instant::now() + std::time::Duration::from_secs(60),
            0,
            60_000,
        );
        assert!(guard.tick().is_err());
    }

    #[test]
    fn test_loop_guard_abort() {
        let abort = AbortFlag::new();
        abort.set();
        let guard = LoopGuard::new(
            SharedStats::new(),
            abort,
            Instant::now() + std::time::Duration::from_secs(60),
            10,
            60_000,
        );
        assert_eq!(guard.tick().unwrap_err().code(), "EXECUTION_ABORTED");
    }
}
