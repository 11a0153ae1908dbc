//! The `Math` namespace.

use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{NativeFn, NativeId};
use crate::error::EngineResult;
use crate::value::Value;

/// Builds the frozen `Math` namespace object.
pub fn namespace() -> Value {
    let mut entries = IndexMap::new();
    entries.insert("PI".to_string(), Value::Number(std::f64::consts::PI));
    entries.insert("E".to_string(), Value::Number(std::f64::consts::E));
    entries.insert("LN2".to_string(), Value::Number(std::f64::consts::LN_2));
    entries.insert("LN10".to_string(), Value::Number(std::f64::consts::LN_10));
    entries.insert("SQRT2".to_string(), Value::Number(std::f64::consts::SQRT_2));
    for (name, id) in [
        ("abs", NativeId::MathAbs),
        ("floor", NativeId::MathFloor),
        ("ceil", NativeId::MathCeil),
        ("round", NativeId::MathRound),
        ("trunc", NativeId::MathTrunc),
        ("sqrt", NativeId::MathSqrt),
        ("pow", NativeId::MathPow),
        ("min", NativeId::MathMin),
        ("max", NativeId::MathMax),
        ("random", NativeId::MathRandom),
        ("log", NativeId::MathLog),
        ("exp", NativeId::MathExp),
        ("sign", NativeId::MathSign),
    ] {
        entries.insert(name.to_string(), Value::Native(NativeFn::new(name, id)));
    }
    Value::object(entries)
}

fn arg(args: &[Value], index: usize) -> f64 {
    args.get(index).map(|v| v.to_number()).unwrap_or(f64::NAN)
}

/// A splitmix step over a process-wide state. Guests only get a uniform
/// stream; nothing about the host clock is recoverable from it.
fn next_random() -> f64 {
    static STATE: AtomicU64 = AtomicU64::new(0x9E3779B97F4A7C15);
    let mut z = STATE.fetch_add(0x9E3779B97F4A7C15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

/// Dispatches one `Math` function.
pub fn call(id: NativeId, args: &[Value]) -> EngineResult<Value> {
    let result = match id {
        NativeId::MathAbs => arg(args, 0).abs(),
        NativeId::MathFloor => arg(args, 0).floor(),
        NativeId::MathCeil => arg(args, 0).ceil(),
        NativeId::MathRound => {
            // Half-up rounding, including for negative halves.
            let n = arg(args, 0);
            (n + 0.5).floor()
        }
        NativeId::MathTrunc => arg(args, 0).trunc(),
        NativeId::MathSqrt => arg(args, 0).sqrt(),
        NativeId::MathPow => arg(args, 0).powf(arg(args, 1)),
        NativeId::MathMin => args
            .iter()
            .map(|v| v.to_number())
            .fold(f64::INFINITY, f64::min),
        NativeId::MathMax => args
            .iter()
            .map(|v| v.to_number())
            .fold(f64::NEG_INFINITY, f64::max),
        NativeId::MathRandom => next_random(),
        NativeId::MathLog => arg(args, 0).ln(),
        NativeId::MathExp => arg(args, 0).exp(),
        NativeId::MathSign => {
            let n = arg(args, 0);
            if n.is_nan() {
                f64::NAN
            } else if n > 0.0 {
                1.0
            } else if n < 0.0 {
                -1.0
            } else {
                n
            }
        }
        _ => f64::NAN,
    };
    Ok(Value::Number(result))
}
