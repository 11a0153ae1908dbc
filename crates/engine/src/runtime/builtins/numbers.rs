//! Number methods, `Number` statics and the numeric global functions.

use crate::error::{EngineError, EngineResult};
use crate::value::Value;

/// Dispatches one number method. Returns `None` for unknown names.
pub fn call_method(n: f64, method: &str, args: &[Value]) -> EngineResult<Option<Value>> {
    let value = match method {
        "toFixed" => {
            let digits = args.get(0).map(|v| v.to_number()).unwrap_or(0.0);
            if digits.is_nan() || !(0.0..=100.0).contains(&digits) {
                return Err(EngineError::guest("toFixed() digits argument must be between 0 and 100"));
            }
            Value::Str(format!("{:.*}", digits as usize, n))
        }
        "toString" => {
            let radix = args.get(0).map(|v| v.to_number()).unwrap_or(10.0);
            match radix as u32 {
                10 => Value::Str(Value::format_number(n)),
                radix @ 2..=36 => {
                    if n.fract() != 0.0 || n.is_nan() || n.is_infinite() {
                        Value::Str(Value::format_number(n))
                    } else {
                        Value::Str(to_radix(n as i64, radix))
                    }
                }
                _ => {
                    return Err(EngineError::guest(
                        "toString() radix must be between 2 and 36",
                    ))
                }
            }
        }
        "valueOf" => Value::Number(n),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn to_radix(mut n: i64, radix: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let negative = n < 0;
    n = n.abs();
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % radix as i64) as usize]);
        n /= radix as i64;
    }
    if negative {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8(out).expect("radix digits are ascii")
}

/// `parseInt(text, radix?)`.
pub fn parse_int(args: &[Value]) -> Value {
    let text = args
        .get(0)
        .map(|v| v.to_display_string())
        .unwrap_or_default();
    let text = text.trim();
    let radix = match args.get(1).map(|v| v.to_number()) {
        Some(r) if (2.0..=36.0).contains(&r) => r as u32,
        Some(r) if r != 0.0 && !r.is_nan() => return Value::Number(f64::NAN),
        _ => 10,
    };
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let digits = if radix == 16 {
        digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits)
    } else {
        digits
    };
    let prefix: String = digits
        .chars()
        .take_while(|c| c.to_digit(radix).is_some())
        .collect();
    if prefix.is_empty() {
        return Value::Number(f64::NAN);
    }
    let mut out = 0f64;
    for c in prefix.chars() {
        out = out * radix as f64 + c.to_digit(radix).unwrap() as f64;
    }
    Value::Number(if negative { -out } else { out })
}

/// `parseFloat(text)`.
pub fn parse_float(args: &[Value]) -> Value {
    let text = args
        .get(0)
        .map(|v| v.to_display_string())
        .unwrap_or_default();
    let text = text.trim();
    // Longest numeric prefix.
    let mut end = 0;
    let bytes = text.as_bytes();
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end] as char;
        let ok = c.is_ascii_digit()
            || (c == '-' || c == '+') && (end == 0 || matches!(bytes[end - 1], b'e' | b'E'))
            || (c == '.' && !seen_dot && !seen_exp)
            || ((c == 'e' || c == 'E') && !seen_exp && end > 0);
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        seen_exp |= c == 'e' || c == 'E';
        end += 1;
    }
    text[..end]
        .parse::<f64>()
        .map(Value::Number)
        .unwrap_or(Value::Number(f64::NAN))
}

/// The `Number.is*` statics.
pub fn is_integer(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Bool(n.is_finite() && n.fract() == 0.0),
        _ => Value::Bool(false),
    }
}

/// Strict NaN check: no coercion, unlike the global `isNaN`.
pub fn is_nan_strict(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Bool(n.is_nan()),
        _ => Value::Bool(false),
    }
}

/// Strict finiteness check.
pub fn is_finite_strict(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Bool(n.is_finite()),
        _ => Value::Bool(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_fixed() {
        let out = call_method(1.23456, "toFixed", &[Value::Number(2.0)])
            .unwrap()
            .unwrap();
        assert_eq!(out, Value::str("1.23"));
    }

    #[test]
    fn test_to_string_radix() {
        let out = call_method(255.0, "toString", &[Value::Number(16.0)])
            .unwrap()
            .unwrap();
        assert_eq!(out, Value::str("ff"));
        assert!(call_method(1.0, "toString", &[Value::Number(99.0)]).is_err());
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(&[Value::str("  42px")]), Value::Number(42.0));
        assert_eq!(parse_int(&[Value::str("-17")]), Value::Number(-17.0));
        assert_eq!(
            parse_int(&[Value::str("0xff"), Value::Number(16.0)]),
            Value::Number(255.0)
        );
        assert!(matches!(parse_int(&[Value::str("zzz")]), Value::Number(n) if n.is_nan()));
    }

    #[test]
    fn test_parse_float() {
        assert_eq!(parse_float(&[Value::str("3.14suffix")]), Value::Number(3.14));
        assert_eq!(parse_float(&[Value::str("1e3")]), Value::Number(1_000.0));
        assert!(matches!(parse_float(&[Value::str("abc")]), Value::Number(n) if n.is_nan()));
    }

    #[test]
    fn test_strict_checks_do_not_coerce() {
        assert_eq!(is_nan_strict(&Value::str("nope")), Value::Bool(false));
        assert_eq!(is_integer(&Value::Number(4.0)), Value::Bool(true));
        assert_eq!(is_integer(&Value::Number(4.5)), Value::Bool(false));
    }
}
