//! Date construction and methods.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::error::{EngineError, EngineResult};
use crate::value::Value;

/// Current wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// `new Date(...)` with zero or one argument.
pub fn construct(args: &[Value]) -> EngineResult<Value> {
    let date = match args.first() {
        None => now(),
        Some(Value::Number(ms)) => from_millis(*ms)?,
        Some(Value::Date(d)) => *d,
        Some(Value::Str(s)) => parse_text(s)
            .ok_or_else(|| EngineError::guest(format!("Invalid date string: {s}")))?,
        Some(other) => from_millis(other.to_number())?,
    };
    Ok(Value::Date(date))
}

fn from_millis(ms: f64) -> EngineResult<DateTime<Utc>> {
    if ms.is_nan() || ms.is_infinite() {
        return Err(EngineError::guest("Invalid time value"));
    }
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .ok_or_else(|| EngineError::guest("Invalid time value"))
}

fn parse_text(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| Utc.from_utc_datetime(&d))
        })
}

/// `Date.parse(text)` in epoch milliseconds, NaN on failure.
pub fn parse(args: &[Value]) -> Value {
    let text = args
        .first()
        .map(|v| v.to_display_string())
        .unwrap_or_default();
    match parse_text(&text) {
        Some(d) => Value::Number(d.timestamp_millis() as f64),
        None => Value::Number(f64::NAN),
    }
}

/// Dispatches one date method. Returns `None` for unknown names.
pub fn call_method(date: &DateTime<Utc>, method: &str, _args: &[Value]) -> Option<Value> {
    let value = match method {
        "getTime" | "valueOf" => Value::Number(date.timestamp_millis() as f64),
        "toISOString" | "toJSON" => Value::Str(
            date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ),
        "getFullYear" => Value::Number(date.year() as f64),
        "getMonth" => Value::Number(date.month0() as f64),
        "getDate" => Value::Number(date.day() as f64),
        "getDay" => Value::Number(date.weekday().num_days_from_sunday() as f64),
        "getHours" => Value::Number(date.hour() as f64),
        "getMinutes" => Value::Number(date.minute() as f64),
        "getSeconds" => Value::Number(date.second() as f64),
        "getMilliseconds" => Value::Number(date.timestamp_subsec_millis() as f64),
        "toString" => Value::Str(date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        _ => return None,
    };
    Some(value)
}
