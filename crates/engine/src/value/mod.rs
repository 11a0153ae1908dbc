//! Dynamic value model for the guest realm.
//!
//! This module provides the polymorphic value type guest programs compute
//! with. Compound values (arrays, objects) are shared and reference-counted
//! so aliasing and cycles behave the way the guest language expects; the
//! sanitizer detects cycles through pointer identity.

mod guarded;
mod sealed;

pub use guarded::{GuardAccess, GuardedValue, BLOCKED_PROPERTIES};
pub use sealed::SealedError;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::Zero;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::program::Stmt;
use crate::runtime::builtins::NativeFn;
use crate::runtime::Env;

/// Shared, internally-locked array storage.
pub type ArrayRef = Arc<RwLock<Vec<Value>>>;

/// Shared, internally-locked, insertion-ordered object storage.
pub type ObjectRef = Arc<RwLock<IndexMap<String, Value>>>;

/// A guest function closure: the pre-transformed body plus its captured
/// environment.
#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub name: Option<String>,
    pub params: Arc<Vec<String>>,
    pub body: Arc<Vec<Stmt>>,
    pub env: Env,
}

/// A compiled guest regular expression.
#[derive(Debug, Clone)]
pub struct RegexValue {
    pub source: String,
    pub flags: String,
    pub compiled: Arc<regex::Regex>,
}

impl RegexValue {
    /// Compiles a guest pattern. The `i` flag is honored; everything else is
    /// carried but ignored.
    pub fn new(source: &str, flags: &str) -> EngineResult<Self> {
        let mut builder = regex::RegexBuilder::new(source);
        if flags.contains('i') {
            builder.case_insensitive(true);
        }
        let compiled = builder
            .build()
            .map_err(|e| EngineError::guest(format!("Invalid regular expression: {e}")))?;
        Ok(Self {
            source: source.to_string(),
            flags: flags.to_string(),
            compiled: Arc::new(compiled),
        })
    }
}

/// Represents a value in the guest realm.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absent value.
    Undefined,

    /// The null value.
    Null,

    /// A boolean value.
    Bool(bool),

    /// A double-precision number.
    Number(f64),

    /// An arbitrary-precision integer.
    BigInt(BigInt),

    /// An immutable string.
    Str(String),

    /// A shared array of values.
    Array(ArrayRef),

    /// A shared record with string keys, in insertion order.
    Object(ObjectRef),

    /// A wall-clock instant.
    Date(DateTime<Utc>),

    /// A guest regular expression.
    Regex(RegexValue),

    /// A symbolic value; rejected at every serialization boundary.
    Symbol(String),

    /// A guest closure.
    Function(FunctionValue),

    /// An engine-installed native function.
    Native(NativeFn),

    /// A sealed engine error value with its prototype chain severed.
    Sealed(SealedError),

    /// A guarded view over a value a tool call returned.
    Guarded(Box<GuardedValue>),
}

impl Value {
    /// Creates an array value from items.
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    /// Creates an object value from entries, preserving order.
    pub fn object(entries: IndexMap<String, Value>) -> Self {
        Value::Object(Arc::new(RwLock::new(entries)))
    }

    /// Creates an empty object value.
    pub fn empty_object() -> Self {
        Value::Object(Arc::new(RwLock::new(IndexMap::new())))
    }

    /// Creates a string value.
    pub fn str<S: Into<String>>(value: S) -> Self {
        Value::Str(value.into())
    }

    /// The `typeof` tag for this value.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::Str(_) => "string",
            Value::Array(_) | Value::Object(_) | Value::Date(_) | Value::Regex(_) => "object",
            Value::Symbol(_) => "symbol",
            Value::Function(_) | Value::Native(_) => "function",
            Value::Sealed(_) => "object",
            Value::Guarded(g) => g.inner.type_of(),
        }
    }

    /// Returns true if the value is `undefined` or `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Returns true if the value is callable.
    pub fn is_callable(&self) -> bool {
        match self {
            Value::Function(_) | Value::Native(_) => true,
            Value::Guarded(g) => g.inner.is_callable(),
            _ => false,
        }
    }

    /// Converts the value to a boolean.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::BigInt(i) => !i.is_zero(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_)
            | Value::Object(_)
            | Value::Date(_)
            | Value::Regex(_)
            | Value::Symbol(_)
            | Value::Function(_)
            | Value::Native(_)
            | Value::Sealed(_) => true,
            Value::Guarded(g) => g.inner.truthy(),
        }
    }

    /// Converts the value to a number, with the guest language's loose rules.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            Value::Date(d) => d.timestamp_millis() as f64,
            Value::Guarded(g) => g.inner.to_number(),
            _ => f64::NAN,
        }
    }

    /// Formats a number the way the guest language prints it.
    pub fn format_number(n: f64) -> String {
        if n.is_nan() {
            return "NaN".to_string();
        }
        if n.is_infinite() {
            return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
        }
        if n == 0.0 {
            return "0".to_string();
        }
        if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return format!("{}", n as i64);
        }
        format!("{n}")
    }

    /// Stringifies the value for display, concatenation and console output.
    /// Array rendering is depth-capped so cyclic structures terminate.
    pub fn to_display_string(&self) -> String {
        self.display_with_depth(0)
    }

    fn display_with_depth(&self, depth: u32) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => Self::format_number(*n),
            Value::BigInt(i) => i.to_string(),
            Value::Str(s) => s.clone(),
            Value::Array(items) => {
                if depth >= 8 {
                    return String::new();
                }
                let items = items.read();
                items
                    .iter()
                    .map(|v| match v {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.display_with_depth(depth + 1),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(_) => "[object Object]".to_string(),
            Value::Date(d) => d.to_rfc3339_opts(SecondsFormat::Millis, true),
            Value::Regex(r) => format!("/{}/{}", r.source, r.flags),
            Value::Symbol(desc) => format!("Symbol({desc})"),
            Value::Function(f) => match &f.name {
                Some(name) => format!("function {name}() {{ ... }}"),
                None => "function () { ... }".to_string(),
            },
            Value::Native(f) => format!("function {}() {{ [native code] }}", f.name()),
            Value::Sealed(e) => format!("{}: {}", e.name, e.message),
            Value::Guarded(g) => g.inner.display_with_depth(depth),
        }
    }

    /// Strict equality (`===`).
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Guarded(a), b) => a.inner.strict_equals(b),
            (a, Value::Guarded(b)) => a.strict_equals(&b.inner),
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => std::ptr::eq(a, b) || a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.body, &b.body),
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::Sealed(a), Value::Sealed(b)) => a == b,
            _ => false,
        }
    }

    /// Loose equality (`==`), with a deliberately small coercion table.
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Number(_), Value::Str(_))
            | (Value::Str(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => {
                let (a, b) = (self.to_number(), other.to_number());
                !a.is_nan() && !b.is_nan() && a == b
            }
            _ => self.strict_equals(other),
        }
    }

    /// Converts the value to host-facing JSON. Callables and symbols are
    /// rejected: they must never cross the boundary. Cycles are an error,
    /// never a hang.
    pub fn to_json(&self) -> EngineResult<serde_json::Value> {
        let mut ancestors = Vec::new();
        self.to_json_inner(&mut ancestors)
    }

    fn to_json_inner(&self, ancestors: &mut Vec<usize>) -> EngineResult<serde_json::Value> {
        match self {
            Value::Undefined | Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Number(n) => {
                if n.is_finite() {
                    Ok(serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null))
                } else {
                    Ok(serde_json::Value::Null)
                }
            }
            Value::BigInt(i) => Ok(serde_json::Value::String(i.to_string())),
            Value::Str(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Array(items) => {
                let ptr = Arc::as_ptr(items) as usize;
                if ancestors.contains(&ptr) {
                    return Err(EngineError::guest("Converting circular structure to JSON"));
                }
                ancestors.push(ptr);
                let items = items.read();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(item.to_json_inner(ancestors)?);
                }
                drop(items);
                ancestors.pop();
                Ok(serde_json::Value::Array(out))
            }
            Value::Object(entries) => {
                let ptr = Arc::as_ptr(entries) as usize;
                if ancestors.contains(&ptr) {
                    return Err(EngineError::guest("Converting circular structure to JSON"));
                }
                ancestors.push(ptr);
                let entries = entries.read();
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries.iter() {
                    map.insert(key.clone(), value.to_json_inner(ancestors)?);
                }
                drop(entries);
                ancestors.pop();
                Ok(serde_json::Value::Object(map))
            }
            Value::Date(d) => Ok(serde_json::Value::String(
                d.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            Value::Regex(r) => Ok(serde_json::Value::String(format!(
                "/{}/{}",
                r.source, r.flags
            ))),
            Value::Sealed(e) => Ok(serde_json::json!({
                "name": e.name,
                "message": e.message,
            })),
            Value::Symbol(_) => Err(EngineError::SymbolReturned),
            Value::Function(_) | Value::Native(_) => Err(EngineError::FunctionReturned),
            Value::Guarded(g) => g.inner.to_json_inner(ancestors),
        }
    }

    /// Builds a value tree from host JSON, preserving object key order.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let mut entries = IndexMap::with_capacity(map.len());
                for (key, value) in map {
                    entries.insert(key.clone(), Value::from_json(value));
                }
                Value::object(entries)
            }
        }
    }

    /// Unwraps guarded views, yielding the underlying value.
    pub fn unguard(&self) -> &Value {
        match self {
            Value::Guarded(g) => g.inner.unguard(),
            other => other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_equals(other)
    }
}
