//! Guarded views over values returned from tool calls.
//!
//! Everything a tool call hands back into the inner realm is wrapped in a
//! guarded view before the guest can touch it. The view denies the blocked
//! property names and re-wraps nested reads so the guest cannot dig its way
//! to anything with a prototype chain.

use super::Value;
use warden_core::constants::GUARDED_VIEW_MAX_DEPTH;

/// Property names denied on guarded views.
pub const BLOCKED_PROPERTIES: [&str; 8] = [
    "constructor",
    "__proto__",
    "prototype",
    "defineProperty",
    "defineProperties",
    "setPrototypeOf",
    "getOwnPropertyDescriptor",
    "getOwnPropertyDescriptors",
];

/// The outcome of a property read through a guarded view.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardAccess {
    /// The read is permitted; nested compounds come back re-wrapped.
    Allowed(Value),
    /// The name is on the blocklist. The caller decides whether this throws
    /// or silently yields `undefined`, and records the violation either way.
    Blocked,
}

/// A value behind the blocked-name guard.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedValue {
    pub inner: Value,
    /// How many guarded hops deep this view already is.
    pub depth: u32,
}

impl GuardedValue {
    /// Wraps a freshly-returned tool value at depth zero.
    pub fn wrap(inner: Value) -> Value {
        Value::Guarded(Box::new(GuardedValue { inner, depth: 0 }))
    }

    /// Returns true when a property name is denied.
    pub fn is_blocked(key: &str) -> bool {
        BLOCKED_PROPERTIES.contains(&key)
    }

    /// Reads a property through the guard.
    pub fn get(&self, key: &str) -> GuardAccess {
        if Self::is_blocked(key) {
            return GuardAccess::Blocked;
        }
        let raw = match &self.inner {
            Value::Object(entries) => entries
                .read()
                .get(key)
                .cloned()
                .unwrap_or(Value::Undefined),
            Value::Array(items) => match key {
                "length" => Value::Number(items.read().len() as f64),
                _ => match key.parse::<usize>() {
                    Ok(index) => items
                        .read()
                        .get(index)
                        .cloned()
                        .unwrap_or(Value::Undefined),
                    Err(_) => Value::Undefined,
                },
            },
            Value::Str(s) => match key {
                "length" => Value::Number(s.chars().count() as f64),
                _ => Value::Undefined,
            },
            _ => Value::Undefined,
        };
        GuardAccess::Allowed(self.rewrap(raw))
    }

    /// Reads an array index through the guard.
    pub fn index(&self, index: usize) -> Value {
        let raw = match &self.inner {
            Value::Array(items) => items
                .read()
                .get(index)
                .cloned()
                .unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        };
        self.rewrap(raw)
    }

    /// Re-wraps a nested value, stopping at the recursion ceiling. Past the
    /// ceiling values come back raw: by then every compound hop has been
    /// filtered through the blocklist.
    fn rewrap(&self, value: Value) -> Value {
        let needs_guard = matches!(value, Value::Object(_) | Value::Array(_));
        if needs_guard && self.depth < GUARDED_VIEW_MAX_DEPTH {
            Value::Guarded(Box::new(GuardedValue {
                inner: value,
                depth: self.depth + 1,
            }))
        } else {
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn sample() -> Value {
        let mut inner = IndexMap::new();
        inner.insert("id".to_string(), Value::Number(7.0));
        let mut outer = IndexMap::new();
        outer.insert("user".to_string(), Value::object(inner));
        GuardedValue::wrap(Value::object(outer))
    }

    #[test]
    fn test_blocked_names_are_denied() {
        let Value::Guarded(guard) = sample() else {
            panic!("expected guarded value")
        };
        assert_eq!(guard.get("constructor"), GuardAccess::Blocked);
        assert_eq!(guard.get("__proto__"), GuardAccess::Blocked);
        assert_eq!(guard.get("prototype"), GuardAccess::Blocked);
    }

    #[test]
    fn test_nested_reads_stay_guarded() {
        let Value::Guarded(guard) = sample() else {
            panic!("expected guarded value")
        };
        let GuardAccess::Allowed(user) = guard.get("user") else {
            panic!("user must be readable")
        };
        let Value::Guarded(user) = user else {
            panic!("nested compound must come back re-wrapped")
        };
        assert_eq!(user.depth, 1);
        assert_eq!(user.get("defineProperty"), GuardAccess::Blocked);
        let GuardAccess::Allowed(id) = user.get("id") else {
            panic!("id must be readable")
        };
        assert_eq!(id, Value::Number(7.0));
    }

    #[test]
    fn test_array_views() {
        let guarded = GuardedValue::wrap(Value::array(vec![
            Value::str("a"),
            Value::empty_object(),
        ]));
        let Value::Guarded(guard) = guarded else {
            panic!("expected guarded value")
        };
        let GuardAccess::Allowed(len) = guard.get("length") else {
            panic!("length must be readable")
        };
        assert_eq!(len, Value::Number(2.0));
        assert!(matches!(guard.index(1), Value::Guarded(_)));
        assert!(matches!(guard.index(5), Value::Undefined));
    }

    #[test]
    fn test_rewrap_stops_at_ceiling() {
        // Build a chain deeper than the ceiling and walk it down.
        let mut value = Value::Number(1.0);
        for _ in 0..(GUARDED_VIEW_MAX_DEPTH + 3) {
            let mut map = IndexMap::new();
            map.insert("next".to_string(), value);
            value = Value::object(map);
        }
        let mut current = GuardedValue::wrap(value);
        let mut hops = 0;
        while let Value::Guarded(guard) = current {
            let GuardAccess::Allowed(next) = guard.get("next") else {
                panic!("next must be readable")
            };
            current = next;
            hops += 1;
        }
        assert_eq!(hops, GUARDED_VIEW_MAX_DEPTH + 1);
    }
}
