//! Sealed error values.
//!
//! Every error the engine throws into the guest realm is a sealed value: no
//! stack, no prototype chain, and a constructor link that resolves back to
//! the value itself. The classic prototype-walking escape
//! (`err.constructor.constructor("payload")`) only ever reaches the inert
//! self-reference.

use super::Value;
use crate::error::EngineError;

/// An immutable error value with its prototype chain severed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedError {
    /// Error class name as the guest sees it.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stable engine code, recoverable by the orchestrator.
    pub code: String,
}

impl SealedError {
    pub fn new<S: Into<String>>(name: S, message: S, code: S) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: code.into(),
        }
    }

    /// Seals an engine error for throwing into the guest realm.
    pub fn from_error(error: &EngineError) -> Self {
        Self {
            name: error.name().to_string(),
            message: error.to_string(),
            code: error.code().to_string(),
        }
    }

    /// Property access on a sealed error. Only `name` and `message` are
    /// visible; the prototype-walk names resolve to the sealed value itself;
    /// everything else is absent.
    pub fn member(&self, key: &str) -> Value {
        match key {
            "name" => Value::Str(self.name.clone()),
            "message" => Value::Str(self.message.clone()),
            "constructor" | "__proto__" | "prototype" => Value::Sealed(self.clone()),
            _ => Value::Undefined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prototype_walk_reaches_only_the_seal() {
        let sealed = SealedError::from_error(&EngineError::memory_limit(10, 5));
        // err.constructor.constructor never leaves the sealed value.
        let step1 = sealed.member("constructor");
        let Value::Sealed(inner) = step1 else {
            panic!("constructor must resolve to the sealed value");
        };
        let step2 = inner.member("constructor");
        assert!(matches!(step2, Value::Sealed(_)));
    }

    #[test]
    fn test_stack_is_absent() {
        let sealed = SealedError::new("Error", "boom", "DOUBLE_VM_EXECUTION_ERROR");
        assert!(matches!(sealed.member("stack"), Value::Undefined));
    }

    #[test]
    fn test_code_survives_sealing() {
        let sealed = SealedError::from_error(&EngineError::CompositeDisallowed);
        assert_eq!(sealed.code, "COMPOSITE_DISALLOWED");
    }
}
