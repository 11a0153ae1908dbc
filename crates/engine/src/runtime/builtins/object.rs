//! The safe `Object` shadow.
//!
//! The realm's `Object` binding exposes only the read-only reflection
//! methods plus the freeze family; the definition methods that would let a
//! guest sculpt property descriptors are replaced with throwing stubs, and
//! `create` refuses its descriptors argument.

use indexmap::IndexMap;

use super::{NativeFn, NativeId};
use crate::error::{EngineError, EngineResult};
use crate::runtime::FrozenRegistry;
use crate::value::Value;

/// Builds the frozen safe-`Object` namespace.
pub fn namespace() -> Value {
    let mut entries = IndexMap::new();
    for (name, id) in [
        ("keys", NativeId::ObjectKeys),
        ("values", NativeId::ObjectValues),
        ("entries", NativeId::ObjectEntries),
        ("fromEntries", NativeId::ObjectFromEntries),
        ("assign", NativeId::ObjectAssign),
        ("is", NativeId::ObjectIs),
        ("hasOwn", NativeId::ObjectHasOwn),
        ("freeze", NativeId::ObjectFreeze),
        ("isFrozen", NativeId::ObjectIsFrozen),
        ("seal", NativeId::ObjectSeal),
        ("isSealed", NativeId::ObjectIsSealed),
        ("preventExtensions", NativeId::ObjectPreventExtensions),
        ("isExtensible", NativeId::ObjectIsExtensible),
        ("getOwnPropertyNames", NativeId::ObjectGetOwnPropertyNames),
        ("getOwnPropertySymbols", NativeId::ObjectGetOwnPropertySymbols),
        ("getPrototypeOf", NativeId::ObjectGetPrototypeOf),
        ("create", NativeId::ObjectCreate),
    ] {
        entries.insert(name.to_string(), Value::Native(NativeFn::new(name, id)));
    }
    for name in [
        "defineProperty",
        "defineProperties",
        "setPrototypeOf",
        "getOwnPropertyDescriptor",
        "getOwnPropertyDescriptors",
    ] {
        entries.insert(
            name.to_string(),
            Value::Native(NativeFn::new(name, NativeId::ObjectDisabledStub)),
        );
    }
    Value::object(entries)
}

fn first<'a>(args: &'a [Value]) -> &'a Value {
    args.first().unwrap_or(&Value::Undefined)
}

fn own_entries(value: &Value) -> Vec<(String, Value)> {
    match value.unguard() {
        Value::Object(entries) => entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Value::Array(items) => items
            .read()
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Dispatches one safe-`Object` method.
pub fn call(
    id: NativeId,
    name: &'static str,
    args: &[Value],
    frozen: &FrozenRegistry,
) -> EngineResult<Value> {
    match id {
        NativeId::ObjectKeys | NativeId::ObjectGetOwnPropertyNames => Ok(Value::array(
            own_entries(first(args))
                .into_iter()
                .map(|(k, _)| Value::Str(k))
                .collect(),
        )),
        NativeId::ObjectValues => Ok(Value::array(
            own_entries(first(args)).into_iter().map(|(_, v)| v).collect(),
        )),
        NativeId::ObjectEntries => Ok(Value::array(
            own_entries(first(args))
                .into_iter()
                .map(|(k, v)| Value::array(vec![Value::Str(k), v]))
                .collect(),
        )),
        NativeId::ObjectFromEntries => {
            let Value::Array(items) = first(args).unguard() else {
                return Err(EngineError::guest("Object.fromEntries expects an array"));
            };
            let mut entries = IndexMap::new();
            for item in items.read().iter() {
                let Value::Array(pair) = item.unguard() else {
                    return Err(EngineError::guest(
                        "Object.fromEntries expects [key, value] pairs",
                    ));
                };
                let pair = pair.read();
                let key = pair.first().map(|k| k.to_display_string()).unwrap_or_default();
                let value = pair.get(1).cloned().unwrap_or(Value::Undefined);
                entries.insert(key, value);
            }
            Ok(Value::object(entries))
        }
        NativeId::ObjectAssign => {
            let target = first(args).clone();
            let Value::Object(entries) = target.unguard() else {
                return Err(EngineError::guest("Object.assign target must be an object"));
            };
            if frozen.is_frozen(&target) {
                return Err(EngineError::guest(
                    "Object.assign cannot modify a frozen object",
                ));
            }
            for source in args.iter().skip(1) {
                for (key, value) in own_entries(source) {
                    entries.write().insert(key, value);
                }
            }
            Ok(target)
        }
        NativeId::ObjectIs => {
            let (a, b) = (first(args), args.get(1).unwrap_or(&Value::Undefined));
            let same = match (a, b) {
                (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
                _ => a.strict_equals(b),
            };
            Ok(Value::Bool(same))
        }
        NativeId::ObjectHasOwn => {
            let key = args
                .get(1)
                .map(|k| k.to_display_string())
                .unwrap_or_default();
            let has = match first(args).unguard() {
                Value::Object(entries) => entries.read().contains_key(&key),
                Value::Array(items) => key
                    .parse::<usize>()
                    .map(|i| i < items.read().len())
                    .unwrap_or(false),
                _ => false,
            };
            Ok(Value::Bool(has))
        }
        NativeId::ObjectFreeze => {
            let value = first(args).clone();
            frozen.freeze(&value);
            Ok(value)
        }
        NativeId::ObjectIsFrozen => Ok(Value::Bool(frozen.is_frozen(first(args)))),
        NativeId::ObjectSeal | NativeId::ObjectPreventExtensions => {
            let value = first(args).clone();
            frozen.prevent_extensions(&value);
            Ok(value)
        }
        NativeId::ObjectIsSealed => Ok(Value::Bool(!frozen.is_extensible(first(args)))),
        NativeId::ObjectIsExtensible => Ok(Value::Bool(frozen.is_extensible(first(args)))),
        NativeId::ObjectGetOwnPropertySymbols => Ok(Value::array(Vec::new())),
        NativeId::ObjectGetPrototypeOf => Ok(Value::Null),
        NativeId::ObjectCreate => {
            let proto = first(args);
            if !matches!(proto.unguard(), Value::Null | Value::Object(_)) {
                return Err(EngineError::guest(
                    "Object.create prototype must be an object or null",
                ));
            }
            if args.get(1).map(|a| !a.is_nullish()).unwrap_or(false) {
                return Err(EngineError::guest(
                    "Object.create property descriptors are not supported",
                ));
            }
            Ok(Value::empty_object())
        }
        NativeId::ObjectDisabledStub => {
            Err(EngineError::guest(format!("Object.{name} is disabled")))
        }
        _ => Err(EngineError::guest(format!("Object.{name} is not callable"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let mut entries = IndexMap::new();
        entries.insert("a".to_string(), Value::Number(1.0));
        entries.insert("b".to_string(), Value::Number(2.0));
        Value::object(entries)
    }

    fn registry() -> FrozenRegistry {
        FrozenRegistry::default()
    }

    #[test]
    fn test_keys_values_entries() {
        let frozen = registry();
        let obj = sample();
        let keys = call(NativeId::ObjectKeys, "keys", &[obj.clone()], &frozen).unwrap();
        assert_eq!(keys.to_json().unwrap(), serde_json::json!(["a", "b"]));
        let values = call(NativeId::ObjectValues, "values", &[obj.clone()], &frozen).unwrap();
        assert_eq!(values.to_json().unwrap(), serde_json::json!([1.0, 2.0]));
        let entries = call(NativeId::ObjectEntries, "entries", &[obj], &frozen).unwrap();
        let Value::Array(items) = entries else {
            panic!("expected array")
        };
        assert_eq!(items.read().len(), 2);
    }

    #[test]
    fn test_from_entries_round_trip() {
        let frozen = registry();
        let entries = call(NativeId::ObjectEntries, "entries", &[sample()], &frozen).unwrap();
        let rebuilt =
            call(NativeId::ObjectFromEntries, "fromEntries", &[entries], &frozen).unwrap();
        let Value::Object(map) = rebuilt else {
            panic!("expected object")
        };
        assert_eq!(map.read()["b"], Value::Number(2.0));
    }

    #[test]
    fn test_freeze_blocks_assign() {
        let frozen = registry();
        let obj = sample();
        call(NativeId::ObjectFreeze, "freeze", &[obj.clone()], &frozen).unwrap();
        let err = call(
            NativeId::ObjectAssign,
            "assign",
            &[obj.clone(), sample()],
            &frozen,
        )
        .unwrap_err();
        assert!(err.to_string().contains("frozen"));
        let is_frozen =
            call(NativeId::ObjectIsFrozen, "isFrozen", &[obj], &frozen).unwrap();
        assert_eq!(is_frozen, Value::Bool(true));
    }

    #[test]
    fn test_disabled_stubs_throw() {
        let frozen = registry();
        let err = call(
            NativeId::ObjectDisabledStub,
            "defineProperty",
            &[sample()],
            &frozen,
        )
        .unwrap_err();
        assert!(err.to_string().contains("defineProperty is disabled"));
    }

    #[test]
    fn test_create_refuses_descriptors() {
        let frozen = registry();
        assert!(call(
            NativeId::ObjectCreate,
            "create",
            &[Value::Null],
            &frozen
        )
        .is_ok());
        let err = call(
            NativeId::ObjectCreate,
            "create",
            &[Value::Null, sample()],
            &frozen,
        )
        .unwrap_err();
        assert!(err.to_string().contains("descriptors"));
    }

    #[test]
    fn test_get_prototype_of_is_null() {
        let frozen = registry();
        assert_eq!(
            call(NativeId::ObjectGetPrototypeOf, "getPrototypeOf", &[sample()], &frozen).unwrap(),
            Value::Null
        );
    }
}
