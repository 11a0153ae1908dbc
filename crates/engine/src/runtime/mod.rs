//! The inner-realm runtime.
//!
//! A realm is an isolated evaluation context: its own global binding table,
//! its own intrinsics, its own heap of shared compound values. This module
//! owns the binding table construction (curated standard bindings, runtime
//! hooks, security-level stripping), the lexical environment, the violation
//! side channel and the freeze registry backing the safe `Object` methods.

pub mod builtins;
pub mod console;
pub mod hooks;
pub mod interpreter;

pub use console::{ConsoleEntry, ConsoleLevel, ConsoleMeter};
pub use interpreter::{Interpreter, Interrupt};

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::ViolationKind;
use crate::value::{GuardedValue, Value};
use builtins::{NativeFn, NativeId};
use warden_core::config::SecurityLevel;

/// One lexical scope frame. Frames chain toward the function's closure root;
/// the realm's global table is consulted only after the chain is exhausted.
#[derive(Debug)]
pub struct Scope {
    vars: RwLock<HashMap<String, Value>>,
    parent: Option<Env>,
}

/// A shared handle to a scope frame.
#[derive(Debug, Clone)]
pub struct Env(Arc<Scope>);

impl Env {
    /// A fresh root scope.
    pub fn root() -> Env {
        Env(Arc::new(Scope {
            vars: RwLock::new(HashMap::new()),
            parent: None,
        }))
    }

    /// A child scope for a block or a call frame.
    pub fn child(&self) -> Env {
        Env(Arc::new(Scope {
            vars: RwLock::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    /// Declares a binding in this frame, shadowing any outer one.
    pub fn define(&self, name: &str, value: Value) {
        self.0.vars.write().insert(name.to_string(), value);
    }

    /// Resolves a name through the chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = Some(&self.0);
        while let Some(scope) = current {
            if let Some(value) = scope.vars.read().get(name) {
                return Some(value.clone());
            }
            current = scope.parent.as_ref().map(|env| &env.0);
        }
        None
    }

    /// Assigns to an existing binding; returns false when no frame holds it.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut current = Some(&self.0);
        while let Some(scope) = current {
            let mut vars = scope.vars.write();
            if let Some(slot) = vars.get_mut(name) {
                *slot = value;
                return true;
            }
            drop(vars);
            current = scope.parent.as_ref().map(|env| &env.0);
        }
        false
    }
}

/// One recorded violation.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
}

/// The violation side channel. Guest code can catch a sealed error, but it
/// cannot reach in here; under STRICT and SECURE the orchestrator turns a
/// non-empty log into a fatal outcome.
#[derive(Debug, Default)]
pub struct ViolationLog {
    entries: Mutex<Vec<Violation>>,
}

impl ViolationLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, kind: ViolationKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(kind = %kind, detail = %detail, "security violation recorded");
        self.entries.lock().push(Violation { kind, detail });
    }

    pub fn first(&self) -> Option<Violation> {
        self.entries.lock().first().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Tracks which compound values are frozen or non-extensible, backing the
/// safe `Object.freeze` family.
#[derive(Debug, Default)]
pub struct FrozenRegistry {
    frozen: Mutex<HashSet<usize>>,
    non_extensible: Mutex<HashSet<usize>>,
}

impl FrozenRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(value: &Value) -> Option<usize> {
        match value {
            Value::Object(entries) => Some(Arc::as_ptr(entries) as usize),
            Value::Array(items) => Some(Arc::as_ptr(items) as usize),
            Value::Guarded(g) => Self::key(&g.inner),
            _ => None,
        }
    }

    /// Freezing implies non-extensibility.
    pub fn freeze(&self, value: &Value) {
        if let Some(key) = Self::key(value) {
            self.frozen.lock().insert(key);
            self.non_extensible.lock().insert(key);
        }
    }

    /// Sealing and `preventExtensions` both stop new properties; sealed
    /// objects still accept writes to existing ones.
    pub fn prevent_extensions(&self, value: &Value) {
        if let Some(key) = Self::key(value) {
            self.non_extensible.lock().insert(key);
        }
    }

    pub fn is_frozen(&self, value: &Value) -> bool {
        match Self::key(value) {
            // Primitives behave as frozen.
            None => true,
            Some(key) => self.frozen.lock().contains(&key),
        }
    }

    pub fn is_extensible(&self, value: &Value) -> bool {
        match Self::key(value) {
            None => false,
            Some(key) => !self.non_extensible.lock().contains(&key),
        }
    }
}

/// The inner realm: the guest's entire global surface.
pub struct InnerRealm {
    globals: HashMap<String, Value>,
    pub frozen: Arc<FrozenRegistry>,
}

impl InnerRealm {
    /// Builds the realm: curated standard bindings, the runtime hooks,
    /// host-supplied globals, then the security level's removal pass.
    pub fn install(
        security_level: SecurityLevel,
        host_globals: Vec<(String, Value)>,
    ) -> Self {
        let frozen = FrozenRegistry::new();
        let mut globals = HashMap::new();

        let mut define = |name: &str, value: Value| {
            globals.insert(name.to_string(), value);
        };

        // Namespace objects. Each is frozen at install time so member writes
        // fail the same way they would against a frozen prototype.
        for (name, value) in [
            ("Math", builtins::math::namespace()),
            ("JSON", builtins::json::namespace()),
            ("Object", builtins::object::namespace()),
            ("Promise", builtins::promise_namespace()),
            ("console", console::namespace()),
        ] {
            frozen.freeze(&value);
            define(name, value);
        }

        // Callable intrinsics. Their static members live in a fixed table
        // keyed by the native id, so there is nothing for a guest to mutate.
        define("Array", Value::Native(NativeFn::new("Array", NativeId::ArrayCtor)));
        define("String", Value::Native(NativeFn::new("String", NativeId::StringCtor)));
        define("Number", Value::Native(NativeFn::new("Number", NativeId::NumberCtor)));
        define("Boolean", Value::Native(NativeFn::new("Boolean", NativeId::BooleanCtor)));
        define("Date", Value::Native(NativeFn::new("Date", NativeId::DateCtor)));
        define("RegExp", Value::Native(NativeFn::new("RegExp", NativeId::RegExpCtor)));
        define("Error", Value::Native(NativeFn::new("Error", NativeId::ErrorCtor)));
        define(
            "TypeError",
            Value::Native(NativeFn::new("TypeError", NativeId::TypeErrorCtor)),
        );
        define(
            "RangeError",
            Value::Native(NativeFn::new("RangeError", NativeId::RangeErrorCtor)),
        );
        define("Symbol", Value::Native(NativeFn::new("Symbol", NativeId::SymbolFactory)));

        // Global functions and literals.
        define("parseInt", Value::Native(NativeFn::new("parseInt", NativeId::ParseInt)));
        define(
            "parseFloat",
            Value::Native(NativeFn::new("parseFloat", NativeId::ParseFloat)),
        );
        define("isNaN", Value::Native(NativeFn::new("isNaN", NativeId::IsNaN)));
        define("isFinite", Value::Native(NativeFn::new("isFinite", NativeId::IsFinite)));
        define(
            "encodeURIComponent",
            Value::Native(NativeFn::new(
                "encodeURIComponent",
                NativeId::EncodeUriComponent,
            )),
        );
        define(
            "decodeURIComponent",
            Value::Native(NativeFn::new(
                "decodeURIComponent",
                NativeId::DecodeUriComponent,
            )),
        );
        define("NaN", Value::Number(f64::NAN));
        define("Infinity", Value::Number(f64::INFINITY));
        define("undefined", Value::Undefined);

        // Runtime hooks. Loop drivers, `concat` and `template` are reached
        // through their rewritten node forms; these are the callable ones.
        define("callTool", Value::Native(NativeFn::new("callTool", NativeId::CallTool)));
        define("parallel", Value::Native(NativeFn::new("parallel", NativeId::Parallel)));

        // Code-generation intrinsics. Disabled everywhere; under STRICT and
        // SECURE the stubs additionally record the attempt.
        define("eval", Value::Native(NativeFn::new("eval", NativeId::EvalStub)));
        define(
            "Function",
            Value::Native(NativeFn::new("Function", NativeId::FunctionStub)),
        );

        // Bindings that exist only to be observable and strippable.
        for name in [
            "globalThis",
            "Proxy",
            "Reflect",
            "SharedArrayBuffer",
            "Atomics",
            "gc",
            "Iterator",
            "AsyncIterator",
            "Realm",
            "WeakRef",
            "FinalizationRegistry",
            "Temporal",
        ] {
            define(
                name,
                Value::Native(NativeFn::new("disabled", NativeId::DisabledStub)),
            );
        }
        let performance = builtins::performance_namespace();
        frozen.freeze(&performance);
        define("performance", performance);

        // Host-supplied globals, already sanitized; guests see them only
        // through the guard.
        for (name, value) in host_globals {
            define(&name, GuardedValue::wrap(value));
        }

        // The removal pass runs last so nothing re-introduces a binding.
        for name in security_level.removed_bindings() {
            globals.remove(*name);
        }

        // Under STRICT and SECURE the code-generation intrinsics come back
        // as recording wrappers: the real intrinsics stay gone, but every
        // attempt to reach them lands in the violation log.
        if security_level.records_code_generation() {
            globals.insert(
                "eval".to_string(),
                Value::Native(NativeFn::new("eval", NativeId::EvalStub)),
            );
            globals.insert(
                "Function".to_string(),
                Value::Native(NativeFn::new("Function", NativeId::FunctionStub)),
            );
        }

        Self { globals, frozen }
    }

    /// Resolves an engine-installed global.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Whether a name is an engine-installed global (and therefore not
    /// assignable).
    pub fn is_engine_global(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }
}
