//! The guest-program evaluator.
//!
//! A recursive async tree walk over the pre-transformed program. Every
//! engine-raised condition surfaces into guest code as a sealed error value
//! (catchable), except timeout and abort, which unwind the whole execution.
//! Loop statements run through the shared bounded driver; tool calls go
//! through the bridge; every security-relevant event lands in the violation
//! log.

use futures::future::BoxFuture;
use futures::FutureExt;
use num_traits::Zero;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::builtins::{self, NativeFn, NativeId};
use super::console::{ConsoleLevel, ConsoleMeter};
use super::hooks::{self, LoopGuard};
use super::{Env, InnerRealm, ViolationLog};
use crate::bridge::ToolBridge;
use crate::error::{EngineError, ViolationKind};
use crate::memory_accountant::MemoryAccountant;
use crate::program::{BinaryOp, Expr, FunctionDecl, GuestProgram, LogicalOp, Stmt, UnaryOp};
use crate::value::{FunctionValue, GuardAccess, SealedError, Value};
use warden_core::config::{ExecutionConfig, SecurityLevel};
use warden_core::constants::{MAX_CALL_DEPTH, PARALLEL_MAX_ITEMS};
use warden_core::stats::{AbortFlag, SharedStats};

/// Non-local control flow inside the evaluator.
#[derive(Debug)]
pub enum Interrupt {
    Break,
    Continue,
    Return(Value),
    /// A thrown guest value; sealed errors travel this way too.
    Throw(Value),
    /// Unwinds the execution without giving guest code a chance to catch.
    Fatal(EngineError),
}

type Eval<T> = Result<T, Interrupt>;

/// The inner realm's evaluator for one execution.
pub struct Interpreter {
    realm: InnerRealm,
    bridge: Arc<ToolBridge>,
    accountant: Arc<MemoryAccountant>,
    stats: Arc<SharedStats>,
    abort: AbortFlag,
    console: Mutex<ConsoleMeter>,
    violations: Arc<ViolationLog>,
    security_level: SecurityLevel,
    throw_on_blocked: bool,
    allow_composites: bool,
    max_iterations: u64,
    timeout_ms: u64,
    deadline: Instant,
    started: Instant,
    call_depth: AtomicUsize,
    root_env: Env,
}

impl Interpreter {
    pub fn new(
        program: &GuestProgram,
        realm: InnerRealm,
        bridge: Arc<ToolBridge>,
        accountant: Arc<MemoryAccountant>,
        stats: Arc<SharedStats>,
        abort: AbortFlag,
        violations: Arc<ViolationLog>,
        config: &ExecutionConfig,
        deadline: Instant,
    ) -> Self {
        let root_env = Env::root();
        for decl in &program.functions {
            root_env.define(&decl.name, function_value(decl, &root_env));
        }
        Self {
            realm,
            bridge,
            accountant,
            stats,
            abort,
            console: Mutex::new(ConsoleMeter::new(
                config.max_console_calls,
                config.max_console_output_bytes,
            )),
            violations,
            security_level: config.security_level,
            throw_on_blocked: config.security_level.default_throw_on_blocked(),
            allow_composites: config.tool_bridge.allow_composites,
            max_iterations: config.max_iterations,
            timeout_ms: config.timeout_ms,
            deadline,
            started: Instant::now(),
            call_depth: AtomicUsize::new(0),
            root_env,
        }
    }

    /// Runs the guest's entry point and maps uncaught interrupts onto the
    /// engine taxonomy.
    pub async fn run_entry(&self, entry: &FunctionDecl) -> Result<Value, EngineError> {
        let func = FunctionValue {
            name: Some(entry.name.clone()),
            params: Arc::new(entry.params.clone()),
            body: Arc::new(entry.body.clone()),
            env: self.root_env.clone(),
        };
        match self.call_function(func, Vec::new()).await {
            Ok(value) => Ok(value),
            Err(Interrupt::Fatal(err)) => Err(err),
            Err(Interrupt::Throw(value)) => Err(match value {
                Value::Sealed(sealed) => EngineError::from_code(&sealed.code, &sealed.message),
                other => EngineError::guest(format!(
                    "Uncaught guest error: {}",
                    other.to_display_string()
                )),
            }),
            Err(Interrupt::Return(_)) | Err(Interrupt::Break) | Err(Interrupt::Continue) => {
                Err(EngineError::guest("Control flow escaped the entry point"))
            }
        }
    }

    /// Drains captured console output.
    pub fn take_console(&self) -> Vec<super::console::ConsoleEntry> {
        self.console.lock().take_entries()
    }

    fn loop_guard(&self) -> LoopGuard {
        LoopGuard::new(
            self.stats.clone(),
            self.abort.clone(),
            self.deadline,
            self.max_iterations,
            self.timeout_ms,
        )
    }

    /// Converts an engine error into the right interrupt: sealed throws for
    /// everything a guest may catch, fatal for timeout and abort. Policy
    /// rejections are mirrored into the violation side channel.
    fn engine_interrupt(&self, err: EngineError) -> Interrupt {
        match err {
            err @ (EngineError::TimeoutExceeded { .. } | EngineError::ExecutionAborted) => {
                Interrupt::Fatal(err)
            }
            err => {
                if err.is_policy() {
                    self.violations
                        .record(ViolationKind::PolicyBreach, err.to_string());
                }
                Interrupt::Throw(Value::Sealed(SealedError::from_error(&err)))
            }
        }
    }

    fn guest_throw(&self, name: &str, message: impl Into<String>) -> Interrupt {
        Interrupt::Throw(Value::Sealed(SealedError::new(
            name.to_string(),
            message.into(),
            "DOUBLE_VM_EXECUTION_ERROR".to_string(),
        )))
    }

    fn eval_stmts<'a>(&'a self, stmts: &'a [Stmt], env: Env) -> BoxFuture<'a, Eval<()>> {
        async move {
            for stmt in stmts {
                self.eval_stmt(stmt, env.clone()).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn eval_stmt<'a>(&'a self, stmt: &'a Stmt, env: Env) -> BoxFuture<'a, Eval<()>> {
        async move {
            match stmt {
                Stmt::Let { name, init } => {
                    let value = match init {
                        Some(expr) => self.eval_expr(expr, env.clone()).await?,
                        None => Value::Undefined,
                    };
                    env.define(name, value);
                    Ok(())
                }
                Stmt::Expr { expr } => {
                    self.eval_expr(expr, env).await?;
                    Ok(())
                }
                Stmt::Return { arg } => {
                    let value = match arg {
                        Some(expr) => self.eval_expr(expr, env).await?,
                        None => Value::Undefined,
                    };
                    Err(Interrupt::Return(value))
                }
                Stmt::If { test, then, alt } => {
                    if self.eval_expr(test, env.clone()).await?.truthy() {
                        self.eval_stmts(then, env.child()).await
                    } else {
                        self.eval_stmts(alt, env.child()).await
                    }
                }
                Stmt::Block { body } => self.eval_stmts(body, env.child()).await,
                Stmt::Throw { arg } => {
                    let value = self.eval_expr(arg, env).await?;
                    Err(Interrupt::Throw(value))
                }
                Stmt::Break => Err(Interrupt::Break),
                Stmt::Continue => Err(Interrupt::Continue),
                Stmt::ForOf {
                    binding,
                    iterable,
                    body,
                } => {
                    let guard = self.loop_guard();
                    let iterable = self.eval_expr(iterable, env.clone()).await?;
                    let items = self.iterable_items(&iterable)?;
                    for item in items {
                        guard.tick().map_err(|e| self.engine_interrupt(e))?;
                        let scope = env.child();
                        scope.define(binding, item);
                        match self.eval_stmts(body, scope).await {
                            Ok(()) => {}
                            Err(Interrupt::Break) => break,
                            Err(Interrupt::Continue) => continue,
                            Err(other) => return Err(other),
                        }
                    }
                    Ok(())
                }
                Stmt::While { test, body } => {
                    let guard = self.loop_guard();
                    while self.eval_expr(test, env.clone()).await?.truthy() {
                        guard.tick().map_err(|e| self.engine_interrupt(e))?;
                        match self.eval_stmts(body, env.child()).await {
                            Ok(()) => {}
                            Err(Interrupt::Break) => break,
                            Err(Interrupt::Continue) => continue,
                            Err(other) => return Err(other),
                        }
                    }
                    Ok(())
                }
                Stmt::DoWhile { test, body } => {
                    let guard = self.loop_guard();
                    loop {
                        guard.tick().map_err(|e| self.engine_interrupt(e))?;
                        match self.eval_stmts(body, env.child()).await {
                            Ok(()) => {}
                            Err(Interrupt::Break) => break,
                            Err(Interrupt::Continue) => {}
                            Err(other) => return Err(other),
                        }
                        if !self.eval_expr(test, env.clone()).await?.truthy() {
                            break;
                        }
                    }
                    Ok(())
                }
                Stmt::For {
                    init,
                    test,
                    update,
                    body,
                } => {
                    let guard = self.loop_guard();
                    let scope = env.child();
                    if let Some(init) = init {
                        self.eval_stmt(init, scope.clone()).await?;
                    }
                    loop {
                        if let Some(test) = test {
                            if !self.eval_expr(test, scope.clone()).await?.truthy() {
                                break;
                            }
                        }
                        guard.tick().map_err(|e| self.engine_interrupt(e))?;
                        match self.eval_stmts(body, scope.child()).await {
                            Ok(()) | Err(Interrupt::Continue) => {}
                            Err(Interrupt::Break) => break,
                            Err(other) => return Err(other),
                        }
                        if let Some(update) = update {
                            self.eval_expr(update, scope.clone()).await?;
                        }
                    }
                    Ok(())
                }
                Stmt::Try {
                    body,
                    catch_binding,
                    catch,
                    finally,
                } => {
                    let result = match self.eval_stmts(body, env.child()).await {
                        Err(Interrupt::Throw(thrown)) => match catch {
                            Some(handler) => {
                                let scope = env.child();
                                if let Some(binding) = catch_binding {
                                    scope.define(binding, thrown);
                                }
                                self.eval_stmts(handler, scope).await
                            }
                            None => Err(Interrupt::Throw(thrown)),
                        },
                        other => other,
                    };
                    // Fatal unwinding executes no further guest code, finally
                    // included.
                    if !finally.is_empty() && !matches!(result, Err(Interrupt::Fatal(_))) {
                        self.eval_stmts(finally, env.child()).await?;
                    }
                    result
                }
            }
        }
        .boxed()
    }

    fn eval_expr<'a>(&'a self, expr: &'a Expr, env: Env) -> BoxFuture<'a, Eval<Value>> {
        async move {
            match expr {
                Expr::Undefined => Ok(Value::Undefined),
                Expr::Null => Ok(Value::Null),
                Expr::Bool { value } => Ok(Value::Bool(*value)),
                Expr::Num { value } => Ok(Value::Number(*value)),
                Expr::Str { value } => Ok(Value::Str(value.clone())),
                Expr::BigInt { value } => value
                    .parse::<num_bigint::BigInt>()
                    .map(Value::BigInt)
                    .map_err(|_| self.guest_throw("SyntaxError", "Invalid BigInt literal")),
                Expr::Array { items } => {
                    self.accountant
                        .track(MemoryAccountant::estimate_array(items.len() as u64))
                        .map_err(|e| self.engine_interrupt(e))?;
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval_expr(item, env.clone()).await?);
                    }
                    Ok(Value::array(out))
                }
                Expr::Object { props } => {
                    self.accountant
                        .track(MemoryAccountant::estimate_object(props.len() as u64))
                        .map_err(|e| self.engine_interrupt(e))?;
                    let mut entries = indexmap::IndexMap::with_capacity(props.len());
                    for (key, value_expr) in props {
                        let value = self.eval_expr(value_expr, env.clone()).await?;
                        entries.insert(key.clone(), value);
                    }
                    Ok(Value::object(entries))
                }
                Expr::Ident { name } => self.resolve(name, &env).ok_or_else(|| {
                    self.guest_throw("ReferenceError", format!("{name} is not defined"))
                }),
                Expr::Member { object, property } => {
                    let object = self.eval_expr(object, env).await?;
                    self.get_member(&object, property)
                }
                Expr::Index { object, index } => {
                    let object = self.eval_expr(object, env.clone()).await?;
                    let key = self.eval_expr(index, env).await?;
                    self.get_member(&object, &key.to_display_string())
                }
                Expr::Unary { op, expr } => {
                    if matches!(op, UnaryOp::TypeOf) {
                        // `typeof missing` answers instead of throwing.
                        if let Expr::Ident { name } = expr.as_ref() {
                            return Ok(Value::str(
                                self.resolve(name, &env)
                                    .map(|v| v.type_of())
                                    .unwrap_or("undefined"),
                            ));
                        }
                    }
                    let value = self.eval_expr(expr, env).await?;
                    Ok(match op {
                        UnaryOp::Neg => Value::Number(-value.to_number()),
                        UnaryOp::Plus => Value::Number(value.to_number()),
                        UnaryOp::Not => Value::Bool(!value.truthy()),
                        UnaryOp::TypeOf => Value::str(value.type_of()),
                    })
                }
                Expr::Binary { op, left, right } => {
                    let left = self.eval_expr(left, env.clone()).await?;
                    let right = self.eval_expr(right, env).await?;
                    self.eval_binary(*op, &left, &right)
                }
                Expr::Logical { op, left, right } => {
                    let left = self.eval_expr(left, env.clone()).await?;
                    let take_right = match op {
                        LogicalOp::And => left.truthy(),
                        LogicalOp::Or => !left.truthy(),
                        LogicalOp::Nullish => left.is_nullish(),
                    };
                    if take_right {
                        self.eval_expr(right, env).await
                    } else {
                        Ok(left)
                    }
                }
                Expr::Cond { test, then, alt } => {
                    if self.eval_expr(test, env.clone()).await?.truthy() {
                        self.eval_expr(then, env).await
                    } else {
                        self.eval_expr(alt, env).await
                    }
                }
                Expr::Assign { target, value } => {
                    let value = self.eval_expr(value, env.clone()).await?;
                    self.assign(target, value.clone(), env).await?;
                    Ok(value)
                }
                Expr::Await { expr } => self.eval_expr(expr, env).await,
                Expr::Function { name, params, body } => Ok(Value::Function(FunctionValue {
                    name: name.clone(),
                    params: Arc::new(params.clone()),
                    body: Arc::new(body.clone()),
                    env,
                })),
                Expr::Concat { left, right } => {
                    let left = self.eval_expr(left, env.clone()).await?;
                    let right = self.eval_expr(right, env).await?;
                    hooks::concat_values(&left, &right, &self.accountant, self.allow_composites)
                        .map_err(|e| self.engine_interrupt(e))
                }
                Expr::Template { quasis, values } => {
                    let mut rendered = Vec::with_capacity(values.len());
                    for value in values {
                        rendered.push(self.eval_expr(value, env.clone()).await?);
                    }
                    hooks::template_values(
                        quasis,
                        &rendered,
                        &self.accountant,
                        self.allow_composites,
                    )
                    .map_err(|e| self.engine_interrupt(e))
                }
                Expr::Call { callee, args } | Expr::New { callee, args } => {
                    let mut evaluated = Vec::with_capacity(args.len());
                    for arg in args {
                        evaluated.push(self.eval_expr(arg, env.clone()).await?);
                    }
                    match callee.as_ref() {
                        Expr::Member { object, property } => {
                            let object = self.eval_expr(object, env).await?;
                            self.call_member(object, property, evaluated).await
                        }
                        Expr::Index { object, index } => {
                            let object = self.eval_expr(object, env.clone()).await?;
                            let key = self.eval_expr(index, env).await?;
                            self.call_member(object, &key.to_display_string(), evaluated)
                                .await
                        }
                        _ => {
                            let callee = self.eval_expr(callee, env).await?;
                            self.call_value(callee, evaluated).await
                        }
                    }
                }
            }
        }
        .boxed()
    }

    fn resolve(&self, name: &str, env: &Env) -> Option<Value> {
        env.get(name).or_else(|| self.realm.global(name))
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Eval<Value> {
        use BinaryOp::*;
        if let (Value::BigInt(a), Value::BigInt(b)) = (left.unguard(), right.unguard()) {
            return match op {
                Add => Ok(Value::BigInt(a + b)),
                Sub => Ok(Value::BigInt(a - b)),
                Mul => Ok(Value::BigInt(a * b)),
                Div | Mod if b.is_zero() => {
                    Err(self.guest_throw("RangeError", "Division by zero"))
                }
                Div => Ok(Value::BigInt(a / b)),
                Mod => Ok(Value::BigInt(a % b)),
                Eq | StrictEq => Ok(Value::Bool(a == b)),
                Ne | StrictNe => Ok(Value::Bool(a != b)),
                Lt => Ok(Value::Bool(a < b)),
                Le => Ok(Value::Bool(a <= b)),
                Gt => Ok(Value::Bool(a > b)),
                Ge => Ok(Value::Bool(a >= b)),
            };
        }
        let value = match op {
            Add => Value::Number(left.to_number() + right.to_number()),
            Sub => Value::Number(left.to_number() - right.to_number()),
            Mul => Value::Number(left.to_number() * right.to_number()),
            Div => Value::Number(left.to_number() / right.to_number()),
            Mod => Value::Number(left.to_number() % right.to_number()),
            Eq => Value::Bool(left.loose_equals(right)),
            Ne => Value::Bool(!left.loose_equals(right)),
            StrictEq => Value::Bool(left.strict_equals(right)),
            StrictNe => Value::Bool(!left.strict_equals(right)),
            Lt | Le | Gt | Ge => {
                if let (Value::Str(a), Value::Str(b)) = (left.unguard(), right.unguard()) {
                    Value::Bool(match op {
                        Lt => a < b,
                        Le => a <= b,
                        Gt => a > b,
                        _ => a >= b,
                    })
                } else {
                    let (a, b) = (left.to_number(), right.to_number());
                    if a.is_nan() || b.is_nan() {
                        Value::Bool(false)
                    } else {
                        Value::Bool(match op {
                            Lt => a < b,
                            Le => a <= b,
                            Gt => a > b,
                            _ => a >= b,
                        })
                    }
                }
            }
        };
        Ok(value)
    }

    async fn assign(&self, target: &Expr, value: Value, env: Env) -> Eval<()> {
        match target {
            Expr::Ident { name } => {
                if env.assign(name, value) {
                    return Ok(());
                }
                if self.realm.is_engine_global(name) {
                    return Err(self.guest_throw(
                        "TypeError",
                        format!("Assignment to constant binding `{name}`"),
                    ));
                }
                Err(self.guest_throw("ReferenceError", format!("{name} is not defined")))
            }
            Expr::Member { object, property } => {
                let object = self.eval_expr(object, env).await?;
                self.set_member(&object, property, value)
            }
            Expr::Index { object, index } => {
                let object = self.eval_expr(object, env.clone()).await?;
                let key = self.eval_expr(index, env).await?;
                self.set_member(&object, &key.to_display_string(), value)
            }
            _ => Err(self.guest_throw("SyntaxError", "Invalid assignment target")),
        }
    }

    fn get_member(&self, value: &Value, key: &str) -> Eval<Value> {
        match value {
            Value::Guarded(guard) => match guard.get(key) {
                GuardAccess::Allowed(inner) => Ok(inner),
                GuardAccess::Blocked => {
                    self.violations
                        .record(ViolationKind::BlockedPropertyAccess, key.to_string());
                    if self.throw_on_blocked {
                        Err(self.engine_interrupt(EngineError::security_violation(
                            ViolationKind::BlockedPropertyAccess,
                            format!("blocked property `{key}`"),
                        )))
                    } else {
                        Ok(Value::Undefined)
                    }
                }
            },
            Value::Undefined | Value::Null => Err(self.guest_throw(
                "TypeError",
                format!(
                    "Cannot read properties of {} (reading '{key}')",
                    value.to_display_string()
                ),
            )),
            Value::Object(entries) => Ok(entries
                .read()
                .get(key)
                .cloned()
                .unwrap_or(Value::Undefined)),
            Value::Array(items) => match key {
                "length" => Ok(Value::Number(items.read().len() as f64)),
                _ => match key.parse::<usize>() {
                    Ok(index) => Ok(items
                        .read()
                        .get(index)
                        .cloned()
                        .unwrap_or(Value::Undefined)),
                    Err(_) => Ok(Value::Undefined),
                },
            },
            Value::Str(s) => match key {
                "length" => Ok(Value::Number(s.chars().count() as f64)),
                _ => match key.parse::<usize>() {
                    Ok(index) => Ok(s
                        .chars()
                        .nth(index)
                        .map(|c| Value::Str(c.to_string()))
                        .unwrap_or(Value::Undefined)),
                    Err(_) => Ok(Value::Undefined),
                },
            },
            Value::Sealed(sealed) => Ok(sealed.member(key)),
            Value::Native(native) => {
                Ok(builtins::native_member(native.id, key).unwrap_or(Value::Undefined))
            }
            Value::Regex(regex) => match key {
                "source" => Ok(Value::Str(regex.source.clone())),
                "flags" => Ok(Value::Str(regex.flags.clone())),
                _ => Ok(Value::Undefined),
            },
            _ => Ok(Value::Undefined),
        }
    }

    fn set_member(&self, target: &Value, key: &str, value: Value) -> Eval<()> {
        match target {
            Value::Guarded(_) => {
                Err(self.guest_throw("TypeError", "Cannot modify a tool result"))
            }
            Value::Object(entries) => {
                if self.realm.frozen.is_frozen(target) {
                    return Err(self.guest_throw(
                        "TypeError",
                        format!("Cannot assign to read only property '{key}'"),
                    ));
                }
                let is_new = !entries.read().contains_key(key);
                if is_new && !self.realm.frozen.is_extensible(target) {
                    return Err(self.guest_throw(
                        "TypeError",
                        format!("Cannot add property {key}, object is not extensible"),
                    ));
                }
                entries.write().insert(key.to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                if self.realm.frozen.is_frozen(target) {
                    return Err(self.guest_throw(
                        "TypeError",
                        format!("Cannot assign to read only property '{key}'"),
                    ));
                }
                let Ok(index) = key.parse::<usize>() else {
                    return Err(self.guest_throw(
                        "TypeError",
                        format!("Cannot set property '{key}' on an array"),
                    ));
                };
                let mut items = items.write();
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
                Ok(())
            }
            other => Err(self.guest_throw(
                "TypeError",
                format!(
                    "Cannot set property '{key}' on {}",
                    other.type_of()
                ),
            )),
        }
    }

    fn iterable_items(&self, value: &Value) -> Eval<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items.read().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Guarded(guard) => match &guard.inner {
                Value::Array(items) => {
                    let len = items.read().len();
                    Ok((0..len).map(|i| guard.index(i)).collect())
                }
                _ => Err(self.guest_throw("TypeError", "Value is not iterable")),
            },
            _ => Err(self.guest_throw("TypeError", "Value is not iterable")),
        }
    }

    async fn call_value(&self, callee: Value, args: Vec<Value>) -> Eval<Value> {
        match callee {
            Value::Function(func) => self.call_function(func, args).await,
            Value::Native(native) => self.call_native(native, args).await,
            Value::Guarded(guard) => {
                Box::pin(self.call_value(guard.inner.clone(), args)).await
            }
            other => Err(self.guest_throw(
                "TypeError",
                format!("{} is not a function", other.to_display_string()),
            )),
        }
    }

    async fn call_function(&self, func: FunctionValue, args: Vec<Value>) -> Eval<Value> {
        let depth = self.call_depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > MAX_CALL_DEPTH {
            self.call_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(self.guest_throw(
                "RangeError",
                "Maximum call stack size exceeded",
            ));
        }
        let scope = func.env.child();
        for (index, param) in func.params.iter().enumerate() {
            scope.define(param, args.get(index).cloned().unwrap_or(Value::Undefined));
        }
        let body = func.body.clone();
        let result = self.eval_stmts(&body, scope).await;
        self.call_depth.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(()) => Ok(Value::Undefined),
            Err(Interrupt::Return(value)) => Ok(value),
            Err(Interrupt::Break) | Err(Interrupt::Continue) => Err(self.guest_throw(
                "SyntaxError",
                "Illegal break or continue outside a loop",
            )),
            Err(other) => Err(other),
        }
    }

    async fn call_member(&self, object: Value, method: &str, args: Vec<Value>) -> Eval<Value> {
        // Object members that hold callables win over the builtin tables.
        if matches!(object.unguard(), Value::Object(_)) {
            let member = self.get_member(&object, method)?;
            if member.is_callable() {
                return self.call_value(member, args).await;
            }
            if !matches!(member, Value::Undefined) {
                return Err(self.guest_throw(
                    "TypeError",
                    format!("{method} is not a function"),
                ));
            }
        }

        let receiver = object.unguard().clone();
        let result = match &receiver {
            Value::Str(s) => builtins::strings::call_method(&self.accountant, s, method, &args)
                .map_err(|e| self.engine_interrupt(e))?,
            Value::Array(items) => {
                if let Some(result) = self.array_higher_order(items, method, &args).await? {
                    Some(result)
                } else {
                    builtins::arrays::call_method(
                        &self.accountant,
                        &self.realm.frozen,
                        items,
                        method,
                        &args,
                    )
                    .map_err(|e| self.engine_interrupt(e))?
                }
            }
            Value::Number(n) => builtins::numbers::call_method(*n, method, &args)
                .map_err(|e| self.engine_interrupt(e))?,
            Value::Date(date) => builtins::dates::call_method(date, method, &args),
            Value::Regex(regex) => match method {
                "test" => {
                    let input = args
                        .get(0)
                        .map(|v| v.to_display_string())
                        .unwrap_or_default();
                    Some(Value::Bool(regex.compiled.is_match(&input)))
                }
                "toString" => Some(Value::Str(receiver.to_display_string())),
                _ => None,
            },
            Value::BigInt(i) => match method {
                "toString" => Some(Value::Str(i.to_string())),
                _ => None,
            },
            Value::Bool(b) => match method {
                "toString" => Some(Value::Str(b.to_string())),
                _ => None,
            },
            Value::Native(native) => {
                let member = builtins::native_member(native.id, method);
                match member {
                    Some(callable) => return self.call_value(callable, args).await,
                    None => None,
                }
            }
            _ => None,
        };
        match result {
            Some(value) => Ok(value),
            None => Err(self.guest_throw(
                "TypeError",
                format!(
                    "{}.{method} is not a function",
                    receiver.type_of()
                ),
            )),
        }
    }

    /// The interpreter-driven array methods: the ones that call back into
    /// guest code. Returns `None` when `method` is not one of them.
    async fn array_higher_order(
        &self,
        items: &crate::value::ArrayRef,
        method: &str,
        args: &[Value],
    ) -> Eval<Option<Value>> {
        if !matches!(
            method,
            "map" | "filter" | "forEach" | "find" | "findIndex" | "some" | "every" | "reduce"
        ) {
            return Ok(None);
        }
        let Some(callback) = args.first().filter(|a| a.is_callable()).cloned() else {
            return Err(self.guest_throw(
                "TypeError",
                format!("Array.prototype.{method} expects a callback"),
            ));
        };
        let snapshot: Vec<Value> = items.read().clone();
        let guard = self.loop_guard();

        match method {
            "reduce" => {
                let mut iter = snapshot.into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(seed) => seed.clone(),
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(self.guest_throw(
                                "TypeError",
                                "Reduce of empty array with no initial value",
                            ))
                        }
                    },
                };
                for (index, item) in iter {
                    guard.tick().map_err(|e| self.engine_interrupt(e))?;
                    acc = self
                        .call_value(
                            callback.clone(),
                            vec![acc, item, Value::Number(index as f64)],
                        )
                        .await?;
                }
                Ok(Some(acc))
            }
            _ => {
                let mut mapped = Vec::with_capacity(snapshot.len());
                for (index, item) in snapshot.iter().enumerate() {
                    guard.tick().map_err(|e| self.engine_interrupt(e))?;
                    let verdict = self
                        .call_value(
                            callback.clone(),
                            vec![item.clone(), Value::Number(index as f64)],
                        )
                        .await?;
                    match method {
                        "map" => mapped.push(verdict),
                        "filter" => {
                            if verdict.truthy() {
                                mapped.push(item.clone());
                            }
                        }
                        "forEach" => {}
                        "find" => {
                            if verdict.truthy() {
                                return Ok(Some(item.clone()));
                            }
                        }
                        "findIndex" => {
                            if verdict.truthy() {
                                return Ok(Some(Value::Number(index as f64)));
                            }
                        }
                        "some" => {
                            if verdict.truthy() {
                                return Ok(Some(Value::Bool(true)));
                            }
                        }
                        "every" => {
                            if !verdict.truthy() {
                                return Ok(Some(Value::Bool(false)));
                            }
                        }
                        _ => unreachable!("matched above"),
                    }
                }
                Ok(Some(match method {
                    "map" | "filter" => Value::array(mapped),
                    "forEach" => Value::Undefined,
                    "find" => Value::Undefined,
                    "findIndex" => Value::Number(-1.0),
                    "some" => Value::Bool(false),
                    "every" => Value::Bool(true),
                    _ => unreachable!("matched above"),
                }))
            }
        }
    }

    async fn call_native(&self, native: NativeFn, args: Vec<Value>) -> Eval<Value> {
        use NativeId::*;
        match native.id {
            CallTool => {
                let name = args
                    .first()
                    .map(|v| v.to_display_string())
                    .unwrap_or_default();
                let arg_record = args.get(1).cloned().unwrap_or(Value::Undefined);
                self.bridge
                    .call_tool(&name, &arg_record)
                    .await
                    .map_err(|e| self.engine_interrupt(e))
            }
            Parallel => Box::pin(self.parallel(args)).await,
            ConsoleLog | ConsoleError | ConsoleWarn | ConsoleInfo => {
                let level = match native.id {
                    ConsoleError => ConsoleLevel::Error,
                    ConsoleWarn => ConsoleLevel::Warn,
                    ConsoleInfo => ConsoleLevel::Info,
                    _ => ConsoleLevel::Log,
                };
                let message = super::console::format_args(&args);
                self.console
                    .lock()
                    .write(level, message)
                    .map_err(|e| self.engine_interrupt(e))?;
                Ok(Value::Undefined)
            }
            ParseInt => Ok(builtins::numbers::parse_int(&args)),
            ParseFloat => Ok(builtins::numbers::parse_float(&args)),
            IsNaN => Ok(Value::Bool(
                args.first().map(|v| v.to_number().is_nan()).unwrap_or(true),
            )),
            IsFinite => Ok(Value::Bool(
                args.first()
                    .map(|v| v.to_number().is_finite())
                    .unwrap_or(false),
            )),
            EncodeUriComponent => Ok(Value::Str(uri_encode(
                &args
                    .first()
                    .map(|v| v.to_display_string())
                    .unwrap_or_default(),
            ))),
            DecodeUriComponent => uri_decode(
                &args
                    .first()
                    .map(|v| v.to_display_string())
                    .unwrap_or_default(),
            )
            .map(Value::Str)
            .map_err(|msg| self.guest_throw("URIError", msg)),
            SymbolFactory => Ok(Value::Symbol(
                args.first()
                    .map(|v| v.to_display_string())
                    .unwrap_or_default(),
            )),
            MathAbs | MathFloor | MathCeil | MathRound | MathTrunc | MathSqrt | MathPow
            | MathMin | MathMax | MathRandom | MathLog | MathExp | MathSign => {
                builtins::math::call(native.id, &args).map_err(|e| self.engine_interrupt(e))
            }
            JsonStringify => {
                let space = args.get(2).and_then(|v| match v.to_number() {
                    n if n.is_finite() && n > 0.0 => Some(n as u32),
                    _ => None,
                });
                builtins::json::stringify(
                    args.first().unwrap_or(&Value::Undefined),
                    space,
                )
                .map_err(|e| self.engine_interrupt(e))
            }
            JsonParse => {
                let text = args
                    .first()
                    .map(|v| v.to_display_string())
                    .unwrap_or_default();
                builtins::json::parse(&text).map_err(|e| self.engine_interrupt(e))
            }
            ObjectKeys | ObjectValues | ObjectEntries | ObjectFromEntries | ObjectAssign
            | ObjectIs | ObjectHasOwn | ObjectFreeze | ObjectIsFrozen | ObjectSeal
            | ObjectIsSealed | ObjectPreventExtensions | ObjectIsExtensible
            | ObjectGetOwnPropertyNames | ObjectGetOwnPropertySymbols | ObjectGetPrototypeOf
            | ObjectCreate | ObjectDisabledStub => {
                builtins::object::call(native.id, native.name, &args, &self.realm.frozen)
                    .map_err(|e| self.engine_interrupt(e))
            }
            ArrayCtor => {
                if let [Value::Number(n)] = args.as_slice() {
                    if n.fract() == 0.0 && *n >= 0.0 {
                        let len = *n as u64;
                        self.accountant
                            .track(MemoryAccountant::estimate_array(len))
                            .map_err(|e| self.engine_interrupt(e))?;
                        return Ok(Value::array(vec![Value::Undefined; len as usize]));
                    }
                    return Err(self.guest_throw("RangeError", "Invalid array length"));
                }
                self.accountant
                    .track(MemoryAccountant::estimate_array(args.len() as u64))
                    .map_err(|e| self.engine_interrupt(e))?;
                Ok(Value::array(args))
            }
            ArrayIsArray => Ok(builtins::arrays::is_array(
                args.first().unwrap_or(&Value::Undefined),
            )),
            ArrayFrom => builtins::arrays::from(
                &self.accountant,
                args.first().unwrap_or(&Value::Undefined),
            )
            .map_err(|e| self.engine_interrupt(e)),
            ArrayOf => Ok(Value::array(args)),
            StringCtor => Ok(Value::Str(
                args.first()
                    .map(|v| v.to_display_string())
                    .unwrap_or_default(),
            )),
            StringFromCharCode => Ok(builtins::strings::from_char_code(&args)),
            NumberCtor => Ok(Value::Number(
                args.first().map(|v| v.to_number()).unwrap_or(0.0),
            )),
            BooleanCtor => Ok(Value::Bool(
                args.first().map(|v| v.truthy()).unwrap_or(false),
            )),
            NumberIsInteger => Ok(builtins::numbers::is_integer(
                args.first().unwrap_or(&Value::Undefined),
            )),
            NumberIsFinite => Ok(builtins::numbers::is_finite_strict(
                args.first().unwrap_or(&Value::Undefined),
            )),
            NumberIsNaN => Ok(builtins::numbers::is_nan_strict(
                args.first().unwrap_or(&Value::Undefined),
            )),
            DateCtor => builtins::dates::construct(&args).map_err(|e| self.engine_interrupt(e)),
            DateNow => Ok(Value::Number(
                builtins::dates::now().timestamp_millis() as f64
            )),
            DateParse => Ok(builtins::dates::parse(&args)),
            RegExpCtor => {
                let source = match args.first() {
                    Some(Value::Regex(r)) => r.source.clone(),
                    Some(other) => other.to_display_string(),
                    None => String::new(),
                };
                let flags = args
                    .get(1)
                    .map(|v| v.to_display_string())
                    .unwrap_or_default();
                crate::value::RegexValue::new(&source, &flags)
                    .map(Value::Regex)
                    .map_err(|e| self.engine_interrupt(e))
            }
            ErrorCtor | TypeErrorCtor | RangeErrorCtor => {
                let name = match native.id {
                    TypeErrorCtor => "TypeError",
                    RangeErrorCtor => "RangeError",
                    _ => "Error",
                };
                let message = args
                    .first()
                    .map(|v| v.to_display_string())
                    .unwrap_or_default();
                Ok(Value::Sealed(SealedError::new(
                    name.to_string(),
                    message,
                    "DOUBLE_VM_EXECUTION_ERROR".to_string(),
                )))
            }
            PromiseResolve => Ok(args.into_iter().next().unwrap_or(Value::Undefined)),
            PromiseAll => {
                let value = args.into_iter().next().unwrap_or(Value::Undefined);
                if matches!(value.unguard(), Value::Array(_)) {
                    Ok(value)
                } else {
                    Err(self.guest_throw("TypeError", "Promise.all expects an array"))
                }
            }
            PerformanceNow => Ok(Value::Number(
                self.started.elapsed().as_secs_f64() * 1_000.0,
            )),
            EvalStub | FunctionStub => {
                if self.security_level.records_code_generation() {
                    self.violations
                        .record(ViolationKind::CodeGeneration, native.name);
                    Err(self.engine_interrupt(EngineError::security_violation(
                        ViolationKind::CodeGeneration,
                        format!("`{}` is disabled in this realm", native.name),
                    )))
                } else {
                    Err(self.guest_throw(
                        "TypeError",
                        format!("`{}` is not supported in this realm", native.name),
                    ))
                }
            }
            DisabledStub => {
                Err(self.guest_throw("TypeError", "This binding is disabled in this realm"))
            }
        }
    }

    /// The `parallel(items, fn)` hook. The realm is a single cooperative
    /// task, so the mapped callbacks are awaited in order; the observable
    /// contract is order preservation and the fan-out bound.
    async fn parallel(&self, args: Vec<Value>) -> Eval<Value> {
        let items = match args.first().map(|v| v.unguard().clone()) {
            Some(Value::Array(items)) => items.read().clone(),
            _ => {
                return Err(self.engine_interrupt(EngineError::bad_arguments(
                    "parallel expects an array of items",
                )))
            }
        };
        if items.len() > PARALLEL_MAX_ITEMS {
            return Err(self.engine_interrupt(EngineError::bad_arguments(format!(
                "parallel accepts at most {PARALLEL_MAX_ITEMS} items"
            ))));
        }
        let Some(callback) = args.get(1).filter(|a| a.is_callable()).cloned() else {
            return Err(self.engine_interrupt(EngineError::bad_arguments(
                "parallel expects a callable",
            )));
        };
        let guard = self.loop_guard();
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            guard.tick().map_err(|e| self.engine_interrupt(e))?;
            let value = self
                .call_value(callback.clone(), vec![item, Value::Number(index as f64)])
                .await?;
            results.push(value);
        }
        Ok(Value::array(results))
    }
}

fn function_value(decl: &FunctionDecl, env: &Env) -> Value {
    Value::Function(FunctionValue {
        name: Some(decl.name.clone()),
        params: Arc::new(decl.params.clone()),
        body: Arc::new(decl.body.clone()),
        env: env.clone(),
    })
}

/// `encodeURIComponent`: unreserved marks stay, everything else is
/// percent-encoded UTF-8.
fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn uri_decode(input: &str) -> Result<String, String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            if index + 2 >= bytes.len() + 1 {
                return Err("URI malformed".to_string());
            }
            let hex = input
                .get(index + 1..index + 3)
                .ok_or_else(|| "URI malformed".to_string())?;
            let byte =
                u8::from_str_radix(hex, 16).map_err(|_| "URI malformed".to_string())?;
            out.push(byte);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(out).map_err(|_| "URI malformed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_round_trip() {
        let original = "a b/c?d=ä";
        let encoded = uri_encode(original);
        assert_eq!(encoded, "a%20b%2Fc%3Fd%3D%C3%A4");
        assert_eq!(uri_decode(&encoded).unwrap(), original);
        assert!(uri_decode("%ZZ").is_err());
        assert!(uri_decode("%2").is_err());
    }
}
