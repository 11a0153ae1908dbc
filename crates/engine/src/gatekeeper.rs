//! The gatekeeper orchestrator.
//!
//! Drives one execution end to end: fresh realms, instrumentation,
//! watchdogs, the violation side channel, final-value sanitation and the
//! stats finalization that happens on every path out.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::{HostToolProxy, SidecarStore, ToolBridge, ToolHandler};
use crate::error::{EngineError, ErrorInfo};
use crate::memory_accountant::MemoryAccountant;
use crate::program::GuestProgram;
use crate::redact::redact_message;
use crate::runtime::{ConsoleEntry, InnerRealm, Interpreter, ViolationLog};
use crate::sanitize::{enforce_serialized_size, Sanitizer};
use crate::value::Value;
use crate::policy::PolicyValidator;
use warden_core::config::ExecutionConfig;
use warden_core::stats::{AbortFlag, ExecutionStats, SharedStats};

/// Everything the host hands the engine for one execution.
#[derive(Clone)]
pub struct HostContext {
    /// The async tool implementation.
    pub tool_handler: Arc<dyn ToolHandler>,
    /// Optional sidecar for reference handles.
    pub sidecar: Option<Arc<dyn SidecarStore>>,
    /// Cooperative cancellation flag.
    pub abort: AbortFlag,
    /// Per-execution options.
    pub config: ExecutionConfig,
    /// Stats scaffold; the engine writes through it during the run.
    pub stats: Arc<SharedStats>,
}

impl HostContext {
    pub fn new(tool_handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            tool_handler,
            sidecar: None,
            abort: AbortFlag::new(),
            config: ExecutionConfig::default(),
            stats: SharedStats::new(),
        }
    }
}

/// The outcome of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub success: bool,
    /// The sanitized final value; `None` means the guest returned undefined.
    pub value: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub stats: ExecutionStats,
    /// Captured console output, in emission order.
    pub console: Vec<ConsoleEntry>,
}

impl ExecutionResult {
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Orchestrates executions. Stateless across runs; every execution gets
/// fresh realms, a fresh accountant and a fresh history.
#[derive(Debug, Default)]
pub struct Gatekeeper;

impl Gatekeeper {
    pub fn new() -> Self {
        Self
    }

    /// Executes one pre-transformed guest program.
    pub async fn execute(&self, source: &str, ctx: HostContext) -> ExecutionResult {
        let execution_id = Uuid::new_v4();
        let span = tracing::info_span!("execution", id = %execution_id);
        self.execute_inner(execution_id, source, ctx)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        execution_id: Uuid,
        source: &str,
        ctx: HostContext,
    ) -> ExecutionResult {
        let config = ctx.config.clamped();
        let accountant = MemoryAccountant::new(config.memory_limit_bytes);
        ctx.stats.reset();
        ctx.stats.mark_start(wall_clock_ms());

        let finish = |success: bool,
                      value: Option<serde_json::Value>,
                      error: Option<ErrorInfo>,
                      console: Vec<ConsoleEntry>| {
            ctx.stats.mark_end(wall_clock_ms());
            ExecutionResult {
                execution_id,
                success,
                value,
                error,
                stats: ctx.stats.snapshot(accountant.snapshot()),
                console,
            }
        };

        let fail = |error: EngineError, console: Vec<ConsoleEntry>| {
            tracing::debug!(code = error.code(), "execution failed");
            let mut info = ErrorInfo::from_error(&error);
            if config.sanitize_stack_traces {
                info.message = redact_message(&info.message);
            }
            (false, None, Some(info), console)
        };

        // An empty program runs to completion with nothing to do.
        if source.trim().is_empty() {
            return finish(true, None, None, Vec::new());
        }

        if let Err(err) = config.validate() {
            let (s, v, e, c) = fail(EngineError::validation(err.to_string()), Vec::new());
            return finish(s, v, e, c);
        }

        let program = match GuestProgram::parse(source) {
            Ok(program) => program,
            Err(err) => {
                let (s, v, e, c) = fail(err, Vec::new());
                return finish(s, v, e, c);
            }
        };
        let Some(entry) = program.entry_point().cloned() else {
            let (s, v, e, c) = fail(
                EngineError::validation("Guest program has no __ag_main entry point"),
                Vec::new(),
            );
            return finish(s, v, e, c);
        };

        // The gatekeeper layer: policy validation lives in the outer realm.
        // The single-realm adapter is an intentionally weaker configuration.
        let validator = if config.double_vm.enabled {
            match PolicyValidator::from_config(&config.double_vm.parent_validation) {
                Ok(validator) => Some(validator),
                Err(err) => {
                    let (s, v, e, c) = fail(err, Vec::new());
                    return finish(s, v, e, c);
                }
            }
        } else {
            tracing::warn!(
                "double_vm disabled: running single-realm without parent validation; \
                 this configuration is NOT suitable for untrusted guests"
            );
            None
        };

        let sanitizer = Sanitizer::new(config.max_sanitize_depth, config.max_sanitize_properties);

        // Host-supplied globals cross the same boundary as tool results.
        let mut host_globals = Vec::with_capacity(config.globals.len());
        for (name, json) in &config.globals {
            match sanitizer.sanitize(&Value::from_json(json)) {
                Ok(value) => host_globals.push((name.clone(), value)),
                Err(err) => {
                    let (s, v, e, c) = fail(err, Vec::new());
                    return finish(s, v, e, c);
                }
            }
        }

        let realm = InnerRealm::install(config.security_level, host_globals);
        let proxy = HostToolProxy::new(
            ctx.tool_handler.clone(),
            ctx.sidecar.clone(),
            sanitizer,
            config.tool_bridge.clone(),
        );
        let bridge = Arc::new(ToolBridge::new(
            proxy,
            validator,
            ctx.stats.clone(),
            ctx.abort.clone(),
            config.tool_bridge.clone(),
            config.max_tool_calls,
        ));
        let violations = ViolationLog::new();
        let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);

        let interpreter = Interpreter::new(
            &program,
            realm,
            bridge,
            accountant.clone(),
            ctx.stats.clone(),
            ctx.abort.clone(),
            violations.clone(),
            &config,
            deadline,
        );

        // Two watchdogs: the guest budget, and a buffered outer one that
        // catches anything wedged around it.
        let inner_budget = Duration::from_millis(config.timeout_ms);
        let outer_budget =
            inner_budget + Duration::from_millis(config.double_vm.parent_timeout_buffer_ms);
        let outcome = tokio::time::timeout(outer_budget, async {
            match tokio::time::timeout(inner_budget, interpreter.run_entry(&entry)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::timeout(config.timeout_ms)),
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(EngineError::timeout(
                config.timeout_ms + config.double_vm.parent_timeout_buffer_ms,
            ))
        });

        let console = interpreter.take_console();

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                let (s, v, e, c) = fail(err, console);
                return finish(s, v, e, c);
            }
        };

        // A caught sealed error does not launder a violation: under STRICT
        // and SECURE a recorded violation overrides a successful outcome.
        if config.security_level.escalates_violations() {
            if let Some(violation) = violations.first() {
                let (s, v, e, c) = fail(
                    EngineError::security_violation(violation.kind, violation.detail),
                    console,
                );
                return finish(s, v, e, c);
            }
        }

        let sanitized = match sanitizer.sanitize(&value) {
            Ok(sanitized) => sanitized,
            Err(err) => {
                let (s, v, e, c) = fail(err, console);
                return finish(s, v, e, c);
            }
        };
        if let Err(err) = enforce_serialized_size(&sanitized, config.memory_limit_bytes) {
            let (s, v, e, c) = fail(err, console);
            return finish(s, v, e, c);
        }

        let json = match &sanitized {
            Value::Undefined => None,
            other => match other.to_json() {
                Ok(json) => Some(json),
                Err(err) => {
                    let (s, v, e, c) = fail(err, console);
                    return finish(s, v, e, c);
                }
            },
        };
        finish(true, json, None, console)
    }
}

fn wall_clock_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
