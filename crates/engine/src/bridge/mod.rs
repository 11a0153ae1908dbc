//! The tool bridge between the guest realm and the host.
//!
//! The inner side owns the guest-facing `callTool` contract: abort check,
//! call budget, argument-shape check, a JSON round-trip clone of the
//! arguments, policy validation, and then the forward in the configured
//! mode. Everything returned into the guest realm comes back behind a
//! guarded view.

pub mod envelope;
pub mod handle;
pub mod proxy;

pub use envelope::{ToolRequest, ToolResponse, ENVELOPE_VERSION};
pub use handle::{generate_handle, is_reference_handle, MemorySidecar, SidecarStore};
pub use proxy::{HostToolProxy, ToolHandler};

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::policy::{OperationHistory, PolicyValidator};
use crate::value::{GuardedValue, Value};
use warden_core::config::{BridgeMode, ToolBridgeConfig};
use warden_core::stats::{AbortFlag, SharedStats};

/// The inner realm's gateway to host tools.
pub struct ToolBridge {
    proxy: HostToolProxy,
    /// Absent only in the degraded single-realm mode.
    validator: Option<PolicyValidator>,
    history: Mutex<OperationHistory>,
    stats: Arc<SharedStats>,
    abort: AbortFlag,
    config: ToolBridgeConfig,
    max_tool_calls: u64,
}

impl ToolBridge {
    pub fn new(
        proxy: HostToolProxy,
        validator: Option<PolicyValidator>,
        stats: Arc<SharedStats>,
        abort: AbortFlag,
        config: ToolBridgeConfig,
        max_tool_calls: u64,
    ) -> Self {
        Self {
            proxy,
            validator,
            history: Mutex::new(OperationHistory::new()),
            stats,
            abort,
            config,
            max_tool_calls,
        }
    }

    /// The guest-facing `callTool(name, args)` contract.
    pub async fn call_tool(&self, name: &str, args: &Value) -> EngineResult<Value> {
        if self.abort.is_set() {
            return Err(EngineError::ExecutionAborted);
        }

        let count = self.stats.record_tool_call();
        if count > self.max_tool_calls {
            // The increment that triggered the rejection is consumed so the
            // reported count never exceeds the budget.
            self.stats.unrecord_tool_call();
            return Err(EngineError::tool_call_limit(self.max_tool_calls));
        }

        if !matches!(args.unguard(), Value::Object(_)) {
            return Err(EngineError::bad_arguments(
                "tool arguments must be a record",
            ));
        }

        // Deep-clone through JSON: accessor tricks and exotic values do not
        // survive a text round trip.
        let cloned = args
            .to_json()
            .map_err(|e| EngineError::bad_arguments(e.to_string()))?;

        if let Some(validator) = &self.validator {
            let mut history = self.history.lock();
            validator.validate(name, &cloned, &mut history)?;
        }

        let result = match self.config.mode {
            BridgeMode::String => {
                let request = ToolRequest::new(name.to_string(), cloned)
                    .encode(self.config.max_payload_bytes)?;
                let response = self.proxy.call_string(&request).await?;
                ToolResponse::decode(&response, self.config.max_payload_bytes)?
            }
            BridgeMode::Direct => self.proxy.invoke(name, cloned).await?,
        };

        Ok(GuardedValue::wrap(Value::from_json(&result)))
    }

    /// Number of operations the validator has accepted so far.
    pub fn accepted_operations(&self) -> usize {
        self.history.lock().len()
    }
}
