//! # Warden Engine
//!
//! A nested execution engine for untrusted guest scripts with policy-enforced
//! access to host tools.
//!
//! Guest programs arrive pre-transformed: an external transformer rewrites
//! loops, string concatenation, template literals, console access and tool
//! calls into their hook forms and ships the result as a JSON instruction
//! tree. The engine evaluates that tree inside a guest realm built from a
//! curated binding set, instrumented with iteration bounds and allocation
//! accounting, while a gatekeeper layer validates every tool call against
//! rate limits, name filters and suspicious-sequence detectors before the
//! host handler sees it.
//!
//! ## Architecture
//!
//! - **Gatekeeper**: drives one execution from source to result, owns the
//!   watchdogs and the violation side channel
//! - **InnerRealm / Interpreter**: the guest realm's bindings and the
//!   recursive async evaluator
//! - **ToolBridge**: the envelope protocol between the realms and the host
//! - **PolicyValidator**: rate limit, whitelist/blacklist, detectors
//! - **MemoryAccountant**: pre-estimated allocation accounting
//! - **Sanitizer**: value normalization at every trust boundary
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden_engine::{Gatekeeper, HostContext, ToolHandler};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ToolHandler for Echo {
//!     async fn call(
//!         &self,
//!         _name: &str,
//!         args: serde_json::Value,
//!     ) -> anyhow::Result<serde_json::Value> {
//!         Ok(args)
//!     }
//! }
//!
//! # async fn example(source: &str) {
//! let ctx = HostContext::new(Arc::new(Echo));
//! let result = Gatekeeper::new().execute(source, ctx).await;
//! assert!(result.success);
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// Tool bridge: envelopes, reference handles, host proxy
pub mod bridge;
/// Engine error taxonomy and host-facing error info
pub mod error;
/// The gatekeeper orchestrator
pub mod gatekeeper;
/// Allocation accounting with a hard ceiling
pub mod memory_accountant;
/// Policy validation: rate limit, name filters, detectors
pub mod policy;
/// Pre-transformed guest program model
pub mod program;
/// Error-message and stack redaction
pub mod redact;
/// Inner-realm runtime: bindings, interpreter, hooks, console
pub mod runtime;
/// Safe-value sanitization at the trust boundary
pub mod sanitize;
/// The guest value model
pub mod value;

pub use bridge::{
    is_reference_handle, HostToolProxy, MemorySidecar, SidecarStore, ToolBridge, ToolHandler,
};
pub use error::{EngineError, EngineResult, ErrorInfo, ViolationKind};
pub use gatekeeper::{ExecutionResult, Gatekeeper, HostContext};
pub use memory_accountant::MemoryAccountant;
pub use policy::{OperationHistory, PolicyValidator, SuspiciousPattern};
pub use program::GuestProgram;
pub use runtime::{ConsoleEntry, ConsoleLevel, InnerRealm, Interpreter};
pub use sanitize::Sanitizer;
pub use value::Value;

// Re-export the shared configuration surface so hosts depend on one crate.
pub use warden_core::{
    AbortFlag, BridgeMode, DetectorSpec, DoubleVmConfig, ExecutionConfig, ExecutionStats,
    MemorySnapshot, ParentValidationConfig, SecurityLevel, SharedStats, ToolBridgeConfig,
};
