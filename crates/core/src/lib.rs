//! # Warden Core
//!
//! Shared configuration, limits and execution statistics for the warden
//! sandbox engine.
//!
//! This crate carries everything the host and the engine agree on before an
//! execution starts: the [`config::ExecutionConfig`] options bundle, the
//! [`config::SecurityLevel`] posture table, the engine-wide constants, and
//! the [`stats`] counters the realms write back through.

#![warn(rustdoc::missing_crate_level_docs)]

/// Per-execution configuration and security levels
pub mod config;
/// Engine-wide limits and window sizes
pub mod constants;
/// Configuration-time error types
pub mod error;
/// Execution statistics shared between host and realms
pub mod stats;

pub use config::{
    BridgeMode, DetectorSpec, DoubleVmConfig, ExecutionConfig, ParentValidationConfig,
    SecurityLevel, ToolBridgeConfig,
};
pub use error::ConfigError;
pub use stats::{AbortFlag, ExecutionStats, MemorySnapshot, SharedStats};
