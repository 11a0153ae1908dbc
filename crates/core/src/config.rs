//! Per-execution configuration for the sandbox engine.
//!
//! Everything here is immutable once an execution starts. The orchestrator
//! clamps the sanitizer knobs at its boundary; every other field is taken as
//! given.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::*;
use crate::error::ConfigError;

/// How aggressively the inner realm is stripped and how policy violations are
/// escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityLevel {
    /// Maximum stripping; violations are fatal even when caught by the guest.
    Strict,
    /// Strict minus reflection and timing intrinsics; violations fatal.
    Secure,
    /// The default posture.
    #[default]
    Standard,
    /// Minimal stripping, for trusted-ish workloads.
    Permissive,
}

impl SecurityLevel {
    /// Binding names deleted from the inner realm before guest code runs.
    pub fn removed_bindings(&self) -> &'static [&'static str] {
        match self {
            SecurityLevel::Strict => &[
                "Function",
                "eval",
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
                "performance",
                "Temporal",
            ],
            SecurityLevel::Secure => &[
                "Function",
                "eval",
                "globalThis",
                "Proxy",
                "SharedArrayBuffer",
                "Atomics",
                "gc",
                "Iterator",
                "AsyncIterator",
                "Realm",
                "WeakRef",
                "FinalizationRegistry",
            ],
            SecurityLevel::Standard => &[
                "Function",
                "eval",
                "SharedArrayBuffer",
                "Atomics",
                "gc",
                "Realm",
                "WeakRef",
                "FinalizationRegistry",
            ],
            SecurityLevel::Permissive => {
                &["Realm", "SharedArrayBuffer", "Atomics", "gc"]
            }
        }
    }

    /// Whether a recorded violation turns a successful run into a failure.
    pub fn escalates_violations(&self) -> bool {
        matches!(self, SecurityLevel::Strict | SecurityLevel::Secure)
    }

    /// Default for `throw_on_blocked` on guarded views.
    pub fn default_throw_on_blocked(&self) -> bool {
        !matches!(self, SecurityLevel::Permissive)
    }

    /// Whether attempts to reach the code-generation intrinsics are recorded
    /// as violations (the intrinsics themselves are already disabled).
    pub fn records_code_generation(&self) -> bool {
        matches!(self, SecurityLevel::Strict | SecurityLevel::Secure)
    }
}

/// Which shape tool calls take across the realm boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Arguments and results cross only as JSON text. The safer default.
    #[default]
    String,
    /// Structured pass-through for hot-path payloads.
    Direct,
}

/// Tool-bridge tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolBridgeConfig {
    pub mode: BridgeMode,
    /// Cap on one serialized envelope, either direction.
    pub max_payload_bytes: u64,
    /// Whether reference handles may be composed via `concat`/`template`.
    pub allow_composites: bool,
    /// Sanitized result strings at or above this size are lifted into the
    /// sidecar and returned as a reference handle.
    pub extraction_threshold_bytes: u64,
    /// Cap on the total resolved size of handles inside one call's arguments.
    pub max_inbound_reference_bytes: u64,
}

impl Default for ToolBridgeConfig {
    fn default() -> Self {
        Self {
            mode: BridgeMode::String,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            allow_composites: false,
            extraction_threshold_bytes: DEFAULT_EXTRACTION_THRESHOLD_BYTES,
            max_inbound_reference_bytes: DEFAULT_MAX_INBOUND_REFERENCE_BYTES,
        }
    }
}

/// A declarative user-supplied suspicious-pattern detector.
///
/// Detectors are data, not code: the current operation name is tested against
/// `trigger_pattern`, and the entry fires when, additionally, some history
/// entry inside `window_ms` matches `recent_pattern` (when present) or the
/// serialized arguments match `args_pattern` (when present).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorSpec {
    pub id: String,
    pub description: String,
    pub trigger_pattern: String,
    #[serde(default)]
    pub recent_pattern: Option<String>,
    #[serde(default)]
    pub args_pattern: Option<String>,
    #[serde(default = "DetectorSpec::default_window_ms")]
    pub window_ms: u64,
}

impl DetectorSpec {
    fn default_window_ms() -> u64 {
        SUSPICIOUS_SHORT_WINDOW_MS
    }

    /// Substrings rejected inside any textual field of a user detector.
    /// The original embedded detector bodies as source text inside the
    /// gatekeeper realm; the equivalent boundary here is these fields.
    const DANGEROUS_SUBSTRINGS: [&'static str; 7] = [
        "function",
        "=>",
        "require(",
        "import(",
        "globalThis",
        "process",
        "eval(",
    ];

    /// Validates the spec: compilable patterns and no injection-shaped text.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::invalid_detector(&self.id, "empty id"));
        }
        for field in [
            Some(self.id.as_str()),
            Some(self.description.as_str()),
            Some(self.trigger_pattern.as_str()),
            self.recent_pattern.as_deref(),
            self.args_pattern.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            for needle in Self::DANGEROUS_SUBSTRINGS {
                if field.contains(needle) {
                    return Err(ConfigError::dangerous_detector(&self.id, needle));
                }
            }
        }
        for pattern in [
            Some(self.trigger_pattern.as_str()),
            self.recent_pattern.as_deref(),
            self.args_pattern.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::invalid_pattern(pattern, e.to_string()))?;
        }
        Ok(())
    }
}

/// Operation-name and sequence policy enforced by the gatekeeper realm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParentValidationConfig {
    /// Master switch for the whitelist check.
    pub validate_operation_names: bool,
    /// Whitelist: operations must match when set and enabled.
    pub allowed_pattern: Option<String>,
    /// Blacklist: always consulted, even when the whitelist is disabled.
    pub blocked_patterns: Vec<String>,
    /// Sliding-window rate limit.
    pub max_operations_per_second: u32,
    /// Master switch for the suspicious-sequence detectors.
    pub block_suspicious_sequences: bool,
    /// User detectors, appended after the built-in set.
    pub suspicious_patterns: Vec<DetectorSpec>,
    /// Repeats of one operation inside the short window before the
    /// rapid-enumeration detector fires.
    pub rapid_enumeration_threshold: u32,
}

impl Default for ParentValidationConfig {
    fn default() -> Self {
        Self {
            validate_operation_names: true,
            allowed_pattern: None,
            blocked_patterns: Vec::new(),
            max_operations_per_second: DEFAULT_MAX_OPERATIONS_PER_SECOND,
            block_suspicious_sequences: true,
            suspicious_patterns: Vec::new(),
            rapid_enumeration_threshold: RAPID_ENUMERATION_THRESHOLD,
        }
    }
}

impl ParentValidationConfig {
    /// Validates every pattern and user detector in the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(pattern) = &self.allowed_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::invalid_pattern(pattern, e.to_string()))?;
        }
        for pattern in &self.blocked_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::invalid_pattern(pattern, e.to_string()))?;
        }
        for spec in &self.suspicious_patterns {
            spec.validate()?;
        }
        Ok(())
    }
}

/// Double-realm layering switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubleVmConfig {
    /// When false the engine runs the intentionally-weaker single-realm
    /// adapter and logs a loud warning.
    pub enabled: bool,
    /// Extra budget for the outer watchdog beyond `timeout_ms`.
    pub parent_timeout_buffer_ms: u64,
    pub parent_validation: ParentValidationConfig,
}

impl Default for DoubleVmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parent_timeout_buffer_ms: DEFAULT_PARENT_TIMEOUT_BUFFER_MS,
            parent_validation: ParentValidationConfig::default(),
        }
    }
}

/// Immutable options for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    pub max_iterations: u64,
    pub max_tool_calls: u64,
    /// 0 means unlimited.
    pub memory_limit_bytes: u64,
    pub max_console_calls: u64,
    pub max_console_output_bytes: u64,
    /// Clamped to 5..=50 at the orchestrator boundary.
    pub max_sanitize_depth: u32,
    /// Clamped to 50..=1000 at the orchestrator boundary.
    pub max_sanitize_properties: u32,
    pub sanitize_stack_traces: bool,
    pub security_level: SecurityLevel,
    /// Host-provided globals, sanitized and guard-wrapped before the guest
    /// sees them.
    pub globals: BTreeMap<String, serde_json::Value>,
    pub tool_bridge: ToolBridgeConfig,
    pub double_vm: DoubleVmConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            memory_limit_bytes: 0,
            max_console_calls: DEFAULT_MAX_CONSOLE_CALLS,
            max_console_output_bytes: DEFAULT_MAX_CONSOLE_OUTPUT_BYTES,
            max_sanitize_depth: SANITIZE_DEPTH_DEFAULT,
            max_sanitize_properties: SANITIZE_PROPERTIES_DEFAULT,
            sanitize_stack_traces: true,
            security_level: SecurityLevel::default(),
            globals: BTreeMap::new(),
            tool_bridge: ToolBridgeConfig::default(),
            double_vm: DoubleVmConfig::default(),
        }
    }
}

impl ExecutionConfig {
    /// Returns a copy with the sanitizer knobs clamped into their ranges.
    pub fn clamped(&self) -> Self {
        let mut cfg = self.clone();
        cfg.max_sanitize_depth = cfg
            .max_sanitize_depth
            .clamp(SANITIZE_DEPTH_MIN, SANITIZE_DEPTH_MAX);
        cfg.max_sanitize_properties = cfg
            .max_sanitize_properties
            .clamp(SANITIZE_PROPERTIES_MIN, SANITIZE_PROPERTIES_MAX);
        cfg
    }

    /// Validates the policy section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.double_vm.parent_validation.validate()
    }
}
