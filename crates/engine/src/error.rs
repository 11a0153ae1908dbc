//! Error types for the engine crate.
//!
//! One variant per host-facing error code, plus the flattened [`ErrorInfo`]
//! form carried on execution results. Errors raised inside the inner realm
//! surface to guest code as sealed error values; this taxonomy is what the
//! host sees after the orchestrator parses the outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine execution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Guest source failed pre-transform checks; surfaced from the
    /// transformer or raised by program parsing.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A loop helper exceeded the iteration budget
    #[error("Iteration limit exceeded: executed {executed}, limit {limit}")]
    IterationLimitExceeded { executed: u64, limit: u64 },

    /// `callTool` would push the count past the budget
    #[error("Tool call limit exceeded: limit {limit}")]
    ToolCallLimitExceeded { limit: u64 },

    /// The policy validator's sliding-window rate check failed
    #[error("Rate limit exceeded: more than {max_per_second} operations in {window_ms}ms")]
    RateLimitExceeded { max_per_second: u32, window_ms: u64 },

    /// The operation did not match the whitelist
    #[error("Operation not allowed: {operation}")]
    OperationNotAllowed { operation: String },

    /// The operation matched a blacklist pattern
    #[error("Operation blocked: {operation} matched `{pattern}`")]
    OperationBlocked { operation: String, pattern: String },

    /// A suspicious-sequence detector fired
    #[error("Suspicious pattern detected: {pattern_id}")]
    SuspiciousPatternDetected {
        pattern_id: String,
        description: String,
    },

    /// The memory accountant's ceiling was crossed
    #[error("Memory limit exceeded: used {used_bytes} bytes, limit {limit_bytes} bytes")]
    MemoryLimitExceeded { used_bytes: u64, limit_bytes: u64 },

    /// The final value's estimated serialized size crossed the cap
    #[error("Serialization limit exceeded: estimated {estimated} bytes, limit {limit} bytes")]
    SerializationLimitExceeded { estimated: u64, limit: u64 },

    /// The sanitizer recursed past its depth budget
    #[error("Sanitize depth exceeded: limit {limit}")]
    SanitizeDepthExceeded { limit: u32 },

    /// The sanitizer visited more properties than its budget
    #[error("Sanitize properties exceeded: limit {limit}")]
    SanitizePropertiesExceeded { limit: u32 },

    /// Console call or byte cap crossed
    #[error("Console limit exceeded: {kind}")]
    ConsoleLimitExceeded { kind: ConsoleLimitKind },

    /// A security violation was recorded under STRICT or SECURE
    #[error("Security violation: {kind}: {detail}")]
    SecurityViolation { kind: ViolationKind, detail: String },

    /// The watchdog fired
    #[error("Timeout exceeded: {timeout_ms}ms")]
    TimeoutExceeded { timeout_ms: u64 },

    /// The host signalled the abort flag
    #[error("Execution aborted")]
    ExecutionAborted,

    /// Tool arguments were not a serializable record
    #[error("Bad arguments: {reason}")]
    BadArguments { reason: String },

    /// A bridge envelope was malformed, truncated or over the payload cap
    #[error("Bridge protocol error: {reason}")]
    BridgeProtocolError { reason: String },

    /// The host tool handler failed
    #[error("Tool invocation failed: {name}: {message}")]
    ToolInvocationFailed { name: String, message: String },

    /// Resolving reference handles would exceed the inbound size cap
    #[error("Reference size exceeded: resolved {resolved} bytes, limit {limit} bytes")]
    ReferenceSizeExceeded { resolved: u64, limit: u64 },

    /// A reference handle was composed while composites are disabled
    #[error("Composite handles are disallowed")]
    CompositeDisallowed,

    /// The guest's final value contained a callable
    #[error("A function crossed the sanitizer boundary")]
    FunctionReturned,

    /// The guest's final value contained a symbolic value
    #[error("A symbol crossed the sanitizer boundary")]
    SymbolReturned,

    /// Any other uncaught guest error
    #[error("Guest execution error: {message}")]
    DoubleVmExecution { message: String },
}

/// Which console budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLimitKind {
    Calls,
    Bytes,
}

impl std::fmt::Display for ConsoleLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleLimitKind::Calls => write!(f, "call count"),
            ConsoleLimitKind::Bytes => write!(f, "output bytes"),
        }
    }
}

/// What kind of security violation was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    /// An attempt to reach the code-generation intrinsics.
    CodeGeneration,
    /// A blocked property name was read through a guarded view.
    BlockedPropertyAccess,
    /// A tool call was rejected by the policy validator.
    PolicyBreach,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationKind::CodeGeneration => write!(f, "CODE_GENERATION"),
            ViolationKind::BlockedPropertyAccess => write!(f, "BLOCKED_PROPERTY_ACCESS"),
            ViolationKind::PolicyBreach => write!(f, "POLICY_BREACH"),
        }
    }
}

impl EngineError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new iteration limit error
    pub fn iteration_limit(executed: u64, limit: u64) -> Self {
        Self::IterationLimitExceeded { executed, limit }
    }

    /// Create a new tool call limit error
    pub fn tool_call_limit(limit: u64) -> Self {
        Self::ToolCallLimitExceeded { limit }
    }

    /// Create a new rate limit error
    pub fn rate_limit(max_per_second: u32, window_ms: u64) -> Self {
        Self::RateLimitExceeded {
            max_per_second,
            window_ms,
        }
    }

    /// Create a new operation-not-allowed error
    pub fn not_allowed<S: Into<String>>(operation: S) -> Self {
        Self::OperationNotAllowed {
            operation: operation.into(),
        }
    }

    /// Create a new operation-blocked error
    pub fn blocked<S: Into<String>>(operation: S, pattern: S) -> Self {
        Self::OperationBlocked {
            operation: operation.into(),
            pattern: pattern.into(),
        }
    }

    /// Create a new suspicious-pattern error
    pub fn suspicious<S: Into<String>>(pattern_id: S, description: S) -> Self {
        Self::SuspiciousPatternDetected {
            pattern_id: pattern_id.into(),
            description: description.into(),
        }
    }

    /// Create a new memory limit error
    pub fn memory_limit(used_bytes: u64, limit_bytes: u64) -> Self {
        Self::MemoryLimitExceeded {
            used_bytes,
            limit_bytes,
        }
    }

    /// Create a new serialization limit error
    pub fn serialization_limit(estimated: u64, limit: u64) -> Self {
        Self::SerializationLimitExceeded { estimated, limit }
    }

    /// Create a new security violation error
    pub fn security_violation<S: Into<String>>(kind: ViolationKind, detail: S) -> Self {
        Self::SecurityViolation {
            kind,
            detail: detail.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::TimeoutExceeded { timeout_ms }
    }

    /// Create a new bad-arguments error
    pub fn bad_arguments<S: Into<String>>(reason: S) -> Self {
        Self::BadArguments {
            reason: reason.into(),
        }
    }

    /// Create a new bridge protocol error
    pub fn bridge_protocol<S: Into<String>>(reason: S) -> Self {
        Self::BridgeProtocolError {
            reason: reason.into(),
        }
    }

    /// Create a new tool-invocation failure
    pub fn tool_failed<S: Into<String>>(name: S, message: S) -> Self {
        Self::ToolInvocationFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a new guest execution error
    pub fn guest<S: Into<String>>(message: S) -> Self {
        Self::DoubleVmExecution {
            message: message.into(),
        }
    }

    /// The stable host-facing code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "VALIDATION_ERROR",
            EngineError::IterationLimitExceeded { .. } => "ITERATION_LIMIT_EXCEEDED",
            EngineError::ToolCallLimitExceeded { .. } => "TOOL_CALL_LIMIT_EXCEEDED",
            EngineError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            EngineError::OperationNotAllowed { .. } => "OPERATION_NOT_ALLOWED",
            EngineError::OperationBlocked { .. } => "OPERATION_BLOCKED",
            EngineError::SuspiciousPatternDetected { .. } => "SUSPICIOUS_PATTERN_DETECTED",
            EngineError::MemoryLimitExceeded { .. } => "MEMORY_LIMIT_EXCEEDED",
            EngineError::SerializationLimitExceeded { .. } => "SERIALIZATION_LIMIT_EXCEEDED",
            EngineError::SanitizeDepthExceeded { .. } => "SANITIZE_DEPTH_EXCEEDED",
            EngineError::SanitizePropertiesExceeded { .. } => "SANITIZE_PROPERTIES_EXCEEDED",
            EngineError::ConsoleLimitExceeded { .. } => "CONSOLE_LIMIT_EXCEEDED",
            EngineError::SecurityViolation { .. } => "SECURITY_VIOLATION",
            EngineError::TimeoutExceeded { .. } => "TIMEOUT_EXCEEDED",
            EngineError::ExecutionAborted => "EXECUTION_ABORTED",
            EngineError::BadArguments { .. } => "BAD_ARGUMENTS",
            EngineError::BridgeProtocolError { .. } => "BRIDGE_PROTOCOL_ERROR",
            EngineError::ToolInvocationFailed { .. } => "TOOL_INVOCATION_FAILED",
            EngineError::ReferenceSizeExceeded { .. } => "REFERENCE_SIZE_EXCEEDED",
            EngineError::CompositeDisallowed => "COMPOSITE_DISALLOWED",
            EngineError::FunctionReturned => "FUNCTION_RETURNED",
            EngineError::SymbolReturned => "SYMBOL_RETURNED",
            EngineError::DoubleVmExecution { .. } => "DOUBLE_VM_EXECUTION_ERROR",
        }
    }

    /// Rebuilds the error variant that matches a sealed error's code. The
    /// message is carried verbatim; structured fields are not recoverable
    /// across the realm boundary.
    pub fn from_code(code: &str, message: &str) -> Self {
        match code {
            "VALIDATION_ERROR" => Self::validation(message),
            "ITERATION_LIMIT_EXCEEDED" => Self::IterationLimitExceeded {
                executed: 0,
                limit: 0,
            },
            "TOOL_CALL_LIMIT_EXCEEDED" => Self::ToolCallLimitExceeded { limit: 0 },
            "RATE_LIMIT_EXCEEDED" => Self::RateLimitExceeded {
                max_per_second: 0,
                window_ms: 0,
            },
            "OPERATION_NOT_ALLOWED" => Self::not_allowed(message),
            "OPERATION_BLOCKED" => Self::blocked(message, ""),
            "SUSPICIOUS_PATTERN_DETECTED" => Self::suspicious(message, ""),
            "MEMORY_LIMIT_EXCEEDED" => Self::memory_limit(0, 0),
            "SERIALIZATION_LIMIT_EXCEEDED" => Self::serialization_limit(0, 0),
            "SANITIZE_DEPTH_EXCEEDED" => Self::SanitizeDepthExceeded { limit: 0 },
            "SANITIZE_PROPERTIES_EXCEEDED" => Self::SanitizePropertiesExceeded { limit: 0 },
            "CONSOLE_LIMIT_EXCEEDED" => Self::ConsoleLimitExceeded {
                kind: ConsoleLimitKind::Calls,
            },
            "SECURITY_VIOLATION" => Self::security_violation(
                ViolationKind::BlockedPropertyAccess,
                message,
            ),
            "TIMEOUT_EXCEEDED" => Self::timeout(0),
            "EXECUTION_ABORTED" => Self::ExecutionAborted,
            "BAD_ARGUMENTS" => Self::bad_arguments(message),
            "BRIDGE_PROTOCOL_ERROR" => Self::bridge_protocol(message),
            "TOOL_INVOCATION_FAILED" => Self::tool_failed("", message),
            "REFERENCE_SIZE_EXCEEDED" => Self::ReferenceSizeExceeded {
                resolved: 0,
                limit: 0,
            },
            "COMPOSITE_DISALLOWED" => Self::CompositeDisallowed,
            "FUNCTION_RETURNED" => Self::FunctionReturned,
            "SYMBOL_RETURNED" => Self::SymbolReturned,
            _ => Self::guest(message),
        }
    }

    /// The error class name as guests and hosts see it.
    pub fn name(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "ValidationError",
            EngineError::IterationLimitExceeded { .. } => "IterationLimitError",
            EngineError::ToolCallLimitExceeded { .. } => "ToolCallLimitError",
            EngineError::RateLimitExceeded { .. } => "RateLimitError",
            EngineError::OperationNotAllowed { .. } => "OperationNotAllowedError",
            EngineError::OperationBlocked { .. } => "OperationBlockedError",
            EngineError::SuspiciousPatternDetected { .. } => "SuspiciousPatternError",
            EngineError::MemoryLimitExceeded { .. } => "MemoryLimitError",
            EngineError::SerializationLimitExceeded { .. } => "SerializationLimitError",
            EngineError::SanitizeDepthExceeded { .. }
            | EngineError::SanitizePropertiesExceeded { .. } => "SanitizeLimitError",
            EngineError::ConsoleLimitExceeded { .. } => "ConsoleLimitError",
            EngineError::SecurityViolation { .. } => "SecurityViolationError",
            EngineError::TimeoutExceeded { .. } => "TimeoutError",
            EngineError::ExecutionAborted => "AbortError",
            EngineError::BadArguments { .. } => "BadArgumentsError",
            EngineError::BridgeProtocolError { .. } => "BridgeProtocolError",
            EngineError::ToolInvocationFailed { .. } => "ToolInvocationError",
            EngineError::ReferenceSizeExceeded { .. } => "ReferenceSizeError",
            EngineError::CompositeDisallowed => "CompositeDisallowedError",
            EngineError::FunctionReturned | EngineError::SymbolReturned => "SanitizeError",
            EngineError::DoubleVmExecution { .. } => "DoubleVMExecutionError",
        }
    }

    /// Check if this error is a resource limit error
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            EngineError::IterationLimitExceeded { .. }
                | EngineError::ToolCallLimitExceeded { .. }
                | EngineError::MemoryLimitExceeded { .. }
                | EngineError::SerializationLimitExceeded { .. }
                | EngineError::ConsoleLimitExceeded { .. }
                | EngineError::TimeoutExceeded { .. }
                | EngineError::ReferenceSizeExceeded { .. }
        )
    }

    /// Check if this error is a policy rejection
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimitExceeded { .. }
                | EngineError::OperationNotAllowed { .. }
                | EngineError::OperationBlocked { .. }
                | EngineError::SuspiciousPatternDetected { .. }
        )
    }

    /// Check if this error is security-relevant (recorded in the violation
    /// log under STRICT and SECURE)
    pub fn is_security(&self) -> bool {
        matches!(self, EngineError::SecurityViolation { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::IterationLimitExceeded { .. }
            | EngineError::ToolCallLimitExceeded { .. }
            | EngineError::MemoryLimitExceeded { .. }
            | EngineError::SerializationLimitExceeded { .. }
            | EngineError::ConsoleLimitExceeded { .. }
            | EngineError::ReferenceSizeExceeded { .. } => "resource",
            EngineError::RateLimitExceeded { .. }
            | EngineError::OperationNotAllowed { .. }
            | EngineError::OperationBlocked { .. }
            | EngineError::SuspiciousPatternDetected { .. } => "policy",
            EngineError::SanitizeDepthExceeded { .. }
            | EngineError::SanitizePropertiesExceeded { .. }
            | EngineError::FunctionReturned
            | EngineError::SymbolReturned => "sanitize",
            EngineError::SecurityViolation { .. } => "security",
            EngineError::TimeoutExceeded { .. } => "timeout",
            EngineError::ExecutionAborted => "abort",
            EngineError::BadArguments { .. }
            | EngineError::BridgeProtocolError { .. }
            | EngineError::ToolInvocationFailed { .. }
            | EngineError::CompositeDisallowed => "bridge",
            EngineError::DoubleVmExecution { .. } => "guest",
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// The flattened error carried on an [`crate::gatekeeper::ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error class name, e.g. `MemoryLimitExceeded`.
    pub name: String,
    /// Human-readable message, redacted when configured.
    pub message: String,
    /// Stable code from the §7 enumeration.
    pub code: String,
    /// Optional structured payload (e.g. the detector id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorInfo {
    /// Flattens an engine error into its host-facing form.
    pub fn from_error(error: &EngineError) -> Self {
        let data = match error {
            EngineError::SuspiciousPatternDetected {
                pattern_id,
                description,
            } => Some(serde_json::json!({
                "id": pattern_id,
                "description": description,
            })),
            EngineError::SecurityViolation { kind, .. } => {
                Some(serde_json::json!({ "kind": kind }))
            }
            EngineError::MemoryLimitExceeded {
                used_bytes,
                limit_bytes,
            } => Some(serde_json::json!({
                "usedBytes": used_bytes,
                "limitBytes": limit_bytes,
            })),
            _ => None,
        };
        Self {
            name: error.name().to_string(),
            message: error.to_string(),
            code: error.code().to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(EngineError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(
            EngineError::memory_limit(10, 5).code(),
            "MEMORY_LIMIT_EXCEEDED"
        );
        assert_eq!(EngineError::CompositeDisallowed.code(), "COMPOSITE_DISALLOWED");
        assert_eq!(
            EngineError::guest("boom").code(),
            "DOUBLE_VM_EXECUTION_ERROR"
        );
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::memory_limit(2048, 1024);
        assert_eq!(
            err.to_string(),
            "Memory limit exceeded: used 2048 bytes, limit 1024 bytes"
        );
    }

    #[test]
    fn test_classification() {
        assert!(EngineError::memory_limit(1, 0).is_resource_limit());
        assert!(!EngineError::validation("x").is_resource_limit());
        assert!(EngineError::rate_limit(5, 1000).is_policy());
        assert!(EngineError::security_violation(
            ViolationKind::CodeGeneration,
            "Function"
        )
        .is_security());
    }

    #[test]
    fn test_round_trip_through_code() {
        let original = EngineError::CompositeDisallowed;
        let rebuilt = EngineError::from_code(original.code(), &original.to_string());
        assert_eq!(rebuilt.code(), original.code());
    }

    #[test]
    fn test_error_info_carries_detector_id() {
        let err = EngineError::suspicious("EXFIL_LIST_SEND", "list then send");
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.code, "SUSPICIOUS_PATTERN_DETECTED");
        assert_eq!(info.data.unwrap()["id"], "EXFIL_LIST_SEND");
    }
}
