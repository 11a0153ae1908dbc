//! Engine-wide limits and window sizes.
//!
//! These values are observable by guest programs (a guest can measure when a
//! loop helper trips, or how much console output it is allowed), so changing
//! them changes guest-visible behavior. Treat them as part of the contract.

/// Width of the rate-limit window used by the policy validator.
pub const RATE_LIMIT_WINDOW_MS: u64 = 1_000;

/// Operation-history entries older than this are purged on every validation.
pub const HISTORY_MAX_AGE_MS: u64 = 2_000;

/// Hard cap on live operation-history entries, independent of age.
pub const HISTORY_MAX_ENTRIES: usize = 256;

/// Window consulted by the exfiltration and rapid-enumeration detectors.
pub const SUSPICIOUS_SHORT_WINDOW_MS: u64 = 5_000;

/// Window consulted by the credential-exfiltration detector.
pub const SUSPICIOUS_MEDIUM_WINDOW_MS: u64 = 10_000;

/// Window consulted by the delete-after-access detector.
pub const SUSPICIOUS_LONG_WINDOW_MS: u64 = 30_000;

/// Default threshold for the rapid-enumeration detector.
pub const RAPID_ENUMERATION_THRESHOLD: u32 = 10;

/// Default sanitizer recursion depth before clamping.
pub const SANITIZE_DEPTH_DEFAULT: u32 = 20;

/// Clamp range for the sanitizer recursion depth.
pub const SANITIZE_DEPTH_MIN: u32 = 5;
/// Upper clamp for the sanitizer recursion depth.
pub const SANITIZE_DEPTH_MAX: u32 = 50;

/// Default sanitizer cumulative property budget before clamping.
pub const SANITIZE_PROPERTIES_DEFAULT: u32 = 10_000;

/// Clamp range for the sanitizer property budget.
pub const SANITIZE_PROPERTIES_MIN: u32 = 50;
/// Upper clamp for the sanitizer property budget.
pub const SANITIZE_PROPERTIES_MAX: u32 = 1_000;

/// Hard ceiling on the estimated serialized size of any value returned to the
/// host, applied as `min(memory_limit, SERIALIZED_SIZE_CAP_BYTES)`.
pub const SERIALIZED_SIZE_CAP_BYTES: u64 = 50 * 1024 * 1024;

/// Depth to which guarded views re-wrap nested property reads.
pub const GUARDED_VIEW_MAX_DEPTH: u32 = 10;

/// Maximum number of items `parallel` accepts.
pub const PARALLEL_MAX_ITEMS: usize = 100;

/// Maximum guest call-stack depth.
pub const MAX_CALL_DEPTH: usize = 64;

/// Maximum number of AST nodes accepted in one guest program.
pub const MAX_PROGRAM_NODES: usize = 100_000;

/// Depth cap applied by the realm's `JSON.parse`. The engine never assumes
/// the underlying parser protects itself.
pub const JSON_PARSE_MAX_DEPTH: usize = 64;

/// Default cap on one bridge envelope, request or response.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1024 * 1024;

/// Sanitized tool-result strings at or above this size are lifted into the
/// sidecar and replaced with a reference handle.
pub const DEFAULT_EXTRACTION_THRESHOLD_BYTES: u64 = 256 * 1024;

/// Cap on the total resolved size of reference handles inside one tool call's
/// arguments.
pub const DEFAULT_MAX_INBOUND_REFERENCE_BYTES: u64 = 8 * 1024 * 1024;

/// Length bounds of a well-formed reference handle string.
pub const REFERENCE_HANDLE_MIN_LEN: usize = 40;
/// Upper length bound of a well-formed reference handle string.
pub const REFERENCE_HANDLE_MAX_LEN: usize = 48;

/// Default wall-clock budget for one execution.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default extra budget granted to the outer realm's watchdog, catching
/// bootstrap code that wedges before the inner watchdog is armed.
pub const DEFAULT_PARENT_TIMEOUT_BUFFER_MS: u64 = 1_000;

/// Default loop-iteration budget for one execution.
pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000;

/// Default tool-call budget for one execution.
pub const DEFAULT_MAX_TOOL_CALLS: u64 = 50;

/// Default console budget: number of calls.
pub const DEFAULT_MAX_CONSOLE_CALLS: u64 = 100;

/// Default console budget: total output bytes.
pub const DEFAULT_MAX_CONSOLE_OUTPUT_BYTES: u64 = 64 * 1024;

/// Default rate limit applied by the policy validator.
pub const DEFAULT_MAX_OPERATIONS_PER_SECOND: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_ranges_are_ordered() {
        assert!(SANITIZE_DEPTH_MIN < SANITIZE_DEPTH_MAX);
        assert!(SANITIZE_PROPERTIES_MIN < SANITIZE_PROPERTIES_MAX);
        assert!(REFERENCE_HANDLE_MIN_LEN < REFERENCE_HANDLE_MAX_LEN);
    }

    #[test]
    fn test_history_window_covers_rate_window() {
        // The rate limiter counts inside the history; purging must never
        // discard entries still inside the rate window.
        assert!(HISTORY_MAX_AGE_MS >= RATE_LIMIT_WINDOW_MS);
    }
}
