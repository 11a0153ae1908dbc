//! Suspicious-sequence detectors.
//!
//! Each detector inspects the current operation together with the bounded
//! history and reports whether the sequence looks hostile. Detect functions
//! must be pure; user-supplied detectors that misbehave are swallowed
//! per-detector rather than failing the call closed.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::time::Instant;

use super::history::OperationHistory;
use warden_core::config::DetectorSpec;
use warden_core::constants::{
    SUSPICIOUS_LONG_WINDOW_MS, SUSPICIOUS_MEDIUM_WINDOW_MS, SUSPICIOUS_SHORT_WINDOW_MS,
};
use warden_core::ConfigError;

/// A suspicious-sequence detector.
pub trait SuspiciousPattern: Send + Sync {
    /// Stable identifier surfaced on rejections.
    fn id(&self) -> &str;
    /// Human-readable description of what the pattern means.
    fn description(&self) -> &str;
    /// Returns true when the current operation completes a hostile sequence.
    fn detect(
        &self,
        operation_name: &str,
        args: &serde_json::Value,
        history: &OperationHistory,
        now: Instant,
    ) -> bool;
}

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static pattern")
}

static DATA_ACCESS: Lazy<Regex> =
    Lazy::new(|| ci(r"list|query|get|fetch|read|search|find|select"));
static DATA_EGRESS: Lazy<Regex> =
    Lazy::new(|| ci(r"send|export|post|write|upload|publish|emit|transmit|forward"));
static CREDENTIAL_SOURCE: Lazy<Regex> =
    Lazy::new(|| ci(r"secret|credential|password|token|key|auth|api[-_]?key"));
static EXTERNAL_SINK: Lazy<Regex> =
    Lazy::new(|| ci(r"http|api|external|webhook|slack|email|sms|notification"));
static BULK_NAME: Lazy<Regex> = Lazy::new(|| ci(r"\b(bulk|batch|mass|dump)\b|export[-_]all"));
static BULK_ARGS: Lazy<Regex> = Lazy::new(|| ci(r#"limit.*\d{4,}|"\*"|no[-_]?limit"#));
static DESTRUCTIVE: Lazy<Regex> = Lazy::new(|| ci(r"delete|remove|destroy|purge|clear|wipe|erase"));

/// Read-then-exfiltrate: a data-access operation shortly followed by an
/// egress operation.
pub struct ExfilListSend;

impl SuspiciousPattern for ExfilListSend {
    fn id(&self) -> &str {
        "EXFIL_LIST_SEND"
    }
    fn description(&self) -> &str {
        "data access followed by an outbound send"
    }
    fn detect(
        &self,
        operation_name: &str,
        _args: &serde_json::Value,
        history: &OperationHistory,
        now: Instant,
    ) -> bool {
        DATA_EGRESS.is_match(operation_name)
            && history.any_within(now, SUSPICIOUS_SHORT_WINDOW_MS, |n| DATA_ACCESS.is_match(n))
    }
}

/// The same operation hammered in a tight window.
pub struct RapidEnumeration {
    pub threshold: u32,
}

impl SuspiciousPattern for RapidEnumeration {
    fn id(&self) -> &str {
        "RAPID_ENUMERATION"
    }
    fn description(&self) -> &str {
        "one operation repeated rapidly"
    }
    fn detect(
        &self,
        operation_name: &str,
        _args: &serde_json::Value,
        history: &OperationHistory,
        now: Instant,
    ) -> bool {
        let repeats =
            history.count_matching_within(now, SUSPICIOUS_SHORT_WINDOW_MS, |n| {
                n == operation_name
            });
        repeats as u32 > self.threshold
    }
}

/// Credential material read, then an external channel invoked.
pub struct CredentialExfil;

impl SuspiciousPattern for CredentialExfil {
    fn id(&self) -> &str {
        "CREDENTIAL_EXFIL"
    }
    fn description(&self) -> &str {
        "credential access followed by an external channel"
    }
    fn detect(
        &self,
        operation_name: &str,
        _args: &serde_json::Value,
        history: &OperationHistory,
        now: Instant,
    ) -> bool {
        EXTERNAL_SINK.is_match(operation_name)
            && history.any_within(now, SUSPICIOUS_MEDIUM_WINDOW_MS, |n| {
                CREDENTIAL_SOURCE.is_match(n)
            })
    }
}

/// Bulk-shaped operation names or argument shapes.
pub struct BulkOperation;

impl SuspiciousPattern for BulkOperation {
    fn id(&self) -> &str {
        "BULK_OPERATION"
    }
    fn description(&self) -> &str {
        "bulk-shaped operation or unbounded arguments"
    }
    fn detect(
        &self,
        operation_name: &str,
        args: &serde_json::Value,
        _history: &OperationHistory,
        _now: Instant,
    ) -> bool {
        if BULK_NAME.is_match(operation_name) {
            return true;
        }
        match serde_json::to_string(args) {
            Ok(serialized) => BULK_ARGS.is_match(&serialized),
            Err(_) => false,
        }
    }
}

/// Destructive operation after any recent data access.
pub struct DeleteAfterAccess;

impl SuspiciousPattern for DeleteAfterAccess {
    fn id(&self) -> &str {
        "DELETE_AFTER_ACCESS"
    }
    fn description(&self) -> &str {
        "destructive operation following data access"
    }
    fn detect(
        &self,
        operation_name: &str,
        _args: &serde_json::Value,
        history: &OperationHistory,
        now: Instant,
    ) -> bool {
        DESTRUCTIVE.is_match(operation_name)
            && history.any_within(now, SUSPICIOUS_LONG_WINDOW_MS, |n| DATA_ACCESS.is_match(n))
    }
}

/// A detector compiled from a user's declarative [`DetectorSpec`].
pub struct ScriptedPattern {
    id: String,
    description: String,
    trigger: Regex,
    recent: Option<Regex>,
    args: Option<Regex>,
    window_ms: u64,
}

impl ScriptedPattern {
    /// Compiles a validated spec. The spec's own `validate` has already
    /// rejected code-shaped text; this only compiles the patterns.
    pub fn compile(spec: &DetectorSpec) -> Result<Self, ConfigError> {
        spec.validate()?;
        let compile = |p: &str| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::invalid_pattern(p.to_string(), e.to_string()))
        };
        Ok(Self {
            id: spec.id.clone(),
            description: spec.description.clone(),
            trigger: compile(&spec.trigger_pattern)?,
            recent: spec.recent_pattern.as_deref().map(compile).transpose()?,
            args: spec.args_pattern.as_deref().map(compile).transpose()?,
            window_ms: spec.window_ms,
        })
    }
}

impl SuspiciousPattern for ScriptedPattern {
    fn id(&self) -> &str {
        &self.id
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn detect(
        &self,
        operation_name: &str,
        args: &serde_json::Value,
        history: &OperationHistory,
        now: Instant,
    ) -> bool {
        if !self.trigger.is_match(operation_name) {
            return false;
        }
        if let Some(recent) = &self.recent {
            if !history.any_within(now, self.window_ms, |n| recent.is_match(n)) {
                return false;
            }
        }
        if let Some(args_re) = &self.args {
            match serde_json::to_string(args) {
                Ok(serialized) => {
                    if !args_re.is_match(&serialized) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }
}

/// The built-in detector set, in evaluation order.
pub fn default_detectors(rapid_enumeration_threshold: u32) -> Vec<Box<dyn SuspiciousPattern>> {
    vec![
        Box::new(ExfilListSend),
        Box::new(RapidEnumeration {
            threshold: rapid_enumeration_threshold,
        }),
        Box::new(CredentialExfil),
        Box::new(BulkOperation),
        Box::new(DeleteAfterAccess),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> serde_json::Value {
        serde_json::json!({})
    }

    #[test]
    fn test_exfil_list_send() {
        let mut history = OperationHistory::new();
        let now = Instant::now();
        let detector = ExfilListSend;
        assert!(!detector.detect("http:post", &empty_args(), &history, now));
        history.push("db:listUsers".into(), vec![], now);
        assert!(detector.detect("http:post", &empty_args(), &history, now));
        assert!(!detector.detect("db:count", &empty_args(), &history, now));
    }

    #[test]
    fn test_rapid_enumeration_respects_threshold() {
        let mut history = OperationHistory::new();
        let now = Instant::now();
        let detector = RapidEnumeration { threshold: 3 };
        for _ in 0..3 {
            history.push("db:get".into(), vec![], now);
        }
        assert!(!detector.detect("db:get", &empty_args(), &history, now));
        history.push("db:get".into(), vec![], now);
        assert!(detector.detect("db:get", &empty_args(), &history, now));
    }

    #[test]
    fn test_credential_exfil() {
        let mut history = OperationHistory::new();
        let now = Instant::now();
        let detector = CredentialExfil;
        history.push("vault:getSecret".into(), vec![], now);
        assert!(detector.detect("slack:message", &empty_args(), &history, now));
        assert!(!detector.detect("db:update", &empty_args(), &history, now));
    }

    #[test]
    fn test_bulk_operation_names_and_args() {
        let history = OperationHistory::new();
        let now = Instant::now();
        let detector = BulkOperation;
        assert!(detector.detect("users:bulkDelete", &empty_args(), &history, now));
        assert!(detector.detect("export_all", &empty_args(), &history, now));
        assert!(!detector.detect("users:get", &empty_args(), &history, now));
        let unbounded = serde_json::json!({ "limit": 99999 });
        assert!(detector.detect("users:get", &unbounded, &history, now));
        let wildcard = serde_json::json!({ "select": "*" });
        assert!(detector.detect("users:get", &wildcard, &history, now));
    }

    #[test]
    fn test_delete_after_access() {
        let mut history = OperationHistory::new();
        let now = Instant::now();
        let detector = DeleteAfterAccess;
        assert!(!detector.detect("db:deleteUser", &empty_args(), &history, now));
        history.push("db:findUser".into(), vec![], now);
        assert!(detector.detect("db:deleteUser", &empty_args(), &history, now));
    }

    #[test]
    fn test_scripted_pattern() {
        let spec = DetectorSpec {
            id: "BILLING_TOUCH".into(),
            description: "billing mutation after invoice read".into(),
            trigger_pattern: "billing:(update|charge)".into(),
            recent_pattern: Some("invoice".into()),
            args_pattern: None,
            window_ms: 5_000,
        };
        let detector = ScriptedPattern::compile(&spec).unwrap();
        let mut history = OperationHistory::new();
        let now = Instant::now();
        assert!(!detector.detect("billing:charge", &empty_args(), &history, now));
        history.push("invoice:read".into(), vec![], now);
        assert!(detector.detect("billing:charge", &empty_args(), &history, now));
    }

    #[test]
    fn test_default_set_order() {
        let detectors = default_detectors(10);
        let ids: Vec<&str> = detectors.iter().map(|d| d.id()).collect();
        assert_eq!(
            ids,
            [
                "EXFIL_LIST_SEND",
                "RAPID_ENUMERATION",
                "CREDENTIAL_EXFIL",
                "BULK_OPERATION",
                "DELETE_AFTER_ACCESS"
            ]
        );
    }
}
