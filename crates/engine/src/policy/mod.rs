//! Policy enforcement for tool calls.
//!
//! The validator runs inside the gatekeeper realm, before the host handler
//! observes anything. Checks run in a fixed order: age purge, rate limit,
//! name format, whitelist, blacklist, suspicious sequences. Only calls that
//! pass everything are appended to the history.

pub mod history;
pub mod patterns;

pub use history::{HistoryEntry, OperationHistory};
pub use patterns::{ScriptedPattern, SuspiciousPattern};

use regex::Regex;
use std::time::Instant;

use crate::error::{EngineError, EngineResult};
use warden_core::config::ParentValidationConfig;
use warden_core::constants::RATE_LIMIT_WINDOW_MS;

/// Compiled per-execution policy.
pub struct PolicyValidator {
    validate_operation_names: bool,
    allowed: Option<Regex>,
    blocked: Vec<Regex>,
    max_operations_per_second: u32,
    block_suspicious_sequences: bool,
    detectors: Vec<Box<dyn SuspiciousPattern>>,
}

impl PolicyValidator {
    /// Compiles the configured policy. Custom detectors were screened at
    /// configuration time; compile failures here are still configuration
    /// bugs and surface as validation errors.
    pub fn from_config(config: &ParentValidationConfig) -> EngineResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                EngineError::validation(format!("Invalid policy pattern `{pattern}`: {e}"))
            })
        };
        let allowed = config
            .allowed_pattern
            .as_deref()
            .map(compile)
            .transpose()?;
        let blocked = config
            .blocked_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<EngineResult<Vec<_>>>()?;

        let mut detectors = patterns::default_detectors(config.rapid_enumeration_threshold);
        for spec in &config.suspicious_patterns {
            let scripted = ScriptedPattern::compile(spec)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            detectors.push(Box::new(scripted));
        }

        Ok(Self {
            validate_operation_names: config.validate_operation_names,
            allowed,
            blocked,
            max_operations_per_second: config.max_operations_per_second,
            block_suspicious_sequences: config.block_suspicious_sequences,
            detectors,
        })
    }

    /// Validates one operation against the policy and, on success, appends
    /// it to the history.
    pub fn validate(
        &self,
        operation_name: &str,
        args: &serde_json::Value,
        history: &mut OperationHistory,
    ) -> EngineResult<()> {
        let now = Instant::now();
        history.purge(now);

        let recent = history.count_within(now, RATE_LIMIT_WINDOW_MS);
        if recent >= self.max_operations_per_second as usize {
            return Err(EngineError::rate_limit(
                self.max_operations_per_second,
                RATE_LIMIT_WINDOW_MS,
            ));
        }

        if operation_name.trim().is_empty() {
            return Err(EngineError::bad_arguments(
                "operation name must be a non-empty string",
            ));
        }

        if self.validate_operation_names {
            if let Some(allowed) = &self.allowed {
                if !allowed.is_match(operation_name) {
                    return Err(EngineError::not_allowed(operation_name));
                }
            }
        }

        // The blacklist is always consulted, whitelist or not.
        for pattern in &self.blocked {
            if pattern.is_match(operation_name) {
                return Err(EngineError::blocked(operation_name, pattern.as_str()));
            }
        }

        if self.block_suspicious_sequences {
            for detector in &self.detectors {
                let fired = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    detector.detect(operation_name, args, history, now)
                }))
                // A broken detector fails open, never closed.
                .unwrap_or(false);
                if fired {
                    return Err(EngineError::suspicious(
                        detector.id(),
                        detector.description(),
                    ));
                }
            }
        }

        let arg_keys = match args {
            serde_json::Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        history.push(operation_name.to_string(), arg_keys, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::config::DetectorSpec;

    fn validator(config: ParentValidationConfig) -> PolicyValidator {
        PolicyValidator::from_config(&config).unwrap()
    }

    fn args() -> serde_json::Value {
        serde_json::json!({ "a": 1 })
    }

    #[test]
    fn test_accepted_calls_are_appended_with_arg_keys() {
        let validator = validator(ParentValidationConfig::default());
        let mut history = OperationHistory::new();
        validator.validate("db:get", &args(), &mut history).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.iter().next().unwrap().arg_keys, ["a"]);
    }

    #[test]
    fn test_rate_limit_window() {
        let validator = validator(ParentValidationConfig {
            max_operations_per_second: 5,
            block_suspicious_sequences: false,
            ..Default::default()
        });
        let mut history = OperationHistory::new();
        for _ in 0..5 {
            validator.validate("api:ping", &args(), &mut history).unwrap();
        }
        let err = validator
            .validate("api:ping", &args(), &mut history)
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
        // The rejected call is not recorded.
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let validator = validator(ParentValidationConfig::default());
        let mut history = OperationHistory::new();
        let err = validator.validate("  ", &args(), &mut history).unwrap_err();
        assert_eq!(err.code(), "BAD_ARGUMENTS");
    }

    #[test]
    fn test_whitelist() {
        let validator = validator(ParentValidationConfig {
            allowed_pattern: Some("^db:".into()),
            block_suspicious_sequences: false,
            ..Default::default()
        });
        let mut history = OperationHistory::new();
        validator.validate("db:get", &args(), &mut history).unwrap();
        let err = validator
            .validate("fs:open", &args(), &mut history)
            .unwrap_err();
        assert_eq!(err.code(), "OPERATION_NOT_ALLOWED");
    }

    #[test]
    fn test_blacklist_applies_even_when_whitelisted() {
        let validator = validator(ParentValidationConfig {
            allowed_pattern: Some("^db:".into()),
            blocked_patterns: vec!["drop".into()],
            block_suspicious_sequences: false,
            ..Default::default()
        });
        let mut history = OperationHistory::new();
        let err = validator
            .validate("db:dropTable", &args(), &mut history)
            .unwrap_err();
        assert_eq!(err.code(), "OPERATION_BLOCKED");
    }

    #[test]
    fn test_blacklist_applies_when_whitelist_disabled() {
        let validator = validator(ParentValidationConfig {
            validate_operation_names: false,
            allowed_pattern: Some("^db:".into()),
            blocked_patterns: vec!["^admin:".into()],
            block_suspicious_sequences: false,
            ..Default::default()
        });
        let mut history = OperationHistory::new();
        // Whitelist is off, so a non-db operation passes...
        validator.validate("fs:open", &args(), &mut history).unwrap();
        // ...but the blacklist still fires.
        let err = validator
            .validate("admin:reset", &args(), &mut history)
            .unwrap_err();
        assert_eq!(err.code(), "OPERATION_BLOCKED");
    }

    #[test]
    fn test_detector_rejection_carries_id() {
        let validator = validator(ParentValidationConfig::default());
        let mut history = OperationHistory::new();
        validator
            .validate("db:listUsers", &args(), &mut history)
            .unwrap();
        let err = validator
            .validate("http:post", &args(), &mut history)
            .unwrap_err();
        let EngineError::SuspiciousPatternDetected { pattern_id, .. } = &err else {
            panic!("expected detector rejection, got {err:?}");
        };
        assert_eq!(pattern_id, "EXFIL_LIST_SEND");
        // The rejected call was not appended.
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_custom_detectors_run_after_defaults() {
        let validator = validator(ParentValidationConfig {
            suspicious_patterns: vec![DetectorSpec {
                id: "NO_PING".into(),
                description: "ping is suspicious here".into(),
                trigger_pattern: "^net:ping$".into(),
                recent_pattern: None,
                args_pattern: None,
                window_ms: 5_000,
            }],
            ..Default::default()
        });
        let mut history = OperationHistory::new();
        let err = validator
            .validate("net:ping", &args(), &mut history)
            .unwrap_err();
        assert_eq!(err.code(), "SUSPICIOUS_PATTERN_DETECTED");
    }
}
