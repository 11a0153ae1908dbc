//! Configuration-time errors.
//!
//! These are raised before an execution starts and are distinct from the
//! engine's runtime taxonomy: a bad config is the host's bug, not the
//! guest's.

use thiserror::Error;

/// Errors produced while validating or compiling configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A regular expression in the policy config failed to compile.
    #[error("Invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A user detector carried code-shaped text in one of its fields.
    #[error("Detector `{id}` rejected: contains dangerous substring `{needle}`")]
    DangerousDetector { id: String, needle: String },

    /// A user detector is structurally invalid.
    #[error("Detector `{id}` rejected: {reason}")]
    InvalidDetector { id: String, reason: String },
}

impl ConfigError {
    /// Create a new invalid pattern error
    pub fn invalid_pattern<S1: Into<String>, S2: Into<String>>(pattern: S1, reason: S2) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a new dangerous detector error
    pub fn dangerous_detector<S1: Into<String>, S2: Into<String>>(id: S1, needle: S2) -> Self {
        Self::DangerousDetector {
            id: id.into(),
            needle: needle.into(),
        }
    }

    /// Create a new invalid detector error
    pub fn invalid_detector<S1: Into<String>, S2: Into<String>>(id: S1, reason: S2) -> Self {
        Self::InvalidDetector {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::invalid_pattern("(", "unclosed group");
        assert_eq!(err.to_string(), "Invalid pattern `(`: unclosed group");
    }
}
