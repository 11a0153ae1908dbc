//! The metered guest console.
//!
//! Console output is captured for the host and echoed to the tracing layer.
//! Both the number of calls and the total output bytes are capped; crossing
//! either cap fails the write.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::builtins::{NativeFn, NativeId};
use crate::error::{ConsoleLimitKind, EngineError, EngineResult};
use crate::value::Value;

/// Console severity, matching the four guest-facing methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Error,
    Warn,
    Info,
}

/// One captured console line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
}

/// Call- and byte-capped console buffer.
#[derive(Debug)]
pub struct ConsoleMeter {
    max_calls: u64,
    max_output_bytes: u64,
    calls: u64,
    output_bytes: u64,
    entries: Vec<ConsoleEntry>,
}

impl ConsoleMeter {
    pub fn new(max_calls: u64, max_output_bytes: u64) -> Self {
        Self {
            max_calls,
            max_output_bytes,
            calls: 0,
            output_bytes: 0,
            entries: Vec::new(),
        }
    }

    /// Records one console call.
    pub fn write(&mut self, level: ConsoleLevel, message: String) -> EngineResult<()> {
        self.calls += 1;
        if self.calls > self.max_calls {
            return Err(EngineError::ConsoleLimitExceeded {
                kind: ConsoleLimitKind::Calls,
            });
        }
        self.output_bytes += message.len() as u64;
        if self.output_bytes > self.max_output_bytes {
            return Err(EngineError::ConsoleLimitExceeded {
                kind: ConsoleLimitKind::Bytes,
            });
        }
        tracing::debug!(level = ?level, "{message}");
        self.entries.push(ConsoleEntry { level, message });
        Ok(())
    }

    /// Drains the captured lines for the execution result.
    pub fn take_entries(&mut self) -> Vec<ConsoleEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// Formats console arguments the way the guest expects: display strings,
/// space-joined, with compound values JSON-ish.
pub fn format_args(args: &[Value]) -> String {
    args.iter()
        .map(|v| match v.unguard() {
            Value::Object(_) | Value::Array(_) => super::builtins::json::stringify(v, None)
                .map(|s| s.to_display_string())
                .unwrap_or_else(|_| v.to_display_string()),
            other => other.to_display_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the `console` namespace object.
pub fn namespace() -> Value {
    let mut entries = IndexMap::new();
    for (name, id) in [
        ("log", NativeId::ConsoleLog),
        ("error", NativeId::ConsoleError),
        ("warn", NativeId::ConsoleWarn),
        ("info", NativeId::ConsoleInfo),
    ] {
        entries.insert(name.to_string(), Value::Native(NativeFn::new(name, id)));
    }
    Value::object(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_cap() {
        let mut meter = ConsoleMeter::new(2, 1_000);
        meter.write(ConsoleLevel::Log, "one".into()).unwrap();
        meter.write(ConsoleLevel::Log, "two".into()).unwrap();
        let err = meter.write(ConsoleLevel::Log, "three".into()).unwrap_err();
        assert_eq!(err.code(), "CONSOLE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_byte_cap() {
        let mut meter = ConsoleMeter::new(100, 10);
        meter.write(ConsoleLevel::Info, "12345".into()).unwrap();
        let err = meter
            .write(ConsoleLevel::Info, "678901".into())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConsoleLimitExceeded {
                kind: ConsoleLimitKind::Bytes
            }
        ));
    }

    #[test]
    fn test_entries_are_captured_in_order() {
        let mut meter = ConsoleMeter::new(10, 1_000);
        meter.write(ConsoleLevel::Warn, "first".into()).unwrap();
        meter.write(ConsoleLevel::Log, "second".into()).unwrap();
        let entries = meter.take_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, ConsoleLevel::Warn);
        assert_eq!(entries[1].message, "second");
        assert!(meter.take_entries().is_empty());
    }

    #[test]
    fn test_format_args_joins_and_serializes() {
        let mut map = indexmap::IndexMap::new();
        map.insert("a".to_string(), Value::Number(1.0));
        let line = format_args(&[Value::str("result:"), Value::object(map)]);
        assert_eq!(line, "result: {\"a\":1}");
    }
}
