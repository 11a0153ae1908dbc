//! Reference handles and the sidecar store.
//!
//! Large tool results never enter the guest realm: the host lifts them into
//! the sidecar and hands the guest an opaque handle string instead. Handles
//! are resolved back to their stored values only at the `callTool` argument
//! boundary, after a total-size pre-check.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use warden_core::config::ToolBridgeConfig;
use warden_core::constants::{REFERENCE_HANDLE_MAX_LEN, REFERENCE_HANDLE_MIN_LEN};

static HANDLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^__REF_[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}__$",
    )
    .expect("static pattern")
});

/// Returns true when a string is a well-formed reference handle.
pub fn is_reference_handle(s: &str) -> bool {
    (REFERENCE_HANDLE_MIN_LEN..=REFERENCE_HANDLE_MAX_LEN).contains(&s.len())
        && HANDLE_RE.is_match(s)
}

/// Mints a fresh handle.
pub fn generate_handle() -> String {
    format!("__REF_{}__", Uuid::new_v4())
}

/// External content store for lifted values, keyed by reference handle.
#[async_trait]
pub trait SidecarStore: Send + Sync {
    /// Stores a value and returns its handle.
    async fn store(&self, value: String) -> anyhow::Result<String>;
    /// Fetches a stored value.
    async fn fetch(&self, handle: &str) -> anyhow::Result<Option<String>>;
    /// Returns true when the handle is known.
    async fn contains(&self, handle: &str) -> bool;
}

/// In-memory sidecar, for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct MemorySidecar {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySidecar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SidecarStore for MemorySidecar {
    async fn store(&self, value: String) -> anyhow::Result<String> {
        let handle = generate_handle();
        self.values.write().insert(handle.clone(), value);
        Ok(handle)
    }

    async fn fetch(&self, handle: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.read().get(handle).cloned())
    }

    async fn contains(&self, handle: &str) -> bool {
        self.values.read().contains_key(handle)
    }
}

/// Resolves reference handles inside tool-call arguments.
///
/// The walk first collects every handle (and, when composites are enabled,
/// every composite object), sums the resolved sizes, and only substitutes
/// when the total stays under the inbound cap.
pub async fn resolve_references(
    args: &mut serde_json::Value,
    sidecar: &Arc<dyn SidecarStore>,
    config: &ToolBridgeConfig,
) -> EngineResult<()> {
    let mut handles = Vec::new();
    collect_handles(args, config.allow_composites, &mut handles);
    if handles.is_empty() {
        return Ok(());
    }

    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut total: u64 = 0;
    for handle in &handles {
        if resolved.contains_key(handle) {
            continue;
        }
        let value = sidecar
            .fetch(handle)
            .await
            .map_err(|e| EngineError::bridge_protocol(format!("sidecar fetch failed: {e}")))?
            .ok_or_else(|| {
                EngineError::bridge_protocol(format!("unknown reference handle {handle}"))
            })?;
        total = total.saturating_add(value.len() as u64);
        if total > config.max_inbound_reference_bytes {
            return Err(EngineError::ReferenceSizeExceeded {
                resolved: total,
                limit: config.max_inbound_reference_bytes,
            });
        }
        resolved.insert(handle.clone(), value);
    }

    substitute(args, config.allow_composites, &resolved);
    Ok(())
}

fn collect_handles(value: &serde_json::Value, allow_composites: bool, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if is_reference_handle(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_handles(item, allow_composites, out);
            }
        }
        serde_json::Value::Object(map) => {
            if allow_composites && map.get("kind").and_then(|k| k.as_str()) == Some("composite") {
                if let Some(serde_json::Value::Array(parts)) = map.get("parts") {
                    for part in parts {
                        collect_handles(part, allow_composites, out);
                    }
                    return;
                }
            }
            for item in map.values() {
                collect_handles(item, allow_composites, out);
            }
        }
        _ => {}
    }
}

fn substitute(
    value: &mut serde_json::Value,
    allow_composites: bool,
    resolved: &HashMap<String, String>,
) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(stored) = resolved.get(s.as_str()) {
                *value = serde_json::Value::String(stored.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute(item, allow_composites, resolved);
            }
        }
        serde_json::Value::Object(map) => {
            if allow_composites && map.get("kind").and_then(|k| k.as_str()) == Some("composite") {
                if let Some(joined) = join_composite(map, resolved) {
                    *value = serde_json::Value::String(joined);
                    return;
                }
            }
            for item in map.values_mut() {
                substitute(item, allow_composites, resolved);
            }
        }
        _ => {}
    }
}

/// Joins a composite object's parts into one string, substituting resolved
/// handles along the way.
fn join_composite(
    map: &serde_json::Map<String, serde_json::Value>,
    resolved: &HashMap<String, String>,
) -> Option<String> {
    let parts = map.get("parts")?.as_array()?;
    let mut joined = String::new();
    for part in parts {
        match part {
            serde_json::Value::String(s) => match resolved.get(s.as_str()) {
                Some(stored) => joined.push_str(stored),
                None => joined.push_str(s),
            },
            serde_json::Value::Object(inner)
                if inner.get("kind").and_then(|k| k.as_str()) == Some("composite") =>
            {
                joined.push_str(&join_composite(inner, resolved)?);
            }
            other => joined.push_str(&other.to_string()),
        }
    }
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_syntax() {
        let handle = generate_handle();
        assert!(is_reference_handle(&handle));
        assert!(is_reference_handle(
            "__REF_A1B2C3D4-E5F6-7890-ABCD-EF0123456789__"
        ));
        assert!(!is_reference_handle("__REF_not-a-uuid__"));
        assert!(!is_reference_handle("plain string"));
        assert!(!is_reference_handle(
            "x__REF_a1b2c3d4-e5f6-7890-abcd-ef0123456789__"
        ));
    }

    #[tokio::test]
    async fn test_memory_sidecar_round_trip() {
        let sidecar = MemorySidecar::new();
        let handle = sidecar.store("payload".to_string()).await.unwrap();
        assert!(sidecar.contains(&handle).await);
        assert_eq!(
            sidecar.fetch(&handle).await.unwrap(),
            Some("payload".to_string())
        );
        assert_eq!(sidecar.fetch("__REF_missing__").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolution_substitutes_in_place() {
        let sidecar = MemorySidecar::new();
        let handle = sidecar.store("secret payload".to_string()).await.unwrap();
        let store: Arc<dyn SidecarStore> = sidecar;
        let mut args = serde_json::json!({ "body": handle, "keep": "as-is" });
        resolve_references(&mut args, &store, &ToolBridgeConfig::default())
            .await
            .unwrap();
        assert_eq!(args["body"], "secret payload");
        assert_eq!(args["keep"], "as-is");
    }

    #[tokio::test]
    async fn test_resolution_size_precheck() {
        let sidecar = MemorySidecar::new();
        let handle = sidecar.store("x".repeat(2_000)).await.unwrap();
        let store: Arc<dyn SidecarStore> = sidecar;
        let config = ToolBridgeConfig {
            max_inbound_reference_bytes: 1_000,
            ..Default::default()
        };
        let mut args = serde_json::json!({ "body": handle.clone() });
        let err = resolve_references(&mut args, &store, &config)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REFERENCE_SIZE_EXCEEDED");
        // Nothing was substituted.
        assert_eq!(args["body"], handle);
    }

    #[tokio::test]
    async fn test_unknown_handle_is_a_protocol_error() {
        let store: Arc<dyn SidecarStore> = MemorySidecar::new();
        let mut args =
            serde_json::json!({ "body": "__REF_a1b2c3d4-e5f6-7890-abcd-ef0123456789__" });
        let err = resolve_references(&mut args, &store, &ToolBridgeConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BRIDGE_PROTOCOL_ERROR");
    }

    #[tokio::test]
    async fn test_composite_resolution_when_enabled() {
        let sidecar = MemorySidecar::new();
        let handle = sidecar.store("BULK".to_string()).await.unwrap();
        let store: Arc<dyn SidecarStore> = sidecar;
        let config = ToolBridgeConfig {
            allow_composites: true,
            ..Default::default()
        };
        let mut args = serde_json::json!({
            "payload": {
                "kind": "composite",
                "op": "concat",
                "parts": [handle, "-suffix"],
            }
        });
        resolve_references(&mut args, &store, &config).await.unwrap();
        assert_eq!(args["payload"], "BULK-suffix");
    }
}
