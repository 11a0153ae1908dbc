//! Host-side tool proxy.
//!
//! The proxy is the last stop before the host's tool handler: it resolves
//! reference handles inside the arguments, invokes the handler, sanitizes
//! whatever comes back, and lifts oversized string results into the sidecar.

use async_trait::async_trait;
use std::sync::Arc;

use super::envelope::{ToolRequest, ToolResponse};
use super::handle::{resolve_references, SidecarStore};
use crate::error::{EngineError, EngineResult};
use crate::sanitize::Sanitizer;
use crate::value::Value;
use warden_core::config::ToolBridgeConfig;

/// The host's tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Executes one named operation. The arguments arrive as a sanitized
    /// JSON record with reference handles already resolved.
    async fn call(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Host-side proxy wrapping the tool handler.
pub struct HostToolProxy {
    handler: Arc<dyn ToolHandler>,
    sidecar: Option<Arc<dyn SidecarStore>>,
    sanitizer: Sanitizer,
    config: ToolBridgeConfig,
}

impl HostToolProxy {
    pub fn new(
        handler: Arc<dyn ToolHandler>,
        sidecar: Option<Arc<dyn SidecarStore>>,
        sanitizer: Sanitizer,
        config: ToolBridgeConfig,
    ) -> Self {
        Self {
            handler,
            sidecar,
            sanitizer,
            config,
        }
    }

    /// Direct-mode entry: structured arguments in, sanitized value out.
    pub async fn invoke(
        &self,
        name: &str,
        mut args: serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        if let Some(sidecar) = &self.sidecar {
            resolve_references(&mut args, sidecar, &self.config).await?;
        }

        tracing::debug!(tool = name, "invoking host tool handler");
        let raw = self
            .handler
            .call(name, args)
            .await
            .map_err(|e| EngineError::tool_failed(name.to_string(), e.to_string()))?;

        let sanitized = self.sanitizer.sanitize(&Value::from_json(&raw))?;
        let mut json = sanitized.to_json()?;

        // Oversized string results are lifted into the sidecar; the guest
        // only ever sees the handle.
        if let (Some(sidecar), serde_json::Value::String(s)) = (&self.sidecar, &json) {
            if s.len() as u64 >= self.config.extraction_threshold_bytes {
                let handle = sidecar.store(s.clone()).await.map_err(|e| {
                    EngineError::bridge_protocol(format!("sidecar store failed: {e}"))
                })?;
                json = serde_json::Value::String(handle);
            }
        }
        Ok(json)
    }

    /// String-mode entry: one JSON envelope in, one JSON envelope out.
    /// Failures travel inside the response envelope; only encoding bugs
    /// surface as errors here.
    pub async fn call_string(&self, payload: &str) -> EngineResult<String> {
        let response = match ToolRequest::decode(payload, self.config.max_payload_bytes) {
            Ok(request) => match self.invoke(&request.tool, request.args).await {
                Ok(value) => ToolResponse::success(value),
                Err(error) => ToolResponse::failure(&error),
            },
            Err(error) => ToolResponse::failure(&error),
        };
        response.encode(self.config.max_payload_bytes)
    }
}
