//! The tool-call envelope protocol (version 1).
//!
//! In string mode both directions of a tool call cross the realm boundary
//! only as JSON text. Requests are `{ v: 1, tool, args }`; responses are
//! `{ v: 1, ok: true, value }` or `{ v: 1, ok: false, error }`. Anything
//! truncated, oversized or malformed is a protocol error: the engine never
//! relies on the JSON parser to protect itself, so sizes are capped before
//! parsing.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Protocol version spoken by both sides.
pub const ENVELOPE_VERSION: u8 = 1;

/// A guest-originated tool request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub v: u8,
    pub tool: String,
    pub args: serde_json::Value,
}

/// The error body of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorBody {
    pub name: String,
    pub message: String,
}

/// A host response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub v: u8,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorBody>,
}

impl ToolRequest {
    pub fn new(tool: String, args: serde_json::Value) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            tool,
            args,
        }
    }

    /// Serializes the request, enforcing the payload cap on the UTF-8 size.
    pub fn encode(&self, max_payload_bytes: u64) -> EngineResult<String> {
        let encoded = serde_json::to_string(self)
            .map_err(|e| EngineError::bridge_protocol(format!("request encoding failed: {e}")))?;
        if encoded.len() as u64 > max_payload_bytes {
            return Err(EngineError::bridge_protocol(format!(
                "request payload {} bytes exceeds cap {max_payload_bytes}",
                encoded.len()
            )));
        }
        Ok(encoded)
    }

    /// Parses and verifies a request on the host side.
    pub fn decode(payload: &str, max_payload_bytes: u64) -> EngineResult<Self> {
        if payload.len() as u64 > max_payload_bytes {
            return Err(EngineError::bridge_protocol(format!(
                "request payload {} bytes exceeds cap {max_payload_bytes}",
                payload.len()
            )));
        }
        let request: ToolRequest = serde_json::from_str(payload)
            .map_err(|e| EngineError::bridge_protocol(format!("malformed request: {e}")))?;
        if request.v != ENVELOPE_VERSION {
            return Err(EngineError::bridge_protocol(format!(
                "unsupported envelope version {}",
                request.v
            )));
        }
        if request.tool.is_empty() {
            return Err(EngineError::bridge_protocol("request without a tool name"));
        }
        if !request.args.is_object() {
            return Err(EngineError::bridge_protocol("request args must be a record"));
        }
        Ok(request)
    }
}

impl ToolResponse {
    pub fn success(value: serde_json::Value) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    /// Builds a failure response from an engine error. The error's stable
    /// code travels as the name so the inner side can rebuild the variant.
    pub fn failure(error: &EngineError) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            ok: false,
            value: None,
            error: Some(ToolErrorBody {
                name: error.code().to_string(),
                message: error.to_string(),
            }),
        }
    }

    /// Serializes the response, enforcing the payload cap.
    pub fn encode(&self, max_payload_bytes: u64) -> EngineResult<String> {
        let encoded = serde_json::to_string(self)
            .map_err(|e| EngineError::bridge_protocol(format!("response encoding failed: {e}")))?;
        if encoded.len() as u64 > max_payload_bytes {
            return Err(EngineError::bridge_protocol(format!(
                "response payload {} bytes exceeds cap {max_payload_bytes}",
                encoded.len()
            )));
        }
        Ok(encoded)
    }

    /// Parses and verifies a response on the inner side, yielding the value
    /// or the rebuilt error.
    pub fn decode(payload: &str, max_payload_bytes: u64) -> EngineResult<serde_json::Value> {
        if payload.len() as u64 > max_payload_bytes {
            return Err(EngineError::bridge_protocol(format!(
                "response payload {} bytes exceeds cap {max_payload_bytes}",
                payload.len()
            )));
        }
        let response: ToolResponse = serde_json::from_str(payload)
            .map_err(|e| EngineError::bridge_protocol(format!("malformed response: {e}")))?;
        if response.v != ENVELOPE_VERSION {
            return Err(EngineError::bridge_protocol(format!(
                "unsupported envelope version {}",
                response.v
            )));
        }
        if response.ok {
            Ok(response.value.unwrap_or(serde_json::Value::Null))
        } else {
            let body = response.error.ok_or_else(|| {
                EngineError::bridge_protocol("failure response without an error body")
            })?;
            Err(EngineError::from_code(&body.name, &body.message))
        }
    }
}
