//! Tool descriptors and call outcomes.
//!
//! Workers advertise their tools as [`ToolDescriptor`]s; tool calls
//! resolve to a [`ToolCallOutcome`] carrying a content list. Content
//! kinds the supervisor does not know about pass through unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::HubError;

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// A tool advertised by a worker (or by the hub itself).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name (unique within its worker).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object"})
}

impl ToolDescriptor {
    /// Create a descriptor with an object schema built from properties.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: schema,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Content blocks
// ─────────────────────────────────────────────────────────────────────────────

/// Content kinds the supervisor understands natively.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KnownContent {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type (e.g. `image/png`).
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Base64-encoded audio.
    Audio {
        /// Base64 payload.
        data: String,
        /// MIME type (e.g. `audio/wav`).
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// One element of a tool result content list.
///
/// Unknown kinds deserialize into [`ToolContent::Other`] and serialize
/// back byte-for-byte, so workers can extend the protocol without the
/// supervisor mangling their payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolContent {
    /// A kind the supervisor understands.
    Known(KnownContent),
    /// Anything else, passed through unchanged.
    Other(Value),
}

impl ToolContent {
    /// Create a text content block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Known(KnownContent::Text { text: text.into() })
    }

    /// The text if this is a text block, `None` otherwise.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Known(KnownContent::Text { text }) => Some(text),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutcome {
    /// The content list produced by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the call failed. Errors travel inside the result.
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolCallOutcome {
    /// A successful text outcome.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    /// A successful outcome carrying a JSON payload rendered as text.
    #[must_use]
    pub fn json(value: &Value) -> Self {
        Self::text(serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
    }

    /// An error outcome with a plain-text message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(message)],
            is_error: true,
        }
    }

    /// Concatenated text of every text block.
    #[must_use]
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ToolContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<HubError> for ToolCallOutcome {
    fn from(err: HubError) -> Self {
        Self::error(format!("[{}] {err}", err.code()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
