//! Relay protocol: gate callback contracts, browser notification frames,
//! and the minimal upstream realtime event vocabulary.
//!
//! Workflows report progress through three gates (PREPARING → READY_TO_SEND
//! → COMPLETED); the relay answers each callback with a [`GateDecision`]
//! telling the workflow whether to continue or abort.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle status a workflow reports for a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    /// Gate 1 — workflow announces it is about to start; cancellable.
    Preparing,
    /// Gate 2 — side effect prepared, awaiting final human confirmation.
    ReadyToSend,
    /// Gate 3 — terminal success, result ready to announce.
    Completed,
    /// Terminal: cancelled by the user, a caller, or a timeout.
    Cancelled,
    /// Terminal: workflow reported failure.
    Failed,
}

impl GateStatus {
    /// Parse the wire form (`"PREPARING"`, …). Unknown statuses return `None`
    /// so callers can apply the permissive default.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PREPARING" => Some(Self::Preparing),
            "READY_TO_SEND" => Some(Self::ReadyToSend),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::ReadyToSend => "READY_TO_SEND",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    /// Gate number for gated statuses; terminal cancel/fail have none.
    pub fn gate(&self) -> Option<u8> {
        match self {
            Self::Preparing => Some(1),
            Self::ReadyToSend => Some(2),
            Self::Completed => Some(3),
            Self::Cancelled | Self::Failed => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate callbacks (workflow → relay)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Body of `POST /tool-progress` (and the cancel/confirm endpoints, which
/// use a subset). Either `tool_call_id` or `intent_id` identifies the call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateCallback {
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub intent_id: Option<String>,
    /// Raw status string; unknown values get the permissive response.
    #[serde(default)]
    pub status: Option<String>,
    /// Explicit gate number; derived from `status` when absent.
    #[serde(default)]
    pub gate: Option<u8>,
    #[serde(default)]
    pub cancellable: Option<bool>,
    #[serde(default)]
    pub requires_confirmation: Option<bool>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub voice_response: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl GateCallback {
    /// The effective identifier: `tool_call_id` wins over `intent_id`.
    pub fn id(&self) -> Option<&str> {
        self.tool_call_id
            .as_deref()
            .or(self.intent_id.as_deref())
    }

    pub fn status(&self) -> Option<GateStatus> {
        self.status.as_deref().and_then(GateStatus::parse)
    }

    /// Gate number for idempotency keying: explicit field, else from status.
    pub fn gate_number(&self) -> Option<u8> {
        self.gate.or_else(|| self.status().and_then(|s| s.gate()))
    }
}

/// Response to a gated callback: whether the workflow may continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    #[serde(rename = "continue")]
    pub proceed: bool,
    pub cancel: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GateDecision {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            cancel: false,
            reason: None,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            cancel: true,
            reason: Some(reason.into()),
        }
    }
}

/// Acknowledgement for terminal callbacks (COMPLETED / CANCELLED / FAILED).
#[derive(Debug, Clone, Serialize)]
pub struct GateAck {
    pub received: bool,
    pub status: &'static str,
}

impl GateAck {
    pub fn acknowledged() -> Self {
        Self {
            received: true,
            status: "acknowledged",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Browser notifications (relay → browser)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames the relay injects into the otherwise-transparent browser stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrowserNotice {
    #[serde(rename = "tool_gate")]
    ToolGate {
        tool_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        gate: Option<u8>,
        status: GateStatus,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_response: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        requires_confirmation: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        awaiting_confirmation: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cancellable: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_time_ms: Option<u64>,
    },

    #[serde(rename = "tool_cancel_requested")]
    ToolCancelRequested {
        tool_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "tool_confirmed")]
    ToolConfirmed {
        tool_call_id: String,
        confirmed: bool,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream realtime events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incoming event types the relay intercepts; everything else passes through.
pub mod upstream {
    use serde_json::{json, Value};

    pub const FUNCTION_CALL_DONE: &str = "response.function_call_arguments.done";
    pub const INPUT_TRANSCRIPTION_DONE: &str =
        "conversation.item.input_audio_transcription.completed";
    pub const RESPONSE_TRANSCRIPT_DONE: &str = "response.audio_transcript.done";

    /// `conversation.item.create` carrying a function result back to the model.
    pub fn function_call_output(call_id: &str, output: &Value) -> Value {
        json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output.to_string(),
            }
        })
    }

    /// Plain `response.create` — ask the model to continue.
    pub fn response_create() -> Value {
        json!({ "type": "response.create" })
    }

    /// `response.create` with an instructions override (agent nudge).
    pub fn response_create_with_instructions(instructions: &str) -> Value {
        json!({
            "type": "response.create",
            "response": { "instructions": instructions }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhook responses (workflow → relay, synchronous)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed view of a workflow's synchronous dispatch response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub voice_response: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
