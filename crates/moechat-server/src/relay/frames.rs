//! Client-facing SSE frame construction.
//!
//! Every event is `data: <json>\n\n` carrying a `chat.completion.chunk`
//! object; the stream always ends with one terminal frame (non-null
//! `finish_reason`) followed by the literal `data: [DONE]`.

use chrono::Utc;
use moechat_llm::FinishReason;
use serde::Serialize;
use uuid::Uuid;

/// The literal terminal sentinel event.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Serialize)]
struct ClientDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClientChoice {
    index: u32,
    delta: ClientDelta,
    /// Always serialized as `null`; the relay never forwards logprobs.
    logprobs: Option<()>,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorInfo {
    message: String,
    #[serde(rename = "type")]
    error_type: &'static str,
    code: u16,
}

#[derive(Debug, Serialize)]
struct ClientChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ClientChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

/// Per-session frame factory: one completion id and creation timestamp
/// shared by every frame of the stream.
#[derive(Clone, Debug)]
pub struct FrameContext {
    completion_id: String,
    model: String,
    created: i64,
}

impl FrameContext {
    /// New context with a fresh completion id.
    pub fn new(model: impl Into<String>) -> Self {
        let created = Utc::now().timestamp();
        Self {
            completion_id: completion_id(created),
            model: model.into(),
            created,
        }
    }

    /// The completion id stamped on every frame.
    pub fn completion_id(&self) -> &str {
        &self.completion_id
    }

    /// Stream-opening frame carrying `delta.role = "assistant"`.
    pub fn role_frame(&self) -> String {
        self.render(
            ClientDelta {
                role: Some("assistant"),
                content: None,
            },
            None,
            None,
        )
    }

    /// Answer-text delta frame.
    pub fn content_frame(&self, text: &str) -> String {
        self.render(
            ClientDelta {
                role: None,
                content: Some(text.to_string()),
            },
            None,
            None,
        )
    }

    /// Terminal frame for a normally finished stream.
    pub fn finish_frame(&self, reason: FinishReason) -> String {
        self.render(
            ClientDelta {
                role: None,
                content: None,
            },
            Some(reason.as_str()),
            None,
        )
    }

    /// Terminal frame for an aborted or failed stream.
    pub fn error_frame(&self, message: &str) -> String {
        self.render(
            ClientDelta {
                role: None,
                content: None,
            },
            Some("error"),
            Some(ErrorInfo {
                message: message.to_string(),
                error_type: "generation_failed",
                code: 500,
            }),
        )
    }

    fn render(
        &self,
        delta: ClientDelta,
        finish_reason: Option<&'static str>,
        error: Option<ErrorInfo>,
    ) -> String {
        let chunk = ClientChunk {
            id: self.completion_id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ClientChoice {
                index: 0,
                delta,
                logprobs: None,
                finish_reason,
            }],
            error,
        };
        let json = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".into());
        format!("data: {json}\n\n")
    }
}

/// `chatcmpl-<unix ts><8 hex>` completion id.
fn completion_id(created: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{created}{}", &suffix[..8])
}
