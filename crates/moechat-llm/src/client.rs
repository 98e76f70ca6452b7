//! Upstream inference HTTP client.
//!
//! One shared [`UpstreamClient`] serves every relay session; each call is
//! parameterized by the target model's service URL from the directory.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use moechat_core::message::ChatTurn;

use crate::chunk::{self, ChatCompletion, ChunkEvent};
use crate::error::{UpstreamError, UpstreamResult};
use crate::sse::{self, SseLine};

/// Boxed stream of decoded chunk events from one upstream call.
pub type ChunkEventStream =
    Pin<Box<dyn Stream<Item = Result<ChunkEvent, UpstreamError>> + Send>>;

/// Client construction options.
#[derive(Clone, Debug)]
pub struct UpstreamClientConfig {
    /// TCP/TLS connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for non-streaming calls, in seconds.
    /// Streaming calls are not bounded here; the relay session enforces a
    /// per-chunk idle timeout instead.
    pub request_timeout_secs: u64,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
        }
    }
}

/// An OpenAI-compatible chat-completions request body.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    /// Target model id.
    pub model: String,
    /// Conversation context, oldest first.
    pub messages: Vec<ChatTurn>,
    /// Sampling temperature.
    pub temperature: f64,
    /// Nucleus sampling cutoff.
    pub top_p: f64,
    /// Generation cap, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether to stream chunks.
    pub stream: bool,
}

impl ChatRequest {
    /// Build a request with the backend's default sampling parameters.
    pub fn new(model: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: None,
            stream: false,
        }
    }

    /// Enable streaming.
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// HTTP client for OpenAI-compatible inference services.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    /// Per-request bound for non-streaming calls. Not set on the shared
    /// client builder, where it would also cut off long-lived chunk streams.
    request_timeout: Duration,
}

impl UpstreamClient {
    /// Create a client.
    pub fn new(config: &UpstreamClientConfig) -> UpstreamResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Open a streaming chat-completions call.
    ///
    /// The returned stream yields decoded chunk events in upstream order and
    /// ends after [`ChunkEvent::Done`]; an end-of-body without `[DONE]`
    /// surfaces as [`UpstreamError::Disconnected`].
    pub async fn stream_chat(
        &self,
        service_url: &str,
        request: &ChatRequest,
    ) -> UpstreamResult<ChunkEventStream> {
        let request = ChatRequest {
            stream: true,
            ..request.clone()
        };
        let url = completions_url(service_url);
        debug!(url = %url, model = %request.model, "opening upstream stream");

        let response = self.http.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;

        let lines = sse::parse_sse_lines(response.bytes_stream());
        let events = lines.map(|line| match line {
            Ok(SseLine::Data(data)) => match chunk::parse_chunk(&data) {
                Ok(decoded) => Ok(ChunkEvent::Chunk(decoded)),
                Err(malformed) => Ok(ChunkEvent::Malformed(malformed)),
            },
            Ok(SseLine::Done) => Ok(ChunkEvent::Done),
            Err(e) => Err(e),
        });

        Ok(Box::pin(events))
    }

    /// One-shot (non-streaming) chat-completions call.
    pub async fn chat(
        &self,
        service_url: &str,
        request: &ChatRequest,
    ) -> UpstreamResult<ChatCompletion> {
        let request = ChatRequest {
            stream: false,
            ..request.clone()
        };
        let response = self
            .http
            .post(completions_url(service_url))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json::<ChatCompletion>().await?)
    }

    /// List model ids served at a service URL.
    pub async fn list_models(&self, service_url: &str) -> UpstreamResult<Vec<String>> {
        let url = format!("{}/v1/models", service_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = check_status(response).await?;
        let list = response.json::<ModelList>().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    /// Whether a service answers its model listing probe.
    pub async fn check_health(&self, service_url: &str) -> bool {
        match self.list_models(service_url).await {
            Ok(_) => true,
            Err(e) => {
                debug!(url = %service_url, error = %e, "health probe failed");
                false
            }
        }
    }
}

fn completions_url(service_url: &str) -> String {
    format!("{}/v1/chat/completions", service_url.trim_end_matches('/'))
}

/// Map a non-success response to [`UpstreamError::Api`] with the best
/// available message.
async fn check_status(response: reqwest::Response) -> UpstreamResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.error.map(|e| e.message).or(b.detail))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.to_string()
            } else {
                trimmed.chars().take(200).collect()
            }
        });
    warn!(status = status.as_u16(), message = %message, "upstream returned error");

    Err(UpstreamError::Api {
        status: status.as_u16(),
        message,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
