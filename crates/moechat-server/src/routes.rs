//! HTTP handlers for the relay surface.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use moechat_core::message::{ChatTurn, MessageRole, MessageStatus};
use moechat_core::model::ModelRecord;
use moechat_llm::splitter::ThinkingSplitter;
use moechat_llm::{ChatRequest, ChunkEventStream, UpstreamError};

use crate::error::{RelayError, RelayResult};
use crate::health;
use crate::metrics::{
    RELAY_REJECTIONS_TOTAL, RELAY_REQUESTS_TOTAL, RELAY_SESSIONS_ACTIVE,
};
use crate::relay::session::{run_session, SessionContext};
use crate::server::AppState;

/// Turns of history included in each upstream request.
const CONTEXT_TURNS: usize = 20;

/// Client request body for both message endpoints.
#[derive(Clone, Debug, Deserialize)]
pub struct SendMessageRequest {
    /// User message text.
    pub content: String,
    /// Target model; the configured default when omitted.
    pub model_id: Option<String>,
    /// Attachment ids. Accepted for wire compatibility; file handling is
    /// performed by the CRUD layer, not the relay.
    #[serde(default)]
    pub file_ids: Vec<String>,
}

/// Response body of the non-streaming message endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct MessageResponse {
    /// Persisted assistant message id.
    pub id: Uuid,
    /// Chat the message belongs to.
    pub chat_id: Uuid,
    /// Always `"assistant"`.
    pub role: MessageRole,
    /// Answer text.
    pub content: String,
    /// Separated reasoning text, if the model produced any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Model that answered.
    pub model_id: String,
    /// Persisted status.
    pub status: MessageStatus,
    /// Position within the chat.
    pub position: u32,
}

/// Everything resolved during session opening.
struct Opened {
    ctx: SessionContext,
    upstream: ChunkEventStream,
}

/// Resolve the model, persist the user message, and open the upstream
/// stream. Every failure here is pre-stream and maps to a plain HTTP error.
async fn open_session(
    state: &AppState,
    chat_id: Uuid,
    body: &SendMessageRequest,
) -> RelayResult<Opened> {
    let model = resolve_model(state, body.model_id.as_deref()).await?;
    let request = build_request(state, chat_id, &model, &body.content).await?;
    let user_position = state.store.next_position(chat_id).await?;
    let _ = state
        .store
        .save_message(
            chat_id,
            MessageRole::User,
            &body.content,
            MessageStatus::Completed,
            None,
            user_position,
        )
        .await?;

    let upstream = state
        .upstream
        .stream_chat(&model.service_url, &request)
        .await
        .map_err(|e| map_open_error(e, &model.id))?;

    Ok(Opened {
        ctx: SessionContext {
            request_id: Uuid::new_v4().to_string(),
            chat_id,
            model,
            position: user_position + 1,
            chunk_idle_timeout: Duration::from_secs(state.config.chunk_idle_timeout_secs),
        },
        upstream,
    })
}

async fn resolve_model(state: &AppState, model_id: Option<&str>) -> RelayResult<ModelRecord> {
    let model_id = model_id.unwrap_or(&state.config.default_model);
    let Some(record) = state.directory.get_model(model_id).await else {
        counter!(RELAY_REJECTIONS_TOTAL, "reason" => "not_found").increment(1);
        return Err(RelayError::ModelNotFound {
            model_id: model_id.to_string(),
        });
    };
    if !record.is_active {
        counter!(RELAY_REJECTIONS_TOTAL, "reason" => "inactive").increment(1);
        return Err(RelayError::ModelUnavailable {
            model_id: model_id.to_string(),
        });
    }
    Ok(record)
}

async fn build_request(
    state: &AppState,
    chat_id: Uuid,
    model: &ModelRecord,
    content: &str,
) -> RelayResult<ChatRequest> {
    let mut turns = state.store.recent_turns(chat_id, CONTEXT_TURNS).await?;
    turns.push(ChatTurn::user(content));
    Ok(ChatRequest::new(model.id.clone(), turns))
}

/// Connection-level failures at opening mean the service is unreachable,
/// which the taxonomy treats the same as an inactive model.
fn map_open_error(error: UpstreamError, model_id: &str) -> RelayError {
    match &error {
        UpstreamError::Http(e) if e.is_connect() || e.is_timeout() => {
            counter!(RELAY_REJECTIONS_TOTAL, "reason" => "unreachable").increment(1);
            RelayError::ModelUnavailable {
                model_id: model_id.to_string(),
            }
        }
        _ => RelayError::Upstream(error),
    }
}

/// `POST /api/v1/chats/{chat_id}/messages/stream`
pub async fn stream_message(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> RelayResult<Response> {
    if !body.file_ids.is_empty() {
        debug!(count = body.file_ids.len(), "ignoring file attachments");
    }
    let opened = open_session(&state, chat_id, &body).await?;
    counter!(RELAY_REQUESTS_TOTAL, "model" => opened.ctx.model.id.clone()).increment(1);

    let (tx, rx) = mpsc::channel::<String>(state.config.frame_buffer);
    let session_state = state.clone();
    let _ = session_state.active_sessions.fetch_add(1, Ordering::Relaxed);
    gauge!(RELAY_SESSIONS_ACTIVE).increment(1.0);

    let _session = tokio::spawn(async move {
        let outcome = run_session(
            opened.ctx,
            opened.upstream,
            tx,
            session_state.store.as_ref(),
            &session_state.telemetry,
        )
        .await;
        let _ = session_state.active_sessions.fetch_sub(1, Ordering::Relaxed);
        gauge!(RELAY_SESSIONS_ACTIVE).decrement(1.0);
        if outcome.message_id.is_none() {
            warn!("session ended without a persisted message id");
        }
    });

    let frames = ReceiverStream::new(rx).map(|frame| Ok::<_, std::convert::Infallible>(Bytes::from(frame)));
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(frames))
        .map_err(|e| RelayError::Persistence {
            message: format!("failed to build response: {e}"),
        })?;
    Ok(response)
}

/// `POST /api/v1/chats/{chat_id}/messages` — non-streaming variant.
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> RelayResult<Json<MessageResponse>> {
    let model = resolve_model(&state, body.model_id.as_deref()).await?;
    let request = build_request(&state, chat_id, &model, &body.content).await?;
    let user_position = state.store.next_position(chat_id).await?;
    let _ = state
        .store
        .save_message(
            chat_id,
            MessageRole::User,
            &body.content,
            MessageStatus::Completed,
            None,
            user_position,
        )
        .await?;
    let position = user_position + 1;

    let completion = match state.upstream.chat(&model.service_url, &request).await {
        Ok(completion) => completion,
        Err(e) => {
            // Mirror the streaming abort path: the failure is still visible
            // in history as an errored assistant message.
            let _ = state
                .store
                .save_message(
                    chat_id,
                    MessageRole::Assistant,
                    "",
                    MessageStatus::Error,
                    Some(&model.id),
                    position,
                )
                .await;
            return Err(map_open_error(e, &model.id));
        }
    };

    let (thinking, answer) = split_completed(
        completion.content(),
        completion.reasoning_content(),
        model.splitter_marker(),
    );

    if let Some(info) = &completion.expert_info {
        let request_id = Uuid::new_v4().to_string();
        let samples = moechat_llm::experts::extract_samples(&request_id, &model.id, info);
        state
            .telemetry
            .try_publish(moechat_core::telemetry::ActivationBatch { samples });
    }

    let id = state
        .store
        .save_message(
            chat_id,
            MessageRole::Assistant,
            &answer,
            MessageStatus::Completed,
            Some(&model.id),
            position,
        )
        .await?;

    Ok(Json(MessageResponse {
        id,
        chat_id,
        role: MessageRole::Assistant,
        content: answer,
        thinking: (!thinking.is_empty()).then_some(thinking),
        model_id: model.id,
        status: MessageStatus::Completed,
        position,
    }))
}

/// Separate reasoning from answer in a completed (non-streaming) response.
///
/// Backends that separate reasoning themselves win; otherwise the marker
/// embedded in `content` is split out with the same state machine the
/// streaming path uses.
fn split_completed(
    content: &str,
    reasoning: Option<&str>,
    marker: Option<&str>,
) -> (String, String) {
    if let Some(reasoning) = reasoning {
        return (reasoning.to_string(), content.to_string());
    }
    let mut splitter = ThinkingSplitter::new(marker);
    let mut out = splitter.push(content);
    let flush = splitter.finish();
    out.thinking.push_str(&flush.thinking);
    out.answer.push_str(&flush.answer);
    if splitter.marker_seen() {
        (out.thinking, out.answer)
    } else {
        // No marker in the payload: the whole body is the answer.
        (String::new(), content.to_string())
    }
}

/// `GET /api/v1/models`
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelRecord>> {
    Json(state.directory.list_models().await)
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Json<health::HealthResponse> {
    let active_models = state
        .directory
        .list_models()
        .await
        .iter()
        .filter(|m| m.is_active)
        .count();
    let sessions = state.active_sessions.load(Ordering::Relaxed);
    Json(health::health_check(state.start_time, sessions, active_models))
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    crate::metrics::render(&state.metrics_handle)
}
