//! Per-request relay session.
//!
//! One session bridges one upstream chunk stream and one client SSE stream:
//! `Opening → Streaming → Finalizing → Closed`, with `Aborted` reachable
//! from `Streaming` on upstream failure, idle timeout, or client
//! disconnect. Opening (directory lookup, upstream call) happens in the
//! route handler because its failures must surface as plain HTTP responses;
//! [`run_session`] drives everything after the upstream stream exists.
//!
//! Whatever way the session ends past opening, exactly one message is
//! persisted and (client permitting) exactly one terminal frame plus
//! `[DONE]` is emitted.

use std::time::Duration;

use futures::Stream;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use moechat_core::message::{MessageRole, MessageStatus};
use moechat_core::model::ModelRecord;
use moechat_core::telemetry::ActivationBatch;
use moechat_llm::chunk::{ChatCompletionChunk, ChunkEvent, FinishReason};
use moechat_llm::experts;
use moechat_llm::splitter::ThinkingSplitter;
use moechat_llm::UpstreamError;

use crate::metrics::{
    RELAY_ABORTS_TOTAL, RELAY_CHUNKS_TOTAL, RELAY_MALFORMED_CHUNKS_TOTAL,
};
use crate::persistence::MessageStore;
use crate::relay::frames::{FrameContext, DONE_FRAME};
use crate::telemetry::TelemetryPublisher;

/// Consecutive undecodable payloads tolerated before the stream is declared
/// broken.
const MAX_CONSECUTIVE_MALFORMED: u32 = 3;

/// Immutable inputs of one session.
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// Correlation id for logs and telemetry.
    pub request_id: String,
    /// Chat the assistant message belongs to.
    pub chat_id: Uuid,
    /// Directory record resolved at opening.
    pub model: ModelRecord,
    /// Position the assistant message takes in the chat.
    pub position: u32,
    /// Abort when no upstream chunk arrives within this window.
    pub chunk_idle_timeout: Duration,
}

/// What a finished session produced.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Persisted message id, `None` when the store write failed.
    pub message_id: Option<Uuid>,
    /// Status the message was persisted with.
    pub status: MessageStatus,
    /// Assembled answer text.
    pub answer: String,
    /// Assembled thinking text. Never persisted, never sent to the client.
    pub thinking: String,
    /// Whether the session aborted (upstream failure, timeout, or client
    /// disconnect) rather than finalizing normally.
    pub aborted: bool,
}

/// How the streaming phase ended.
#[derive(Debug)]
enum Ending {
    /// Upstream delivered a terminal chunk (or `[DONE]`).
    Finished(FinishReason),
    /// Upstream failed mid-stream.
    UpstreamFailed(UpstreamError),
    /// The client-side frame channel closed.
    ClientGone,
}

/// Drive one session from first upstream chunk to close.
///
/// `frames` receives fully rendered SSE frame strings in chunk-arrival
/// order; the route layer writes them to the response body verbatim. The
/// sender side of `frames` closing is how client disconnect is detected.
pub async fn run_session<S>(
    ctx: SessionContext,
    mut upstream: S,
    frames: mpsc::Sender<String>,
    store: &dyn MessageStore,
    telemetry: &TelemetryPublisher,
) -> SessionOutcome
where
    S: Stream<Item = Result<ChunkEvent, UpstreamError>> + Unpin + Send,
{
    let frame_ctx = FrameContext::new(&ctx.model.id);
    let mut splitter = ThinkingSplitter::new(ctx.model.splitter_marker());
    let mut answer = String::new();
    let mut thinking = String::new();
    let mut sequence_index: u64 = 0;
    let mut consecutive_malformed: u32 = 0;

    debug!(
        request_id = %ctx.request_id,
        model = %ctx.model.id,
        "session streaming"
    );

    let mut client_open = frames.send(frame_ctx.role_frame()).await.is_ok();

    // ── Streaming ────────────────────────────────────────────────────────
    let ending = loop {
        // A dropped receiver must be noticed even while no frames are being
        // written (thinking preamble, empty deltas); a failed send alone
        // would leave upstream streaming into the void.
        if frames.is_closed() {
            client_open = false;
        }
        if !client_open {
            break Ending::ClientGone;
        }

        let event = match timeout(ctx.chunk_idle_timeout, upstream.next()).await {
            Err(_) => {
                break Ending::UpstreamFailed(UpstreamError::Timeout {
                    elapsed_secs: ctx.chunk_idle_timeout.as_secs(),
                });
            }
            Ok(None) => break Ending::UpstreamFailed(UpstreamError::Disconnected),
            Ok(Some(Err(e))) => break Ending::UpstreamFailed(e),
            Ok(Some(Ok(event))) => event,
        };

        match event {
            ChunkEvent::Done => {
                // Upstream skipped the terminal finish_reason chunk.
                break Ending::Finished(FinishReason::Stop);
            }
            ChunkEvent::Malformed(bad) => {
                consecutive_malformed += 1;
                counter!(RELAY_MALFORMED_CHUNKS_TOTAL).increment(1);
                warn!(
                    request_id = %ctx.request_id,
                    count = consecutive_malformed,
                    error = %bad,
                    "skipping malformed chunk"
                );
                if consecutive_malformed >= MAX_CONSECUTIVE_MALFORMED {
                    break Ending::UpstreamFailed(UpstreamError::Protocol {
                        message: format!(
                            "{MAX_CONSECUTIVE_MALFORMED} consecutive malformed chunks"
                        ),
                    });
                }
            }
            ChunkEvent::Chunk(chunk) => {
                consecutive_malformed = 0;
                sequence_index += 1;
                counter!(RELAY_CHUNKS_TOTAL).increment(1);

                publish_expert_info(&ctx, &chunk, telemetry);

                if let Some(fragment) = chunk.content_delta() {
                    let out = splitter.push(fragment);
                    thinking.push_str(&out.thinking);
                    if !out.answer.is_empty() {
                        answer.push_str(&out.answer);
                        if frames.send(frame_ctx.content_frame(&out.answer)).await.is_err() {
                            client_open = false;
                            break Ending::ClientGone;
                        }
                    }
                }

                if let Some(reason) = chunk.finish_reason() {
                    break Ending::Finished(reason);
                }
            }
        }
    };

    // ── Finalizing / Aborted ─────────────────────────────────────────────
    // An unresolved partial-marker suffix was not a marker after all.
    let flush = splitter.finish();
    thinking.push_str(&flush.thinking);
    if !flush.answer.is_empty() {
        answer.push_str(&flush.answer);
        if client_open && matches!(ending, Ending::Finished(_)) {
            client_open = frames.send(frame_ctx.content_frame(&flush.answer)).await.is_ok();
        }
    }

    let (status, aborted) = match &ending {
        Ending::Finished(FinishReason::Error) => (MessageStatus::Error, false),
        Ending::Finished(_) => (MessageStatus::Completed, false),
        Ending::UpstreamFailed(_) | Ending::ClientGone => (MessageStatus::Error, true),
    };
    if aborted {
        counter!(RELAY_ABORTS_TOTAL).increment(1);
    }

    // Exactly one persistence call per session, on every path.
    let message_id = match store
        .save_message(
            ctx.chat_id,
            MessageRole::Assistant,
            &answer,
            status,
            Some(&ctx.model.id),
            ctx.position,
        )
        .await
    {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(request_id = %ctx.request_id, error = %e, "failed to persist message");
            None
        }
    };

    // Terminal frame then [DONE]; skipped once the client is gone.
    let terminal = match &ending {
        Ending::Finished(FinishReason::Error) => {
            Some(frame_ctx.error_frame("model reported a generation failure"))
        }
        Ending::Finished(reason) => Some(frame_ctx.finish_frame(*reason)),
        Ending::UpstreamFailed(e) => Some(frame_ctx.error_frame(&e.to_string())),
        Ending::ClientGone => None,
    };
    if client_open {
        if let Some(frame) = terminal {
            if frames.send(frame).await.is_ok() {
                let _ = frames.send(DONE_FRAME.to_string()).await;
            }
        }
    }

    info!(
        request_id = %ctx.request_id,
        model = %ctx.model.id,
        chunks = sequence_index,
        answer_bytes = answer.len(),
        thinking_bytes = thinking.len(),
        status = ?status,
        aborted,
        "session closed"
    );

    SessionOutcome {
        message_id,
        status,
        answer,
        thinking,
        aborted,
    }
}

/// Extract and hand off MoE routing telemetry, never blocking.
fn publish_expert_info(
    ctx: &SessionContext,
    chunk: &ChatCompletionChunk,
    telemetry: &TelemetryPublisher,
) {
    let Some(info) = &chunk.expert_info else {
        return;
    };
    let samples = experts::extract_samples(&ctx.request_id, &ctx.model.id, info);
    telemetry.try_publish(ActivationBatch { samples });
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryMessageStore;
    use moechat_llm::chunk::{ChunkChoice, ChunkDelta, MalformedChunk};
    use serde_json::json;

    fn model(has_thinking: bool) -> ModelRecord {
        let record = ModelRecord::new("deepseek-moe-16b", "http://localhost:8000");
        if has_thinking {
            record.with_thinking()
        } else {
            record
        }
    }

    fn context(model: ModelRecord) -> SessionContext {
        SessionContext {
            request_id: "req-1".into(),
            chat_id: Uuid::new_v4(),
            model,
            position: 2,
            chunk_idle_timeout: Duration::from_secs(5),
        }
    }

    fn chunk_with(delta: ChunkDelta, finish: Option<FinishReason>) -> ChunkEvent {
        ChunkEvent::Chunk(ChatCompletionChunk {
            id: "chatcmpl-up".into(),
            object: "chat.completion.chunk".into(),
            created: 0,
            model: "deepseek-moe-16b".into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            expert_info: None,
        })
    }

    fn role_chunk() -> ChunkEvent {
        chunk_with(
            ChunkDelta {
                role: Some("assistant".into()),
                content: None,
            },
            None,
        )
    }

    fn content_chunk(text: &str) -> ChunkEvent {
        chunk_with(
            ChunkDelta {
                role: None,
                content: Some(text.into()),
            },
            None,
        )
    }

    fn finish_chunk(reason: FinishReason) -> ChunkEvent {
        chunk_with(ChunkDelta::default(), Some(reason))
    }

    fn malformed() -> ChunkEvent {
        ChunkEvent::Malformed(MalformedChunk {
            message: "expected value".into(),
            preview: "{broken".into(),
        })
    }

    struct Harness {
        store: InMemoryMessageStore,
        telemetry: TelemetryPublisher,
        ctx: SessionContext,
    }

    impl Harness {
        fn new(model: ModelRecord) -> Self {
            let (telemetry, _forwarder) = TelemetryPublisher::spawn(16);
            Self {
                store: InMemoryMessageStore::new(),
                telemetry,
                ctx: context(model),
            }
        }

        /// Run a session over scripted events; returns frames and outcome.
        async fn run(
            &self,
            events: Vec<Result<ChunkEvent, UpstreamError>>,
        ) -> (Vec<String>, SessionOutcome) {
            let (tx, mut rx) = mpsc::channel(64);
            let upstream = futures::stream::iter(events);
            let outcome = run_session(
                self.ctx.clone(),
                upstream,
                tx,
                &self.store,
                &self.telemetry,
            )
            .await;

            let mut frames = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
            (frames, outcome)
        }
    }

    fn frame_json(frame: &str) -> serde_json::Value {
        serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).unwrap()
    }

    fn content_of(frame: &str) -> Option<String> {
        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).ok()?;
        json["choices"][0]["delta"]["content"]
            .as_str()
            .map(str::to_string)
    }

    #[tokio::test]
    async fn happy_path_without_thinking() {
        let harness = Harness::new(model(false));
        let (frames, outcome) = harness
            .run(vec![
                Ok(role_chunk()),
                Ok(content_chunk("Hel")),
                Ok(content_chunk("lo")),
                Ok(finish_chunk(FinishReason::Stop)),
                Ok(ChunkEvent::Done),
            ])
            .await;

        // role, two deltas, terminal, [DONE]
        assert_eq!(frames.len(), 5);
        assert_eq!(
            frame_json(&frames[0])["choices"][0]["delta"]["role"],
            "assistant"
        );
        assert_eq!(content_of(&frames[1]).unwrap(), "Hel");
        assert_eq!(content_of(&frames[2]).unwrap(), "lo");
        assert_eq!(frame_json(&frames[3])["choices"][0]["finish_reason"], "stop");
        assert_eq!(frames[4], DONE_FRAME);

        assert_eq!(outcome.answer, "Hello");
        assert_eq!(outcome.status, MessageStatus::Completed);
        assert!(!outcome.aborted);
        assert!(outcome.message_id.is_some());

        let messages = harness.store.messages(harness.ctx.chat_id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[0].status, MessageStatus::Completed);
        assert_eq!(messages[0].position, 2);
        assert_eq!(messages[0].model_id.as_deref(), Some("deepseek-moe-16b"));
    }

    #[tokio::test]
    async fn thinking_split_across_fragments() {
        let harness = Harness::new(model(true));
        let (frames, outcome) = harness
            .run(vec![
                Ok(role_chunk()),
                Ok(content_chunk("Ar")),
                Ok(content_chunk("ight, thinking")),
                Ok(content_chunk("</think>")),
                Ok(content_chunk("\nFinal answer.")),
                Ok(finish_chunk(FinishReason::Stop)),
                Ok(ChunkEvent::Done),
            ])
            .await;

        assert_eq!(outcome.thinking, "Aright, thinking");
        assert_eq!(outcome.answer, "\nFinal answer.");

        // Thinking never appears in any delta frame.
        let streamed: String = frames
            .iter()
            .filter_map(|f| content_of(f))
            .collect();
        assert_eq!(streamed, "\nFinal answer.");

        let messages = harness.store.messages(harness.ctx.chat_id);
        assert_eq!(messages[0].content, "\nFinal answer.");
    }

    #[tokio::test]
    async fn marker_torn_at_stream_start() {
        let harness = Harness::new(model(true));
        let (frames, outcome) = harness
            .run(vec![
                Ok(content_chunk("</th")),
                Ok(content_chunk("ink>")),
                Ok(content_chunk("Hello")),
                Ok(finish_chunk(FinishReason::Stop)),
                Ok(ChunkEvent::Done),
            ])
            .await;

        assert_eq!(outcome.thinking, "");
        assert_eq!(outcome.answer, "Hello");
        let streamed: String = frames.iter().filter_map(|f| content_of(f)).collect();
        assert_eq!(streamed, "Hello");
    }

    #[tokio::test]
    async fn disconnect_persists_partial_with_error_status() {
        let harness = Harness::new(model(false));
        let (frames, outcome) = harness
            .run(vec![
                Ok(role_chunk()),
                Ok(content_chunk("Partial respo")),
                Err(UpstreamError::Disconnected),
            ])
            .await;

        assert!(outcome.aborted);
        assert_eq!(outcome.status, MessageStatus::Error);
        assert_eq!(outcome.answer, "Partial respo");

        let messages = harness.store.messages(harness.ctx.chat_id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Partial respo");
        assert_eq!(messages[0].status, MessageStatus::Error);

        // Error-shaped terminal frame, then [DONE].
        let terminal = frame_json(&frames[frames.len() - 2]);
        assert_eq!(terminal["choices"][0]["finish_reason"], "error");
        assert_eq!(terminal["error"]["type"], "generation_failed");
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
    }

    #[tokio::test]
    async fn idle_timeout_aborts() {
        let harness = Harness::new(model(false));
        let mut ctx = harness.ctx.clone();
        ctx.chunk_idle_timeout = Duration::from_millis(50);

        let (tx, mut rx) = mpsc::channel(64);
        let outcome = run_session(
            ctx,
            futures::stream::pending(),
            tx,
            &harness.store,
            &harness.telemetry,
        )
        .await;

        assert!(outcome.aborted);
        assert_eq!(outcome.status, MessageStatus::Error);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        let terminal = frame_json(&frames[frames.len() - 2]);
        assert!(terminal["error"]["message"]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn three_consecutive_malformed_chunks_are_fatal() {
        let harness = Harness::new(model(false));
        let (frames, outcome) = harness
            .run(vec![
                Ok(content_chunk("ok")),
                Ok(malformed()),
                Ok(malformed()),
                Ok(malformed()),
                // Never reached.
                Ok(content_chunk("never")),
            ])
            .await;

        assert!(outcome.aborted);
        assert_eq!(outcome.answer, "ok");
        let terminal = frame_json(&frames[frames.len() - 2]);
        assert!(terminal["error"]["message"]
            .as_str()
            .unwrap()
            .contains("consecutive malformed"));
    }

    #[tokio::test]
    async fn malformed_counter_resets_on_valid_chunk() {
        let harness = Harness::new(model(false));
        let (_, outcome) = harness
            .run(vec![
                Ok(malformed()),
                Ok(malformed()),
                Ok(content_chunk("a")),
                Ok(malformed()),
                Ok(malformed()),
                Ok(content_chunk("b")),
                Ok(finish_chunk(FinishReason::Stop)),
            ])
            .await;

        assert!(!outcome.aborted);
        assert_eq!(outcome.answer, "ab");
        assert_eq!(outcome.status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn client_disconnect_persists_and_skips_frames() {
        let harness = Harness::new(model(false));
        let (tx, rx) = mpsc::channel(64);
        drop(rx); // client gone before the first frame

        let outcome = run_session(
            harness.ctx.clone(),
            futures::stream::iter(vec![Ok(content_chunk("unseen"))]),
            tx,
            &harness.store,
            &harness.telemetry,
        )
        .await;

        assert!(outcome.aborted);
        assert_eq!(outcome.status, MessageStatus::Error);
        // Still exactly one persisted message.
        assert_eq!(harness.store.messages(harness.ctx.chat_id).len(), 1);
    }

    #[tokio::test]
    async fn client_disconnect_detected_during_thinking_preamble() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use futures::StreamExt as _;

        let harness = Harness::new(model(true));

        // A long thinking run produces no answer frames, so a failed send
        // can never signal the disconnect.
        let mut events: Vec<Result<ChunkEvent, UpstreamError>> = vec![Ok(role_chunk())];
        for _ in 0..50 {
            events.push(Ok(content_chunk("still thinking ")));
        }
        events.push(Ok(finish_chunk(FinishReason::Stop)));
        let total = events.len();

        let consumed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(4);
        let mut rx_slot = Some(rx);
        let upstream = futures::stream::iter(events).inspect({
            let consumed = consumed.clone();
            move |_| {
                // Drop the receiver two chunks in, mid-preamble.
                if consumed.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    drop(rx_slot.take());
                }
            }
        });

        let outcome = run_session(
            harness.ctx.clone(),
            upstream,
            tx,
            &harness.store,
            &harness.telemetry,
        )
        .await;

        assert!(outcome.aborted);
        assert_eq!(outcome.status, MessageStatus::Error);
        // Upstream consumption stops promptly instead of draining all chunks.
        assert!(consumed.load(Ordering::SeqCst) <= 3, "drained {} of {total}", consumed.load(Ordering::SeqCst));

        let messages = harness.store.messages(harness.ctx.chat_id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Error);
    }

    #[tokio::test]
    async fn done_without_terminal_chunk_finalizes_as_stop() {
        let harness = Harness::new(model(false));
        let (frames, outcome) = harness
            .run(vec![Ok(content_chunk("hi")), Ok(ChunkEvent::Done)])
            .await;

        assert!(!outcome.aborted);
        assert_eq!(outcome.status, MessageStatus::Completed);
        let terminal = frame_json(&frames[frames.len() - 2]);
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn upstream_error_finish_reason_persists_error_status() {
        let harness = Harness::new(model(false));
        let (frames, outcome) = harness
            .run(vec![
                Ok(content_chunk("partial")),
                Ok(finish_chunk(FinishReason::Error)),
            ])
            .await;

        assert!(!outcome.aborted);
        assert_eq!(outcome.status, MessageStatus::Error);
        assert_eq!(outcome.answer, "partial");
        let terminal = frame_json(&frames[frames.len() - 2]);
        assert_eq!(terminal["choices"][0]["finish_reason"], "error");
        assert_eq!(terminal["error"]["type"], "generation_failed");
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
    }

    #[tokio::test]
    async fn unresolved_partial_marker_flushed_on_finish() {
        let harness = Harness::new(model(true));
        let (_, outcome) = harness
            .run(vec![
                Ok(content_chunk("only reasoning</th")),
                Ok(finish_chunk(FinishReason::Stop)),
            ])
            .await;

        // The marker never completed; held bytes flush to thinking.
        assert_eq!(outcome.thinking, "only reasoning</th");
        assert_eq!(outcome.answer, "");
        assert_eq!(outcome.status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn empty_delta_chunks_emit_no_frames() {
        let harness = Harness::new(model(false));
        let (frames, outcome) = harness
            .run(vec![
                Ok(role_chunk()),
                Ok(chunk_with(ChunkDelta::default(), None)),
                Ok(content_chunk("x")),
                Ok(finish_chunk(FinishReason::Stop)),
            ])
            .await;

        // role, one delta, terminal, [DONE]
        assert_eq!(frames.len(), 4);
        assert_eq!(outcome.answer, "x");
    }

    #[tokio::test]
    async fn expert_info_reaches_subscribers() {
        let harness = Harness::new(model(false));
        let mut telemetry_rx = harness.telemetry.subscribe();

        let mut chunk = match content_chunk("x") {
            ChunkEvent::Chunk(c) => c,
            _ => unreachable!(),
        };
        chunk.expert_info = Some(json!({"usage": {"7": 3}}));

        let (_, outcome) = harness
            .run(vec![
                Ok(ChunkEvent::Chunk(chunk)),
                Ok(finish_chunk(FinishReason::Stop)),
            ])
            .await;
        assert_eq!(outcome.answer, "x");

        let batch = telemetry_rx.recv().await.unwrap();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].expert_id, 7);
        assert_eq!(batch.samples[0].request_id, "req-1");
    }

    #[tokio::test]
    async fn length_finish_reason_passed_through() {
        let harness = Harness::new(model(false));
        let (frames, outcome) = harness
            .run(vec![
                Ok(content_chunk("truncat")),
                Ok(finish_chunk(FinishReason::Length)),
            ])
            .await;

        assert_eq!(outcome.status, MessageStatus::Completed);
        let terminal = frame_json(&frames[frames.len() - 2]);
        assert_eq!(terminal["choices"][0]["finish_reason"], "length");
    }
}
