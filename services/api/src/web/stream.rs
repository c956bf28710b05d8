//! services/api/src/web/stream.rs
//!
//! The explanation stream dispatcher. It runs the engine's explanation
//! request on a detached task that pushes text chunks into a channel, and
//! relays the channel to the client as Server-Sent Events.
//!
//! The detached task owns generation and the cache write. When the client
//! goes away, only the receiving half is dropped: the engine keeps
//! generating, the result is still cached and the next request for the same
//! sub-topic is served from the cache.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Extension,
};
use futures::Stream;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info};
use tutor_core::{EngineError, EngineResult, ExplanationServed, LearningEngine};
use uuid::Uuid;

use crate::error::{engine_error_parts, ApiError, ErrorBody};
use crate::web::{protocol::StreamMessage, state::AppState};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Whether the request may be served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainMode {
    Cached,
    Regenerate,
}

//=========================================================================================
// The Dispatcher
//=========================================================================================

/// Starts serving an explanation and returns its message stream.
///
/// The call waits for the first chunk before returning, so a request the
/// engine rejects outright (wrong phase, quota exhausted, stale sub-topic)
/// is reported as an ordinary error instead of an opened stream.
pub async fn dispatch_explanation(
    engine: Arc<LearningEngine>,
    user_id: Uuid,
    session_id: Uuid,
    sub_topic_id: Uuid,
    mode: ExplainMode,
) -> EngineResult<impl Stream<Item = StreamMessage> + Send + 'static> {
    // A slow client must never hold up generation or its timeout.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let task: JoinHandle<EngineResult<ExplanationServed>> = tokio::spawn(async move {
        match mode {
            ExplainMode::Cached => {
                engine
                    .request_explanation(user_id, session_id, sub_topic_id, Some(tx))
                    .await
            }
            ExplainMode::Regenerate => {
                engine
                    .reexplain(user_id, session_id, sub_topic_id, Some(tx))
                    .await
            }
        }
    });

    // The sender lives inside the task, so `None` means the task has finished.
    let first = rx.recv().await;
    let completion = match first {
        Some(_) => Completion::Running(task),
        None => Completion::Finished(join(task).await?),
    };

    Ok(relay(session_id, sub_topic_id, first, rx, completion))
}

enum Completion {
    Running(JoinHandle<EngineResult<ExplanationServed>>),
    Finished(ExplanationServed),
}

fn relay(
    session_id: Uuid,
    sub_topic_id: Uuid,
    first: Option<String>,
    mut rx: mpsc::UnboundedReceiver<String>,
    completion: Completion,
) -> impl Stream<Item = StreamMessage> + Send + 'static {
    async_stream::stream! {
        yield StreamMessage::Started { session_id, sub_topic_id };
        if let Some(text) = first {
            yield StreamMessage::Chunk { text };
        }
        while let Some(text) = rx.recv().await {
            yield StreamMessage::Chunk { text };
        }

        let outcome = match completion {
            Completion::Finished(served) => Ok(served),
            Completion::Running(handle) => join(handle).await,
        };
        match outcome {
            Ok(served) => {
                info!(
                    session_id = %session_id,
                    sub_topic_id = %served.sub_topic_id,
                    from_cache = served.from_cache,
                    "Explanation stream finished"
                );
                yield StreamMessage::Done {
                    sub_topic_id: served.sub_topic_id,
                    from_cache: served.from_cache,
                    chars: served.text.len(),
                };
            }
            Err(e) => {
                debug!(session_id = %session_id, "Explanation stream ended with an error: {}", e);
                let (_, body) = engine_error_parts(&e);
                yield StreamMessage::Error(body);
            }
        }
    }
}

async fn join(
    handle: JoinHandle<EngineResult<ExplanationServed>>,
) -> EngineResult<ExplanationServed> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!("Explanation task failed to complete: {}", e);
            Err(EngineError::GenerationFailed(
                "explanation task aborted".to_string(),
            ))
        }
    }
}

fn to_event(message: StreamMessage) -> Event {
    let name = message.event_name();
    Event::default()
        .event(name)
        .json_data(&message)
        .unwrap_or_else(|_| Event::default().event(name).data("{}"))
}

fn into_sse(
    messages: impl Stream<Item = StreamMessage> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    use futures::StreamExt;
    let events = messages.map(|message| Ok::<_, Infallible>(to_event(message)));
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Streams the explanation of the current sub-topic, from the cache when present.
#[utoipa::path(
    get,
    path = "/sessions/{session_id}/sub-topics/{sub_topic_id}/explanation",
    params(
        ("session_id" = Uuid, Path, description = "Learning session id"),
        ("sub_topic_id" = Uuid, Path, description = "Sub-topic to explain"),
    ),
    responses(
        (status = 200, description = "Server-Sent Events: started, chunk*, done | error", body = String, content_type = "text/event-stream"),
        (status = 409, description = "Not the current sub-topic or not explaining", body = ErrorBody),
        (status = 429, description = "Explanation quota exhausted", body = ErrorBody),
    )
)]
pub async fn explanation_stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path((session_id, sub_topic_id)): Path<(Uuid, Uuid)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiError> {
    let messages = dispatch_explanation(
        state.engine.clone(),
        user_id,
        session_id,
        sub_topic_id,
        ExplainMode::Cached,
    )
    .await?;
    Ok(into_sse(messages))
}

/// Discards the cached explanation and streams a newly generated one.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/sub-topics/{sub_topic_id}/re-explain",
    params(
        ("session_id" = Uuid, Path, description = "Learning session id"),
        ("sub_topic_id" = Uuid, Path, description = "Sub-topic to explain again"),
    ),
    responses(
        (status = 200, description = "Server-Sent Events: started, chunk*, done | error", body = String, content_type = "text/event-stream"),
        (status = 409, description = "Not the current sub-topic or not explaining", body = ErrorBody),
        (status = 429, description = "Explanation quota exhausted", body = ErrorBody),
    )
)]
pub async fn reexplain_stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path((session_id, sub_topic_id)): Path<(Uuid, Uuid)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiError> {
    let messages = dispatch_explanation(
        state.engine.clone(),
        user_id,
        session_id,
        sub_topic_id,
        ExplainMode::Regenerate,
    )
    .await?;
    Ok(into_sse(messages))
}
