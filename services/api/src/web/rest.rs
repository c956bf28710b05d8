//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::error::{ApiError, ErrorBody};
use crate::web::{state::AppState, stream};
use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tutor_core::{
    session::{QuizQuestionView, QuizView, TopicSummary},
    AnswerResult, QuotaBucket, QuotaStatus, SessionSnapshot, TopicCompletion,
};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        start_session_handler,
        get_session_handler,
        pause_session_handler,
        confirm_handler,
        get_quiz_handler,
        answer_handler,
        skip_handler,
        complete_topic_handler,
        quota_handler,
        stream::explanation_stream_handler,
        stream::reexplain_stream_handler,
    ),
    components(
        schemas(
            SessionResponse,
            TopicSummaryResponse,
            QuizResponse,
            QuizQuestionResponse,
            AnswerResponse,
            TopicCompletionResponse,
            QuotaResponse,
            ConfirmRequest,
            AnswerRequest,
            SkipRequest,
            ErrorBody,
        )
    ),
    tags(
        (name = "Learning Session API", description = "Guided explain, confirm and quiz sessions over an uploaded document.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct TopicSummaryResponse {
    pub topic_id: Uuid,
    pub index: usize,
    pub title: String,
    /// `PENDING`, `IN_PROGRESS` or `COMPLETED`.
    pub status: String,
    pub is_weak_point: bool,
    pub correct_count: u32,
    pub wrong_count: u32,
    pub passed: Option<bool>,
}

impl From<TopicSummary> for TopicSummaryResponse {
    fn from(summary: TopicSummary) -> Self {
        Self {
            topic_id: summary.topic_id,
            index: summary.index,
            title: summary.title,
            status: summary.status.as_str().to_string(),
            is_weak_point: summary.is_weak_point,
            correct_count: summary.correct_count,
            wrong_count: summary.wrong_count,
            passed: summary.passed,
        }
    }
}

/// The authoritative position of a learning session.
#[derive(Serialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub document_id: Uuid,
    /// `IN_PROGRESS`, `PAUSED` or `COMPLETED`.
    pub status: String,
    /// `EXPLAINING`, `CONFIRMING`, `TESTING` or `COMPLETED`.
    pub phase: String,
    pub current_topic_index: usize,
    pub current_sub_index: usize,
    pub current_topic_id: Option<Uuid>,
    pub current_sub_topic_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub topics: Vec<TopicSummaryResponse>,
}

impl From<SessionSnapshot> for SessionResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            document_id: snapshot.document_id,
            status: snapshot.status.as_str().to_string(),
            phase: snapshot.phase.as_str().to_string(),
            current_topic_index: snapshot.current_topic_index,
            current_sub_index: snapshot.current_sub_index,
            current_topic_id: snapshot.current_topic_id,
            current_sub_topic_id: snapshot.current_sub_topic_id,
            started_at: snapshot.started_at,
            last_active_at: snapshot.last_active_at,
            completed_at: snapshot.completed_at,
            topics: snapshot.topics.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct QuizQuestionResponse {
    pub index: usize,
    pub text: String,
    pub options: Vec<String>,
    pub attempts: u32,
    pub skippable: bool,
    /// `correct`, `late_correct` or `skipped` once resolved.
    pub outcome: Option<String>,
}

impl From<QuizQuestionView> for QuizQuestionResponse {
    fn from(view: QuizQuestionView) -> Self {
        Self {
            index: view.index,
            text: view.text,
            options: view.options,
            attempts: view.attempts,
            skippable: view.skippable,
            outcome: view.outcome.map(|o| o.as_str().to_string()),
        }
    }
}

/// The current topic's quiz without its answer key.
#[derive(Serialize, ToSchema)]
pub struct QuizResponse {
    pub topic_id: Uuid,
    pub questions: Vec<QuizQuestionResponse>,
}

impl From<QuizView> for QuizResponse {
    fn from(view: QuizView) -> Self {
        Self {
            topic_id: view.topic_id,
            questions: view.questions.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct AnswerResponse {
    pub correct: bool,
    pub attempts: u32,
    pub skippable: bool,
    pub outcome: Option<String>,
    pub explanation: Option<String>,
}

impl From<AnswerResult> for AnswerResponse {
    fn from(result: AnswerResult) -> Self {
        Self {
            correct: result.correct,
            attempts: result.attempts,
            skippable: result.skippable,
            outcome: result.outcome.map(|o| o.as_str().to_string()),
            explanation: result.explanation,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct TopicCompletionResponse {
    pub passed: bool,
    pub correct: usize,
    pub session: SessionResponse,
}

impl From<TopicCompletion> for TopicCompletionResponse {
    fn from(completion: TopicCompletion) -> Self {
        Self {
            passed: completion.passed,
            correct: completion.correct,
            session: completion.snapshot.into(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct QuotaResponse {
    pub bucket: String,
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl From<QuotaStatus> for QuotaResponse {
    fn from(status: QuotaStatus) -> Self {
        Self {
            bucket: status.bucket.to_string(),
            used: status.used,
            remaining: status.remaining,
            limit: status.limit,
            reset_at: status.reset_at,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct ConfirmRequest {
    pub sub_topic_id: Uuid,
}

#[derive(Deserialize, ToSchema)]
pub struct AnswerRequest {
    pub question_index: usize,
    /// Indices of the selected options, 0 to 3.
    pub selected: Vec<u8>,
}

#[derive(Deserialize, ToSchema)]
pub struct SkipRequest {
    pub question_index: usize,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Start the learning session for a document, or resume the existing one.
#[utoipa::path(
    post,
    path = "/documents/{document_id}/session",
    params(
        ("document_id" = Uuid, Path, description = "Document to study"),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    ),
    responses(
        (status = 200, description = "The session at its stored position", body = SessionResponse),
        (status = 409, description = "The document outline is not ready yet", body = ErrorBody),
    )
)]
pub async fn start_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let snapshot = state.engine.start(user_id, document_id).await?;
    Ok(Json(snapshot.into()))
}

/// Read the session's current position and per-topic progress.
#[utoipa::path(
    get,
    path = "/sessions/{session_id}",
    params(("session_id" = Uuid, Path, description = "Learning session id")),
    responses(
        (status = 200, body = SessionResponse),
        (status = 404, description = "No such session", body = ErrorBody),
    )
)]
pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let snapshot = state.engine.snapshot(user_id, session_id).await?;
    Ok(Json(snapshot.into()))
}

#[utoipa::path(
    post,
    path = "/sessions/{session_id}/pause",
    params(("session_id" = Uuid, Path, description = "Learning session id")),
    responses(
        (status = 200, body = SessionResponse),
        (status = 409, description = "The session is already completed", body = ErrorBody),
    )
)]
pub async fn pause_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let snapshot = state.engine.pause(user_id, session_id).await?;
    Ok(Json(snapshot.into()))
}

/// Confirm that the current sub-topic was understood. Confirming the last
/// sub-topic of a topic prepares the topic quiz.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/confirm",
    params(("session_id" = Uuid, Path, description = "Learning session id")),
    request_body = ConfirmRequest,
    responses(
        (status = 200, body = SessionResponse),
        (status = 409, description = "Not the current sub-topic", body = ErrorBody),
        (status = 429, description = "Quiz quota exhausted", body = ErrorBody),
        (status = 503, description = "Quiz generation failed, retry the confirmation", body = ErrorBody),
    )
)]
pub async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ConfirmRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let snapshot = state
        .engine
        .confirm(user_id, session_id, payload.sub_topic_id)
        .await?;
    Ok(Json(snapshot.into()))
}

#[utoipa::path(
    get,
    path = "/sessions/{session_id}/quiz",
    params(("session_id" = Uuid, Path, description = "Learning session id")),
    responses(
        (status = 200, body = QuizResponse),
        (status = 409, description = "The session is not testing", body = ErrorBody),
    )
)]
pub async fn get_quiz_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<QuizResponse>, ApiError> {
    let quiz = state.engine.quiz(user_id, session_id).await?;
    Ok(Json(quiz.into()))
}

/// Grade one answer. A wrong answer is a normal 200 response.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/answer",
    params(("session_id" = Uuid, Path, description = "Learning session id")),
    request_body = AnswerRequest,
    responses(
        (status = 200, body = AnswerResponse),
        (status = 400, description = "Empty or out-of-range selection", body = ErrorBody),
        (status = 409, description = "Not testing, or the question is already resolved", body = ErrorBody),
    )
)]
pub async fn answer_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let result = state
        .engine
        .submit_answer(user_id, session_id, payload.question_index, &payload.selected)
        .await?;
    Ok(Json(result.into()))
}

#[utoipa::path(
    post,
    path = "/sessions/{session_id}/skip",
    params(("session_id" = Uuid, Path, description = "Learning session id")),
    request_body = SkipRequest,
    responses(
        (status = 200, body = SessionResponse),
        (status = 409, description = "The question still has attempts left", body = ErrorBody),
    )
)]
pub async fn skip_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SkipRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let snapshot = state
        .engine
        .skip(user_id, session_id, payload.question_index)
        .await?;
    Ok(Json(snapshot.into()))
}

#[utoipa::path(
    post,
    path = "/sessions/{session_id}/complete-topic",
    params(("session_id" = Uuid, Path, description = "Learning session id")),
    responses(
        (status = 200, body = TopicCompletionResponse),
        (status = 409, description = "Unresolved questions remain", body = ErrorBody),
    )
)]
pub async fn complete_topic_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<TopicCompletionResponse>, ApiError> {
    let completion = state.engine.complete_topic(user_id, session_id).await?;
    Ok(Json(completion.into()))
}

/// Read the caller's balance in one quota bucket without consuming it.
#[utoipa::path(
    get,
    path = "/quota/{bucket}",
    params(("bucket" = String, Path, description = "`explanation` or `quiz`")),
    responses(
        (status = 200, body = QuotaResponse),
        (status = 400, description = "Unknown bucket", body = ErrorBody),
    )
)]
pub async fn quota_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(bucket): Path<String>,
) -> Result<Json<QuotaResponse>, ApiError> {
    let bucket = QuotaBucket::parse(&bucket)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown quota bucket '{}'", bucket)))?;
    let status = state.engine.quota(user_id, bucket).await?;
    Ok(Json(status.into()))
}
