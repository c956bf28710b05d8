//! crates/tutor_core/src/ports.rs
//!
//! Defines the service contracts (traits) the engine consumes.
//! These traits form the boundary of the hexagonal architecture, keeping the
//! session engine independent of the database, the outline producer, and the
//! LLM vendor that actually writes explanations and quizzes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;
use uuid::Uuid;

use crate::domain::{
    CacheEntry, CacheKey, LearningSession, Outline, ProgressChange, ProgressRejected, QuotaBucket,
    QuotaRecord, Quiz, SubTopicProgress, TopicProgress,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
    /// The stored row refused the change; nothing was written.
    #[error("Change rejected: {0}")]
    Rejected(#[from] ProgressRejected),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// An incremental stream of generated text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = PortResult<String>> + Send>>;

//=========================================================================================
// Storage Ports
//=========================================================================================

/// Sessions and progress rows. Every method is a single key-based read or an
/// atomic write.
#[async_trait]
pub trait LearningStore: Send + Sync {
    async fn get_session(&self, session_id: Uuid) -> PortResult<LearningSession>;

    async fn find_session(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> PortResult<Option<LearningSession>>;

    /// Inserts the session unless one already exists for the same
    /// (user, document) pair, and returns whichever row is stored.
    async fn create_session(&self, session: LearningSession) -> PortResult<LearningSession>;

    /// Overwrites the session row. Last write wins.
    async fn save_session(&self, session: &LearningSession) -> PortResult<()>;

    async fn get_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
    ) -> PortResult<Option<TopicProgress>>;

    async fn list_topic_progress(&self, session_id: Uuid) -> PortResult<Vec<TopicProgress>>;

    /// Inserts a fresh row unless one exists, and returns the stored row.
    async fn create_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
    ) -> PortResult<TopicProgress>;

    /// Applies `change` to the stored row in one atomic step, creating the
    /// row first if needed, and returns the updated row. Concurrent changes to
    /// the same row are serialized. A refused change is `PortError::Rejected`.
    async fn update_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
        change: ProgressChange,
    ) -> PortResult<TopicProgress>;

    async fn get_sub_topic_progress(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
    ) -> PortResult<Option<SubTopicProgress>>;

    /// Sets `confirmed` exactly once. Returns `true` if this call confirmed the
    /// sub-topic and `false` if it was already confirmed.
    async fn confirm_sub_topic(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool>;

    async fn mark_explanation_served(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<()>;
}

/// One row per cache key; writes are idempotent overwrites.
#[async_trait]
pub trait GenerationCacheStore: Send + Sync {
    async fn get_cache_entry(&self, key: &CacheKey) -> PortResult<Option<CacheEntry>>;

    async fn put_cache_entry(&self, entry: &CacheEntry) -> PortResult<()>;

    async fn delete_cache_entry(&self, key: &CacheKey) -> PortResult<()>;
}

/// One row per (user, bucket).
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_quota(&self, user_id: Uuid, bucket: QuotaBucket)
        -> PortResult<Option<QuotaRecord>>;

    /// Inserts the row with the given limit unless it already exists, and
    /// returns the stored row.
    async fn create_quota(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        limit: u32,
        reset_at: DateTime<Utc>,
    ) -> PortResult<QuotaRecord>;

    /// A single conditional increment: applies only if `used + amount <= limit`.
    /// Returns the updated row, or `None` if the increment was refused.
    async fn try_consume(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> PortResult<Option<QuotaRecord>>;

    /// Decrements `used`, floored at zero.
    async fn refund(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> PortResult<QuotaRecord>;
}

//=========================================================================================
// Upstream and Generation Ports
//=========================================================================================

#[async_trait]
pub trait OutlineProvider: Send + Sync {
    /// Returns the outline, or `None` while extraction is not finished.
    async fn get_outline(&self, document_id: Uuid) -> PortResult<Option<Outline>>;
}

/// What the generator knows about the material it is writing for.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub topic_id: Uuid,
    pub topic_title: String,
    pub sub_topic_id: Option<Uuid>,
    pub sub_topic_title: Option<String>,
    /// Titles of the sub-topics of the topic, in order.
    pub sub_topic_titles: Vec<String>,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Streams the five-layer explanation of one sub-topic.
    async fn generate_explanation(&self, context: &GenerationContext) -> PortResult<TextStream>;

    /// Generates the three-question quiz for a whole topic.
    async fn generate_quiz(&self, context: &GenerationContext) -> PortResult<Quiz>;
}
