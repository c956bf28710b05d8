//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of
//! the storage ports from the `core` crate (`LearningStore`,
//! `GenerationCacheStore`, `QuotaStore`) and of the `OutlineProvider` port,
//! which reads the outline tables written by the ingestion pipeline.
//! It handles all interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, PgExecutor, PgPool};
use tracing::debug;
use tutor_core::domain::{
    CacheEntry, CacheKey, CachedContent, LearningSession, Outline, Phase, ProgressChange,
    QuestionProgress, QuotaBucket, QuotaRecord, Quiz, SessionStatus, SubTopic, SubTopicProgress,
    TopicGroup, TopicProgress, TopicStatus,
};
use tutor_core::ports::{
    GenerationCacheStore, LearningStore, OutlineProvider, PortError, PortResult, QuotaStore,
};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the engine's storage ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// Column Encodings
//=========================================================================================

fn parse_session_status(value: &str) -> PortResult<SessionStatus> {
    match value {
        "IN_PROGRESS" => Ok(SessionStatus::InProgress),
        "PAUSED" => Ok(SessionStatus::Paused),
        "COMPLETED" => Ok(SessionStatus::Completed),
        other => Err(PortError::Unexpected(format!("unknown session status '{}'", other))),
    }
}

fn parse_phase(value: &str) -> PortResult<Phase> {
    match value {
        "EXPLAINING" => Ok(Phase::Explaining),
        "CONFIRMING" => Ok(Phase::Confirming),
        "TESTING" => Ok(Phase::Testing),
        "COMPLETED" => Ok(Phase::Completed),
        other => Err(PortError::Unexpected(format!("unknown session phase '{}'", other))),
    }
}

fn parse_topic_status(value: &str) -> PortResult<TopicStatus> {
    match value {
        "PENDING" => Ok(TopicStatus::Pending),
        "IN_PROGRESS" => Ok(TopicStatus::InProgress),
        "COMPLETED" => Ok(TopicStatus::Completed),
        other => Err(PortError::Unexpected(format!("unknown topic status '{}'", other))),
    }
}

/// The JSON shape of a `generation_cache.content` value.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoredContent {
    Explanation { text: String },
    Quiz { quiz: Quiz },
}

impl From<&CachedContent> for StoredContent {
    fn from(content: &CachedContent) -> Self {
        match content {
            CachedContent::Explanation(text) => StoredContent::Explanation { text: text.clone() },
            CachedContent::Quiz(quiz) => StoredContent::Quiz { quiz: quiz.clone() },
        }
    }
}

impl From<StoredContent> for CachedContent {
    fn from(content: StoredContent) -> Self {
        match content {
            StoredContent::Explanation { text } => CachedContent::Explanation(text),
            StoredContent::Quiz { quiz } => CachedContent::Quiz(quiz),
        }
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const SESSION_COLUMNS: &str = "id, user_id, document_id, status, current_topic_index, \
     current_sub_index, current_phase, started_at, last_active_at, completed_at";

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    user_id: Uuid,
    document_id: Uuid,
    status: String,
    current_topic_index: i32,
    current_sub_index: i32,
    current_phase: String,
    started_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}
impl SessionRecord {
    fn to_domain(self) -> PortResult<LearningSession> {
        Ok(LearningSession {
            id: self.id,
            user_id: self.user_id,
            document_id: self.document_id,
            status: parse_session_status(&self.status)?,
            current_topic_index: self.current_topic_index as usize,
            current_sub_index: self.current_sub_index as usize,
            current_phase: parse_phase(&self.current_phase)?,
            started_at: self.started_at,
            last_active_at: self.last_active_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(FromRow)]
struct TopicProgressRecord {
    session_id: Uuid,
    topic_id: Uuid,
    status: String,
    is_weak_point: bool,
    correct_count: i32,
    wrong_count: i32,
    questions: Json<Vec<QuestionProgress>>,
    passed: Option<bool>,
    completed_at: Option<DateTime<Utc>>,
}
impl TopicProgressRecord {
    fn to_domain(self) -> PortResult<TopicProgress> {
        Ok(TopicProgress {
            session_id: self.session_id,
            topic_id: self.topic_id,
            status: parse_topic_status(&self.status)?,
            is_weak_point: self.is_weak_point,
            correct_count: self.correct_count as u32,
            wrong_count: self.wrong_count as u32,
            questions: self.questions.0,
            passed: self.passed,
            completed_at: self.completed_at,
        })
    }
}

#[derive(FromRow)]
struct SubTopicProgressRecord {
    session_id: Uuid,
    sub_topic_id: Uuid,
    confirmed: bool,
    confirmed_at: Option<DateTime<Utc>>,
    explanation_served_at: Option<DateTime<Utc>>,
}
impl SubTopicProgressRecord {
    fn to_domain(self) -> SubTopicProgress {
        SubTopicProgress {
            session_id: self.session_id,
            sub_topic_id: self.sub_topic_id,
            confirmed: self.confirmed,
            confirmed_at: self.confirmed_at,
            explanation_served_at: self.explanation_served_at,
        }
    }
}

#[derive(FromRow)]
struct CacheRecord {
    content: Json<StoredContent>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct QuotaRow {
    user_id: Uuid,
    bucket: String,
    used: i32,
    quota_limit: i32,
    reset_at: DateTime<Utc>,
}
impl QuotaRow {
    fn to_domain(self) -> PortResult<QuotaRecord> {
        let bucket = QuotaBucket::parse(&self.bucket).ok_or_else(|| {
            PortError::Unexpected(format!("unknown quota bucket '{}'", self.bucket))
        })?;
        Ok(QuotaRecord {
            user_id: self.user_id,
            bucket,
            used: self.used.max(0) as u32,
            limit: self.quota_limit.max(0) as u32,
            reset_at: self.reset_at,
        })
    }
}

#[derive(FromRow)]
struct TopicRow {
    id: Uuid,
    idx: i32,
    title: String,
}

#[derive(FromRow)]
struct SubTopicRow {
    id: Uuid,
    topic_id: Uuid,
    idx: i32,
    title: String,
}

//=========================================================================================
// `OutlineProvider` Trait Implementation
//=========================================================================================

#[async_trait]
impl OutlineProvider for DbAdapter {
    async fn get_outline(&self, document_id: Uuid) -> PortResult<Option<Outline>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT outline_status FROM documents WHERE id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unexpected)?;

        match status.as_deref() {
            Some("READY") => {}
            other => {
                debug!(document_id = %document_id, status = ?other, "Outline not ready");
                return Ok(None);
            }
        }

        let topics = sqlx::query_as::<_, TopicRow>(
            "SELECT id, idx, title FROM topic_groups WHERE document_id = $1 ORDER BY idx ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let sub_topics = sqlx::query_as::<_, SubTopicRow>(
            "SELECT s.id, s.topic_id, s.idx, s.title FROM sub_topics s \
             JOIN topic_groups t ON s.topic_id = t.id \
             WHERE t.document_id = $1 ORDER BY t.idx ASC, s.idx ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let topics = topics
            .into_iter()
            .map(|topic| TopicGroup {
                id: topic.id,
                index: topic.idx as usize,
                title: topic.title,
                sub_topics: sub_topics
                    .iter()
                    .filter(|s| s.topic_id == topic.id)
                    .map(|s| SubTopic {
                        id: s.id,
                        index: s.idx as usize,
                        title: s.title.clone(),
                    })
                    .collect(),
            })
            .collect();

        Ok(Some(Outline {
            document_id,
            topics,
        }))
    }
}

//=========================================================================================
// `LearningStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl LearningStore for DbAdapter {
    async fn get_session(&self, session_id: Uuid) -> PortResult<LearningSession> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM learning_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Session {} not found", session_id))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn find_session(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> PortResult<Option<LearningSession>> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM learning_sessions WHERE user_id = $1 AND document_id = $2",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(SessionRecord::to_domain).transpose()
    }

    async fn create_session(&self, session: LearningSession) -> PortResult<LearningSession> {
        sqlx::query(
            "INSERT INTO learning_sessions (id, user_id, document_id, status, current_topic_index, \
             current_sub_index, current_phase, started_at, last_active_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (user_id, document_id) DO NOTHING",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.document_id)
        .bind(session.status.as_str())
        .bind(session.current_topic_index as i32)
        .bind(session.current_sub_index as i32)
        .bind(session.current_phase.as_str())
        .bind(session.started_at)
        .bind(session.last_active_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        self.find_session(session.user_id, session.document_id)
            .await?
            .ok_or_else(|| PortError::Unexpected("session vanished after insert".to_string()))
    }

    async fn save_session(&self, session: &LearningSession) -> PortResult<()> {
        sqlx::query(
            "UPDATE learning_sessions SET status = $2, current_topic_index = $3, \
             current_sub_index = $4, current_phase = $5, last_active_at = $6, completed_at = $7 \
             WHERE id = $1",
        )
        .bind(session.id)
        .bind(session.status.as_str())
        .bind(session.current_topic_index as i32)
        .bind(session.current_sub_index as i32)
        .bind(session.current_phase.as_str())
        .bind(session.last_active_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn get_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
    ) -> PortResult<Option<TopicProgress>> {
        let record = sqlx::query_as::<_, TopicProgressRecord>(
            "SELECT session_id, topic_id, status, is_weak_point, correct_count, wrong_count, \
             questions, passed, completed_at FROM topic_progress \
             WHERE session_id = $1 AND topic_id = $2",
        )
        .bind(session_id)
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(TopicProgressRecord::to_domain).transpose()
    }

    async fn list_topic_progress(&self, session_id: Uuid) -> PortResult<Vec<TopicProgress>> {
        let records = sqlx::query_as::<_, TopicProgressRecord>(
            "SELECT session_id, topic_id, status, is_weak_point, correct_count, wrong_count, \
             questions, passed, completed_at FROM topic_progress WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn create_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
    ) -> PortResult<TopicProgress> {
        insert_topic_progress_if_absent(&self.pool, &TopicProgress::new(session_id, topic_id))
            .await?;
        self.get_topic_progress(session_id, topic_id)
            .await?
            .ok_or_else(|| PortError::Unexpected("topic progress vanished after insert".to_string()))
    }

    async fn update_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
        change: ProgressChange,
    ) -> PortResult<TopicProgress> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        insert_topic_progress_if_absent(&mut *tx, &TopicProgress::new(session_id, topic_id))
            .await?;

        // The row lock queues concurrent changes to the same topic behind this one.
        let mut progress = sqlx::query_as::<_, TopicProgressRecord>(
            "SELECT session_id, topic_id, status, is_weak_point, correct_count, wrong_count, \
             questions, passed, completed_at FROM topic_progress \
             WHERE session_id = $1 AND topic_id = $2 FOR UPDATE",
        )
        .bind(session_id)
        .bind(topic_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?
        .to_domain()?;

        // A rejected change returns early; dropping `tx` rolls it back.
        progress.apply(change)?;

        sqlx::query(
            "UPDATE topic_progress SET status = $3, is_weak_point = $4, correct_count = $5, \
             wrong_count = $6, questions = $7, passed = $8, completed_at = $9 \
             WHERE session_id = $1 AND topic_id = $2",
        )
        .bind(session_id)
        .bind(topic_id)
        .bind(progress.status.as_str())
        .bind(progress.is_weak_point)
        .bind(progress.correct_count as i32)
        .bind(progress.wrong_count as i32)
        .bind(Json(&progress.questions))
        .bind(progress.passed)
        .bind(progress.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;

        debug!(
            session_id = %session_id,
            topic_id = %topic_id,
            change = ?change,
            wrong_count = progress.wrong_count,
            "Topic progress updated"
        );
        Ok(progress)
    }

    async fn get_sub_topic_progress(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
    ) -> PortResult<Option<SubTopicProgress>> {
        let record = sqlx::query_as::<_, SubTopicProgressRecord>(
            "SELECT session_id, sub_topic_id, confirmed, confirmed_at, explanation_served_at \
             FROM sub_topic_progress WHERE session_id = $1 AND sub_topic_id = $2",
        )
        .bind(session_id)
        .bind(sub_topic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(SubTopicProgressRecord::to_domain))
    }

    async fn confirm_sub_topic(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "INSERT INTO sub_topic_progress (session_id, sub_topic_id, confirmed, confirmed_at) \
             VALUES ($1, $2, TRUE, $3) \
             ON CONFLICT (session_id, sub_topic_id) DO UPDATE \
             SET confirmed = TRUE, confirmed_at = EXCLUDED.confirmed_at \
             WHERE sub_topic_progress.confirmed = FALSE",
        )
        .bind(session_id)
        .bind(sub_topic_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_explanation_served(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO sub_topic_progress (session_id, sub_topic_id, explanation_served_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (session_id, sub_topic_id) DO UPDATE \
             SET explanation_served_at = EXCLUDED.explanation_served_at",
        )
        .bind(session_id)
        .bind(sub_topic_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }
}

//=========================================================================================
// `GenerationCacheStore` Trait Implementation
//=========================================================================================

/// Inserts a fresh progress row unless one already exists.
async fn insert_topic_progress_if_absent<'e, E>(executor: E, progress: &TopicProgress) -> PortResult<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO topic_progress (session_id, topic_id, status, is_weak_point, \
         correct_count, wrong_count, questions, passed, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (session_id, topic_id) DO NOTHING",
    )
    .bind(progress.session_id)
    .bind(progress.topic_id)
    .bind(progress.status.as_str())
    .bind(progress.is_weak_point)
    .bind(progress.correct_count as i32)
    .bind(progress.wrong_count as i32)
    .bind(Json(&progress.questions))
    .bind(progress.passed)
    .bind(progress.completed_at)
    .execute(executor)
    .await
    .map_err(unexpected)?;
    Ok(())
}

#[async_trait]
impl GenerationCacheStore for DbAdapter {
    async fn get_cache_entry(&self, key: &CacheKey) -> PortResult<Option<CacheEntry>> {
        let record = sqlx::query_as::<_, CacheRecord>(
            "SELECT content, created_at FROM generation_cache WHERE kind = $1 AND key_id = $2",
        )
        .bind(key.kind())
        .bind(key.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(record.map(|r| CacheEntry {
            key: *key,
            content: r.content.0.into(),
            created_at: r.created_at,
        }))
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO generation_cache (kind, key_id, content, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (kind, key_id) DO UPDATE \
             SET content = EXCLUDED.content, created_at = EXCLUDED.created_at",
        )
        .bind(entry.key.kind())
        .bind(entry.key.id())
        .bind(Json(StoredContent::from(&entry.content)))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &CacheKey) -> PortResult<()> {
        sqlx::query("DELETE FROM generation_cache WHERE kind = $1 AND key_id = $2")
            .bind(key.kind())
            .bind(key.id())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }
}

//=========================================================================================
// `QuotaStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl QuotaStore for DbAdapter {
    async fn get_quota(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
    ) -> PortResult<Option<QuotaRecord>> {
        let record = sqlx::query_as::<_, QuotaRow>(
            "SELECT user_id, bucket, used, quota_limit, reset_at FROM quotas \
             WHERE user_id = $1 AND bucket = $2",
        )
        .bind(user_id)
        .bind(bucket.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(QuotaRow::to_domain).transpose()
    }

    async fn create_quota(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        limit: u32,
        reset_at: DateTime<Utc>,
    ) -> PortResult<QuotaRecord> {
        sqlx::query(
            "INSERT INTO quotas (user_id, bucket, used, quota_limit, reset_at) \
             VALUES ($1, $2, 0, $3, $4) ON CONFLICT (user_id, bucket) DO NOTHING",
        )
        .bind(user_id)
        .bind(bucket.as_str())
        .bind(limit as i32)
        .bind(reset_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        self.get_quota(user_id, bucket)
            .await?
            .ok_or_else(|| PortError::Unexpected("quota vanished after insert".to_string()))
    }

    async fn try_consume(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> PortResult<Option<QuotaRecord>> {
        // One conditional statement: the check and the increment cannot interleave.
        let record = sqlx::query_as::<_, QuotaRow>(
            "UPDATE quotas SET used = used + $3 \
             WHERE user_id = $1 AND bucket = $2 AND used + $3 <= quota_limit \
             RETURNING user_id, bucket, used, quota_limit, reset_at",
        )
        .bind(user_id)
        .bind(bucket.as_str())
        .bind(amount as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(QuotaRow::to_domain).transpose()
    }

    async fn refund(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> PortResult<QuotaRecord> {
        let record = sqlx::query_as::<_, QuotaRow>(
            "UPDATE quotas SET used = GREATEST(used - $3, 0) \
             WHERE user_id = $1 AND bucket = $2 \
             RETURNING user_id, bucket, used, quota_limit, reset_at",
        )
        .bind(user_id)
        .bind(bucket.as_str())
        .bind(amount as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        record
            .ok_or_else(|| {
                PortError::NotFound(format!("Quota {} for user {} not found", bucket, user_id))
            })?
            .to_domain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_encodings_round_trip() {
        for status in [SessionStatus::InProgress, SessionStatus::Paused, SessionStatus::Completed] {
            assert_eq!(parse_session_status(status.as_str()).unwrap(), status);
        }
        for phase in [Phase::Explaining, Phase::Confirming, Phase::Testing, Phase::Completed] {
            assert_eq!(parse_phase(phase.as_str()).unwrap(), phase);
        }
        assert!(parse_topic_status("DONE").is_err());
    }

    #[test]
    fn stored_content_is_tagged_json() {
        let stored = StoredContent::from(&CachedContent::Explanation("Layers".to_string()));
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["type"], "explanation");
        assert_eq!(json["text"], "Layers");

        let back: StoredContent = serde_json::from_value(json).unwrap();
        assert_eq!(
            CachedContent::from(back),
            CachedContent::Explanation("Layers".to_string())
        );
    }
}
