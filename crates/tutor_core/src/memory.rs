//! crates/tutor_core/src/memory.rs
//!
//! An in-memory implementation of every storage port. Each operation takes a
//! single lock, so it gives the same per-call atomicity the database adapter
//! gets from single-statement updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::{
    CacheEntry, CacheKey, LearningSession, Outline, ProgressChange, QuotaBucket, QuotaRecord,
    SubTopicProgress, TopicProgress,
};
use crate::ports::{
    GenerationCacheStore, LearningStore, OutlineProvider, PortError, PortResult, QuotaStore,
};

#[derive(Default)]
struct Tables {
    outlines: HashMap<Uuid, Outline>,
    sessions: HashMap<Uuid, LearningSession>,
    topic_progress: HashMap<(Uuid, Uuid), TopicProgress>,
    sub_topic_progress: HashMap<(Uuid, Uuid), SubTopicProgress>,
    cache: HashMap<CacheKey, CacheEntry>,
    quotas: HashMap<(Uuid, QuotaBucket), QuotaRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a document's outline as ready.
    pub fn insert_outline(&self, outline: Outline) {
        self.lock().outlines.insert(outline.document_id, outline);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OutlineProvider for InMemoryStore {
    async fn get_outline(&self, document_id: Uuid) -> PortResult<Option<Outline>> {
        Ok(self.lock().outlines.get(&document_id).cloned())
    }
}

#[async_trait]
impl LearningStore for InMemoryStore {
    async fn get_session(&self, session_id: Uuid) -> PortResult<LearningSession> {
        self.lock()
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))
    }

    async fn find_session(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> PortResult<Option<LearningSession>> {
        Ok(self
            .lock()
            .sessions
            .values()
            .find(|s| s.user_id == user_id && s.document_id == document_id)
            .cloned())
    }

    async fn create_session(&self, session: LearningSession) -> PortResult<LearningSession> {
        let mut tables = self.lock();
        if let Some(existing) = tables
            .sessions
            .values()
            .find(|s| s.user_id == session.user_id && s.document_id == session.document_id)
        {
            return Ok(existing.clone());
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn save_session(&self, session: &LearningSession) -> PortResult<()> {
        self.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
    ) -> PortResult<Option<TopicProgress>> {
        Ok(self
            .lock()
            .topic_progress
            .get(&(session_id, topic_id))
            .cloned())
    }

    async fn list_topic_progress(&self, session_id: Uuid) -> PortResult<Vec<TopicProgress>> {
        Ok(self
            .lock()
            .topic_progress
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn create_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
    ) -> PortResult<TopicProgress> {
        Ok(self
            .lock()
            .topic_progress
            .entry((session_id, topic_id))
            .or_insert_with(|| TopicProgress::new(session_id, topic_id))
            .clone())
    }

    async fn update_topic_progress(
        &self,
        session_id: Uuid,
        topic_id: Uuid,
        change: ProgressChange,
    ) -> PortResult<TopicProgress> {
        let mut tables = self.lock();
        let row = tables
            .topic_progress
            .entry((session_id, topic_id))
            .or_insert_with(|| TopicProgress::new(session_id, topic_id));
        let mut next = row.clone();
        next.apply(change)?;
        *row = next.clone();
        Ok(next)
    }

    async fn get_sub_topic_progress(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
    ) -> PortResult<Option<SubTopicProgress>> {
        Ok(self
            .lock()
            .sub_topic_progress
            .get(&(session_id, sub_topic_id))
            .cloned())
    }

    async fn confirm_sub_topic(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut tables = self.lock();
        let row = tables
            .sub_topic_progress
            .entry((session_id, sub_topic_id))
            .or_insert_with(|| blank_sub_topic_progress(session_id, sub_topic_id));
        if row.confirmed {
            return Ok(false);
        }
        row.confirmed = true;
        row.confirmed_at = Some(at);
        Ok(true)
    }

    async fn mark_explanation_served(
        &self,
        session_id: Uuid,
        sub_topic_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<()> {
        self.lock()
            .sub_topic_progress
            .entry((session_id, sub_topic_id))
            .or_insert_with(|| blank_sub_topic_progress(session_id, sub_topic_id))
            .explanation_served_at = Some(at);
        Ok(())
    }
}

fn blank_sub_topic_progress(session_id: Uuid, sub_topic_id: Uuid) -> SubTopicProgress {
    SubTopicProgress {
        session_id,
        sub_topic_id,
        confirmed: false,
        confirmed_at: None,
        explanation_served_at: None,
    }
}

#[async_trait]
impl GenerationCacheStore for InMemoryStore {
    async fn get_cache_entry(&self, key: &CacheKey) -> PortResult<Option<CacheEntry>> {
        Ok(self.lock().cache.get(key).cloned())
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> PortResult<()> {
        self.lock().cache.insert(entry.key, entry.clone());
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &CacheKey) -> PortResult<()> {
        self.lock().cache.remove(key);
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for InMemoryStore {
    async fn get_quota(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
    ) -> PortResult<Option<QuotaRecord>> {
        Ok(self.lock().quotas.get(&(user_id, bucket)).cloned())
    }

    async fn create_quota(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        limit: u32,
        reset_at: DateTime<Utc>,
    ) -> PortResult<QuotaRecord> {
        Ok(self
            .lock()
            .quotas
            .entry((user_id, bucket))
            .or_insert_with(|| QuotaRecord {
                user_id,
                bucket,
                used: 0,
                limit,
                reset_at,
            })
            .clone())
    }

    async fn try_consume(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> PortResult<Option<QuotaRecord>> {
        let mut tables = self.lock();
        let record = tables.quotas.get_mut(&(user_id, bucket)).ok_or_else(|| {
            PortError::NotFound(format!("Quota {} for user {} not found", bucket, user_id))
        })?;
        match record.used.checked_add(amount) {
            Some(next) if next <= record.limit => {
                record.used = next;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn refund(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> PortResult<QuotaRecord> {
        let mut tables = self.lock();
        let record = tables.quotas.get_mut(&(user_id, bucket)).ok_or_else(|| {
            PortError::NotFound(format!("Quota {} for user {} not found", bucket, user_id))
        })?;
        record.used = record.used.saturating_sub(amount);
        Ok(record.clone())
    }
}
