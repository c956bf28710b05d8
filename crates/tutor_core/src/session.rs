//! crates/tutor_core/src/session.rs
//!
//! The learning session engine. Each public method is one short unit of work
//! against the persisted session: load the authoritative row, check the
//! requested event against the phase machine, satisfy it through the
//! generation cache when content is needed, and write the new state back.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{GenerationCache, QuotaCharge};
use crate::domain::{
    CacheKey, CachedContent, LearningSession, Outline, Phase, ProgressChange, QuestionOutcome,
    QuotaBucket, Quiz, SessionStatus, TopicGroup, TopicProgress, TopicStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::machine::{transition, SessionEvent, SessionState};
use crate::ports::{
    ContentGenerator, GenerationCacheStore, GenerationContext, LearningStore, OutlineProvider,
    PortError, PortResult, QuotaStore,
};
use crate::quiz::{evaluate, validate_quiz};
use crate::quota::{QuotaLedger, QuotaLimits, QuotaStatus};

/// Receives explanation text chunk by chunk while it is generated. Sending
/// never waits on the receiver, so a slow reader cannot hold up generation.
pub type ChunkSink = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub quota_limits: QuotaLimits,
    pub generation_timeout: Duration,
}

//=========================================================================================
// Views returned to callers
//=========================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TopicSummary {
    pub topic_id: Uuid,
    pub index: usize,
    pub title: String,
    pub status: TopicStatus,
    pub is_weak_point: bool,
    pub correct_count: u32,
    pub wrong_count: u32,
    pub passed: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub status: SessionStatus,
    pub phase: Phase,
    pub current_topic_index: usize,
    pub current_sub_index: usize,
    pub current_topic_id: Option<Uuid>,
    pub current_sub_topic_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub topics: Vec<TopicSummary>,
}

/// A quiz question as shown to the learner: no answer key.
#[derive(Debug, Clone, Serialize)]
pub struct QuizQuestionView {
    pub index: usize,
    pub text: String,
    pub options: Vec<String>,
    pub attempts: u32,
    pub skippable: bool,
    pub outcome: Option<QuestionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuizView {
    pub topic_id: Uuid,
    pub questions: Vec<QuizQuestionView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub correct: bool,
    pub attempts: u32,
    pub skippable: bool,
    pub outcome: Option<QuestionOutcome>,
    /// Revealed once the question is resolved.
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicCompletion {
    pub passed: bool,
    pub correct: usize,
    pub snapshot: SessionSnapshot,
}

#[derive(Debug, Clone)]
pub struct ExplanationServed {
    pub sub_topic_id: Uuid,
    pub text: String,
    pub from_cache: bool,
}

//=========================================================================================
// The Engine
//=========================================================================================

pub struct LearningEngine {
    store: Arc<dyn LearningStore>,
    outlines: Arc<dyn OutlineProvider>,
    generator: Arc<dyn ContentGenerator>,
    ledger: Arc<QuotaLedger>,
    cache: GenerationCache,
}

impl LearningEngine {
    pub fn new(
        store: Arc<dyn LearningStore>,
        outlines: Arc<dyn OutlineProvider>,
        cache_store: Arc<dyn GenerationCacheStore>,
        quota_store: Arc<dyn QuotaStore>,
        generator: Arc<dyn ContentGenerator>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(QuotaLedger::new(quota_store, config.quota_limits));
        let cache = GenerationCache::new(cache_store, ledger.clone(), config.generation_timeout);
        Self {
            store,
            outlines,
            generator,
            ledger,
            cache,
        }
    }

    /// Starts the learning session for (user, document), or returns the
    /// existing one with its stored position. This is how a second device
    /// resumes: the server's position is authoritative.
    pub async fn start(&self, user_id: Uuid, document_id: Uuid) -> EngineResult<SessionSnapshot> {
        let outline = self.ready_outline(document_id).await?;

        if let Some(mut existing) = self.store.find_session(user_id, document_id).await? {
            self.resume_if_paused(&mut existing).await?;
            debug!(session_id = %existing.id, "Resuming learning session");
            return self.snapshot_of(&existing, &outline).await;
        }

        let session = self
            .store
            .create_session(LearningSession::new(user_id, document_id, Utc::now()))
            .await?;
        self.topic_progress(session.id, &outline.topics[0]).await?;
        info!(session_id = %session.id, document_id = %document_id, "Learning session started");
        self.snapshot_of(&session, &outline).await
    }

    pub async fn snapshot(&self, user_id: Uuid, session_id: Uuid) -> EngineResult<SessionSnapshot> {
        let (session, outline) = self.load(user_id, session_id).await?;
        self.snapshot_of(&session, &outline).await
    }

    pub async fn pause(&self, user_id: Uuid, session_id: Uuid) -> EngineResult<SessionSnapshot> {
        let (mut session, outline) = self.load(user_id, session_id).await?;
        if session.is_completed() {
            return Err(EngineError::InvalidTransition(
                "a completed session cannot be paused".to_string(),
            ));
        }
        if session.status != SessionStatus::Paused {
            session.status = SessionStatus::Paused;
            session.last_active_at = Utc::now();
            self.store.save_session(&session).await?;
            info!(session_id = %session.id, "Learning session paused");
        }
        self.snapshot_of(&session, &outline).await
    }

    pub async fn quota(&self, user_id: Uuid, bucket: QuotaBucket) -> EngineResult<QuotaStatus> {
        self.ledger.check(user_id, bucket).await
    }

    //-------------------------------------------------------------------------------------
    // Explaining
    //-------------------------------------------------------------------------------------

    /// Serves the explanation of the current sub-topic, generating it on a
    /// cache miss. Chunks are pushed to `sink` as they arrive; a cached
    /// explanation is pushed as a single chunk. The phase is not changed.
    pub async fn request_explanation(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        sub_topic_id: Uuid,
        sink: Option<ChunkSink>,
    ) -> EngineResult<ExplanationServed> {
        self.explain(user_id, session_id, sub_topic_id, sink, false)
            .await
    }

    /// Like `request_explanation`, but discards the cached explanation and
    /// generates a new one, charging quota again.
    pub async fn reexplain(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        sub_topic_id: Uuid,
        sink: Option<ChunkSink>,
    ) -> EngineResult<ExplanationServed> {
        self.explain(user_id, session_id, sub_topic_id, sink, true)
            .await
    }

    async fn explain(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        sub_topic_id: Uuid,
        sink: Option<ChunkSink>,
        regenerate: bool,
    ) -> EngineResult<ExplanationServed> {
        let (mut session, outline) = self.load(user_id, session_id).await?;
        let position = match SessionState::of(&session) {
            SessionState::Explaining(p) => p,
            state => {
                return Err(EngineError::InvalidTransition(format!(
                    "explanations are only served while explaining, session is {:?}",
                    state.phase()
                )))
            }
        };
        self.expect_current_sub_topic(&session, &outline, sub_topic_id)?;
        self.resume_if_paused(&mut session).await?;

        let context = generation_context(&session, &outline.topics[position.topic], Some(position.sub));
        let key = CacheKey::Explanation(sub_topic_id);
        let charge = QuotaCharge::one(user_id, &key);
        let generator = self.generator.clone();
        let stream_sink = sink.clone();
        let produce = move || collect_explanation(generator, context, stream_sink);

        let generated = if regenerate {
            self.cache.regenerate(key, charge, produce).await?
        } else {
            self.cache.get_or_generate(key, charge, produce).await?
        };

        let text = match generated.entry.content {
            CachedContent::Explanation(text) => text,
            CachedContent::Quiz(_) => {
                return Err(EngineError::GenerationFailed(format!(
                    "cache entry {} does not hold an explanation",
                    key
                )))
            }
        };
        if generated.from_cache {
            if let Some(sink) = &sink {
                // The listener may already be gone; nothing to do then.
                let _ = sink.send(text.clone());
            }
        }

        self.store
            .mark_explanation_served(session.id, sub_topic_id, Utc::now())
            .await?;

        Ok(ExplanationServed {
            sub_topic_id,
            text,
            from_cache: generated.from_cache,
        })
    }

    //-------------------------------------------------------------------------------------
    // Confirming
    //-------------------------------------------------------------------------------------

    /// Confirms the current sub-topic. Advances to the next sub-topic, or,
    /// after the last one, prepares the topic quiz and enters testing.
    ///
    /// Confirming a sub-topic that is already confirmed is a no-op. While the
    /// session waits in `Confirming` (quiz preparation failed), confirming
    /// the last sub-topic again retries the preparation.
    pub async fn confirm(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        sub_topic_id: Uuid,
    ) -> EngineResult<SessionSnapshot> {
        let (mut session, outline) = self.load(user_id, session_id).await?;
        let state = SessionState::of(&session);
        let is_current = self
            .expect_current_sub_topic(&session, &outline, sub_topic_id)
            .is_ok();

        match state {
            SessionState::Explaining(_) if is_current => {
                let newly = self
                    .store
                    .confirm_sub_topic(session.id, sub_topic_id, Utc::now())
                    .await?;
                if !newly {
                    // A concurrent confirm got here first; report where it left us.
                    let (session, outline) = self.load(user_id, session_id).await?;
                    return self.snapshot_of(&session, &outline).await;
                }

                let next = transition(state, SessionEvent::SubTopicConfirmed, &outline)?;
                next.apply_to(&mut session, Utc::now());
                self.store.save_session(&session).await?;
                debug!(session_id = %session.id, phase = ?next.phase(), "Sub-topic confirmed");

                if let SessionState::Confirming(_) = next {
                    self.prepare_quiz(&mut session, &outline).await?;
                }
                self.snapshot_of(&session, &outline).await
            }
            SessionState::Confirming(_) if is_current => {
                self.prepare_quiz(&mut session, &outline).await?;
                self.snapshot_of(&session, &outline).await
            }
            _ => {
                let already = self
                    .store
                    .get_sub_topic_progress(session.id, sub_topic_id)
                    .await?
                    .map(|p| p.confirmed)
                    .unwrap_or(false);
                if already {
                    self.snapshot_of(&session, &outline).await
                } else {
                    Err(EngineError::InvalidTransition(format!(
                        "sub-topic {} is not the current sub-topic",
                        sub_topic_id
                    )))
                }
            }
        }
    }

    async fn prepare_quiz(&self, session: &mut LearningSession, outline: &Outline) -> EngineResult<()> {
        let state = SessionState::of(session);
        let topic = &outline.topics[state.position().topic];
        self.load_quiz(session, topic).await?;

        let next = transition(state, SessionEvent::QuizReady, outline)?;
        next.apply_to(session, Utc::now());
        self.store.save_session(session).await?;
        info!(session_id = %session.id, topic_id = %topic.id, "Topic quiz ready");
        Ok(())
    }

    /// Reads the topic quiz from the cache, generating it on a miss.
    async fn load_quiz(&self, session: &LearningSession, topic: &TopicGroup) -> EngineResult<Quiz> {
        let key = CacheKey::Quiz(topic.id);
        let context = generation_context(session, topic, None);
        let generator = self.generator.clone();
        let topic_id = topic.id;

        let generated = self
            .cache
            .get_or_generate(key, QuotaCharge::one(session.user_id, &key), move || async move {
                let mut quiz = generator.generate_quiz(&context).await?;
                quiz.topic_id = topic_id;
                validate_quiz(&quiz)
                    .map_err(|reason| PortError::Unexpected(format!("malformed quiz: {}", reason)))?;
                Ok(CachedContent::Quiz(quiz))
            })
            .await?;

        match generated.entry.content {
            CachedContent::Quiz(quiz) => Ok(quiz),
            CachedContent::Explanation(_) => Err(EngineError::GenerationFailed(format!(
                "cache entry {} does not hold a quiz",
                key
            ))),
        }
    }

    //-------------------------------------------------------------------------------------
    // Testing
    //-------------------------------------------------------------------------------------

    pub async fn quiz(&self, user_id: Uuid, session_id: Uuid) -> EngineResult<QuizView> {
        let (session, outline) = self.load(user_id, session_id).await?;
        let topic = self.testing_topic(&session, &outline)?;
        let quiz = self.load_quiz(&session, topic).await?;
        let progress = self.topic_progress(session.id, topic).await?;

        let questions = quiz
            .questions
            .into_iter()
            .enumerate()
            .map(|(index, question)| {
                let state = progress.questions.get(index).cloned().unwrap_or_default();
                QuizQuestionView {
                    index,
                    text: question.text,
                    options: question.options,
                    attempts: state.attempts,
                    skippable: state.is_skippable(),
                    outcome: state.outcome,
                }
            })
            .collect();

        Ok(QuizView {
            topic_id: topic.id,
            questions,
        })
    }

    /// Grades one answer. A wrong answer is a normal outcome, not an error.
    pub async fn submit_answer(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        question_index: usize,
        selected: &[u8],
    ) -> EngineResult<AnswerResult> {
        let (mut session, outline) = self.load(user_id, session_id).await?;
        let topic = self.testing_topic(&session, &outline)?;
        let quiz = self.load_quiz(&session, topic).await?;
        let question = quiz.questions.get(question_index).ok_or_else(|| {
            EngineError::InvalidAnswer(format!("question index {} does not exist", question_index))
        })?;
        let correct = evaluate(question, selected)?;

        let progress = self
            .store
            .update_topic_progress(
                session.id,
                topic.id,
                ProgressChange::Answer {
                    question_index,
                    correct,
                },
            )
            .await?;
        let state = progress
            .questions
            .get(question_index)
            .cloned()
            .unwrap_or_default();
        self.resume_if_paused(&mut session).await?;
        debug!(
            session_id = %session.id,
            question_index,
            correct,
            attempts = state.attempts,
            weak_point = progress.is_weak_point,
            "Answer graded"
        );

        Ok(AnswerResult {
            correct,
            attempts: state.attempts,
            skippable: state.is_skippable(),
            outcome: state.outcome,
            explanation: state.outcome.map(|_| question.explanation.clone()),
        })
    }

    /// Gives up on a question after it used up its attempts. Scored as wrong.
    pub async fn skip(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        question_index: usize,
    ) -> EngineResult<SessionSnapshot> {
        let (mut session, outline) = self.load(user_id, session_id).await?;
        let topic = self.testing_topic(&session, &outline)?;
        self.store
            .update_topic_progress(session.id, topic.id, ProgressChange::Skip { question_index })
            .await?;
        self.resume_if_paused(&mut session).await?;
        self.snapshot_of(&session, &outline).await
    }

    /// Closes the current topic once every question is resolved and moves to
    /// the next topic, or completes the session after the last one. The topic
    /// is completed whether or not the quiz was passed.
    pub async fn complete_topic(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> EngineResult<TopicCompletion> {
        let (mut session, outline) = self.load(user_id, session_id).await?;
        let state = SessionState::of(&session);
        let topic = self.testing_topic(&session, &outline)?;

        // Only one caller can complete the row; a second one is rejected here
        // before it can advance the session again.
        let now = Utc::now();
        let progress = self
            .store
            .update_topic_progress(session.id, topic.id, ProgressChange::Complete { at: now })
            .await?;
        let correct = progress.correct_outcomes();
        let passed = progress.passed.unwrap_or(false);

        let next = transition(state, SessionEvent::TopicCompleted, &outline)?;
        if let SessionState::Explaining(p) = next {
            self.topic_progress(session.id, &outline.topics[p.topic]).await?;
        }
        next.apply_to(&mut session, now);
        self.store.save_session(&session).await?;
        info!(
            session_id = %session.id,
            topic_id = %topic.id,
            passed,
            correct,
            completed = session.is_completed(),
            "Topic completed"
        );

        Ok(TopicCompletion {
            passed,
            correct,
            snapshot: self.snapshot_of(&session, &outline).await?,
        })
    }

    //-------------------------------------------------------------------------------------
    // Helpers
    //-------------------------------------------------------------------------------------

    async fn ready_outline(&self, document_id: Uuid) -> EngineResult<Outline> {
        match self.outlines.get_outline(document_id).await? {
            Some(outline) if outline.is_walkable() => Ok(outline),
            Some(_) => {
                warn!(document_id = %document_id, "Outline is ready but has an empty topic");
                Err(EngineError::StructureNotReady(document_id))
            }
            None => Err(EngineError::StructureNotReady(document_id)),
        }
    }

    /// Loads the authoritative session row and its outline, checking ownership.
    async fn load(&self, user_id: Uuid, session_id: Uuid) -> EngineResult<(LearningSession, Outline)> {
        let session = match self.store.get_session(session_id).await {
            Ok(session) => session,
            Err(PortError::NotFound(_)) => return Err(EngineError::SessionNotFound(session_id)),
            Err(e) => return Err(e.into()),
        };
        if session.user_id != user_id {
            warn!(session_id = %session_id, user_id = %user_id, "Session accessed by another user");
            return Err(EngineError::Forbidden(session_id));
        }
        let outline = self.ready_outline(session.document_id).await?;
        Ok((session, outline))
    }

    fn expect_current_sub_topic(
        &self,
        session: &LearningSession,
        outline: &Outline,
        sub_topic_id: Uuid,
    ) -> EngineResult<()> {
        let current = outline
            .sub_topic(session.current_topic_index, session.current_sub_index)
            .ok_or_else(|| {
                EngineError::InvalidTransition("session position is outside the outline".to_string())
            })?;
        if current.id != sub_topic_id {
            return Err(EngineError::InvalidTransition(format!(
                "sub-topic {} is not the current sub-topic {}",
                sub_topic_id, current.id
            )));
        }
        Ok(())
    }

    fn testing_topic<'a>(
        &self,
        session: &LearningSession,
        outline: &'a Outline,
    ) -> EngineResult<&'a TopicGroup> {
        match SessionState::of(session) {
            SessionState::Testing(p) => outline.topic(p.topic).ok_or_else(|| {
                EngineError::InvalidTransition("session position is outside the outline".to_string())
            }),
            state => Err(EngineError::InvalidTransition(format!(
                "the quiz is only available while testing, session is {:?}",
                state.phase()
            ))),
        }
    }

    /// Fetches the topic's progress row, creating it on first contact.
    async fn topic_progress(&self, session_id: Uuid, topic: &TopicGroup) -> EngineResult<TopicProgress> {
        if let Some(progress) = self.store.get_topic_progress(session_id, topic.id).await? {
            return Ok(progress);
        }
        Ok(self.store.create_topic_progress(session_id, topic.id).await?)
    }

    async fn resume_if_paused(&self, session: &mut LearningSession) -> EngineResult<()> {
        if session.status == SessionStatus::Paused {
            session.status = SessionStatus::InProgress;
            session.last_active_at = Utc::now();
            self.store.save_session(session).await?;
        }
        Ok(())
    }

    async fn snapshot_of(
        &self,
        session: &LearningSession,
        outline: &Outline,
    ) -> EngineResult<SessionSnapshot> {
        let progress = self.store.list_topic_progress(session.id).await?;
        let topics = outline
            .topics
            .iter()
            .map(|topic| match progress.iter().find(|p| p.topic_id == topic.id) {
                Some(p) => TopicSummary {
                    topic_id: topic.id,
                    index: topic.index,
                    title: topic.title.clone(),
                    status: p.status,
                    is_weak_point: p.is_weak_point,
                    correct_count: p.correct_count,
                    wrong_count: p.wrong_count,
                    passed: p.passed,
                },
                None => TopicSummary {
                    topic_id: topic.id,
                    index: topic.index,
                    title: topic.title.clone(),
                    status: TopicStatus::Pending,
                    is_weak_point: false,
                    correct_count: 0,
                    wrong_count: 0,
                    passed: None,
                },
            })
            .collect();

        Ok(SessionSnapshot {
            session_id: session.id,
            document_id: session.document_id,
            status: session.status,
            phase: session.current_phase,
            current_topic_index: session.current_topic_index,
            current_sub_index: session.current_sub_index,
            current_topic_id: outline.topic(session.current_topic_index).map(|t| t.id),
            current_sub_topic_id: outline
                .sub_topic(session.current_topic_index, session.current_sub_index)
                .map(|s| s.id),
            started_at: session.started_at,
            last_active_at: session.last_active_at,
            completed_at: session.completed_at,
            topics,
        })
    }
}

fn generation_context(
    session: &LearningSession,
    topic: &TopicGroup,
    sub_index: Option<usize>,
) -> GenerationContext {
    let sub_topic = sub_index.and_then(|i| topic.sub_topics.get(i));
    GenerationContext {
        session_id: session.id,
        document_id: session.document_id,
        topic_id: topic.id,
        topic_title: topic.title.clone(),
        sub_topic_id: sub_topic.map(|s| s.id),
        sub_topic_title: sub_topic.map(|s| s.title.clone()),
        sub_topic_titles: topic.sub_topics.iter().map(|s| s.title.clone()).collect(),
    }
}

/// Drains the generator's stream into one text, forwarding each chunk to the
/// sink while someone is listening. A departed listener does not stop the
/// generation; the full text still reaches the cache.
async fn collect_explanation(
    generator: Arc<dyn ContentGenerator>,
    context: GenerationContext,
    sink: Option<ChunkSink>,
) -> PortResult<CachedContent> {
    let mut stream = generator.generate_explanation(&context).await?;
    let mut sink = sink;
    let mut text = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(tx) = &sink {
            if tx.send(chunk.clone()).is_err() {
                debug!(session_id = %context.session_id, "Explanation listener disconnected");
                sink = None;
            }
        }
        text.push_str(&chunk);
    }

    if text.trim().is_empty() {
        return Err(PortError::Unexpected("generator returned an empty explanation".to_string()));
    }
    Ok(CachedContent::Explanation(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QuizQuestion, SubTopic, SubTopicProgress};
    use crate::memory::InMemoryStore;
    use crate::ports::TextStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Every quiz question's answer key is {0, 1}.
    #[derive(Default)]
    struct ScriptedGenerator {
        explanation_calls: AtomicUsize,
        quiz_calls: AtomicUsize,
        fail_quiz: AtomicBool,
        long_explanation: AtomicBool,
    }

    const LONG_EXPLANATION_CHUNKS: usize = 500;

    #[async_trait]
    impl ContentGenerator for ScriptedGenerator {
        async fn generate_explanation(&self, context: &GenerationContext) -> PortResult<TextStream> {
            self.explanation_calls.fetch_add(1, Ordering::SeqCst);
            let title = context.sub_topic_title.clone().unwrap_or_default();
            let chunks: Vec<PortResult<String>> = if self.long_explanation.load(Ordering::SeqCst) {
                (0..LONG_EXPLANATION_CHUNKS)
                    .map(|i| Ok(format!("Part {} of {}. ", i, title)))
                    .collect()
            } else {
                vec![
                    Ok(format!("Layer 1 of {}. ", title)),
                    Ok("Layer 2. ".to_string()),
                    Ok("Layer 3.".to_string()),
                ]
            };
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        async fn generate_quiz(&self, context: &GenerationContext) -> PortResult<Quiz> {
            self.quiz_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_quiz.load(Ordering::SeqCst) {
                return Err(PortError::Unexpected("quiz model unavailable".to_string()));
            }
            let question = QuizQuestion {
                text: format!("About {}?", context.topic_title),
                options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                correct_indices: vec![0, 1],
                explanation: "a and b hold.".to_string(),
            };
            Ok(Quiz {
                topic_id: Uuid::nil(),
                questions: vec![question.clone(), question.clone(), question],
            })
        }
    }

    /// Delays every session read so that concurrent requests all load the
    /// same state before any of them writes.
    struct SlowSessionReads {
        inner: Arc<InMemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl LearningStore for SlowSessionReads {
        async fn get_session(&self, session_id: Uuid) -> PortResult<LearningSession> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_session(session_id).await
        }

        async fn find_session(
            &self,
            user_id: Uuid,
            document_id: Uuid,
        ) -> PortResult<Option<LearningSession>> {
            self.inner.find_session(user_id, document_id).await
        }

        async fn create_session(&self, session: LearningSession) -> PortResult<LearningSession> {
            self.inner.create_session(session).await
        }

        async fn save_session(&self, session: &LearningSession) -> PortResult<()> {
            self.inner.save_session(session).await
        }

        async fn get_topic_progress(
            &self,
            session_id: Uuid,
            topic_id: Uuid,
        ) -> PortResult<Option<TopicProgress>> {
            self.inner.get_topic_progress(session_id, topic_id).await
        }

        async fn list_topic_progress(&self, session_id: Uuid) -> PortResult<Vec<TopicProgress>> {
            self.inner.list_topic_progress(session_id).await
        }

        async fn create_topic_progress(
            &self,
            session_id: Uuid,
            topic_id: Uuid,
        ) -> PortResult<TopicProgress> {
            self.inner.create_topic_progress(session_id, topic_id).await
        }

        async fn update_topic_progress(
            &self,
            session_id: Uuid,
            topic_id: Uuid,
            change: ProgressChange,
        ) -> PortResult<TopicProgress> {
            self.inner
                .update_topic_progress(session_id, topic_id, change)
                .await
        }

        async fn get_sub_topic_progress(
            &self,
            session_id: Uuid,
            sub_topic_id: Uuid,
        ) -> PortResult<Option<SubTopicProgress>> {
            self.inner.get_sub_topic_progress(session_id, sub_topic_id).await
        }

        async fn confirm_sub_topic(
            &self,
            session_id: Uuid,
            sub_topic_id: Uuid,
            at: DateTime<Utc>,
        ) -> PortResult<bool> {
            self.inner.confirm_sub_topic(session_id, sub_topic_id, at).await
        }

        async fn mark_explanation_served(
            &self,
            session_id: Uuid,
            sub_topic_id: Uuid,
            at: DateTime<Utc>,
        ) -> PortResult<()> {
            self.inner
                .mark_explanation_served(session_id, sub_topic_id, at)
                .await
        }
    }

    struct Harness {
        engine: Arc<LearningEngine>,
        store: Arc<InMemoryStore>,
        generator: Arc<ScriptedGenerator>,
        outline: Outline,
        user_id: Uuid,
    }

    fn harness(shape: &[usize], quota: u32) -> Harness {
        build_harness(shape, quota, None)
    }

    /// A harness whose session reads lag, for racing requests against each other.
    fn slow_harness(shape: &[usize], quota: u32) -> Harness {
        build_harness(shape, quota, Some(Duration::from_millis(50)))
    }

    fn build_harness(shape: &[usize], quota: u32, read_delay: Option<Duration>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let generator = Arc::new(ScriptedGenerator::default());
        let outline = Outline {
            document_id: Uuid::new_v4(),
            topics: shape
                .iter()
                .enumerate()
                .map(|(t, &subs)| TopicGroup {
                    id: Uuid::new_v4(),
                    index: t,
                    title: format!("Topic {}", t),
                    sub_topics: (0..subs)
                        .map(|s| SubTopic {
                            id: Uuid::new_v4(),
                            index: s,
                            title: format!("Sub {}.{}", t, s),
                        })
                        .collect(),
                })
                .collect(),
        };
        store.insert_outline(outline.clone());

        let learning_store: Arc<dyn LearningStore> = match read_delay {
            Some(delay) => Arc::new(SlowSessionReads {
                inner: store.clone(),
                delay,
            }),
            None => store.clone(),
        };
        let engine = Arc::new(LearningEngine::new(
            learning_store,
            store.clone(),
            store.clone(),
            store.clone(),
            generator.clone(),
            EngineConfig {
                quota_limits: QuotaLimits {
                    explanation: quota,
                    quiz: quota,
                },
                generation_timeout: Duration::from_secs(5),
            },
        ));
        Harness {
            engine,
            store,
            generator,
            outline,
            user_id: Uuid::new_v4(),
        }
    }

    impl Harness {
        fn sub(&self, topic: usize, sub: usize) -> Uuid {
            self.outline.topics[topic].sub_topics[sub].id
        }

        async fn start(&self) -> SessionSnapshot {
            self.engine
                .start(self.user_id, self.outline.document_id)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn start_requires_a_ready_outline() {
        let h = harness(&[1], 10);
        let err = h.engine.start(h.user_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::StructureNotReady(_)));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_resumes_position() {
        let h = harness(&[2], 10);
        let first = h.start().await;
        assert_eq!((first.current_topic_index, first.current_sub_index), (0, 0));
        assert_eq!(first.phase, Phase::Explaining);
        assert_eq!(first.topics[0].status, TopicStatus::InProgress);

        h.engine
            .confirm(h.user_id, first.session_id, h.sub(0, 0))
            .await
            .unwrap();
        h.engine.pause(h.user_id, first.session_id).await.unwrap();

        let resumed = h.start().await;
        assert_eq!(resumed.session_id, first.session_id);
        assert_eq!((resumed.current_topic_index, resumed.current_sub_index), (0, 1));
        assert_eq!(resumed.status, SessionStatus::InProgress);
    }

    #[tokio::test]
    async fn two_topic_walkthrough_completes_the_session() {
        let h = harness(&[1, 1], 10);
        let session_id = h.start().await.session_id;

        for topic in 0..2 {
            let snapshot = h
                .engine
                .confirm(h.user_id, session_id, h.sub(topic, 0))
                .await
                .unwrap();
            assert_eq!(snapshot.phase, Phase::Testing);

            assert!(h.engine.submit_answer(h.user_id, session_id, 0, &[1, 0]).await.unwrap().correct);
            assert!(h.engine.submit_answer(h.user_id, session_id, 1, &[0, 1]).await.unwrap().correct);
            for _ in 0..3 {
                let wrong = h.engine.submit_answer(h.user_id, session_id, 2, &[0]).await.unwrap();
                assert!(!wrong.correct);
            }
            h.engine.skip(h.user_id, session_id, 2).await.unwrap();

            let completion = h.engine.complete_topic(h.user_id, session_id).await.unwrap();
            assert!(completion.passed);
            assert_eq!(completion.correct, 2);
            assert_eq!(completion.snapshot.topics[topic].status, TopicStatus::Completed);

            if topic == 0 {
                assert_eq!(completion.snapshot.phase, Phase::Explaining);
                assert_eq!(
                    (completion.snapshot.current_topic_index, completion.snapshot.current_sub_index),
                    (1, 0)
                );
            } else {
                assert_eq!(completion.snapshot.status, SessionStatus::Completed);
                assert_eq!(completion.snapshot.phase, Phase::Completed);
                assert_eq!(completion.snapshot.current_sub_topic_id, Some(h.sub(1, 0)));
            }
        }
    }

    #[tokio::test]
    async fn explanation_is_charged_once_until_reexplained() {
        let h = harness(&[1], 10);
        let session_id = h.start().await.session_id;

        let first = h
            .engine
            .request_explanation(h.user_id, session_id, h.sub(0, 0), None)
            .await
            .unwrap();
        let second = h
            .engine
            .request_explanation(h.user_id, session_id, h.sub(0, 0), None)
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.text, second.text);
        assert_eq!(h.generator.explanation_calls.load(Ordering::SeqCst), 1);
        let quota = h.engine.quota(h.user_id, QuotaBucket::Explanation).await.unwrap();
        assert_eq!(quota.used, 1);

        h.engine
            .reexplain(h.user_id, session_id, h.sub(0, 0), None)
            .await
            .unwrap();
        assert_eq!(h.generator.explanation_calls.load(Ordering::SeqCst), 2);
        let quota = h.engine.quota(h.user_id, QuotaBucket::Explanation).await.unwrap();
        assert_eq!(quota.used, 2);

        let served = h
            .store
            .get_sub_topic_progress(session_id, h.sub(0, 0))
            .await
            .unwrap()
            .unwrap();
        assert!(served.explanation_served_at.is_some());
        assert!(!served.confirmed);
    }

    #[tokio::test]
    async fn explanation_streams_chunks_and_caches_after_disconnect() {
        let h = harness(&[1], 10);
        let session_id = h.start().await.session_id;

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let served = h
            .engine
            .request_explanation(h.user_id, session_id, h.sub(0, 0), Some(tx))
            .await
            .unwrap();
        assert!(served.text.starts_with("Layer 1 of Sub 0.0"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.engine
            .request_explanation(h.user_id, session_id, h.sub(0, 0), Some(tx))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(served.text));
        assert_eq!(h.generator.explanation_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unread_sink_does_not_hold_up_generation() {
        let h = harness(&[1], 10);
        let session_id = h.start().await.session_id;
        h.generator.long_explanation.store(true, Ordering::SeqCst);

        // The receiver stays open but is not read until generation is over.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let served = tokio::time::timeout(
            Duration::from_secs(2),
            h.engine
                .request_explanation(h.user_id, session_id, h.sub(0, 0), Some(tx)),
        )
        .await
        .expect("generation waited on the reader")
        .unwrap();
        assert!(!served.from_cache);

        let mut relayed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            relayed.push_str(&chunk);
        }
        assert_eq!(relayed, served.text);
        assert!(relayed.starts_with("Part 0 of Sub 0.0"));
        assert!(relayed.contains(&format!("Part {} of", LONG_EXPLANATION_CHUNKS - 1)));
    }

    #[tokio::test]
    async fn stale_sub_topic_is_rejected() {
        let h = harness(&[2], 10);
        let session_id = h.start().await.session_id;

        let err = h
            .engine
            .request_explanation(h.user_id, session_id, h.sub(0, 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        let err = h
            .engine
            .confirm(h.user_id, session_id, h.sub(0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn repeated_confirm_is_a_no_op() {
        let h = harness(&[3], 10);
        let session_id = h.start().await.session_id;

        let first = h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();
        let again = h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();
        assert_eq!(first.current_sub_index, 1);
        assert_eq!(again.current_sub_index, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_confirms_advance_once() {
        let h = slow_harness(&[2, 1], 10);
        let session_id = h.start().await.session_id;

        let confirm_all = |sub_topic_id: Uuid| {
            (0..4)
                .map(|_| {
                    let engine = h.engine.clone();
                    let user_id = h.user_id;
                    tokio::spawn(async move { engine.confirm(user_id, session_id, sub_topic_id).await })
                })
                .collect::<Vec<_>>()
        };

        for confirm in confirm_all(h.sub(0, 0)) {
            confirm.await.unwrap().unwrap();
        }
        let snapshot = h.engine.snapshot(h.user_id, session_id).await.unwrap();
        assert_eq!((snapshot.current_topic_index, snapshot.current_sub_index), (0, 1));
        assert_eq!(snapshot.phase, Phase::Explaining);

        // Confirming the last sub-topic also prepares the topic quiz.
        for confirm in confirm_all(h.sub(0, 1)) {
            confirm.await.unwrap().unwrap();
        }
        let snapshot = h.engine.snapshot(h.user_id, session_id).await.unwrap();
        assert_eq!((snapshot.current_topic_index, snapshot.current_sub_index), (0, 1));
        assert_eq!(snapshot.phase, Phase::Testing);
        assert_eq!(h.generator.quiz_calls.load(Ordering::SeqCst), 1);
        let quota = h.engine.quota(h.user_id, QuotaBucket::Quiz).await.unwrap();
        assert_eq!(quota.used, 1);
    }

    #[tokio::test]
    async fn quiz_quota_exhaustion_leaves_session_confirming_until_retry() {
        let h = harness(&[1], 1);
        let session_id = h.start().await.session_id;
        h.store
            .create_quota(h.user_id, QuotaBucket::Quiz, 0, Utc::now())
            .await
            .unwrap();

        let err = h
            .engine
            .confirm(h.user_id, session_id, h.sub(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded { bucket: QuotaBucket::Quiz, .. }));
        assert_eq!(h.generator.quiz_calls.load(Ordering::SeqCst), 0);

        let snapshot = h.engine.snapshot(h.user_id, session_id).await.unwrap();
        assert_eq!(snapshot.phase, Phase::Confirming);
    }

    #[tokio::test]
    async fn failed_quiz_generation_is_refunded_and_retryable() {
        let h = harness(&[1], 5);
        let session_id = h.start().await.session_id;
        h.generator.fail_quiz.store(true, Ordering::SeqCst);

        let err = h
            .engine
            .confirm(h.user_id, session_id, h.sub(0, 0))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let quota = h.engine.quota(h.user_id, QuotaBucket::Quiz).await.unwrap();
        assert_eq!(quota.used, 0);

        h.generator.fail_quiz.store(false, Ordering::SeqCst);
        let snapshot = h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();
        assert_eq!(snapshot.phase, Phase::Testing);
        let quota = h.engine.quota(h.user_id, QuotaBucket::Quiz).await.unwrap();
        assert_eq!(quota.used, 1);
    }

    #[tokio::test]
    async fn quiz_is_generated_once_per_topic() {
        let h = harness(&[1], 5);
        let session_id = h.start().await.session_id;
        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();

        let view = h.engine.quiz(h.user_id, session_id).await.unwrap();
        h.engine.submit_answer(h.user_id, session_id, 0, &[0, 1]).await.unwrap();
        h.engine.quiz(h.user_id, session_id).await.unwrap();

        assert_eq!(view.questions.len(), 3);
        assert_eq!(view.topic_id, h.outline.topics[0].id);
        assert_eq!(h.generator.quiz_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn weak_point_latches_and_skip_unlocks_after_three_misses() {
        let h = harness(&[1], 5);
        let session_id = h.start().await.session_id;
        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();

        let err = h.engine.skip(h.user_id, session_id, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        let mut last = None;
        for _ in 0..3 {
            last = Some(h.engine.submit_answer(h.user_id, session_id, 0, &[2]).await.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.attempts, 3);
        assert!(last.skippable);

        let snapshot = h.engine.snapshot(h.user_id, session_id).await.unwrap();
        assert!(snapshot.topics[0].is_weak_point);
        assert_eq!(snapshot.topics[0].wrong_count, 3);

        h.engine.submit_answer(h.user_id, session_id, 1, &[0, 1]).await.unwrap();
        let snapshot = h.engine.skip(h.user_id, session_id, 0).await.unwrap();
        assert!(snapshot.topics[0].is_weak_point);
        assert_eq!(snapshot.topics[0].correct_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_wrong_answers_are_all_counted() {
        let h = slow_harness(&[1], 5);
        let session_id = h.start().await.session_id;
        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();

        let answers: Vec<_> = [0, 0, 0, 1, 2]
            .into_iter()
            .map(|question_index| {
                let engine = h.engine.clone();
                let user_id = h.user_id;
                tokio::spawn(async move {
                    engine
                        .submit_answer(user_id, session_id, question_index, &[3])
                        .await
                })
            })
            .collect();
        for answer in answers {
            assert!(!answer.await.unwrap().unwrap().correct);
        }

        let snapshot = h.engine.snapshot(h.user_id, session_id).await.unwrap();
        assert_eq!(snapshot.topics[0].wrong_count, 5);
        assert!(snapshot.topics[0].is_weak_point);

        let view = h.engine.quiz(h.user_id, session_id).await.unwrap();
        let attempts: Vec<u32> = view.questions.iter().map(|q| q.attempts).collect();
        assert_eq!(attempts, vec![3, 1, 1]);
        assert!(view.questions[0].skippable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_topic_completion_advances_once() {
        let h = slow_harness(&[1, 1, 1], 5);
        let session_id = h.start().await.session_id;
        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();
        for question in 0..3 {
            h.engine
                .submit_answer(h.user_id, session_id, question, &[0, 1])
                .await
                .unwrap();
        }

        let completions: Vec<_> = (0..2)
            .map(|_| {
                let engine = h.engine.clone();
                let user_id = h.user_id;
                tokio::spawn(async move { engine.complete_topic(user_id, session_id).await })
            })
            .collect();
        let mut succeeded = 0;
        for completion in completions {
            match completion.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(err) => assert!(matches!(err, EngineError::InvalidTransition(_))),
            }
        }
        assert_eq!(succeeded, 1);

        let snapshot = h.engine.snapshot(h.user_id, session_id).await.unwrap();
        assert_eq!((snapshot.current_topic_index, snapshot.current_sub_index), (1, 0));
        assert_eq!(snapshot.topics[0].status, TopicStatus::Completed);
        assert_eq!(snapshot.topics[1].status, TopicStatus::InProgress);
    }

    #[tokio::test]
    async fn late_correct_answer_counts_as_incorrect() {
        let h = harness(&[1], 5);
        let session_id = h.start().await.session_id;
        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();

        for _ in 0..3 {
            h.engine.submit_answer(h.user_id, session_id, 0, &[3]).await.unwrap();
        }
        let late = h.engine.submit_answer(h.user_id, session_id, 0, &[0, 1]).await.unwrap();
        assert!(late.correct);
        assert_eq!(late.outcome, Some(QuestionOutcome::LateCorrect));
        assert!(late.explanation.is_some());

        let err = h
            .engine
            .submit_answer(h.user_id, session_id, 0, &[0, 1])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        h.engine.submit_answer(h.user_id, session_id, 1, &[0, 1]).await.unwrap();
        h.engine.submit_answer(h.user_id, session_id, 2, &[1]).await.unwrap();
        h.engine.submit_answer(h.user_id, session_id, 2, &[1, 0]).await.unwrap();

        let completion = h.engine.complete_topic(h.user_id, session_id).await.unwrap();
        assert_eq!(completion.correct, 2);
        assert!(completion.passed);
    }

    #[tokio::test]
    async fn failing_topic_still_completes_and_advances() {
        let h = harness(&[1, 1], 5);
        let session_id = h.start().await.session_id;
        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();

        h.engine.submit_answer(h.user_id, session_id, 0, &[0, 1]).await.unwrap();
        for question in 1..3 {
            for _ in 0..3 {
                h.engine.submit_answer(h.user_id, session_id, question, &[2, 3]).await.unwrap();
            }
            h.engine.skip(h.user_id, session_id, question).await.unwrap();
        }

        let completion = h.engine.complete_topic(h.user_id, session_id).await.unwrap();
        assert!(!completion.passed);
        assert_eq!(completion.snapshot.topics[0].status, TopicStatus::Completed);
        assert_eq!(completion.snapshot.topics[0].passed, Some(false));
        assert_eq!(completion.snapshot.current_topic_index, 1);
    }

    #[tokio::test]
    async fn complete_topic_requires_every_question_resolved() {
        let h = harness(&[1], 5);
        let session_id = h.start().await.session_id;
        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();
        h.engine.submit_answer(h.user_id, session_id, 0, &[0, 1]).await.unwrap();

        let err = h.engine.complete_topic(h.user_id, session_id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn invalid_answers_are_caller_errors() {
        let h = harness(&[1], 5);
        let session_id = h.start().await.session_id;

        let err = h
            .engine
            .submit_answer(h.user_id, session_id, 0, &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        h.engine.confirm(h.user_id, session_id, h.sub(0, 0)).await.unwrap();
        let err = h
            .engine
            .submit_answer(h.user_id, session_id, 0, &[0, 5])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAnswer(_)));
        let err = h
            .engine
            .submit_answer(h.user_id, session_id, 7, &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAnswer(_)));

        let view = h.engine.quiz(h.user_id, session_id).await.unwrap();
        assert!(view.questions.iter().all(|q| q.attempts == 0));
    }

    #[tokio::test]
    async fn sessions_are_private_to_their_owner() {
        let h = harness(&[1], 5);
        let session_id = h.start().await.session_id;

        let err = h.engine.snapshot(Uuid::new_v4(), session_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
        let err = h.engine.snapshot(h.user_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }
}
