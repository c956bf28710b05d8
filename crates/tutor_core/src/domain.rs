//! crates/tutor_core/src/domain.rs
//!
//! Defines the pure, core data structures of the learning session engine.
//! Storage adapters map their own record types onto these; only the quiz and
//! the small status enums carry serde derives, because those cross the cache
//! and wire boundaries as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of questions in every topic quiz.
pub const QUIZ_QUESTION_COUNT: usize = 3;
/// Number of options offered by every quiz question.
pub const QUIZ_OPTION_COUNT: usize = 4;
/// Correct answers (within the attempt limit) needed to pass a topic quiz.
pub const QUIZ_PASS_THRESHOLD: usize = 2;
/// Failed attempts after which a question may be skipped.
pub const MAX_ATTEMPTS_PER_QUESTION: u32 = 3;
/// Cumulative wrong answers in a topic that flag it as a weak point.
pub const WEAK_POINT_WRONG_ANSWERS: u32 = 3;

//=========================================================================================
// Learning Session
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    InProgress,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Completed => "COMPLETED",
        }
    }
}

/// The phase of the session within its current sub-topic / topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Explaining,
    Confirming,
    Testing,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Explaining => "EXPLAINING",
            Phase::Confirming => "CONFIRMING",
            Phase::Testing => "TESTING",
            Phase::Completed => "COMPLETED",
        }
    }
}

/// One guided walk through a document's outline. There is exactly one per
/// (user, document) pair; the persisted row is the authoritative position.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub status: SessionStatus,
    pub current_topic_index: usize,
    pub current_sub_index: usize,
    pub current_phase: Phase,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LearningSession {
    /// A fresh session positioned at the first sub-topic of the first topic.
    pub fn new(user_id: Uuid, document_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            document_id,
            status: SessionStatus::InProgress,
            current_topic_index: 0,
            current_sub_index: 0,
            current_phase: Phase::Explaining,
            started_at: now,
            last_active_at: now,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

//=========================================================================================
// Outline (produced upstream, immutable here)
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SubTopic {
    pub id: Uuid,
    pub index: usize,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicGroup {
    pub id: Uuid,
    pub index: usize,
    pub title: String,
    pub sub_topics: Vec<SubTopic>,
}

/// The two-level outline of a document whose extraction is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    pub document_id: Uuid,
    pub topics: Vec<TopicGroup>,
}

impl Outline {
    pub fn topic(&self, index: usize) -> Option<&TopicGroup> {
        self.topics.get(index)
    }

    pub fn sub_topic(&self, topic_index: usize, sub_index: usize) -> Option<&SubTopic> {
        self.topic(topic_index)
            .and_then(|topic| topic.sub_topics.get(sub_index))
    }

    /// An outline is usable only if every topic has at least one sub-topic.
    pub fn is_walkable(&self) -> bool {
        !self.topics.is_empty() && self.topics.iter().all(|t| !t.sub_topics.is_empty())
    }
}

//=========================================================================================
// Progress
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopicStatus {
    Pending,
    InProgress,
    Completed,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Pending => "PENDING",
            TopicStatus::InProgress => "IN_PROGRESS",
            TopicStatus::Completed => "COMPLETED",
        }
    }
}

/// How a quiz question was resolved within the topic test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionOutcome {
    /// Answered correctly before the attempt limit was reached.
    Correct,
    /// Answered correctly only after the attempt limit; scored as incorrect.
    LateCorrect,
    /// Skipped after exhausting the attempt limit; scored as incorrect.
    Skipped,
}

impl QuestionOutcome {
    pub fn counts_as_correct(self) -> bool {
        matches!(self, QuestionOutcome::Correct)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionOutcome::Correct => "correct",
            QuestionOutcome::LateCorrect => "late_correct",
            QuestionOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionProgress {
    pub attempts: u32,
    pub outcome: Option<QuestionOutcome>,
}

impl QuestionProgress {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_skippable(&self) -> bool {
        self.outcome.is_none() && self.attempts >= MAX_ATTEMPTS_PER_QUESTION
    }
}

/// Progress of one session through one topic. Created lazily when the
/// session first reaches the topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicProgress {
    pub session_id: Uuid,
    pub topic_id: Uuid,
    pub status: TopicStatus,
    pub is_weak_point: bool,
    pub correct_count: u32,
    pub wrong_count: u32,
    pub questions: Vec<QuestionProgress>,
    pub passed: Option<bool>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TopicProgress {
    pub fn new(session_id: Uuid, topic_id: Uuid) -> Self {
        Self {
            session_id,
            topic_id,
            status: TopicStatus::InProgress,
            is_weak_point: false,
            correct_count: 0,
            wrong_count: 0,
            questions: vec![QuestionProgress::default(); QUIZ_QUESTION_COUNT],
            passed: None,
            completed_at: None,
        }
    }

    /// Records a wrong answer; the weak-point flag latches once set.
    pub fn record_wrong(&mut self) {
        self.wrong_count += 1;
        if self.wrong_count >= WEAK_POINT_WRONG_ANSWERS {
            self.is_weak_point = true;
        }
    }

    pub fn all_questions_resolved(&self) -> bool {
        self.questions.iter().all(QuestionProgress::is_resolved)
    }

    pub fn correct_outcomes(&self) -> usize {
        self.questions
            .iter()
            .filter_map(|q| q.outcome)
            .filter(|o| o.counts_as_correct())
            .count()
    }

    /// Applies one change in place. A rejected change leaves the row as it was.
    pub fn apply(&mut self, change: ProgressChange) -> Result<(), ProgressRejected> {
        if self.status == TopicStatus::Completed {
            return Err(ProgressRejected::TopicCompleted);
        }
        match change {
            ProgressChange::Answer {
                question_index,
                correct,
            } => {
                let state = self.question_mut(question_index)?;
                if state.is_resolved() {
                    return Err(ProgressRejected::AlreadyResolved(question_index));
                }
                if correct {
                    state.outcome = Some(if state.attempts < MAX_ATTEMPTS_PER_QUESTION {
                        QuestionOutcome::Correct
                    } else {
                        QuestionOutcome::LateCorrect
                    });
                    self.correct_count += 1;
                } else {
                    state.attempts += 1;
                    self.record_wrong();
                }
            }
            ProgressChange::Skip { question_index } => {
                let state = self.question_mut(question_index)?;
                if !state.is_skippable() {
                    return Err(ProgressRejected::NotSkippable(question_index));
                }
                state.outcome = Some(QuestionOutcome::Skipped);
            }
            ProgressChange::Complete { at } => {
                if self.questions.len() < QUIZ_QUESTION_COUNT || !self.all_questions_resolved() {
                    return Err(ProgressRejected::QuestionsUnresolved);
                }
                self.status = TopicStatus::Completed;
                self.passed = Some(self.correct_outcomes() >= QUIZ_PASS_THRESHOLD);
                self.completed_at = Some(at);
            }
        }
        Ok(())
    }

    fn question_mut(&mut self, index: usize) -> Result<&mut QuestionProgress, ProgressRejected> {
        if index >= QUIZ_QUESTION_COUNT {
            return Err(ProgressRejected::NoSuchQuestion(index));
        }
        if self.questions.len() < QUIZ_QUESTION_COUNT {
            self.questions
                .resize(QUIZ_QUESTION_COUNT, QuestionProgress::default());
        }
        Ok(&mut self.questions[index])
    }
}

/// One change to a topic's progress row. Stores apply it as a single atomic
/// step against the stored row, so concurrent answers never lose a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressChange {
    /// A graded answer to one question.
    Answer { question_index: usize, correct: bool },
    /// Gives up on a question that used up its attempts.
    Skip { question_index: usize },
    /// Closes the topic and records whether the quiz was passed.
    Complete { at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressRejected {
    #[error("question index {0} does not exist")]
    NoSuchQuestion(usize),
    #[error("question {0} is already resolved")]
    AlreadyResolved(usize),
    #[error("question {0} can only be skipped after {} failed attempts", MAX_ATTEMPTS_PER_QUESTION)]
    NotSkippable(usize),
    #[error("every question must be answered or skipped first")]
    QuestionsUnresolved,
    #[error("the topic is already completed")]
    TopicCompleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubTopicProgress {
    pub session_id: Uuid,
    pub sub_topic_id: Uuid,
    pub confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub explanation_served_at: Option<DateTime<Utc>>,
}

//=========================================================================================
// Quiz
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub text: String,
    pub options: Vec<String>,
    pub correct_indices: Vec<u8>,
    pub explanation: String,
}

/// The quiz for a whole topic. Generated once and cached under the topic id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub topic_id: Uuid,
    pub questions: Vec<QuizQuestion>,
}

//=========================================================================================
// Generation Cache
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Explanation text for a sub-topic.
    Explanation(Uuid),
    /// Quiz for a topic.
    Quiz(Uuid),
}

impl CacheKey {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheKey::Explanation(_) => "explanation",
            CacheKey::Quiz(_) => "quiz",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            CacheKey::Explanation(id) | CacheKey::Quiz(id) => *id,
        }
    }

    pub fn bucket(&self) -> QuotaBucket {
        match self {
            CacheKey::Explanation(_) => QuotaBucket::Explanation,
            CacheKey::Quiz(_) => QuotaBucket::Quiz,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedContent {
    Explanation(String),
    Quiz(Quiz),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub content: CachedContent,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Quota
//=========================================================================================

/// A named counter limiting billed generation calls per reset period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaBucket {
    Explanation,
    Quiz,
}

impl QuotaBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaBucket::Explanation => "explanation",
            QuotaBucket::Quiz => "quiz",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "explanation" => Some(QuotaBucket::Explanation),
            "quiz" => Some(QuotaBucket::Quiz),
            _ => None,
        }
    }
}

impl std::fmt::Display for QuotaBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    pub user_id: Uuid,
    pub bucket: QuotaBucket,
    pub used: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}
