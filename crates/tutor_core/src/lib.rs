pub mod cache;
pub mod domain;
pub mod error;
pub mod machine;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod ports;
pub mod quiz;
pub mod quota;
pub mod session;

pub use cache::{GenerationCache, Generated, QuotaCharge};
pub use domain::{
    CacheEntry, CacheKey, CachedContent, LearningSession, Outline, Phase, ProgressChange,
    ProgressRejected, QuestionOutcome, QuestionProgress, QuotaBucket, QuotaRecord, Quiz,
    QuizQuestion, SessionStatus, SubTopic, SubTopicProgress, TopicGroup, TopicProgress,
    TopicStatus,
};
pub use error::{EngineError, EngineResult};
#[cfg(any(test, feature = "memory"))]
pub use memory::InMemoryStore;
pub use ports::{
    ContentGenerator, GenerationCacheStore, GenerationContext, LearningStore, OutlineProvider,
    PortError, PortResult, QuotaStore, TextStream,
};
pub use quota::{QuotaLedger, QuotaLimits, QuotaStatus};
pub use session::{
    AnswerResult, ChunkSink, EngineConfig, ExplanationServed, LearningEngine, QuizView,
    SessionSnapshot, TopicCompletion,
};
