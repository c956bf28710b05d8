pub mod content_llm;
pub mod db;

pub use content_llm::OpenAiContentAdapter;
pub use db::DbAdapter;
