//! services/api/src/web/protocol.rs
//!
//! Defines the event protocol of the explanation stream. Each message is sent
//! as one Server-Sent Event whose `event` name is the message type and whose
//! `data` is the message as JSON.

use crate::error::ErrorBody;
use serde::Serialize;
use uuid::Uuid;

/// Messages the server pushes to the client while an explanation is served.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Generation (or the cache lookup) succeeded far enough to send text.
    Started {
        session_id: Uuid,
        sub_topic_id: Uuid,
    },

    /// The next piece of explanation text, in order.
    Chunk { text: String },

    /// The explanation is complete and stored.
    Done {
        sub_topic_id: Uuid,
        from_cache: bool,
        chars: usize,
    },

    /// Generation failed after the stream had started. Nothing is cached and
    /// the quota charge has been refunded.
    Error(ErrorBody),
}

impl StreamMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamMessage::Started { .. } => "started",
            StreamMessage::Chunk { .. } => "chunk",
            StreamMessage::Done { .. } => "done",
            StreamMessage::Error(_) => "error",
        }
    }
}
