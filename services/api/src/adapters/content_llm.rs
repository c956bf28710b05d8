//! services/api/src/adapters/content_llm.rs
//!
//! This module contains the adapter for the content-generating LLM.
//! It implements the `ContentGenerator` port from the `core` crate: a
//! streamed five-layer explanation per sub-topic and a three-question quiz
//! per topic. Both calls share a per-session conversation so later requests
//! stay grounded in what was already taught.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tutor_core::{
    domain::{Quiz, QuizQuestion},
    ports::{ContentGenerator, GenerationContext, PortError, PortResult, TextStream},
};
use uuid::Uuid;

const EXPLANATION_INSTRUCTIONS: &str = r#"You are a patient tutor walking a learner through a document one sub-topic at a time.

Explain the requested sub-topic in exactly five layers, each under its own short heading:
1. The big picture: one or two sentences on what this is and why it matters.
2. The core idea: the central concept in plain words.
3. How it works: the mechanism, steps or structure behind it.
4. An example: one concrete, worked example.
5. Common pitfalls: the misunderstandings learners usually have.

Rules:
- Stay on the requested sub-topic. Earlier sub-topics may be referenced briefly but not re-taught.
- Use plain language and short paragraphs. Markdown headings and lists are fine.
- Do not ask the learner questions and do not add a quiz."#;

const QUIZ_INSTRUCTIONS: &str = r#"You write short multiple-answer quizzes that check understanding of a topic the learner just studied.

Return ONLY a JSON object with this exact shape and nothing else:
{"questions": [{"text": "...", "options": ["...", "...", "...", "..."], "correct_indices": [0, 2], "explanation": "..."}]}

Rules:
- Exactly 3 questions covering the topic as a whole, not a single sub-topic.
- Every question has exactly 4 options.
- Every question has 2 or 3 correct options. "correct_indices" lists their zero-based positions.
- "explanation" says briefly why the correct options are correct."#;

/// Older turns beyond this are dropped from a conversation.
const MAX_CONTEXT_TURNS: usize = 16;

//=========================================================================================
// Conversation Contexts
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
struct Turn {
    role: Role,
    content: String,
}

struct Conversation {
    turns: Vec<Turn>,
    last_used: Instant,
}

/// Per-learning-session message history with an idle lifetime. An expired
/// conversation is discarded and the next call starts a fresh one.
struct ConversationContexts {
    idle_ttl: Duration,
    conversations: HashMap<Uuid, Conversation>,
}

impl ConversationContexts {
    fn new(idle_ttl: Duration) -> Self {
        Self {
            idle_ttl,
            conversations: HashMap::new(),
        }
    }

    /// Returns the turns recorded for a session and marks it as used.
    fn history(&mut self, session_id: Uuid, now: Instant) -> Vec<Turn> {
        self.evict_idle(now);
        let conversation = self
            .conversations
            .entry(session_id)
            .or_insert_with(|| Conversation {
                turns: Vec::new(),
                last_used: now,
            });
        conversation.last_used = now;
        conversation.turns.clone()
    }

    fn record(&mut self, session_id: Uuid, prompt: String, reply: String, now: Instant) {
        let conversation = self
            .conversations
            .entry(session_id)
            .or_insert_with(|| Conversation {
                turns: Vec::new(),
                last_used: now,
            });
        conversation.turns.push(Turn {
            role: Role::User,
            content: prompt,
        });
        conversation.turns.push(Turn {
            role: Role::Assistant,
            content: reply,
        });
        if conversation.turns.len() > MAX_CONTEXT_TURNS {
            let excess = conversation.turns.len() - MAX_CONTEXT_TURNS;
            conversation.turns.drain(..excess);
        }
        conversation.last_used = now;
    }

    fn evict_idle(&mut self, now: Instant) {
        let idle_ttl = self.idle_ttl;
        self.conversations.retain(|session_id, conversation| {
            let alive = now.saturating_duration_since(conversation.last_used) < idle_ttl;
            if !alive {
                debug!(session_id = %session_id, "Discarding idle conversation context");
            }
            alive
        });
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `ContentGenerator` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiContentAdapter {
    client: Client<OpenAIConfig>,
    explanation_model: String,
    quiz_model: String,
    contexts: Arc<Mutex<ConversationContexts>>,
}

impl OpenAiContentAdapter {
    /// Creates a new `OpenAiContentAdapter`.
    pub fn new(
        client: Client<OpenAIConfig>,
        explanation_model: String,
        quiz_model: String,
        context_idle_ttl: Duration,
    ) -> Self {
        Self {
            client,
            explanation_model,
            quiz_model,
            contexts: Arc::new(Mutex::new(ConversationContexts::new(context_idle_ttl))),
        }
    }

    fn history(&self, session_id: Uuid) -> Vec<Turn> {
        lock(&self.contexts).history(session_id, Instant::now())
    }

    /// Assembles system instructions, prior turns and the new prompt.
    fn build_messages(
        instructions: &str,
        history: &[Turn],
        prompt: &str,
    ) -> PortResult<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> =
            Vec::with_capacity(history.len() + 2);
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(instructions)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        );
        for turn in history {
            let message: ChatCompletionRequestMessage = match turn.role {
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?
                    .into(),
            };
            messages.push(message);
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        );
        Ok(messages)
    }
}

fn lock(contexts: &Mutex<ConversationContexts>) -> std::sync::MutexGuard<'_, ConversationContexts> {
    contexts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn explanation_prompt(context: &GenerationContext) -> String {
    let sub_topic = context
        .sub_topic_title
        .as_deref()
        .unwrap_or(context.topic_title.as_str());
    format!(
        "TOPIC: {}\nSUB-TOPICS OF THIS TOPIC, IN ORDER:\n- {}\n\nExplain the sub-topic: {}",
        context.topic_title,
        context.sub_topic_titles.join("\n- "),
        sub_topic
    )
}

fn quiz_prompt(context: &GenerationContext) -> String {
    format!(
        "TOPIC: {}\nIT COVERED THESE SUB-TOPICS:\n- {}\n\nWrite the quiz for this topic.",
        context.topic_title,
        context.sub_topic_titles.join("\n- ")
    )
}

#[derive(Deserialize)]
struct QuizPayload {
    questions: Vec<QuizQuestion>,
}

/// Parses the model's quiz reply, tolerating a surrounding code fence.
fn parse_quiz(raw: &str, topic_id: Uuid) -> PortResult<Quiz> {
    let fence = Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$")
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
    let body = match fence.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    };
    let payload: QuizPayload = serde_json::from_str(body)
        .map_err(|e| PortError::Unexpected(format!("Quiz response was not valid JSON: {}", e)))?;
    Ok(Quiz {
        topic_id,
        questions: payload.questions,
    })
}

//=========================================================================================
// `ContentGenerator` Trait Implementation
//=========================================================================================

#[async_trait]
impl ContentGenerator for OpenAiContentAdapter {
    /// Streams the explanation and records it in the session's conversation
    /// once the stream finishes.
    async fn generate_explanation(&self, context: &GenerationContext) -> PortResult<TextStream> {
        let prompt = explanation_prompt(context);
        let history = self.history(context.session_id);
        let messages = Self::build_messages(EXPLANATION_INSTRUCTIONS, &history, &prompt)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.explanation_model)
            .messages(messages)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let mut upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        let contexts = self.contexts.clone();
        let session_id = context.session_id;
        let started = Instant::now();

        let stream = async_stream::stream! {
            let mut full = String::new();
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(response) => {
                        for choice in response.choices {
                            if let Some(delta) = choice.delta.content {
                                if !delta.is_empty() {
                                    full.push_str(&delta);
                                    yield Ok(delta);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, "Explanation stream failed: {}", e);
                        yield Err(PortError::Unexpected(e.to_string()));
                        return;
                    }
                }
            }
            info!(
                session_id = %session_id,
                chars = full.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Explanation generated"
            );
            lock(&contexts).record(session_id, prompt, full, Instant::now());
        };

        Ok(Box::pin(stream))
    }

    async fn generate_quiz(&self, context: &GenerationContext) -> PortResult<Quiz> {
        let prompt = quiz_prompt(context);
        let history = self.history(context.session_id);
        let messages = Self::build_messages(QUIZ_INSTRUCTIONS, &history, &prompt)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.quiz_model)
            .messages(messages)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let started = Instant::now();
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                PortError::Unexpected("Quiz LLM response contained no text content.".to_string())
            })?;

        let quiz = parse_quiz(&content, context.topic_id)?;
        info!(
            session_id = %context.session_id,
            topic_id = %context.topic_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Quiz generated"
        );
        lock(&self.contexts).record(context.session_id, prompt, content, Instant::now());
        Ok(quiz)
    }
}
