//! crates/tutor_core/src/machine.rs
//!
//! The session phase machine. A session's position and phase are read into a
//! `SessionState`, advanced by exactly one `transition` per event, and written
//! back. Anything not matched by `transition` is an invalid transition.

use chrono::{DateTime, Utc};

use crate::domain::{LearningSession, Outline, Phase, SessionStatus};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub topic: usize,
    pub sub: usize,
}

impl Position {
    pub const START: Position = Position { topic: 0, sub: 0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Explaining the sub-topic at the position.
    Explaining(Position),
    /// Every sub-topic of the topic is confirmed; the quiz is being prepared.
    Confirming(Position),
    /// Taking the quiz of the topic at the position.
    Testing(Position),
    /// Terminal. Keeps the last position of the outline.
    Completed(Position),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SubTopicConfirmed,
    QuizReady,
    TopicCompleted,
}

impl SessionState {
    pub fn of(session: &LearningSession) -> Self {
        let position = Position {
            topic: session.current_topic_index,
            sub: session.current_sub_index,
        };
        if session.status == SessionStatus::Completed {
            return SessionState::Completed(position);
        }
        match session.current_phase {
            Phase::Explaining => SessionState::Explaining(position),
            Phase::Confirming => SessionState::Confirming(position),
            Phase::Testing => SessionState::Testing(position),
            Phase::Completed => SessionState::Completed(position),
        }
    }

    pub fn position(&self) -> Position {
        match *self {
            SessionState::Explaining(p)
            | SessionState::Confirming(p)
            | SessionState::Testing(p)
            | SessionState::Completed(p) => p,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            SessionState::Explaining(_) => Phase::Explaining,
            SessionState::Confirming(_) => Phase::Confirming,
            SessionState::Testing(_) => Phase::Testing,
            SessionState::Completed(_) => Phase::Completed,
        }
    }

    /// Writes this state into the session row. Any non-terminal state also
    /// marks the session active again.
    pub fn apply_to(self, session: &mut LearningSession, now: DateTime<Utc>) {
        let position = self.position();
        session.current_topic_index = position.topic;
        session.current_sub_index = position.sub;
        session.current_phase = self.phase();
        session.last_active_at = now;
        match self {
            SessionState::Completed(_) => {
                session.status = SessionStatus::Completed;
                session.completed_at.get_or_insert(now);
            }
            _ => session.status = SessionStatus::InProgress,
        }
    }
}

/// Advances `state` by one event against the document's outline.
pub fn transition(
    state: SessionState,
    event: SessionEvent,
    outline: &Outline,
) -> EngineResult<SessionState> {
    ensure_in_bounds(state, outline)?;

    match (state, event) {
        (SessionState::Explaining(p), SessionEvent::SubTopicConfirmed) => {
            let sub_count = outline.topics[p.topic].sub_topics.len();
            if p.sub + 1 < sub_count {
                Ok(SessionState::Explaining(Position {
                    topic: p.topic,
                    sub: p.sub + 1,
                }))
            } else {
                Ok(SessionState::Confirming(p))
            }
        }
        (SessionState::Confirming(p), SessionEvent::QuizReady) => Ok(SessionState::Testing(p)),
        (SessionState::Testing(p), SessionEvent::TopicCompleted) => {
            if p.topic + 1 < outline.topics.len() {
                Ok(SessionState::Explaining(Position {
                    topic: p.topic + 1,
                    sub: 0,
                }))
            } else {
                Ok(SessionState::Completed(p))
            }
        }
        (state, event) => Err(EngineError::InvalidTransition(format!(
            "{:?} is not allowed while {:?}",
            event,
            state.phase()
        ))),
    }
}

fn ensure_in_bounds(state: SessionState, outline: &Outline) -> EngineResult<()> {
    let p = state.position();
    if outline.sub_topic(p.topic, p.sub).is_none() {
        return Err(EngineError::InvalidTransition(format!(
            "position ({}, {}) is outside the outline",
            p.topic, p.sub
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SubTopic, TopicGroup};
    use uuid::Uuid;

    fn outline(shape: &[usize]) -> Outline {
        Outline {
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
        }
    }

    #[test]
    fn confirming_walks_sub_topics_then_waits_for_quiz() {
        let outline = outline(&[2]);
        let state = SessionState::Explaining(Position::START);

        let state = transition(state, SessionEvent::SubTopicConfirmed, &outline).unwrap();
        assert_eq!(state, SessionState::Explaining(Position { topic: 0, sub: 1 }));

        let state = transition(state, SessionEvent::SubTopicConfirmed, &outline).unwrap();
        assert_eq!(state, SessionState::Confirming(Position { topic: 0, sub: 1 }));

        let state = transition(state, SessionEvent::QuizReady, &outline).unwrap();
        assert_eq!(state, SessionState::Testing(Position { topic: 0, sub: 1 }));
    }

    #[test]
    fn completing_last_topic_is_terminal_and_in_bounds() {
        let outline = outline(&[1, 3]);
        let state = SessionState::Testing(Position { topic: 0, sub: 0 });

        let state = transition(state, SessionEvent::TopicCompleted, &outline).unwrap();
        assert_eq!(state, SessionState::Explaining(Position { topic: 1, sub: 0 }));

        let last = SessionState::Testing(Position { topic: 1, sub: 2 });
        let done = transition(last, SessionEvent::TopicCompleted, &outline).unwrap();
        assert_eq!(done, SessionState::Completed(Position { topic: 1, sub: 2 }));
        assert!(outline.sub_topic(1, 2).is_some());
    }

    #[test]
    fn events_out_of_phase_are_rejected() {
        let outline = outline(&[1]);
        let cases = [
            (SessionState::Explaining(Position::START), SessionEvent::TopicCompleted),
            (SessionState::Explaining(Position::START), SessionEvent::QuizReady),
            (SessionState::Testing(Position::START), SessionEvent::SubTopicConfirmed),
            (SessionState::Completed(Position::START), SessionEvent::TopicCompleted),
        ];
        for (state, event) in cases {
            assert!(matches!(
                transition(state, event, &outline),
                Err(EngineError::InvalidTransition(_))
            ));
        }
    }

    #[test]
    fn out_of_bounds_position_is_rejected() {
        let outline = outline(&[1]);
        let state = SessionState::Explaining(Position { topic: 0, sub: 4 });
        assert!(transition(state, SessionEvent::SubTopicConfirmed, &outline).is_err());
    }

    #[test]
    fn apply_to_marks_completion_once() {
        let mut session = LearningSession::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let first = Utc::now();
        SessionState::Completed(Position::START).apply_to(&mut session, first);
        SessionState::Completed(Position::START).apply_to(&mut session, first + chrono::Duration::seconds(5));

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.current_phase, Phase::Completed);
        assert_eq!(session.completed_at, Some(first));
    }
}
