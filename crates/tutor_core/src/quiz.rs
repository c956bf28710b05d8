//! crates/tutor_core/src/quiz.rs
//!
//! Quiz scoring and quiz shape checks. Pure functions, no I/O.

use std::collections::BTreeSet;

use crate::domain::{Quiz, QuizQuestion, QUIZ_OPTION_COUNT, QUIZ_QUESTION_COUNT};
use crate::error::{EngineError, EngineResult};

/// Scores a submitted answer. The answer is correct only if the submitted
/// option set equals the correct set exactly; order and duplicates are
/// irrelevant and partial overlap scores as incorrect.
pub fn evaluate(question: &QuizQuestion, submitted: &[u8]) -> EngineResult<bool> {
    if submitted.is_empty() {
        return Err(EngineError::InvalidAnswer(
            "at least one option must be selected".to_string(),
        ));
    }
    if let Some(bad) = submitted
        .iter()
        .find(|&&index| usize::from(index) >= QUIZ_OPTION_COUNT)
    {
        return Err(EngineError::InvalidAnswer(format!(
            "option index {} is out of range 0..{}",
            bad, QUIZ_OPTION_COUNT
        )));
    }

    let submitted: BTreeSet<u8> = submitted.iter().copied().collect();
    let correct: BTreeSet<u8> = question.correct_indices.iter().copied().collect();
    Ok(submitted == correct)
}

/// Checks that a generated quiz has the shape the session machine relies on:
/// three questions, four options each, two or three distinct correct options.
pub fn validate_quiz(quiz: &Quiz) -> Result<(), String> {
    if quiz.questions.len() != QUIZ_QUESTION_COUNT {
        return Err(format!(
            "expected {} questions, got {}",
            QUIZ_QUESTION_COUNT,
            quiz.questions.len()
        ));
    }
    for (i, question) in quiz.questions.iter().enumerate() {
        if question.options.len() != QUIZ_OPTION_COUNT {
            return Err(format!(
                "question {} has {} options",
                i,
                question.options.len()
            ));
        }
        let distinct: BTreeSet<u8> = question.correct_indices.iter().copied().collect();
        if distinct.len() != question.correct_indices.len() {
            return Err(format!("question {} repeats a correct index", i));
        }
        if !(2..=3).contains(&distinct.len()) {
            return Err(format!(
                "question {} has {} correct options, expected 2 or 3",
                i,
                distinct.len()
            ));
        }
        if distinct
            .iter()
            .any(|&index| usize::from(index) >= QUIZ_OPTION_COUNT)
        {
            return Err(format!("question {} has an out-of-range correct index", i));
        }
    }
    Ok(())
}
