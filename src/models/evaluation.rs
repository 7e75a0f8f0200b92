// src/models/evaluation.rs

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::AppError;

/// Question kinds understood by the scoring engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultiSelect,
    TrueFalse,
    FreeText,
}

impl QuestionType {
    /// Choice questions carry an option list their answers must come from.
    pub fn is_choice(self) -> bool {
        !matches!(self, QuestionType::FreeText)
    }
}

/// A single graded question of an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Question {
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    #[serde(rename = "type")]
    pub question_type: QuestionType,

    #[validate(length(min = 1, max = 1000))]
    pub prompt: String,

    /// Ordered option list. Empty for free-text questions.
    #[serde(default)]
    pub options: Vec<String>,

    /// Values that make up a correct answer.
    #[serde(default)]
    pub correct_answers: BTreeSet<String>,

    #[validate(range(min = 1))]
    pub points: u32,

    #[serde(default)]
    pub difficulty: Option<String>,
}

/// DTO for sending a question to a learner (excludes correct answers).
#[derive(Debug, Clone, Serialize)]
pub struct PublicQuestion {
    pub id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub prompt: String,
    pub options: Vec<String>,
    pub points: u32,
}

impl From<&Question> for PublicQuestion {
    fn from(q: &Question) -> Self {
        PublicQuestion {
            id: q.id.clone(),
            question_type: q.question_type,
            prompt: q.prompt.clone(),
            options: q.options.clone(),
            points: q.points,
        }
    }
}

/// Immutable evaluation definition, owned by content authoring.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Evaluation {
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    #[validate(length(min = 1, max = 200))]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[validate(length(min = 1), nested)]
    pub questions: Vec<Question>,

    #[validate(range(min = 1))]
    pub time_limit_minutes: u32,

    /// Percentage in `0..=100` required to pass.
    #[validate(range(min = 0.0, max = 100.0))]
    pub passing_score: f64,

    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// Lockout after the budget is exhausted without a pass. At most a year.
    #[validate(range(max = 8760))]
    pub lockout_hours: u32,
}

impl Evaluation {
    /// Runs field validation plus the cross-field question invariants.
    pub fn check(&self) -> Result<(), AppError> {
        self.validate()?;

        let mut seen = BTreeSet::new();
        for question in &self.questions {
            if !seen.insert(question.id.as_str()) {
                return Err(AppError::BadRequest(format!(
                    "evaluation '{}': duplicate question id '{}'",
                    self.id, question.id
                )));
            }
            check_question(question).map_err(|msg| {
                AppError::BadRequest(format!(
                    "evaluation '{}', question '{}': {}",
                    self.id, question.id, msg
                ))
            })?;
        }
        Ok(())
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn time_limit_seconds(&self) -> u64 {
        u64::from(self.time_limit_minutes) * 60
    }

    pub fn public_questions(&self) -> Vec<PublicQuestion> {
        self.questions.iter().map(PublicQuestion::from).collect()
    }
}

fn check_question(question: &Question) -> Result<(), &'static str> {
    if !question.question_type.is_choice() {
        return Ok(());
    }
    if question.options.is_empty() {
        return Err("choice question needs options");
    }
    if question.correct_answers.is_empty() {
        return Err("choice question needs at least one correct answer");
    }
    if question
        .correct_answers
        .iter()
        .any(|answer| !question.options.contains(answer))
    {
        return Err("correct answer missing from options");
    }
    match question.question_type {
        QuestionType::SingleChoice | QuestionType::TrueFalse
            if question.correct_answers.len() != 1 =>
        {
            Err("single answer question needs exactly one correct answer")
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn choice(id: &str, question_type: QuestionType, correct: &[&str], points: u32) -> Question {
        Question {
            id: id.to_string(),
            question_type,
            prompt: format!("Question {}", id),
            options: ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect(),
            correct_answers: correct.iter().map(|s| s.to_string()).collect(),
            points,
            difficulty: None,
        }
    }

    pub fn evaluation(questions: Vec<Question>) -> Evaluation {
        Evaluation {
            id: "eval-1".to_string(),
            title: "Roof Structures".to_string(),
            description: String::new(),
            questions,
            time_limit_minutes: 10,
            passing_score: 70.0,
            max_attempts: 2,
            lockout_hours: 48,
        }
    }
}
