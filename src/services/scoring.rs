// src/services/scoring.rs

//! Pure scoring of submitted answers against an evaluation's answer key.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::{
    error::AppError,
    models::{
        attempt::Answers,
        evaluation::{Evaluation, Question, QuestionType},
    },
};

/// Points awarded for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionScore {
    pub question_id: String,
    pub earned: f64,
    pub possible: u32,
}

/// Outcome of scoring one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReport {
    pub earned_points: f64,
    /// Sum of points over automatically graded questions.
    pub max_points: u32,
    /// Unrounded; round only when displaying.
    pub percentage: f64,
    pub passed: bool,
    pub breakdown: Vec<QuestionScore>,
    /// Free-text questions left for a human grader.
    pub pending_manual_review: Vec<String>,
}

/// Scores `answers` against `evaluation`.
///
/// * Unanswered questions earn nothing but still count towards `max_points`.
/// * Free-text questions are excluded from the percentage and listed in
///   `pending_manual_review`.
/// * An answer for a question id the evaluation does not contain is rejected.
pub fn score(evaluation: &Evaluation, answers: &Answers) -> Result<ScoreReport, AppError> {
    if let Some(unknown) = answers.keys().find(|id| evaluation.question(id).is_none()) {
        return Err(AppError::InvalidAnswerSubmission(format!(
            "question '{}' is not part of evaluation '{}'",
            unknown, evaluation.id
        )));
    }

    let empty = BTreeSet::new();
    let mut earned_points = 0.0;
    let mut max_points = 0;
    let mut breakdown = Vec::with_capacity(evaluation.questions.len());
    let mut pending_manual_review = Vec::new();

    for question in &evaluation.questions {
        if question.question_type == QuestionType::FreeText {
            pending_manual_review.push(question.id.clone());
            continue;
        }

        let selected = answers.get(&question.id).unwrap_or(&empty);
        let earned = question_points(question, selected);

        earned_points += earned;
        max_points += question.points;
        breakdown.push(QuestionScore {
            question_id: question.id.clone(),
            earned,
            possible: question.points,
        });
    }

    let percentage = if max_points == 0 {
        0.0
    } else {
        earned_points / f64::from(max_points) * 100.0
    };

    Ok(ScoreReport {
        earned_points,
        max_points,
        percentage,
        passed: max_points > 0 && percentage >= evaluation.passing_score,
        breakdown,
        pending_manual_review,
    })
}

fn question_points(question: &Question, selected: &BTreeSet<String>) -> f64 {
    let points = f64::from(question.points);
    match question.question_type {
        QuestionType::SingleChoice | QuestionType::TrueFalse => {
            if *selected == question.correct_answers {
                points
            } else {
                0.0
            }
        }
        QuestionType::MultiSelect => {
            let k = question.correct_answers.len();
            if k == 0 {
                return 0.0;
            }
            let correct = selected
                .iter()
                .filter(|v| question.correct_answers.contains(*v))
                .count();
            let incorrect = selected.len() - correct;
            let fraction = (correct as f64 - incorrect as f64) / k as f64;
            fraction.max(0.0) * points
        }
        QuestionType::FreeText => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::evaluation::fixtures::{choice, evaluation};

    fn answer(pairs: &[(&str, &[&str])]) -> Answers {
        pairs
            .iter()
            .map(|(q, values)| {
                (
                    q.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_single_choice_all_or_nothing() {
        let eval = evaluation(vec![choice("q1", QuestionType::SingleChoice, &["B"], 10)]);

        let wrong = score(&eval, &answer(&[("q1", &["A"])])).unwrap();
        assert_eq!(wrong.earned_points, 0.0);

        let right = score(&eval, &answer(&[("q1", &["B"])])).unwrap();
        assert_eq!(right.earned_points, 10.0);
        assert_eq!(right.percentage, 100.0);
    }

    #[test]
    fn test_single_choice_extra_selection_is_wrong() {
        let eval = evaluation(vec![choice("q1", QuestionType::SingleChoice, &["B"], 10)]);
        let report = score(&eval, &answer(&[("q1", &["A", "B"])])).unwrap();
        assert_eq!(report.earned_points, 0.0);
    }

    #[test]
    fn test_multi_select_exact_set_full_credit() {
        let eval = evaluation(vec![choice("q1", QuestionType::MultiSelect, &["A", "B", "C"], 9)]);
        let report = score(&eval, &answer(&[("q1", &["A", "B", "C"])])).unwrap();
        assert_eq!(report.earned_points, 9.0);
    }

    #[test]
    fn test_multi_select_over_selection_penalized() {
        let eval = evaluation(vec![choice("q1", QuestionType::MultiSelect, &["A", "B", "C"], 9)]);
        let report = score(&eval, &answer(&[("q1", &["A", "B", "C", "D"])])).unwrap();
        // (3 - 1) / 3 of 9 points
        assert!((report.earned_points - 6.0).abs() < 1e-9);
        assert!(report.earned_points < 9.0);
    }

    #[test]
    fn test_multi_select_never_negative() {
        let eval = evaluation(vec![choice("q1", QuestionType::MultiSelect, &["A"], 4)]);
        let report = score(&eval, &answer(&[("q1", &["B", "C", "D"])])).unwrap();
        assert_eq!(report.earned_points, 0.0);
    }

    #[test]
    fn test_unanswered_questions_count_towards_max() {
        let eval = evaluation(vec![
            choice("q1", QuestionType::SingleChoice, &["A"], 10),
            choice("q2", QuestionType::TrueFalse, &["B"], 10),
        ]);
        let report = score(&eval, &answer(&[("q1", &["A"])])).unwrap();
        assert_eq!(report.max_points, 20);
        assert_eq!(report.percentage, 50.0);
        assert!(!report.passed);
    }

    #[test]
    fn test_unknown_question_rejected() {
        let eval = evaluation(vec![choice("q1", QuestionType::SingleChoice, &["A"], 10)]);
        let err = score(&eval, &answer(&[("q9", &["A"])])).unwrap_err();
        assert!(matches!(err, AppError::InvalidAnswerSubmission(_)));
    }

    #[test]
    fn test_free_text_excluded_and_flagged() {
        let mut essay = choice("q2", QuestionType::FreeText, &[], 50);
        essay.options.clear();
        let eval = evaluation(vec![choice("q1", QuestionType::SingleChoice, &["A"], 10), essay]);

        let report = score(&eval, &answer(&[("q1", &["A"]), ("q2", &["some prose"])])).unwrap();
        assert_eq!(report.max_points, 10);
        assert_eq!(report.percentage, 100.0);
        assert_eq!(report.pending_manual_review, vec!["q2".to_string()]);
    }

    #[test]
    fn test_pass_boundary_not_rounded() {
        let questions: Vec<_> = (0..3)
            .map(|i| choice(&format!("q{}", i), QuestionType::SingleChoice, &["A"], 1))
            .collect();
        let mut eval = evaluation(questions);
        eval.passing_score = 66.67;

        let two_of_three = answer(&[("q0", &["A"]), ("q1", &["A"])]);
        let report = score(&eval, &two_of_three).unwrap();

        // 66.666..% would display as 66.67 but must still fail.
        assert!(report.percentage < 66.67);
        assert!(!report.passed);

        eval.passing_score = 66.0;
        assert!(score(&eval, &two_of_three).unwrap().passed);
    }
}
