use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationType {
    Assignment1,
    Assignment2,
    Exam,
}

impl EvaluationType {
    pub const ALL: [EvaluationType; 3] = [Self::Assignment1, Self::Assignment2, Self::Exam];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "assignment1" => Some(Self::Assignment1),
            "assignment2" => Some(Self::Assignment2),
            "exam" => Some(Self::Exam),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assignment1 => "assignment1",
            Self::Assignment2 => "assignment2",
            Self::Exam => "exam",
        }
    }
}

/// One graded evaluation of a student in a subject for a semester.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeScore {
    pub evaluation_type: EvaluationType,
    pub score: f64,
}

/// Per-evaluation-type weights. Stored in the `grading` setup section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationWeights {
    pub assignment1: f64,
    pub assignment2: f64,
    pub exam: f64,
}

impl EvaluationWeights {
    pub fn weight_for(&self, t: EvaluationType) -> f64 {
        match t {
            EvaluationType::Assignment1 => self.assignment1,
            EvaluationType::Assignment2 => self.assignment2,
            EvaluationType::Exam => self.exam,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectAverage {
    pub average: Option<f64>,
    pub coefficient: f64,
}

pub fn is_valid_score(score: f64) -> bool {
    score.is_finite() && (MIN_SCORE..=MAX_SCORE).contains(&score)
}

/// Mean of the scores. `None` means "not graded", which is not the same as 0.
pub fn compute_subject_average(entries: &[GradeScore]) -> Option<f64> {
    if entries.is_empty() {
        return None;
    }
    let sum: f64 = entries.iter().map(|e| e.score).sum();
    Some(sum / (entries.len() as f64))
}

/// Weighted by evaluation type. Entries with a non-positive weight do not
/// count; if that leaves nothing, the simple mean is used instead.
pub fn compute_weighted_subject_average(
    entries: &[GradeScore],
    weights: &EvaluationWeights,
) -> Option<f64> {
    if entries.is_empty() {
        return None;
    }
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for e in entries {
        let w = weights.weight_for(e.evaluation_type);
        if w > 0.0 {
            sum += e.score * w;
            denom += w;
        }
    }
    if denom > 0.0 {
        Some(sum / denom)
    } else {
        compute_subject_average(entries)
    }
}

pub fn subject_average_with(
    entries: &[GradeScore],
    weights: Option<&EvaluationWeights>,
) -> Option<f64> {
    match weights {
        Some(w) => compute_weighted_subject_average(entries, w),
        None => compute_subject_average(entries),
    }
}

/// `Σ(avg·coef) / Σ(coef)` over graded subjects only.
///
/// Returns `None` when no subject carries a grade, so an empty semester can
/// never be mistaken for a failing average of 0.
pub fn compute_semester_average(subjects: &[SubjectAverage]) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for s in subjects {
        let Some(avg) = s.average else {
            continue;
        };
        sum += avg * s.coefficient;
        denom += s.coefficient;
    }
    if denom > 0.0 {
        Some(sum / denom)
    } else {
        None
    }
}

/// Both semesters count equally. A semester without data is left out.
pub fn compute_annual_average(semester1: Option<f64>, semester2: Option<f64>) -> Option<f64> {
    match (semester1, semester2) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Display rounding to 2 decimals, half away from zero.
pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Competition ranking ("1, 2, 2, 4"), highest value first.
/// Missing values get no rank.
pub fn rank_descending(values: &[Option<f64>]) -> Vec<Option<usize>> {
    let mut order: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut ranks = vec![None; values.len()];
    let mut prev: Option<f64> = None;
    let mut prev_rank = 0usize;
    for (pos, (i, v)) in order.iter().enumerate() {
        let rank = match prev {
            Some(p) if p == *v => prev_rank,
            _ => pos + 1,
        };
        ranks[*i] = Some(rank);
        prev = Some(*v);
        prev_rank = rank;
    }
    ranks
}
