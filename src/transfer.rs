use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    Enrolled,
    Transferred,
    Withdrawn,
    Completed,
}

impl StudentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enrolled" => Some(Self::Enrolled),
            "transferred" => Some(Self::Transferred),
            "withdrawn" => Some(Self::Withdrawn),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::Transferred => "transferred",
            Self::Withdrawn => "withdrawn",
            Self::Completed => "completed",
        }
    }

    /// Only `enrolled` moves anywhere; nothing returns to `enrolled`.
    pub fn can_transition_to(self, next: StudentStatus) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Self::Enrolled, Self::Transferred)
                | (Self::Enrolled, Self::Withdrawn)
                | (Self::Enrolled, Self::Completed)
        )
    }
}

impl fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRules {
    pub minimum_average: f64,
    pub required_status: StudentStatus,
    pub direct_transfer: bool,
    pub deactivate_source_year_after_transfer: bool,
}

impl Default for TransferRules {
    fn default() -> Self {
        Self {
            minimum_average: 10.0,
            required_status: StudentStatus::Enrolled,
            direct_transfer: true,
            deactivate_source_year_after_transfer: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub eligible: bool,
    pub reason: String,
}

pub fn evaluate(status: StudentStatus, annual_average: f64, rules: &TransferRules) -> Evaluation {
    if status != rules.required_status {
        return Evaluation {
            eligible: false,
            reason: format!(
                "status mismatch: {} (requires {})",
                status, rules.required_status
            ),
        };
    }
    if annual_average >= rules.minimum_average {
        Evaluation {
            eligible: true,
            reason: "eligible".to_string(),
        }
    } else {
        Evaluation {
            eligible: false,
            reason: format!(
                "average below threshold: {:.2} < {:.2}",
                annual_average, rules.minimum_average
            ),
        }
    }
}

pub fn evaluate_annual(
    status: StudentStatus,
    annual_average: Option<f64>,
    rules: &TransferRules,
) -> Evaluation {
    match annual_average {
        Some(avg) => evaluate(status, avg, rules),
        None if status != rules.required_status => evaluate(status, 0.0, rules),
        None => Evaluation {
            eligible: false,
            reason: "insufficient data: no grades recorded".to_string(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextLevel {
    Next(String),
    Terminal,
    Unknown,
}

fn normalize_label(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn next_grade_level(levels: &[String], level: &str) -> NextLevel {
    let key = normalize_label(level);
    if key.is_empty() {
        return NextLevel::Unknown;
    }
    let Some(pos) = levels.iter().position(|l| normalize_label(l) == key) else {
        return NextLevel::Unknown;
    };
    match levels.get(pos + 1) {
        Some(next) => NextLevel::Next(next.clone()),
        None => NextLevel::Terminal,
    }
}

pub fn same_label(a: &str, b: &str) -> bool {
    normalize_label(a) == normalize_label(b)
}

/// "6ème A" -> ("6ème", "A"). A single token has no section.
pub fn split_class_label(name: &str) -> (String, String) {
    let tokens: Vec<&str> = name.split_whitespace().collect();
    match tokens.len() {
        0 => (String::new(), String::new()),
        1 => (tokens[0].to_string(), String::new()),
        n => (tokens[..n - 1].join(" "), tokens[n - 1].to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassRef {
    pub id: String,
    pub name: String,
    pub grade_level: String,
    pub section: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStudent {
    pub id: String,
    pub display_name: String,
    pub status: StudentStatus,
    pub annual_average: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Promote,
    Complete,
    Manual,
    Stay,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPlanEntry {
    pub student_id: String,
    pub display_name: String,
    pub source_class_id: String,
    pub target_class_id: Option<String>,
    pub target_class_name: Option<String>,
    pub annual_average: Option<f64>,
    pub eligible: bool,
    pub action: PlanAction,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn find_direct_target<'a>(
    source: &ClassRef,
    next_level: &str,
    candidates: &'a [ClassRef],
) -> Option<&'a ClassRef> {
    candidates.iter().find(|c| {
        c.active
            && c.id != source.id
            && same_label(&c.grade_level, next_level)
            && same_label(&c.section, &source.section)
    })
}

/// One entry per student, in input order. Ineligible students are kept with
/// their reason so the confirmation step can show why they stay.
pub fn plan_transfers(
    students: &[PlanStudent],
    source: &ClassRef,
    candidates: &[ClassRef],
    levels: &[String],
    rules: &TransferRules,
) -> Vec<TransferPlanEntry> {
    let next = next_grade_level(levels, &source.grade_level);
    let direct_target = match &next {
        NextLevel::Next(level) if rules.direct_transfer => {
            find_direct_target(source, level, candidates)
        }
        _ => None,
    };

    students
        .iter()
        .map(|s| {
            let eval = evaluate_annual(s.status, s.annual_average, rules);
            let mut entry = TransferPlanEntry {
                student_id: s.id.clone(),
                display_name: s.display_name.clone(),
                source_class_id: source.id.clone(),
                target_class_id: None,
                target_class_name: None,
                annual_average: s.annual_average,
                eligible: eval.eligible,
                action: PlanAction::Stay,
                reason: eval.reason,
                note: None,
            };
            if !entry.eligible {
                return entry;
            }
            match &next {
                NextLevel::Terminal => {
                    entry.action = PlanAction::Complete;
                    entry.note = Some("terminal grade level".to_string());
                }
                NextLevel::Unknown => {
                    entry.action = PlanAction::Manual;
                    entry.note = Some(format!(
                        "grade level '{}' is not in the configured progression",
                        source.grade_level
                    ));
                }
                NextLevel::Next(level) => match direct_target {
                    Some(target) => {
                        entry.action = PlanAction::Promote;
                        entry.target_class_id = Some(target.id.clone());
                        entry.target_class_name = Some(target.name.clone());
                    }
                    None if !rules.direct_transfer => {
                        entry.action = PlanAction::Manual;
                        entry.note = Some("direct transfer disabled".to_string());
                    }
                    None => {
                        entry.action = PlanAction::Manual;
                        entry.note = Some(format!(
                            "no active class for {} {}",
                            level, source.section
                        ));
                    }
                },
            }
            entry
        })
        .collect()
}
