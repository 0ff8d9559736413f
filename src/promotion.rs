use crate::bulletin::{self, ClassInfo};
use crate::calc::CalcError;
use crate::setup;
use crate::transfer::{self, ClassRef, PlanAction, PlanStudent, StudentStatus, TransferPlanEntry, TransferRules};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub total: usize,
    pub eligible: usize,
    pub promote: usize,
    pub complete: usize,
    pub manual: usize,
    pub stay: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassPlan {
    pub class_id: String,
    pub class_name: String,
    pub grade_level: String,
    pub rules: TransferRules,
    pub entries: Vec<TransferPlanEntry>,
    pub summary: PlanSummary,
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

fn settings_err(e: anyhow::Error) -> CalcError {
    CalcError::new("db_query_failed", format!("{e:#}"))
}

fn class_ref(c: &ClassInfo) -> ClassRef {
    ClassRef {
        id: c.id.clone(),
        name: c.name.clone(),
        grade_level: c.grade_level.clone(),
        section: c.section.clone(),
        active: c.active,
    }
}

/// Later school years first so a direct transfer lands in the newest class.
fn load_candidate_classes(conn: &Connection, source_id: &str) -> Result<Vec<ClassRef>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, grade_level, section, active
             FROM classes
             WHERE id <> ?
             ORDER BY COALESCE(school_year, '') DESC, name, id",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([source_id], |r| {
            Ok(ClassRef {
                id: r.get(0)?,
                name: r.get(1)?,
                grade_level: r.get(2)?,
                section: r.get(3)?,
                active: r.get::<_, i64>(4)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

fn summarize(entries: &[TransferPlanEntry]) -> PlanSummary {
    let count = |a: PlanAction| entries.iter().filter(|e| e.action == a).count();
    PlanSummary {
        total: entries.len(),
        eligible: entries.iter().filter(|e| e.eligible).count(),
        promote: count(PlanAction::Promote),
        complete: count(PlanAction::Complete),
        manual: count(PlanAction::Manual),
        stay: count(PlanAction::Stay),
    }
}

pub fn build_class_plan(
    conn: &Connection,
    class_id: &str,
    rules: &TransferRules,
) -> Result<ClassPlan, CalcError> {
    let grading = setup::load_grading(conn).map_err(settings_err)?;
    let class = bulletin::load_class(conn, class_id)?;
    let students = bulletin::load_class_students(conn, class_id)?;

    let mut plan_students = Vec::with_capacity(students.len());
    for s in &students {
        let annual = bulletin::annual_average_for(
            conn,
            s,
            &class.grade_level,
            grading.evaluation_weights.as_ref(),
        )?;
        plan_students.push(PlanStudent {
            id: s.id.clone(),
            display_name: s.display_name(),
            status: s.status,
            annual_average: annual,
        });
    }

    let candidates = load_candidate_classes(conn, class_id)?;
    let entries = transfer::plan_transfers(
        &plan_students,
        &class_ref(&class),
        &candidates,
        &grading.levels,
        rules,
    );
    let summary = summarize(&entries);
    Ok(ClassPlan {
        class_id: class.id,
        class_name: class.name,
        grade_level: class.grade_level,
        rules: rules.clone(),
        entries,
        summary,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub student_id: String,
    pub action: PlanAction,
    pub applied: bool,
    pub target_class_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub class_id: String,
    pub moved: usize,
    pub completed: usize,
    pub skipped: usize,
    pub source_deactivated: bool,
    pub results: Vec<ApplyResult>,
}

fn validate_assignments(
    conn: &Connection,
    plan: &ClassPlan,
    assignments: &HashMap<String, String>,
) -> Result<(), CalcError> {
    for (student_id, target_id) in assignments {
        let Some(entry) = plan.entries.iter().find(|e| &e.student_id == student_id) else {
            return Err(
                CalcError::new("bad_params", "assignment for a student outside the class")
                    .with_details(json!({ "studentId": student_id })),
            );
        };
        if !entry.eligible {
            return Err(
                CalcError::new("bad_params", "assignment for an ineligible student")
                    .with_details(json!({ "studentId": student_id, "reason": entry.reason })),
            );
        }
        if !matches!(entry.action, PlanAction::Promote | PlanAction::Manual) {
            return Err(CalcError::new(
                "bad_params",
                "assignment for a student whose plan action is not promote or manual",
            )
            .with_details(json!({ "studentId": student_id, "action": entry.action })));
        }
        if target_id == &plan.class_id {
            return Err(CalcError::new("bad_params", "target class equals source class")
                .with_details(json!({ "studentId": student_id })));
        }
        let active: Option<i64> = conn
            .query_row("SELECT active FROM classes WHERE id = ?", [target_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        match active {
            None => {
                return Err(CalcError::new("not_found", "target class not found")
                    .with_details(json!({ "studentId": student_id, "targetClassId": target_id })))
            }
            Some(0) => {
                return Err(CalcError::new("bad_params", "target class is inactive")
                    .with_details(json!({ "studentId": student_id, "targetClassId": target_id })))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn move_student(conn: &Connection, student_id: &str, target_id: &str) -> Result<(), CalcError> {
    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [target_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    conn.execute(
        "UPDATE students
         SET class_id = ?, status = ?, sort_order = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        (
            target_id,
            StudentStatus::Transferred.as_str(),
            sort_order,
            student_id,
        ),
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    Ok(())
}

fn set_status(conn: &Connection, student_id: &str, status: StudentStatus) -> Result<(), CalcError> {
    conn.execute(
        "UPDATE students SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
        (status.as_str(), student_id),
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    Ok(())
}

fn apply_entries(
    conn: &Connection,
    plan: &ClassPlan,
    statuses: &HashMap<String, StudentStatus>,
    assignments: &HashMap<String, String>,
) -> Result<ApplyOutcome, CalcError> {
    let mut results = Vec::with_capacity(plan.entries.len());
    let mut moved = 0usize;
    let mut completed = 0usize;

    for entry in &plan.entries {
        let current = statuses
            .get(&entry.student_id)
            .copied()
            .unwrap_or(StudentStatus::Enrolled);
        let mut result = ApplyResult {
            student_id: entry.student_id.clone(),
            action: entry.action,
            applied: false,
            target_class_id: None,
            reason: entry.reason.clone(),
        };

        let target = match entry.action {
            PlanAction::Promote | PlanAction::Manual => assignments
                .get(&entry.student_id)
                .cloned()
                .or_else(|| entry.target_class_id.clone()),
            PlanAction::Complete | PlanAction::Stay => None,
        };

        match entry.action {
            PlanAction::Stay => {}
            PlanAction::Complete => {
                if current.can_transition_to(StudentStatus::Completed) {
                    set_status(conn, &entry.student_id, StudentStatus::Completed)?;
                    result.applied = true;
                    completed += 1;
                } else {
                    result.reason = format!("status transition not allowed from {}", current);
                }
            }
            PlanAction::Promote | PlanAction::Manual => match target {
                Some(target_id) if current.can_transition_to(StudentStatus::Transferred) => {
                    move_student(conn, &entry.student_id, &target_id)?;
                    result.action = PlanAction::Promote;
                    result.applied = true;
                    result.target_class_id = Some(target_id);
                    moved += 1;
                }
                Some(_) => {
                    result.reason = format!("status transition not allowed from {}", current);
                }
                None => {
                    result.reason = "awaiting manual class assignment".to_string();
                }
            },
        }
        results.push(result);
    }

    let source_deactivated = plan.rules.deactivate_source_year_after_transfer;
    if source_deactivated {
        conn.execute("UPDATE classes SET active = 0 WHERE id = ?", [&plan.class_id])
            .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    }

    let skipped = results.iter().filter(|r| !r.applied).count();
    Ok(ApplyOutcome {
        class_id: plan.class_id.clone(),
        moved,
        completed,
        skipped,
        source_deactivated,
        results,
    })
}

/// Recomputes the plan from current data and applies it in one transaction.
/// Students already moved out of the class, or whose status no longer
/// matches the rules, are naturally excluded on a second run.
pub fn apply_class_plan(
    conn: &Connection,
    class_id: &str,
    assignments: &HashMap<String, String>,
) -> Result<ApplyOutcome, CalcError> {
    let rules = setup::load_transfer_rules(conn).map_err(settings_err)?;
    let plan = build_class_plan(conn, class_id, &rules)?;
    validate_assignments(conn, &plan, assignments)?;

    let statuses: HashMap<String, StudentStatus> = bulletin::load_class_students(conn, class_id)?
        .into_iter()
        .map(|s| (s.id, s.status))
        .collect();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    let outcome = match apply_entries(&tx, &plan, &statuses, assignments) {
        Ok(v) => v,
        Err(e) => {
            warn!(class_id, code = %e.code, "transfer apply rolled back");
            let _ = tx.rollback();
            return Err(e);
        }
    };
    tx.commit()
        .map_err(|e| CalcError::new("db_commit_failed", e.to_string()))?;

    info!(
        class_id,
        moved = outcome.moved,
        completed = outcome.completed,
        skipped = outcome.skipped,
        source_deactivated = outcome.source_deactivated,
        "transfer plan applied"
    );
    Ok(outcome)
}
