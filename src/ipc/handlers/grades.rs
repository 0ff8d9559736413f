use crate::calc::{self, EvaluationType};
use crate::ipc::helpers::{
    ensure_exists, get_optional_str, get_required_str, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

fn parse_semester(v: Option<&Value>) -> Result<Option<i64>, HandlerErr> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n @ (1 | 2)) => Ok(Some(n)),
            _ => Err(HandlerErr::new("bad_params", "semester must be 1 or 2")),
        },
    }
}

fn grades_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let semester = parse_semester(req.params.get("semester"))?;
    let current_class = student_class(conn, &student_id)?;
    // Grades from a class the student has left stay readable on request.
    let class_id = match get_optional_str(&req.params, "classId")? {
        Some(id) => id,
        None => current_class,
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, subject_id, semester, evaluation_type, score, remark
             FROM grade_entries
             WHERE student_id = ?1 AND class_id = ?2 AND (?3 IS NULL OR semester = ?3)
             ORDER BY semester, subject_id, evaluation_type",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let grades = stmt
        .query_map((&student_id, &class_id, semester), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "semester": r.get::<_, i64>(2)?,
                "evaluationType": r.get::<_, String>(3)?,
                "score": r.get::<_, f64>(4)?,
                "remark": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "classId": class_id, "grades": grades }))
}

fn student_class(conn: &rusqlite::Connection, student_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

/// Insert or replace the score for (student, subject, semester, evaluation)
/// within the class the student currently belongs to.
fn grades_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    let semester = parse_semester(req.params.get("semester"))?
        .ok_or_else(|| HandlerErr::new("bad_params", "missing semester"))?;
    let evaluation_type = get_required_str(&req.params, "evaluationType")
        .ok()
        .as_deref()
        .and_then(EvaluationType::parse)
        .ok_or_else(|| {
            let names: Vec<&str> = EvaluationType::ALL.iter().map(|t| t.as_str()).collect();
            HandlerErr::new(
                "bad_params",
                format!("evaluationType must be one of: {}", names.join(", ")),
            )
        })?;
    let score = req
        .params
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", "score must be a number"))?;
    if !calc::is_valid_score(score) {
        return Err(HandlerErr::new(
            "bad_params",
            format!("score must be in {}..={}", calc::MIN_SCORE, calc::MAX_SCORE),
        )
        .with_details(json!({ "score": score })));
    }
    let remark = get_optional_str(&req.params, "remark")?;

    let class_id = student_class(conn, &student_id)?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grade_entries
             WHERE student_id = ? AND class_id = ? AND subject_id = ? AND semester = ?
               AND evaluation_type = ?",
            (
                &student_id,
                &class_id,
                &subject_id,
                semester,
                evaluation_type.as_str(),
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let (grade_id, created) = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE grade_entries
                 SET score = ?, remark = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE id = ?",
                (score, remark.as_deref(), &id),
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            (id, false)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO grade_entries(
                   id, student_id, class_id, subject_id, semester, evaluation_type,
                   score, remark, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                (
                    &id,
                    &student_id,
                    &class_id,
                    &subject_id,
                    semester,
                    evaluation_type.as_str(),
                    score,
                    remark.as_deref(),
                ),
            )
            .map_err(|e| {
                HandlerErr::db("db_insert_failed", e)
                    .with_details(json!({ "table": "grade_entries" }))
            })?;
            (id, true)
        }
    };
    Ok(json!({ "gradeId": grade_id, "created": created }))
}

fn grades_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let grade_id = get_required_str(&req.params, "gradeId")?;
    let n = conn
        .execute("DELETE FROM grade_entries WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if n == 0 {
        return Err(HandlerErr::new("not_found", "grade not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let state = &*state;
    match req.method.as_str() {
        "grades.list" => Some(respond(req, || grades_list(state, req))),
        "grades.upsert" => Some(respond(req, || grades_upsert(state, req))),
        "grades.delete" => Some(respond(req, || grades_delete(state, req))),
        _ => None,
    }
}
