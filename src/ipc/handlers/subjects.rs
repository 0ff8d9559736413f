use crate::ipc::helpers::{
    ensure_exists, get_optional_str, get_patch, get_required_str, optional_str_value, require_db,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::transfer::same_label;
use serde_json::{json, Value};
use uuid::Uuid;

fn parse_coefficient(v: &Value) -> Result<f64, HandlerErr> {
    let n = v
        .as_f64()
        .ok_or_else(|| HandlerErr::new("bad_params", "coefficient must be a number"))?;
    if !(n > 0.0 && n <= 100.0) {
        return Err(HandlerErr::new("bad_params", "coefficient must be in (0, 100]"));
    }
    Ok(n)
}

fn parse_weekly_hours(v: &Value) -> Result<f64, HandlerErr> {
    let n = v
        .as_f64()
        .ok_or_else(|| HandlerErr::new("bad_params", "weeklyHours must be a number"))?;
    if !(0.0..=60.0).contains(&n) {
        return Err(HandlerErr::new("bad_params", "weeklyHours must be in 0..=60"));
    }
    Ok(n)
}

fn subjects_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let level_filter = get_optional_str(&req.params, "gradeLevel")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, weekly_hours, coefficient, grade_level
             FROM subjects
             ORDER BY name, id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let subjects: Vec<Value> = rows
        .into_iter()
        .filter(|(_, _, _, _, level)| match (&level_filter, level) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(want), Some(have)) => same_label(want, have),
        })
        .map(|(id, name, weekly_hours, coefficient, grade_level)| {
            json!({
                "id": id,
                "name": name,
                "weeklyHours": weekly_hours,
                "coefficient": coefficient,
                "gradeLevel": grade_level
            })
        })
        .collect();
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = get_required_str(&req.params, "name")?;
    let coefficient = match req.params.get("coefficient") {
        None => 1.0,
        Some(v) => parse_coefficient(v)?,
    };
    let weekly_hours = match req.params.get("weeklyHours") {
        None => 0.0,
        Some(v) => parse_weekly_hours(v)?,
    };
    let grade_level = get_optional_str(&req.params, "gradeLevel")?;

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, weekly_hours, coefficient, grade_level)
         VALUES(?, ?, ?, ?, ?)",
        (
            &subject_id,
            &name,
            weekly_hours,
            coefficient,
            grade_level.as_deref(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "subjects" }))
    })?;
    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    let patch = get_patch(&req.params)?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let s = v
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| HandlerErr::new("bad_params", "name must not be empty"))?;
                sets.push("name = ?");
                values.push(s.into());
            }
            "coefficient" => {
                sets.push("coefficient = ?");
                values.push(parse_coefficient(v)?.into());
            }
            "weeklyHours" => {
                sets.push("weekly_hours = ?");
                values.push(parse_weekly_hours(v)?.into());
            }
            "gradeLevel" => {
                sets.push("grade_level = ?");
                values.push(
                    optional_str_value(v, k)?.map_or(rusqlite::types::Value::Null, Into::into),
                );
            }
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("unknown subject field: {}", k),
                ))
            }
        }
    }
    if !sets.is_empty() {
        let sql = format!("UPDATE subjects SET {} WHERE id = ?", sets.join(", "));
        values.push(subject_id.into());
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    Ok(json!({ "ok": true }))
}

fn subjects_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let removed_grades = tx
        .execute("DELETE FROM grade_entries WHERE subject_id = ?", [&subject_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "grade_entries" }))
        })?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "subjects" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true, "removedGrades": removed_grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let state = &*state;
    match req.method.as_str() {
        "subjects.list" => Some(respond(req, || subjects_list(state, req))),
        "subjects.create" => Some(respond(req, || subjects_create(state, req))),
        "subjects.update" => Some(respond(req, || subjects_update(state, req))),
        "subjects.delete" => Some(respond(req, || subjects_delete(state, req))),
        _ => None,
    }
}
