use crate::bulletin;
use crate::ipc::helpers::{
    ensure_exists, get_optional_str, get_patch, get_required_str, optional_str_value,
    parse_birth_date, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::query::{parse_student_query, select_students, StudentRow};
use crate::transfer::StudentStatus;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const MAX_GUARDIANS: usize = 2;

fn student_json(s: &StudentRow) -> Value {
    json!({
        "id": s.id,
        "classId": s.class_id,
        "lastName": s.last_name,
        "firstName": s.first_name,
        "displayName": s.display_name(),
        "studentNo": s.student_no,
        "birthDate": s.birth_date,
        "status": s.status,
        "sortOrder": s.sort_order
    })
}

fn students_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let query = parse_student_query(req.params.get("query"))
        .map_err(|m| HandlerErr::new("bad_params", m))?;

    ensure_exists(conn, "classes", &class_id, "class")?;
    let rows = bulletin::load_class_students(conn, &class_id)?;
    let selected: Vec<Value> = select_students(&rows, &query)
        .into_iter()
        .map(student_json)
        .collect();
    Ok(json!({ "students": selected, "total": rows.len() }))
}

fn students_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let last_name = get_required_str(&req.params, "lastName")?;
    let first_name = get_required_str(&req.params, "firstName")?;
    let student_no = get_optional_str(&req.params, "studentNo")?;
    let birth_date = parse_birth_date(get_optional_str(&req.params, "birthDate")?)?;
    let status = match get_optional_str(&req.params, "status")? {
        None => StudentStatus::Enrolled,
        Some(s) => StudentStatus::parse(&s)
            .ok_or_else(|| HandlerErr::new("bad_params", "unknown status"))?,
    };

    ensure_exists(conn, "classes", &class_id, "class")?;

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
           id, class_id, last_name, first_name, student_no, birth_date,
           status, sort_order, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            student_no.as_deref(),
            birth_date.as_deref(),
            status.as_str(),
            sort_order,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({ "studentId": student_id, "sortOrder": sort_order }))
}

fn students_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let patch = get_patch(&req.params)?;
    let current = bulletin::load_student(conn, &student_id)?;

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "lastName" | "firstName" => {
                let s = v
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        HandlerErr::new("bad_params", format!("{} must be a non-empty string", k))
                    })?;
                sets.push(if k == "lastName" {
                    "last_name = ?"
                } else {
                    "first_name = ?"
                });
                values.push(s.into());
            }
            "studentNo" => {
                sets.push("student_no = ?");
                values.push(optional_str_value(v, k)?.map_or(rusqlite::types::Value::Null, Into::into));
            }
            "birthDate" => {
                let d = parse_birth_date(optional_str_value(v, k)?)?;
                sets.push("birth_date = ?");
                values.push(d.map_or(rusqlite::types::Value::Null, Into::into));
            }
            "status" => {
                let next = v
                    .as_str()
                    .and_then(StudentStatus::parse)
                    .ok_or_else(|| HandlerErr::new("bad_params", "unknown status"))?;
                if !current.status.can_transition_to(next) {
                    return Err(HandlerErr::new(
                        "invalid_transition",
                        format!("cannot change status from {} to {}", current.status, next),
                    ));
                }
                sets.push("status = ?");
                values.push(next.as_str().to_string().into());
            }
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("unknown student field: {}", k),
                ))
            }
        }
    }
    if sets.is_empty() {
        return Ok(json!({ "ok": true }));
    }

    sets.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')");
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    values.push(student_id.into());
    conn.execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn students_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for (table, sql) in [
        ("grade_entries", "DELETE FROM grade_entries WHERE student_id = ?"),
        ("guardians", "DELETE FROM guardians WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        tx.execute(sql, [&student_id]).map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    info!(student_id = %student_id, "student deleted");
    Ok(json!({ "ok": true }))
}

fn guardians_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, relation, phone, email
             FROM guardians
             WHERE student_id = ?
             ORDER BY slot",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let guardians = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "relation": r.get::<_, Option<String>>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "email": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "guardians": guardians }))
}

struct GuardianInput {
    name: String,
    relation: Option<String>,
    phone: Option<String>,
    email: Option<String>,
}

fn parse_guardian(v: &Value) -> Result<GuardianInput, HandlerErr> {
    if !v.is_object() {
        return Err(HandlerErr::new("bad_params", "guardian must be an object"));
    }
    let email = get_optional_str(v, "email")?;
    if let Some(e) = email.as_deref() {
        if !e.contains('@') {
            return Err(HandlerErr::new("bad_params", "guardian email is invalid"));
        }
    }
    Ok(GuardianInput {
        name: get_required_str(v, "name")?,
        relation: get_optional_str(v, "relation")?,
        phone: get_optional_str(v, "phone")?,
        email,
    })
}

/// Replaces the guardian list (0..=2 entries) in one transaction.
fn guardians_set(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let raw = req
        .params
        .get("guardians")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::new("bad_params", "guardians must be an array"))?;
    if raw.len() > MAX_GUARDIANS {
        return Err(HandlerErr::new(
            "bad_params",
            format!("at most {} guardians per student", MAX_GUARDIANS),
        ));
    }
    let guardians = raw
        .iter()
        .map(parse_guardian)
        .collect::<Result<Vec<_>, _>>()?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM guardians WHERE student_id = ?", [&student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    let mut ids = Vec::with_capacity(guardians.len());
    for (slot, g) in guardians.iter().enumerate() {
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO guardians(id, student_id, slot, name, relation, phone, email)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                &student_id,
                slot as i64,
                &g.name,
                g.relation.as_deref(),
                g.phone.as_deref(),
                g.email.as_deref(),
            ),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "guardians" }))
        })?;
        ids.push(id);
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "guardianIds": ids }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let state = &*state;
    match req.method.as_str() {
        "students.list" => Some(respond(req, || students_list(state, req))),
        "students.create" => Some(respond(req, || students_create(state, req))),
        "students.update" => Some(respond(req, || students_update(state, req))),
        "students.delete" => Some(respond(req, || students_delete(state, req))),
        "students.guardians.list" => Some(respond(req, || guardians_list(state, req))),
        "students.guardians.set" => Some(respond(req, || guardians_set(state, req))),
        _ => None,
    }
}
