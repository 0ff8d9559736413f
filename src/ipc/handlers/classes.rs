use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_patch, get_required_str, optional_str_value, require_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::transfer::split_class_label;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.grade_level,
           c.section,
           c.school_year,
           c.active,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         WHERE ? OR c.active = 1
         ORDER BY c.name, c.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([include_inactive], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_level: String = row.get(2)?;
            let section: String = row.get(3)?;
            let school_year: Option<String> = row.get(4)?;
            let active: i64 = row.get(5)?;
            let student_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLevel": grade_level,
                "section": section,
                "schoolYear": school_year,
                "active": active != 0,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let (derived_level, derived_section) = split_class_label(&name);
    let grade_level = match get_optional_str(&req.params, "gradeLevel") {
        Ok(v) => v.unwrap_or(derived_level),
        Err(e) => return e.response(&req.id),
    };
    let section = match get_optional_str(&req.params, "section") {
        Ok(v) => v.unwrap_or(derived_section),
        Err(e) => return e.response(&req.id),
    };
    let school_year = match get_optional_str(&req.params, "schoolYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, grade_level, section, school_year, active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&class_id, &name, &grade_level, &section, school_year.as_deref()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "name": name,
            "gradeLevel": grade_level,
            "section": section,
            "schoolYear": school_year
        }),
    )
}

fn class_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let patch = get_patch(&req.params)?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "name" | "gradeLevel" | "section" => {
                let s = v
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be string", k)))?;
                if k == "name" && s.is_empty() {
                    return Err(HandlerErr::new("bad_params", "name must not be empty"));
                }
                sets.push(match k.as_str() {
                    "name" => "name = ?",
                    "gradeLevel" => "grade_level = ?",
                    _ => "section = ?",
                });
                values.push(s.into());
            }
            "schoolYear" => {
                let s = optional_str_value(v, k)?;
                sets.push("school_year = ?");
                values.push(match s {
                    Some(s) => s.into(),
                    None => rusqlite::types::Value::Null,
                });
            }
            "active" => {
                let b = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::new("bad_params", "active must be boolean"))?;
                sets.push("active = ?");
                values.push(i64::from(b).into());
            }
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("unknown class field: {}", k),
                ))
            }
        }
    }
    if sets.is_empty() {
        return Ok(json!({ "ok": true, "changed": 0 }));
    }

    let sql = format!("UPDATE classes SET {} WHERE id = ?", sets.join(", "));
    values.push(class_id.into());
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "changed": changed }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // No ON DELETE CASCADE: children first.
    let steps: [(&str, &str); 4] = [
        (
            "grade_entries",
            "DELETE FROM grade_entries
             WHERE class_id = ?1 OR student_id IN (SELECT id FROM students WHERE class_id = ?1)",
        ),
        (
            "guardians",
            "DELETE FROM guardians
             WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        ),
        ("students", "DELETE FROM students WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(match class_update(state, req) {
            Ok(v) => ok(&req.id, v),
            Err(e) => e.response(&req.id),
        }),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
