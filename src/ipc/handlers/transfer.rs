use crate::backup;
use crate::ipc::helpers::{get_optional_str, get_required_str, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::promotion;
use crate::setup::{self, SetupSection};
use crate::transfer::TransferRules;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

fn settings_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", format!("{e:#}"))
}

/// Stored rules, optionally overlaid with an unsaved `rules` patch so an
/// admin can try thresholds before committing them.
fn preview_rules(state: &AppState, params: &Value) -> Result<TransferRules, HandlerErr> {
    let conn = require_db(state)?;
    let mut current = setup::load_section(conn, SetupSection::TransferRules).map_err(settings_err)?;
    match params.get("rules") {
        None | Some(Value::Null) => {}
        Some(Value::Object(patch)) => {
            setup::merge_section_patch(SetupSection::TransferRules, &mut current, patch)
                .map_err(|m| HandlerErr::new("bad_params", m))?;
        }
        Some(_) => return Err(HandlerErr::new("bad_params", "rules must be an object")),
    }
    serde_json::from_value(current).map_err(|e| HandlerErr::new("bad_params", e.to_string()))
}

fn transfer_preview(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let rules = preview_rules(state, &req.params)?;
    let plan = promotion::build_class_plan(conn, &class_id, &rules)?;
    serde_json::to_value(&plan).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn parse_assignments(params: &Value) -> Result<HashMap<String, String>, HandlerErr> {
    let mut out = HashMap::new();
    match params.get("assignments") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (student_id, target) in map {
                let target = target
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        HandlerErr::new("bad_params", "assignments values must be class ids")
                            .with_details(json!({ "studentId": student_id }))
                    })?;
                out.insert(student_id.clone(), target);
            }
        }
        Some(_) => {
            return Err(HandlerErr::new(
                "bad_params",
                "assignments must be an object of studentId -> classId",
            ))
        }
    }
    Ok(out)
}

fn transfer_apply(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let assignments = parse_assignments(&req.params)?;
    let backup_path = get_optional_str(&req.params, "backupPath")?;

    let mut backup_info = Value::Null;
    if let Some(path) = backup_path {
        let workspace = state
            .workspace
            .as_ref()
            .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
        let summary = backup::export_workspace_bundle(workspace, &PathBuf::from(&path)).map_err(
            |e| HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": path })),
        )?;
        info!(path = %path, "pre-transfer backup written");
        backup_info = json!({ "path": path, "dbSha256": summary.db_sha256 });
    }

    let outcome = promotion::apply_class_plan(conn, &class_id, &assignments)?;
    let mut result = serde_json::to_value(&outcome)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    result["backup"] = backup_info;
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let state = &*state;
    match req.method.as_str() {
        "transfer.preview" => Some(respond(req, || transfer_preview(state, req))),
        "transfer.apply" => Some(respond(req, || transfer_apply(state, req))),
        _ => None,
    }
}
