use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::setup::{load_section, update_section, SetupSection, SetupUpdateError};
use serde_json::{json, Map, Value};
use tracing::info;

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn apply_update(
    state: &mut AppState,
    req: &Request,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match update_section(conn, section, patch) {
        Ok(current) => {
            info!(section = section.name(), "setup section updated");
            ok(&req.id, json!({ "ok": true, "section": section.name(), "value": current }))
        }
        Err(SetupUpdateError::Invalid(msg)) => err(&req.id, "bad_params", msg, None),
        Err(SetupUpdateError::Storage(e)) => {
            err(&req.id, "db_update_failed", format!("{e:#}"), None)
        }
    }
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };
    apply_update(state, req, section, patch_obj)
}

fn handle_transfer_rules_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match load_section(conn, SetupSection::TransferRules) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

/// The rules object itself is the patch here.
fn handle_transfer_rules_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(patch_obj) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };
    apply_update(state, req, SetupSection::TransferRules, patch_obj)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        "transferRules.get" => Some(handle_transfer_rules_get(state, req)),
        "transferRules.update" => Some(handle_transfer_rules_update(state, req)),
        _ => None,
    }
}
