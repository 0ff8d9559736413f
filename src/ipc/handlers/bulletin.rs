use crate::bulletin::{self, Period};
use crate::ipc::helpers::{get_required_str, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::setup;
use serde_json::Value;

fn settings_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", format!("{e:#}"))
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn student_bulletin(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let grading = setup::load_grading(conn).map_err(settings_err)?;
    let rules = setup::load_transfer_rules(conn).map_err(settings_err)?;
    let report = bulletin::student_bulletin(
        conn,
        &student_id,
        grading.evaluation_weights.as_ref(),
        &rules,
    )?;
    to_value(&report)
}

fn class_bulletin(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let period = Period::parse(req.params.get("period"))?;
    let grading = setup::load_grading(conn).map_err(settings_err)?;
    let report =
        bulletin::class_bulletin(conn, &class_id, period, grading.evaluation_weights.as_ref())?;
    to_value(&report)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let state = &*state;
    match req.method.as_str() {
        "bulletin.student" => Some(respond(req, || student_bulletin(state, req))),
        "bulletin.class" => Some(respond(req, || class_bulletin(state, req))),
        _ => None,
    }
}
