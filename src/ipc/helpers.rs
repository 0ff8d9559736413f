use crate::calc::CalcError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        Self::new(code, e.to_string())
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        let code = match e.code.as_str() {
            "bad_params" => "bad_params",
            "not_found" => "not_found",
            "db_update_failed" => "db_update_failed",
            "db_tx_failed" => "db_tx_failed",
            "db_commit_failed" => "db_commit_failed",
            _ => "db_query_failed",
        };
        Self {
            code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn require_db<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Runs a handler body and folds its error into the response envelope.
pub fn respond(req: &Request, body: impl FnOnce() -> Result<Value, HandlerErr>) -> Value {
    match body() {
        Ok(v) => crate::ipc::error::ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// `None` for absent, null or blank strings.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) => optional_str_value(v, key),
    }
}

pub fn optional_str_value(v: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        _ => Err(HandlerErr::new(
            "bad_params",
            format!("{} must be string or null", key),
        )),
    }
}

pub fn get_patch<'a>(
    params: &'a Value,
) -> Result<&'a serde_json::Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::new("bad_params", "patch must be an object"))
}

pub fn parse_birth_date(raw: Option<String>) -> Result<Option<String>, HandlerErr> {
    let Some(s) = raw else {
        return Ok(None);
    };
    chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .map_err(|_| HandlerErr::new("bad_params", "birthDate must be YYYY-MM-DD"))
}

pub fn ensure_exists(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if found.is_none() {
        return Err(HandlerErr::new("not_found", format!("{} not found", what)));
    }
    Ok(())
}
