use crate::access;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn forbidden(id: &str) -> serde_json::Value {
    err(
        id,
        "forbidden",
        access::DENIED_MESSAGE,
        Some(json!({ "httpStatus": access::DENIED_HTTP_STATUS })),
    )
}
