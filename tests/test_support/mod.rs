#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .env_remove("GRADEBOOKD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn send_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    payload: &Value,
) -> Value {
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", payload);
    serde_json::from_str(line.trim()).expect("parse response json")
}

/// Sends a request under the given role (`None` = no session).
pub fn request_as(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    role: Option<&str>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(role) = role {
        payload["auth"] = json!({ "role": role, "userId": format!("test-{}", role) });
    }
    let value = send_raw(stdin, reader, &payload);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// Admin request; returns the full envelope.
pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    request_as(stdin, reader, Some("admin"), id, method, params)
}

/// Admin request that must succeed; returns `result`.
pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

pub fn error_code(resp: &Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

pub fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

pub fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> PathBuf {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    workspace
}

pub fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("class-{}", name),
        "classes.create",
        json!({ "name": name, "schoolYear": "2024-2025" }),
    );
    str_field(&created, "classId")
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    last_name: &str,
    first_name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("student-{}", last_name),
        "students.create",
        json!({ "classId": class_id, "lastName": last_name, "firstName": first_name }),
    );
    str_field(&created, "studentId")
}

pub fn create_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    name: &str,
    coefficient: f64,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("subject-{}", name),
        "subjects.create",
        json!({ "name": name, "coefficient": coefficient }),
    );
    str_field(&created, "subjectId")
}

pub fn put_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
    subject_id: &str,
    semester: i64,
    evaluation_type: &str,
    score: f64,
) {
    let _ = request_ok(
        stdin,
        reader,
        "grade",
        "grades.upsert",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "semester": semester,
            "evaluationType": evaluation_type,
            "score": score
        }),
    );
}

pub fn approx(v: &Value, expected: f64) -> bool {
    v.as_f64().map(|x| (x - expected).abs() < 1e-9).unwrap_or(false)
}
