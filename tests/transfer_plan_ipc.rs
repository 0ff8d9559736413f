mod test_support;

use serde_json::{json, Value};
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    approx, create_class, create_student, create_subject, error_code, open_workspace, put_grade,
    request, request_ok, spawn_sidecar, str_field,
};

fn entry<'a>(plan: &'a Value, student_id: &str) -> &'a Value {
    plan["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .find(|e| e["studentId"] == json!(student_id))
        .expect("plan entry")
}

fn student_in(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    student_id: &str,
) -> Option<Value> {
    let list = request_ok(
        stdin,
        reader,
        "lookup",
        "students.list",
        json!({ "classId": class_id }),
    );
    list["students"]
        .as_array()
        .expect("students")
        .iter()
        .find(|s| s["id"] == json!(student_id))
        .cloned()
}

#[test]
fn preview_lists_every_student_with_a_reason() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "gradebook-transfer-preview");
    let source = create_class(&mut stdin, &mut reader, "6ème A");
    let target = create_class(&mut stdin, &mut reader, "5ème A");
    let _other = create_class(&mut stdin, &mut reader, "5ème B");
    let maths = create_subject(&mut stdin, &mut reader, "Maths", 2.0);

    let at_threshold = create_student(&mut stdin, &mut reader, &source, "Alpha", "Ana");
    let below = create_student(&mut stdin, &mut reader, &source, "Beta", "Ben");
    let withdrawn = request_ok(
        &mut stdin,
        &mut reader,
        "w",
        "students.create",
        json!({
            "classId": source,
            "lastName": "Gamma",
            "firstName": "Gil",
            "status": "withdrawn"
        }),
    );
    let withdrawn = str_field(&withdrawn, "studentId");
    let ungraded = create_student(&mut stdin, &mut reader, &source, "Delta", "Dan");

    put_grade(&mut stdin, &mut reader, &at_threshold, &maths, 1, "exam", 10.0);
    put_grade(&mut stdin, &mut reader, &below, &maths, 1, "exam", 9.99);
    put_grade(&mut stdin, &mut reader, &withdrawn, &maths, 1, "exam", 15.0);

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "transfer.preview",
        json!({ "classId": source }),
    );
    let ids: Vec<&str> = plan["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .map(|e| e["studentId"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(
        ids,
        vec![
            at_threshold.as_str(),
            below.as_str(),
            withdrawn.as_str(),
            ungraded.as_str()
        ]
    );

    let a = entry(&plan, &at_threshold);
    assert_eq!(a["eligible"], json!(true));
    assert_eq!(a["action"], json!("promote"));
    assert_eq!(a["targetClassId"], json!(target));
    assert_eq!(a["targetClassName"], json!("5ème A"));
    assert!(approx(&a["annualAverage"], 10.0));

    let b = entry(&plan, &below);
    assert_eq!(b["eligible"], json!(false));
    assert_eq!(b["action"], json!("stay"));
    assert!(b["reason"].as_str().unwrap_or("").contains("below threshold"));

    let g = entry(&plan, &withdrawn);
    assert_eq!(g["eligible"], json!(false));
    assert!(g["reason"].as_str().unwrap_or("").contains("status mismatch"));

    let d = entry(&plan, &ungraded);
    assert_eq!(d["eligible"], json!(false));
    assert!(d["annualAverage"].is_null());
    assert!(d["reason"].as_str().unwrap_or("").contains("insufficient data"));

    assert_eq!(plan["summary"]["total"], json!(4));
    assert_eq!(plan["summary"]["eligible"], json!(1));

    // Unsaved override: lowers the bar for this preview only.
    let relaxed = request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "transfer.preview",
        json!({ "classId": source, "rules": { "minimumAverage": 9.5 } }),
    );
    assert_eq!(entry(&relaxed, &below)["eligible"], json!(true));
    let stored = request_ok(&mut stdin, &mut reader, "p3", "transferRules.get", json!({}));
    assert!(approx(&stored["minimumAverage"], 10.0));

    let missing = request(
        &mut stdin,
        &mut reader,
        "p4",
        "transfer.preview",
        json!({ "classId": "nope" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn apply_moves_eligible_students_once_and_can_deactivate_source() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "gradebook-transfer-apply");
    let source = create_class(&mut stdin, &mut reader, "6ème A");
    let target = create_class(&mut stdin, &mut reader, "5ème A");
    let maths = create_subject(&mut stdin, &mut reader, "Maths", 1.0);

    let passing = create_student(&mut stdin, &mut reader, &source, "Alpha", "Ana");
    let failing = create_student(&mut stdin, &mut reader, &source, "Beta", "Ben");
    put_grade(&mut stdin, &mut reader, &passing, &maths, 1, "exam", 14.0);
    put_grade(&mut stdin, &mut reader, &passing, &maths, 2, "exam", 12.0);
    put_grade(&mut stdin, &mut reader, &failing, &maths, 1, "exam", 6.0);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "transferRules.update",
        json!({ "deactivateSourceYearAfterTransfer": true }),
    );

    let backup_path = workspace.join("before-transfer.zip");
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "transfer.apply",
        json!({ "classId": source, "backupPath": backup_path.to_string_lossy() }),
    );
    assert_eq!(first["moved"], json!(1));
    assert_eq!(first["skipped"], json!(1));
    assert_eq!(first["sourceDeactivated"], json!(true));
    assert!(backup_path.is_file());
    assert_eq!(
        first["backup"]["dbSha256"].as_str().map(|s| s.len()),
        Some(64)
    );

    let moved = student_in(&mut stdin, &mut reader, &target, &passing).expect("moved student");
    assert_eq!(moved["status"], json!("transferred"));
    assert!(student_in(&mut stdin, &mut reader, &source, &passing).is_none());
    let stayed = student_in(&mut stdin, &mut reader, &source, &failing).expect("kept student");
    assert_eq!(stayed["status"], json!("enrolled"));

    let active_only = request_ok(
        &mut stdin,
        &mut reader,
        "l",
        "classes.list",
        json!({ "includeInactive": false }),
    );
    let active_ids: Vec<&str> = active_only["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .map(|c| c["id"].as_str().unwrap_or(""))
        .collect();
    assert!(!active_ids.contains(&source.as_str()));
    assert!(active_ids.contains(&target.as_str()));

    // Re-running is a no-op for students already handled.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "transfer.apply",
        json!({ "classId": source }),
    );
    assert_eq!(second["moved"], json!(0));
    assert_eq!(second["completed"], json!(0));
    let target_list = request_ok(
        &mut stdin,
        &mut reader,
        "a3",
        "students.list",
        json!({ "classId": target }),
    );
    assert_eq!(target_list["students"].as_array().map(|a| a.len()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn terminal_level_completes_and_unmatched_levels_need_assignment() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "gradebook-transfer-manual");
    let last_year = create_class(&mut stdin, &mut reader, "3ème A");
    let fourth = create_class(&mut stdin, &mut reader, "4ème B");
    let inactive = create_class(&mut stdin, &mut reader, "3ème C");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "deact",
        "classes.update",
        json!({ "classId": inactive, "patch": { "active": false } }),
    );
    let maths = create_subject(&mut stdin, &mut reader, "Maths", 1.0);

    let graduate = create_student(&mut stdin, &mut reader, &last_year, "Omega", "Ola");
    put_grade(&mut stdin, &mut reader, &graduate, &maths, 1, "exam", 12.0);

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "transfer.preview",
        json!({ "classId": last_year }),
    );
    assert_eq!(entry(&plan, &graduate)["action"], json!("complete"));
    let done = request_ok(
        &mut stdin,
        &mut reader,
        "t2",
        "transfer.apply",
        json!({ "classId": last_year }),
    );
    assert_eq!(done["completed"], json!(1));
    let graduated = student_in(&mut stdin, &mut reader, &last_year, &graduate).expect("graduate");
    assert_eq!(graduated["status"], json!("completed"));

    let pupil = create_student(&mut stdin, &mut reader, &fourth, "Kappa", "Kim");
    let weak = create_student(&mut stdin, &mut reader, &fourth, "Lambda", "Lou");
    put_grade(&mut stdin, &mut reader, &pupil, &maths, 1, "exam", 15.0);
    put_grade(&mut stdin, &mut reader, &weak, &maths, 1, "exam", 5.0);

    // No "3ème B" exists, so the eligible student needs a manual target.
    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "transfer.preview",
        json!({ "classId": fourth }),
    );
    let pending = entry(&plan, &pupil);
    assert_eq!(pending["action"], json!("manual"));
    assert!(pending["targetClassId"].is_null());

    let waiting = request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "transfer.apply",
        json!({ "classId": fourth }),
    );
    assert_eq!(waiting["moved"], json!(0));
    assert!(student_in(&mut stdin, &mut reader, &fourth, &pupil).is_some());

    let rejections = [
        (json!({ weak.clone(): last_year.clone() }), "bad_params"),
        (json!({ pupil.clone(): fourth.clone() }), "bad_params"),
        (json!({ pupil.clone(): inactive.clone() }), "bad_params"),
        (json!({ pupil.clone(): "missing-class" }), "not_found"),
    ];
    for (i, (assignments, code)) in rejections.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "transfer.apply",
            json!({ "classId": fourth, "assignments": assignments }),
        );
        assert_eq!(error_code(&resp), code, "{}", resp);
    }
    // Rejected batches leave nothing half-applied.
    assert!(student_in(&mut stdin, &mut reader, &fourth, &pupil).is_some());

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "m3",
        "transfer.apply",
        json!({ "classId": fourth, "assignments": { pupil.clone(): last_year.clone() } }),
    );
    assert_eq!(assigned["moved"], json!(1));
    let moved = student_in(&mut stdin, &mut reader, &last_year, &pupil).expect("assigned");
    assert_eq!(moved["status"], json!("transferred"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn transferred_student_starts_the_new_class_without_grades() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "gradebook-transfer-grades");
    let source = create_class(&mut stdin, &mut reader, "6ème A");
    let target = create_class(&mut stdin, &mut reader, "5ème A");
    let maths = create_subject(&mut stdin, &mut reader, "Maths", 1.0);
    let pupil = create_student(&mut stdin, &mut reader, &source, "Alpha", "Ana");
    put_grade(&mut stdin, &mut reader, &pupil, &maths, 1, "exam", 15.0);

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "transfer.apply",
        json!({ "classId": source }),
    );
    assert_eq!(applied["moved"], json!(1));

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "bulletin.class",
        json!({ "classId": target }),
    );
    let rows = report["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["studentId"], json!(pupil));
    assert!(rows[0]["average"].is_null(), "{}", rows[0]);
    assert!(rows[0]["rank"].is_null());
    assert_eq!(report["gradedCount"], json!(0));

    let own = request_ok(
        &mut stdin,
        &mut reader,
        "g3",
        "bulletin.student",
        json!({ "studentId": pupil }),
    );
    assert!(own["annualAverage"].is_null());

    let current = request_ok(
        &mut stdin,
        &mut reader,
        "g4",
        "grades.list",
        json!({ "studentId": pupil }),
    );
    assert_eq!(current["classId"], json!(target));
    assert_eq!(current["grades"].as_array().map(|a| a.len()), Some(0));
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "g5",
        "grades.list",
        json!({ "studentId": pupil, "classId": source }),
    );
    assert_eq!(history["grades"].as_array().map(|a| a.len()), Some(1));
    assert!(approx(&history["grades"][0]["score"], 15.0));

    // Same subject, semester and evaluation in the new class is a fresh entry.
    let fresh = request_ok(
        &mut stdin,
        &mut reader,
        "g6",
        "grades.upsert",
        json!({
            "studentId": pupil,
            "subjectId": maths,
            "semester": 1,
            "evaluationType": "exam",
            "score": 9.0
        }),
    );
    assert_eq!(fresh["created"], json!(true));
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "g7",
        "bulletin.class",
        json!({ "classId": target }),
    );
    assert!(approx(&report["rows"][0]["average"], 9.0));

    let _ = std::fs::remove_dir_all(workspace);
}
