mod test_support;

use serde_json::json;
use test_support::{
    approx, create_class, create_student, create_subject, error_code, open_workspace, put_grade,
    request, request_ok, spawn_sidecar,
};

#[test]
fn ungraded_subjects_drop_out_of_the_semester_average() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "gradebook-bulletin-avg");
    let class_id = create_class(&mut stdin, &mut reader, "6ème A");
    let graded = create_student(&mut stdin, &mut reader, &class_id, "Martin", "Léa");
    let empty = create_student(&mut stdin, &mut reader, &class_id, "Durand", "Inès");

    let maths = create_subject(&mut stdin, &mut reader, "Maths", 3.0);
    let _physics = create_subject(&mut stdin, &mut reader, "Physique", 4.0);
    let art = create_subject(&mut stdin, &mut reader, "Arts", 1.0);

    put_grade(&mut stdin, &mut reader, &graded, &maths, 1, "assignment1", 11.0);
    put_grade(&mut stdin, &mut reader, &graded, &maths, 1, "exam", 13.0);
    put_grade(&mut stdin, &mut reader, &graded, &art, 1, "exam", 16.0);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "bulletin.student",
        json!({ "studentId": graded }),
    );
    let s1 = &report["semesters"][0];
    assert_eq!(s1["semester"], json!(1));
    assert!(approx(&s1["average"], 13.0), "{}", s1);
    let physics_line = s1["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .find(|l| l["name"] == json!("Physique"))
        .expect("physique line");
    assert!(physics_line["average"].is_null());

    // Semester 2 has no data; the annual average falls back to semester 1.
    assert!(report["semesters"][1]["average"].is_null());
    assert!(approx(&report["annualAverage"], 13.0));
    assert_eq!(report["transfer"]["eligible"], json!(true));

    let none = request_ok(
        &mut stdin,
        &mut reader,
        "b2",
        "bulletin.student",
        json!({ "studentId": empty }),
    );
    assert!(none["semesters"][0]["average"].is_null());
    assert!(none["annualAverage"].is_null());
    assert_eq!(none["transfer"]["eligible"], json!(false));
    assert!(none["transfer"]["reason"]
        .as_str()
        .unwrap_or("")
        .contains("insufficient data"));

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "b3",
        "bulletin.class",
        json!({ "classId": class_id, "period": 1 }),
    );
    assert_eq!(class["period"], json!("1"));
    assert_eq!(class["gradedCount"], json!(1));
    assert!(approx(&class["classAverage"], 13.0));
    let rows = class["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["rank"], json!(1));
    assert!(rows[1]["rank"].is_null());
    assert!(rows[1]["average"].is_null());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn upsert_replaces_and_weights_apply_per_evaluation_type() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "gradebook-bulletin-weights");
    let class_id = create_class(&mut stdin, &mut reader, "5ème B");
    let student = create_student(&mut stdin, &mut reader, &class_id, "Bernard", "Hugo");
    let maths = create_subject(&mut stdin, &mut reader, "Maths", 2.0);

    put_grade(&mut stdin, &mut reader, &student, &maths, 2, "assignment1", 4.0);
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "grades.upsert",
        json!({
            "studentId": student,
            "subjectId": maths,
            "semester": 2,
            "evaluationType": "assignment1",
            "score": 10
        }),
    );
    assert_eq!(again["created"], json!(false));
    put_grade(&mut stdin, &mut reader, &student, &maths, 2, "exam", 14.0);

    let plain = request_ok(
        &mut stdin,
        &mut reader,
        "u2",
        "bulletin.student",
        json!({ "studentId": student }),
    );
    assert!(approx(&plain["semesters"][1]["average"], 12.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u3",
        "setup.update",
        json!({ "section": "grading", "patch": { "evaluationWeights": { "exam": 3 } } }),
    );
    let weighted = request_ok(
        &mut stdin,
        &mut reader,
        "u4",
        "bulletin.student",
        json!({ "studentId": student }),
    );
    // (10*1 + 14*3) / 4
    assert!(approx(&weighted["semesters"][1]["average"], 13.0));

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "u5",
        "grades.upsert",
        json!({
            "studentId": student,
            "subjectId": maths,
            "semester": 1,
            "evaluationType": "exam",
            "score": 20.5
        }),
    );
    assert_eq!(error_code(&out_of_range), "bad_params");
    let bad_semester = request(
        &mut stdin,
        &mut reader,
        "u6",
        "grades.upsert",
        json!({
            "studentId": student,
            "subjectId": maths,
            "semester": 3,
            "evaluationType": "exam",
            "score": 12
        }),
    );
    assert_eq!(error_code(&bad_semester), "bad_params");
    let bad_period = request(
        &mut stdin,
        &mut reader,
        "u7",
        "bulletin.class",
        json!({ "classId": class_id, "period": "winter" }),
    );
    assert_eq!(error_code(&bad_period), "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}
