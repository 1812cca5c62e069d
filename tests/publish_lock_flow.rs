use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    expected_code: &str,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(value["ok"], false, "{} unexpectedly succeeded", method);
    assert_eq!(value["error"]["code"], expected_code, "response: {}", value);
    value["error"]["message"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

const SCHOOL: &str = "sch-1";

fn seed_class(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let workspace = temp_dir("resultd-publish-flow");
    request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "s2",
        "school.update",
        json!({
            "schoolId": SCHOOL,
            "settings": {
                "schoolName": "Unity College",
                "principalName": "Mrs. Bello",
                "academicYear": "2025-2026",
                "currentTerm": "First Term",
                "maxTests": 2
            }
        }),
    );
    request_ok(
        stdin,
        reader,
        "s3",
        "setup.assignClass",
        json!({ "schoolId": SCHOOL, "teacherId": "T1", "classname": "JSS1" }),
    );
    request_ok(
        stdin,
        reader,
        "s4",
        "subjects.saveConfig",
        json!({
            "schoolId": SCHOOL,
            "config": {
                "classname": "JSS1",
                "coreSubjects": ["English Language", "Mathematics"]
            }
        }),
    );
    for (id, sid, name) in [("s5", "STU1", "Ada"), ("s6", "STU2", "Bola")] {
        request_ok(
            stdin,
            reader,
            id,
            "students.save",
            json!({
                "schoolId": SCHOOL,
                "student": {
                    "studentId": sid,
                    "firstname": name,
                    "classname": "JSS1",
                    "subjects": ["English Language", "Mathematics"]
                }
            }),
        );
    }
}

fn save_scores(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    english: (f64, f64, f64),
    maths: (f64, f64, f64),
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "scores.save",
        json!({
            "schoolId": SCHOOL,
            "studentId": student_id,
            "teacherId": "T1",
            "scores": {
                "English Language": { "tests": [english.0, english.1], "examScore": english.2 },
                "Mathematics": { "tests": [maths.0, maths.1], "examScore": maths.2 }
            }
        }),
    )
}

#[test]
fn publish_once_reopen_on_edit_republish() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_class(&mut stdin, &mut reader);

    // Nothing entered yet: class is not score-complete.
    let completeness = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.completeness",
        json!({ "schoolId": SCHOOL, "classname": "JSS1" }),
    );
    assert_eq!(completeness["allComplete"], false);

    // STU1: English 10+10+60 = 80, Maths 14+10+60 = 84 -> average 82.
    let saved = save_scores(
        &mut stdin,
        &mut reader,
        "2",
        "STU1",
        (10.0, 10.0, 60.0),
        (14.0, 10.0, 60.0),
    );
    assert_eq!(saved["complete"], true);

    // One student still incomplete: publish is rejected with no state change.
    let message = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "publish.class",
        json!({ "schoolId": SCHOOL, "classname": "JSS1", "teacherId": "T1", "teacherName": "Mr. Obi" }),
        "validation_failed",
    );
    assert!(message.contains("Bola"), "incomplete student named: {}", message);

    // STU2: English 9+10+60 = 79, Maths 10+10+60 = 80 -> average 79.5.
    save_scores(
        &mut stdin,
        &mut reader,
        "4",
        "STU2",
        (9.0, 10.0, 60.0),
        (10.0, 10.0, 60.0),
    );

    let published = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "publish.class",
        json!({ "schoolId": SCHOOL, "classname": "JSS1", "teacherId": "T1", "teacherName": "Mr. Obi" }),
    );
    assert_eq!(published["studentsPublished"], 2);

    let status = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "publish.status",
        json!({ "schoolId": SCHOOL, "classname": "JSS1" }),
    );
    assert_eq!(status["isPublished"], true);
    assert_eq!(status["gate"]["teacherName"], "Mr. Obi");
    assert_eq!(status["gate"]["principalName"], "Mrs. Bello");
    assert!(status["gate"]["publishedAt"].is_string());

    // Publish-once: a second publish on the same gate is rejected.
    request_err(
        &mut stdin,
        &mut reader,
        "7",
        "publish.class",
        json!({ "schoolId": SCHOOL, "classname": "JSS1", "teacherId": "T1" }),
        "already_published",
    );

    let class_results = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.class",
        json!({ "schoolId": SCHOOL, "classname": "JSS1" }),
    );
    let rows = class_results["results"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["studentId"], "STU1");
    assert_eq!(rows[0]["averageMarks"], 82.0);
    assert_eq!(rows[0]["grade"], "A");
    assert_eq!(rows[0]["status"], "Pass");
    assert_eq!(rows[0]["position"]["position"], 1);
    assert_eq!(rows[1]["studentId"], "STU2");
    assert_eq!(rows[1]["averageMarks"], 79.5);
    assert_eq!(rows[1]["position"]["position"], 2);

    // Editing any score flips the gate back to draft...
    save_scores(
        &mut stdin,
        &mut reader,
        "9",
        "STU2",
        (9.0, 10.0, 60.0),
        (14.0, 10.0, 60.0),
    );
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "publish.status",
        json!({ "schoolId": SCHOOL, "classname": "JSS1" }),
    );
    assert_eq!(reopened["isPublished"], false);

    // ...which hides the current-term result from students again.
    request_err(
        &mut stdin,
        &mut reader,
        "11",
        "results.student",
        json!({ "schoolId": SCHOOL, "studentId": "STU2" }),
        "not_found",
    );

    // The stale snapshot stays frozen until the next publish supersedes it.
    let stale = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "results.class",
        json!({ "schoolId": SCHOOL, "classname": "JSS1" }),
    );
    let stale_rows = stale["results"].as_array().expect("rows");
    let stu2 = stale_rows
        .iter()
        .find(|r| r["studentId"] == "STU2")
        .expect("STU2 row");
    assert_eq!(stu2["averageMarks"], 79.5);

    // Exactly one subsequent publish succeeds and overwrites the snapshot.
    request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "publish.class",
        json!({ "schoolId": SCHOOL, "classname": "JSS1", "teacherId": "T1" }),
    );
    let fresh = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "results.class",
        json!({ "schoolId": SCHOOL, "classname": "JSS1" }),
    );
    let fresh_rows = fresh["results"].as_array().expect("rows");
    assert_eq!(fresh_rows.len(), 2, "supersede keeps one row per student");
    let stu2 = fresh_rows
        .iter()
        .find(|r| r["studentId"] == "STU2")
        .expect("STU2 row");
    assert_eq!(stu2["averageMarks"], 81.5);
}
