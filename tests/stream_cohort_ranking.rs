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

const SCHOOL: &str = "sch-stream";

fn save_ss_scores(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    subjects: &[&str],
    per_subject: (f64, f64, f64, f64),
) -> serde_json::Value {
    let (t1, t2, objective, theory) = per_subject;
    let mut scores = serde_json::Map::new();
    for subject in subjects {
        scores.insert(
            subject.to_string(),
            json!({ "tests": [t1, t2], "objective": objective, "theory": theory }),
        );
    }
    request_ok(
        stdin,
        reader,
        id,
        "scores.save",
        json!({
            "schoolId": SCHOOL,
            "studentId": student_id,
            "teacherId": "T1",
            "scores": scores,
        }),
    )
}

#[test]
fn separate_mode_ranks_each_stream_as_its_own_cohort() {
    let workspace = temp_dir("resultd-stream");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "school.update",
        json!({
            "schoolId": SCHOOL,
            "settings": {
                "schoolName": "Unity College",
                "academicYear": "2025-2026",
                "currentTerm": "First Term",
                "maxTests": 2,
                "ssRankingMode": "separate"
            }
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.saveConfig",
        json!({
            "schoolId": SCHOOL,
            "config": {
                "classname": "SS2",
                "coreSubjects": ["English Language", "Mathematics"],
                "scienceSubjects": ["Physics"],
                "artSubjects": ["Government"]
            }
        }),
    );

    let science_subjects = ["English Language", "Mathematics", "Physics"];
    let art_subjects = ["English Language", "Mathematics", "Government"];
    let roster = [
        ("SCI1", "Science", &science_subjects),
        ("SCI2", "Science", &science_subjects),
        ("ART1", "Art", &art_subjects),
    ];
    for (i, (sid, stream, subjects)) in roster.iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("4-{}", i),
            "students.save",
            json!({
                "schoolId": SCHOOL,
                "student": {
                    "studentId": sid,
                    "firstname": sid,
                    "classname": "SS2",
                    "stream": stream,
                    "subjects": subjects.to_vec()
                }
            }),
        );
    }

    // An SS student without an allocated stream cannot take scores.
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.save",
        json!({
            "schoolId": SCHOOL,
            "student": {
                "studentId": "NOSTREAM",
                "firstname": "Eze",
                "classname": "SS2",
                "subjects": ["English Language", "Mathematics", "Physics"]
            }
        }),
    );
    let message = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "scores.save",
        json!({
            "schoolId": SCHOOL,
            "studentId": "NOSTREAM",
            "teacherId": "T1",
            "scores": {}
        }),
        "validation_failed",
    );
    assert!(message.contains("stream"), "got: {}", message);
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.delete",
        json!({ "schoolId": SCHOOL, "studentId": "NOSTREAM" }),
    );

    // SS defaults to separate exam entry: tests + objective + theory.
    save_ss_scores(
        &mut stdin,
        &mut reader,
        "8",
        "SCI1",
        &science_subjects,
        (10.0, 10.0, 25.0, 35.0), // 80 per subject
    );
    save_ss_scores(
        &mut stdin,
        &mut reader,
        "9",
        "SCI2",
        &science_subjects,
        (10.0, 10.0, 20.0, 30.0), // 70 per subject
    );
    save_ss_scores(
        &mut stdin,
        &mut reader,
        "10",
        "ART1",
        &art_subjects,
        (10.0, 10.0, 15.0, 25.0), // 60 per subject
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "publish.class",
        json!({ "schoolId": SCHOOL, "classname": "SS2", "teacherId": "T1" }),
    );

    let class_results = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "results.class",
        json!({ "schoolId": SCHOOL, "classname": "SS2" }),
    );
    let rows = class_results["results"].as_array().expect("rows");
    let row_of = |sid: &str| {
        rows.iter()
            .find(|r| r["studentId"] == sid)
            .cloned()
            .expect("row")
    };

    // Science ranks among science only; the lone art student is 1st of 1.
    let sci1 = row_of("SCI1");
    assert_eq!(sci1["position"]["position"], 1);
    assert_eq!(sci1["position"]["cohortSize"], 2);
    assert_eq!(sci1["position"]["isStreamSeparate"], true);
    assert_eq!(sci1["position"]["streamLabel"], "Science");

    let sci2 = row_of("SCI2");
    assert_eq!(sci2["position"]["position"], 2);
    assert_eq!(sci2["position"]["cohortSize"], 2);

    let art1 = row_of("ART1");
    assert_eq!(art1["position"]["position"], 1);
    assert_eq!(art1["position"]["cohortSize"], 1);
    assert_eq!(art1["position"]["streamLabel"], "Art");

    // Subject cohorts follow the same split: SCI2 is 2nd of 2 in Physics,
    // and ART1 1st of 1 in shared subjects despite lower marks.
    let sci2_view = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "results.student",
        json!({ "schoolId": SCHOOL, "studentId": "SCI2" }),
    );
    assert_eq!(sci2_view["subjectPositions"]["Physics"]["position"], 2);
    assert_eq!(sci2_view["subjectPositions"]["Physics"]["cohortSize"], 2);

    let art1_view = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "results.student",
        json!({ "schoolId": SCHOOL, "studentId": "ART1" }),
    );
    assert_eq!(
        art1_view["subjectPositions"]["English Language"]["position"],
        1
    );
    assert_eq!(
        art1_view["subjectPositions"]["English Language"]["cohortSize"],
        1
    );
}
