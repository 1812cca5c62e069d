use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::calc::{self, ScoreEntry};
use crate::classes::{self, AssessmentConfig, ExamMode};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{opt_str_param, score_field, str_param};
use crate::ipc::types::{AppState, Request};
use crate::publish;
use crate::rank::{self, RankEntry};
use crate::school::{self, SchoolSettings};
use crate::students;

use super::students::record_to_json;

fn validation(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("validation_failed", message)
}

fn parse_tests(
    block: &Value,
    subject: &str,
    settings: &SchoolSettings,
) -> Result<Vec<f64>, HandlerErr> {
    if !settings.test_enabled {
        return Ok(Vec::new());
    }
    let raw = block
        .get("tests")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if raw.len() as i64 > settings.max_tests {
        return Err(validation(format!(
            "At most {} test scores are allowed for {}.",
            settings.max_tests, subject
        )));
    }
    let mut tests = Vec::with_capacity(raw.len());
    for (i, value) in raw.iter().enumerate() {
        let n = match value {
            Value::Null => 0.0,
            v => v.as_f64().filter(|n| n.is_finite()).ok_or_else(|| {
                validation(format!("Invalid Test {} score for {}.", i + 1, subject))
            })?,
        };
        if !(0.0..=settings.test_score_max).contains(&n) {
            return Err(validation(format!(
                "Test {} score for {} must be between 0 and {}.",
                i + 1,
                subject,
                settings.test_score_max
            )));
        }
        tests.push(n);
    }
    let total: f64 = tests.iter().sum();
    if total > settings.test_score_max {
        return Err(validation(format!(
            "Total test score for {} must not exceed {}.",
            subject, settings.test_score_max
        )));
    }
    Ok(tests)
}

fn parse_subject_entry(
    block: &Value,
    subject: &str,
    settings: &SchoolSettings,
    exam_config: &AssessmentConfig,
) -> Result<ScoreEntry, HandlerErr> {
    let tests = parse_tests(block, subject, settings)?;
    if !settings.exam_enabled {
        return Ok(ScoreEntry::Tests { tests });
    }

    match exam_config.exam_mode {
        ExamMode::Combined => {
            let exam_score = score_field(block, "examScore", &format!("exam score for {}", subject))?;
            let exam_max = exam_config.exam_score_max.max(0) as f64;
            if !(0.0..=exam_max).contains(&exam_score) {
                return Err(validation(format!(
                    "Exam score for {} must be between 0 and {}.",
                    subject, exam_max
                )));
            }
            Ok(ScoreEntry::CombinedExam { tests, exam_score })
        }
        ExamMode::Separate => {
            let objective =
                score_field(block, "objective", &format!("objective score for {}", subject))?;
            let theory = score_field(block, "theory", &format!("theory score for {}", subject))?;
            let objective_max = exam_config.objective_max.max(0) as f64;
            let theory_max = exam_config.theory_max.max(0) as f64;
            let exam_total_max = exam_config.exam_score_max.max(0) as f64;
            if !(0.0..=objective_max).contains(&objective) {
                return Err(validation(format!(
                    "Objective score for {} must be between 0 and {}.",
                    subject, objective_max
                )));
            }
            if !(0.0..=theory_max).contains(&theory) {
                return Err(validation(format!(
                    "Theory score for {} must be between 0 and {}.",
                    subject, theory_max
                )));
            }
            if objective + theory > exam_total_max {
                return Err(validation(format!(
                    "Total exam score for {} must not exceed {}.",
                    subject, exam_total_max
                )));
            }
            Ok(ScoreEntry::SeparateExam {
                tests,
                objective,
                theory,
            })
        }
    }
}

/// Save one student's scores for the tenant's current term. A save against a
/// published class/term is the explicit `Published --(any score write)-->
/// Draft` transition: the gate reopens in the same transaction as the save,
/// and the class must be republished before students see anything new.
fn scores_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let student_id = str_param(params, "studentId")?;
    let teacher_id = opt_str_param(params, "teacherId").unwrap_or_default();

    let settings = school::require_school(conn, &school_id)?;
    let current_term = settings.current_term.clone();
    let current_year = settings.academic_year.clone();
    let scale = settings.grade_scale();

    let mut student = students::load_student(conn, &school_id, &student_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;

    if classes::class_uses_stream_for_school(&settings, &student.classname)
        && classes::stream_is_unassigned(&student.stream)
    {
        return Err(validation(
            "Allocate stream for this SS student before entering scores.",
        ));
    }

    // Keep the subject list aligned with the current class configuration
    // before accepting scores against it.
    if let Some(config) =
        classes::get_class_subject_config(conn, &school_id, &student.classname)?
    {
        students::sync_subjects_to_config(&mut student, &config, &settings)?;
    }
    if student.subjects.is_empty() {
        return Err(validation("student has no subjects configured"));
    }

    let exam_config = classes::assessment_config_for_class(conn, &school_id, &student.classname)?;
    let payload = params.get("scores").cloned().unwrap_or_else(|| json!({}));
    let empty = json!({});

    let mut scores = BTreeMap::new();
    for subject in &student.subjects {
        let block = payload.get(subject).unwrap_or(&empty);
        let entry = parse_subject_entry(block, subject, &settings, &exam_config)?;
        scores.insert(
            subject.clone(),
            calc::finalize_block(entry, &settings, &scale),
        );
    }

    student.scores = scores;
    student.term = current_term.clone();
    if let Some(comment) = params.get("teacherComment").and_then(|v| v.as_str()) {
        student.teacher_comment = comment.trim().to_string();
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::from)?;
    students::save_student(&tx, &school_id, &student)?;
    publish::reopen_gate_for_edit(
        &tx,
        &school_id,
        &student.classname,
        &current_term,
        &current_year,
        &teacher_id,
    )?;
    tx.commit().map_err(HandlerErr::from)?;

    let complete = student.is_score_complete(&settings, &current_term);
    Ok(json!({
        "saved": true,
        "complete": complete,
        "student": record_to_json(&student),
    }))
}

/// Completeness report for one class on the tenant's current term — the
/// publish precondition, surfaced per student.
fn scores_completeness(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let classname = str_param(params, "classname")?;
    let settings = school::require_school(conn, &school_id)?;
    let term = settings.current_term.clone();

    let records =
        students::load_students(conn, &school_id, Some(&classname), Some(&term))?;
    let rows: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "studentId": r.student_id,
                "firstname": r.firstname,
                "complete": r.is_score_complete(&settings, &term),
            })
        })
        .collect();
    let all_complete = !records.is_empty()
        && records.iter().all(|r| r.is_score_complete(&settings, &term));
    Ok(json!({
        "term": term,
        "students": rows,
        "allComplete": all_complete,
    }))
}

/// Live standings over working records, for teacher preview before publish.
/// Uses the same cohort split and tie walk as the published read path, so the
/// two can never disagree.
fn scores_standings(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let classname = str_param(params, "classname")?;
    let settings = school::require_school(conn, &school_id)?;
    let term = settings.current_term.clone();

    let records = students::load_students(conn, &school_id, Some(&classname), Some(&term))?;
    let entries: Vec<RankEntry> = records
        .iter()
        .map(|r| RankEntry {
            student_id: r.student_id.clone(),
            classname: r.classname.clone(),
            term: r.term.clone(),
            stream: r.stream.clone(),
            average_marks: calc::average_marks(&r.scores, &settings),
        })
        .collect();
    let positions = rank::compute_positions(&entries, &settings);

    let mut rows: Vec<Value> = records
        .iter()
        .zip(entries.iter())
        .map(|(r, e)| {
            let position = positions.get(&r.student_id);
            json!({
                "studentId": r.student_id,
                "firstname": r.firstname,
                "stream": r.stream,
                "averageMarks": e.average_marks,
                "complete": r.is_score_complete(&settings, &term),
                "position": position.map(|p| json!({
                    "position": p.position,
                    "cohortSize": p.cohort_size,
                    "streamLabel": p.stream_label,
                    "isStreamSeparate": p.is_stream_separate,
                })),
            })
        })
        .collect();
    rows.sort_by_key(|row| {
        row.get("position")
            .and_then(|p| p.get("position"))
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::MAX)
    });

    Ok(json!({ "term": term, "standings": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let inner: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "scores.save" => scores_save,
        "scores.completeness" => scores_completeness,
        "scores.standings" => scores_standings,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match inner(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
