use rusqlite::Connection;
use serde_json::{json, Value};

use crate::calc::{self, PublishedTerm};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{opt_str_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::publish::{self, PublishedSnapshot};
use crate::rank::{self, RankEntry, SubjectRankSource};
use crate::school::{self, SchoolSettings};

/// Published terms a student may open right now: snapshot exists AND the
/// class/term gate is still published (an edit reopens the gate and hides
/// that term until it is republished), minus terms hidden by the
/// operations-off visibility rule.
fn visible_terms(
    conn: &Connection,
    settings: &SchoolSettings,
    school_id: &str,
    student_id: &str,
    classname: Option<&str>,
) -> Result<Vec<PublishedTerm>, HandlerErr> {
    let all = publish::published_terms_for_student(conn, school_id, student_id, classname)?;
    let mut gated = Vec::new();
    for term in all {
        if publish::is_result_published(
            conn,
            school_id,
            &term.classname,
            &term.term,
            &term.academic_year,
        )? {
            gated.push(term);
        }
    }
    Ok(calc::filter_visible_terms(settings, gated))
}

fn terms_to_json(terms: &[PublishedTerm]) -> Value {
    json!(terms
        .iter()
        .map(|t| {
            json!({
                "academicYear": t.academic_year,
                "term": t.term,
                "classname": t.classname,
                "token": t.token,
                "label": t.label,
            })
        })
        .collect::<Vec<_>>())
}

fn published_terms(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let student_id = str_param(params, "studentId")?;
    let classname = opt_str_param(params, "classname");
    let settings = school::require_school(conn, &school_id)?;
    let terms = visible_terms(
        conn,
        &settings,
        &school_id,
        &student_id,
        classname.as_deref(),
    )?;
    Ok(json!({ "terms": terms_to_json(&terms) }))
}

fn snapshot_to_json(snapshot: &PublishedSnapshot) -> Value {
    json!({
        "studentId": snapshot.student_id,
        "firstname": snapshot.firstname,
        "classname": snapshot.classname,
        "academicYear": snapshot.academic_year,
        "term": snapshot.term,
        "stream": snapshot.stream,
        "numberOfSubject": snapshot.number_of_subject,
        "subjects": snapshot.subjects,
        "scores": snapshot.scores,
        "teacherComment": snapshot.teacher_comment,
        "averageMarks": snapshot.average_marks,
        "grade": snapshot.grade,
        "status": snapshot.status,
        "publishedAt": snapshot.published_at,
    })
}

fn rank_entries(snapshots: &[PublishedSnapshot]) -> Vec<RankEntry> {
    snapshots
        .iter()
        .map(|s| RankEntry {
            student_id: s.student_id.clone(),
            classname: s.classname.clone(),
            term: s.term.clone(),
            stream: s.stream.clone(),
            average_marks: s.average_marks,
        })
        .collect()
}

fn position_to_json(p: &rank::Position) -> Value {
    json!({
        "position": p.position,
        "cohortSize": p.cohort_size,
        "classname": p.classname,
        "term": p.term,
        "stream": p.stream,
        "streamLabel": p.stream_label,
        "isStreamSeparate": p.is_stream_separate,
        "group": p.group,
    })
}

/// One student's published result for a resolved term, with class and
/// per-subject standing reconstructed from the frozen snapshots.
fn student_result(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let student_id = str_param(params, "studentId")?;
    let requested_term = opt_str_param(params, "term").unwrap_or_default();
    let selected_class = opt_str_param(params, "classname");

    let settings = school::require_school(conn, &school_id)?;
    let terms = visible_terms(
        conn,
        &settings,
        &school_id,
        &student_id,
        selected_class.as_deref(),
    )?;
    if terms.is_empty() {
        return Err(HandlerErr::new(
            "not_found",
            "No published result available yet.",
        ));
    }

    let target = calc::resolve_requested_published_term(
        &terms,
        &requested_term,
        &settings.current_term,
        &settings.academic_year,
    )
    .ok_or_else(|| {
        HandlerErr::new(
            "not_found",
            format!("{} result is not published for you.", requested_term),
        )
    })?;

    let snapshot = publish::load_published_student_result(
        conn,
        &school_id,
        &student_id,
        &target.term,
        Some(&target.academic_year),
        selected_class.as_deref(),
    )?
    .ok_or_else(|| HandlerErr::new("not_found", "Published result snapshot not found."))?;

    publish::record_result_view(
        conn,
        &school_id,
        &student_id,
        &snapshot.term,
        &snapshot.academic_year,
    )?;

    let class_results = publish::load_published_class_results(
        conn,
        &school_id,
        &snapshot.classname,
        &snapshot.term,
        Some(&snapshot.academic_year),
    )?;
    let positions = rank::compute_positions(&rank_entries(&class_results), &settings);
    let position = positions.get(&student_id);

    let sources: Vec<SubjectRankSource<'_>> = class_results
        .iter()
        .map(|s| SubjectRankSource {
            student_id: &s.student_id,
            stream: &s.stream,
            scores: &s.scores,
        })
        .collect();
    let subject_positions = rank::compute_subject_positions(
        &sources,
        &snapshot.subjects,
        &student_id,
        &snapshot.stream,
        &snapshot.classname,
        &settings,
    );
    let subject_positions_json: serde_json::Map<String, Value> = subject_positions
        .iter()
        .map(|(subject, p)| {
            (
                subject.clone(),
                json!({ "position": p.position, "cohortSize": p.cohort_size }),
            )
        })
        .collect();

    Ok(json!({
        "student": snapshot_to_json(&snapshot),
        "position": position.map(position_to_json),
        "subjectPositions": Value::Object(subject_positions_json),
        "publishedTerms": terms_to_json(&terms),
        "termToken": target.token,
    }))
}

/// Whole-class published standings for one term, for staff display.
fn class_results(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let classname = str_param(params, "classname")?;
    let settings = school::require_school(conn, &school_id)?;
    let term = opt_str_param(params, "term").unwrap_or(settings.current_term.clone());
    let year = opt_str_param(params, "academicYear").unwrap_or(settings.academic_year.clone());

    let snapshots =
        publish::load_published_class_results(conn, &school_id, &classname, &term, Some(&year))?;
    let positions = rank::compute_positions(&rank_entries(&snapshots), &settings);

    let mut rows: Vec<Value> = snapshots
        .iter()
        .map(|s| {
            let position = positions.get(&s.student_id);
            json!({
                "studentId": s.student_id,
                "firstname": s.firstname,
                "stream": s.stream,
                "averageMarks": s.average_marks,
                "grade": s.grade,
                "status": s.status,
                "position": position.map(position_to_json),
            })
        })
        .collect();
    rows.sort_by_key(|row| {
        row.get("position")
            .and_then(|p| p.get("position"))
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::MAX)
    });

    Ok(json!({
        "classname": classname,
        "term": term,
        "academicYear": year,
        "results": rows,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let inner: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "results.publishedTerms" => published_terms,
        "results.student" => student_result,
        "results.class" => class_results,
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
