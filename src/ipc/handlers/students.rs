use rusqlite::Connection;
use serde_json::{json, Value};

use crate::calc;
use crate::classes;
use crate::publish;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{bool_param, opt_str_param, str_list_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::school;
use crate::students::{self, StudentRecord};

pub fn record_to_json(record: &StudentRecord) -> Value {
    json!({
        "studentId": record.student_id,
        "firstname": record.firstname,
        "classname": record.classname,
        "firstYearClass": record.first_year_class,
        "term": record.term,
        "stream": record.stream,
        "numberOfSubject": record.subjects.len(),
        "subjects": record.subjects,
        "scores": record.scores,
        "teacherComment": record.teacher_comment,
        "promoted": record.promoted,
    })
}

/// Upsert the roster fields of one working record. Scores are entered through
/// `scores.save` only; an existing score map is preserved here.
fn student_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let payload = params
        .get("student")
        .ok_or_else(|| HandlerErr::bad_params("missing student"))?;

    let settings = school::require_school(conn, &school_id)?;
    let student_id = str_param(payload, "studentId")?;
    let classname = str_param(payload, "classname")?;
    let term = opt_str_param(payload, "term").unwrap_or(settings.current_term.clone());
    if !calc::is_valid_term(&term) {
        return Err(HandlerErr::bad_params("invalid term"));
    }

    // Roster edits reshape the cohort; a published class/term stays frozen
    // until a score edit reopens the gate.
    if publish::is_result_published(
        conn,
        &school_id,
        &classname,
        &term,
        &settings.academic_year,
    )? {
        return Err(HandlerErr::new(
            "result_locked",
            format!(
                "{} ({}) is published; roster edits are locked until it is reopened.",
                classname, term
            ),
        ));
    }

    let raw_stream = opt_str_param(payload, "stream").unwrap_or_default();
    let stream = if classes::class_uses_stream_for_school(&settings, &classname)
        && !classes::stream_is_unassigned(&raw_stream)
    {
        classes::normalize_stream_for_class(&settings, &classname, &raw_stream)?
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "N/A".to_string())
    } else {
        "N/A".to_string()
    };

    let existing = students::load_student(conn, &school_id, &student_id)?;
    let record = StudentRecord {
        student_id: student_id.clone(),
        firstname: str_param(payload, "firstname")?,
        first_year_class: opt_str_param(payload, "firstYearClass").unwrap_or_else(|| {
            existing
                .as_ref()
                .map(|e| e.first_year_class.clone())
                .unwrap_or_else(|| classname.clone())
        }),
        classname,
        term,
        stream,
        subjects: str_list_param(payload, "subjects"),
        scores: existing.as_ref().map(|e| e.scores.clone()).unwrap_or_default(),
        teacher_comment: existing
            .as_ref()
            .map(|e| e.teacher_comment.clone())
            .unwrap_or_default(),
        promoted: bool_param(
            payload,
            "promoted",
            existing.as_ref().map(|e| e.promoted).unwrap_or(false),
        ),
    };
    students::save_student(conn, &school_id, &record)?;
    let saved = students::load_student(conn, &school_id, &student_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "saved student not readable"))?;
    Ok(record_to_json(&saved))
}

fn student_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let student_id = str_param(params, "studentId")?;
    let record = students::load_student(conn, &school_id, &student_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    Ok(record_to_json(&record))
}

fn student_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let class_filter = opt_str_param(params, "classname");
    let term_filter = opt_str_param(params, "term");
    let records = students::load_students(
        conn,
        &school_id,
        class_filter.as_deref(),
        term_filter.as_deref(),
    )?;
    Ok(json!({
        "students": records.iter().map(record_to_json).collect::<Vec<_>>()
    }))
}

fn student_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let student_id = str_param(params, "studentId")?;
    if let Some(record) = students::load_student(conn, &school_id, &student_id)? {
        let settings = school::require_school(conn, &school_id)?;
        if publish::is_result_published(
            conn,
            &school_id,
            &record.classname,
            &settings.current_term,
            &settings.academic_year,
        )? {
            return Err(HandlerErr::new(
                "result_locked",
                format!(
                    "{} ({}) is published; roster edits are locked until it is reopened.",
                    record.classname, settings.current_term
                ),
            ));
        }
    }
    let deleted = students::delete_student(conn, &school_id, &student_id)?;
    Ok(json!({ "deleted": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let inner: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "students.save" => student_save,
        "students.get" => student_get,
        "students.list" => student_list,
        "students.delete" => student_delete,
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
