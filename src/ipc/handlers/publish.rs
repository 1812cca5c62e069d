use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{opt_str_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::publish;
use crate::school;
use crate::students;

/// Publish one class for the tenant's current term. The gate and the
/// score-complete precondition are checked here, then the snapshot + gate
/// flip run as one transaction in the engine.
fn publish_class(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let classname = str_param(params, "classname")?;
    let teacher_id = str_param(params, "teacherId")?;
    let teacher_name = opt_str_param(params, "teacherName").unwrap_or_else(|| teacher_id.clone());

    let settings = school::require_school(conn, &school_id)?;
    let term = settings.current_term.clone();
    let year = settings.academic_year.clone();

    if publish::is_result_published(conn, &school_id, &classname, &term, &year)? {
        return Err(HandlerErr::new(
            "already_published",
            format!(
                "{} ({}) is already published. Republish is not allowed.",
                classname, term
            ),
        ));
    }

    let class_students =
        students::load_students(conn, &school_id, Some(&classname), Some(&term))?;
    if class_students.is_empty() {
        return Err(HandlerErr::new(
            "validation_failed",
            format!("No students found in {}.", classname),
        ));
    }
    let incomplete: Vec<&str> = class_students
        .iter()
        .filter(|s| !s.is_score_complete(&settings, &term))
        .map(|s| s.firstname.as_str())
        .collect();
    if !incomplete.is_empty() {
        return Err(HandlerErr::new(
            "validation_failed",
            format!(
                "Cannot publish yet. Complete scores for all students in {} ({}) first: {}.",
                classname,
                term,
                incomplete.join(", ")
            ),
        ));
    }

    let summary = publish::publish_class(
        conn,
        &school_id,
        &classname,
        &term,
        &teacher_id,
        &teacher_name,
    )?;
    Ok(json!({
        "published": true,
        "term": term,
        "academicYear": year,
        "studentsPublished": summary.students_published,
    }))
}

fn gate_to_json(gate: &publish::PublicationGate) -> Value {
    json!({
        "classname": gate.classname,
        "term": gate.term,
        "academicYear": gate.academic_year,
        "teacherId": gate.teacher_id,
        "teacherName": gate.teacher_name,
        "principalName": gate.principal_name,
        "isPublished": gate.is_published,
        "publishedAt": gate.published_at,
    })
}

/// Gate state for one class, or the publication dashboard for every class
/// assigned this term.
fn publish_status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let settings = school::require_school(conn, &school_id)?;
    let term = opt_str_param(params, "term").unwrap_or(settings.current_term.clone());
    let year = opt_str_param(params, "academicYear").unwrap_or(settings.academic_year.clone());

    if let Some(classname) = opt_str_param(params, "classname") {
        let gate = publish::load_publication_gate(conn, &school_id, &classname, &term, &year)?;
        return Ok(json!({
            "classname": classname,
            "term": term,
            "isPublished": gate.as_ref().map(|g| g.is_published).unwrap_or(false),
            "gate": gate.as_ref().map(gate_to_json),
        }));
    }

    let statuses = publish::school_publication_statuses(conn, &school_id, &term, &year)?;
    let rows: Vec<Value> = statuses
        .iter()
        .map(|s| {
            json!({
                "classname": s.classname,
                "teacherId": s.teacher_id,
                "teacherName": s.teacher_name,
                "isPublished": s.is_published,
                "publishedAt": s.published_at,
            })
        })
        .collect();
    Ok(json!({ "term": term, "academicYear": year, "classes": rows }))
}

fn view_counts(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let settings = school::require_school(conn, &school_id)?;
    let term = opt_str_param(params, "term").unwrap_or(settings.current_term.clone());
    let year = opt_str_param(params, "academicYear").unwrap_or(settings.academic_year.clone());

    let counts = publish::class_published_view_counts(conn, &school_id, &term, &year)?;
    let mut out = serde_json::Map::new();
    for (classname, c) in counts {
        out.insert(
            classname,
            json!({
                "publishedCount": c.published_count,
                "viewedCount": c.viewed_count,
            }),
        );
    }
    Ok(json!({ "term": term, "academicYear": year, "classes": Value::Object(out) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let inner: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "publish.class" => publish_class,
        "publish.status" => publish_status,
        "publish.viewCounts" => view_counts,
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
