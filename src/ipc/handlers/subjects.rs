use rusqlite::Connection;
use serde_json::{json, Value};

use crate::classes::{self, ClassSubjectConfig};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{i64_param, opt_str_param, str_list_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::school;

fn config_to_json(config: &ClassSubjectConfig) -> Value {
    json!({
        "classname": config.classname,
        "coreSubjects": config.core_subjects,
        "scienceSubjects": config.science_subjects,
        "artSubjects": config.art_subjects,
        "commercialSubjects": config.commercial_subjects,
        "optionalSubjects": config.optional_subjects,
        "optionalSubjectLimit": config.optional_subject_limit,
    })
}

fn config_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let classname = str_param(params, "classname")?;
    let config = classes::get_class_subject_config(conn, &school_id, &classname)?
        .ok_or_else(|| HandlerErr::new("not_found", "no subject configuration for this class"))?;
    Ok(config_to_json(&config))
}

fn config_save(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let payload = params
        .get("config")
        .ok_or_else(|| HandlerErr::bad_params("missing config"))?;
    let config = ClassSubjectConfig {
        classname: str_param(payload, "classname")?,
        core_subjects: str_list_param(payload, "coreSubjects"),
        science_subjects: str_list_param(payload, "scienceSubjects"),
        art_subjects: str_list_param(payload, "artSubjects"),
        commercial_subjects: str_list_param(payload, "commercialSubjects"),
        optional_subjects: str_list_param(payload, "optionalSubjects"),
        optional_subject_limit: i64_param(payload, "optionalSubjectLimit", 0),
    };
    classes::save_class_subject_config(conn, &school_id, &config)?;
    let saved = classes::get_class_subject_config(conn, &school_id, &config.classname)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "saved config not readable"))?;
    Ok(config_to_json(&saved))
}

fn config_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let classname = str_param(params, "classname")?;
    let deleted = classes::delete_class_subject_config(conn, &school_id, &classname)?;
    Ok(json!({ "deleted": deleted }))
}

/// Resolve the subject list a student in this class/stream would carry,
/// validating the optional-subject selection.
fn build_for_student(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let classname = str_param(params, "classname")?;
    let stream = opt_str_param(params, "stream").unwrap_or_default();
    let selected_optional = str_list_param(params, "selectedOptional");

    let settings = school::require_school(conn, &school_id)?;
    let config = classes::get_class_subject_config(conn, &school_id, &classname)?.ok_or_else(|| {
        HandlerErr::new(
            "not_found",
            "No subject configuration found for this class. Ask school admin to configure it first.",
        )
    })?;
    let (subjects, resolved_stream) = classes::build_subjects_from_config(
        &settings,
        &classname,
        &stream,
        &config,
        &selected_optional,
    )?;
    Ok(json!({
        "subjects": subjects,
        "stream": resolved_stream.map(|s| s.as_str()).unwrap_or("N/A"),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let inner: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "subjects.getConfig" => config_get,
        "subjects.saveConfig" => config_save,
        "subjects.deleteConfig" => config_delete,
        "subjects.buildForStudent" => build_for_student,
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
