use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::calc;
use crate::classes::{self, AssessmentConfig, ClassLevel, ExamMode, Ss1StreamMode};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{bool_param, f64_param, i64_param, opt_str_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::rank::StreamRankingMode;
use crate::rollover;
use crate::school::{self, SchoolSettings};

fn school_to_json(settings: &SchoolSettings) -> Value {
    json!({
        "schoolId": settings.school_id,
        "schoolName": settings.school_name,
        "principalName": settings.principal_name,
        "academicYear": settings.academic_year,
        "currentTerm": settings.current_term,
        "operationsEnabled": settings.operations_enabled,
        "testEnabled": settings.test_enabled,
        "examEnabled": settings.exam_enabled,
        "maxTests": settings.max_tests,
        "testScoreMax": settings.test_score_max,
        "gradeAMin": settings.grade_a_min,
        "gradeBMin": settings.grade_b_min,
        "gradeCMin": settings.grade_c_min,
        "gradeDMin": settings.grade_d_min,
        "passMark": settings.pass_mark,
        "ssRankingMode": settings.ss_ranking_mode.as_str(),
        "ss1StreamMode": settings.ss1_stream_mode.as_str(),
    })
}

fn school_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let settings = school::load_school(conn, &school_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "school not found"))?;
    Ok(school_to_json(&settings))
}

fn validate_academic_year(year: &str) -> Result<(), HandlerErr> {
    if year.is_empty() {
        return Ok(());
    }
    let parts: Vec<&str> = year.split('-').collect();
    let valid = parts.len() == 2
        && parts.iter().all(|p| p.len() == 4)
        && match (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
            (Ok(start), Ok(end)) => end == start + 1,
            _ => false,
        };
    if !valid {
        return Err(HandlerErr::bad_params(
            "Academic year must be consecutive YYYY-YYYY (e.g., 2026-2027).",
        ));
    }
    Ok(())
}

fn apply_settings_payload(
    settings: &mut SchoolSettings,
    payload: &Value,
) -> Result<(), HandlerErr> {
    if let Some(name) = opt_str_param(payload, "schoolName") {
        settings.school_name = name;
    }
    if let Some(name) = payload.get("principalName").and_then(|v| v.as_str()) {
        settings.principal_name = name.trim().to_string();
    }

    let new_term = opt_str_param(payload, "currentTerm").unwrap_or(settings.current_term.clone());
    if !calc::is_valid_term(&new_term) {
        return Err(HandlerErr::bad_params(
            "Current term must be First Term, Second Term, or Third Term.",
        ));
    }
    settings.current_term = new_term;

    if let Some(year) = payload.get("academicYear").and_then(|v| v.as_str()) {
        let year = year.trim().to_string();
        validate_academic_year(&year)?;
        settings.academic_year = year;
    }

    settings.operations_enabled =
        bool_param(payload, "operationsEnabled", settings.operations_enabled);
    settings.test_enabled = bool_param(payload, "testEnabled", settings.test_enabled);
    settings.exam_enabled = bool_param(payload, "examEnabled", settings.exam_enabled);

    let max_tests = i64_param(payload, "maxTests", settings.max_tests);
    if !(1..=10).contains(&max_tests) {
        return Err(HandlerErr::bad_params("maxTests must be between 1 and 10."));
    }
    settings.max_tests = max_tests;

    let test_score_max = f64_param(payload, "testScoreMax", settings.test_score_max);
    if !(0.0..=100.0).contains(&test_score_max) {
        return Err(HandlerErr::bad_params(
            "Max total test score must be between 0 and 100.",
        ));
    }
    settings.test_score_max = test_score_max;

    let a = i64_param(payload, "gradeAMin", settings.grade_a_min);
    let b = i64_param(payload, "gradeBMin", settings.grade_b_min);
    let c = i64_param(payload, "gradeCMin", settings.grade_c_min);
    let d = i64_param(payload, "gradeDMin", settings.grade_d_min);
    let pass = i64_param(payload, "passMark", settings.pass_mark);
    for v in [a, b, c, d, pass] {
        if !(0..=100).contains(&v) {
            return Err(HandlerErr::bad_params(
                "Grade thresholds and pass mark must be between 0 and 100.",
            ));
        }
    }
    if !(a >= b && b >= c && c >= d) {
        return Err(HandlerErr::bad_params(
            "Grade thresholds must satisfy A >= B >= C >= D.",
        ));
    }
    settings.grade_a_min = a;
    settings.grade_b_min = b;
    settings.grade_c_min = c;
    settings.grade_d_min = d;
    settings.pass_mark = pass;

    if let Some(mode) = opt_str_param(payload, "ssRankingMode") {
        settings.ss_ranking_mode = StreamRankingMode::parse(&mode);
    }
    if let Some(mode) = opt_str_param(payload, "ss1StreamMode") {
        settings.ss1_stream_mode = Ss1StreamMode::parse(&mode);
    }
    Ok(())
}

fn parse_assessment_payload(entry: &Value) -> Result<AssessmentConfig, HandlerErr> {
    let level_raw = str_param(entry, "level")?;
    let level = ClassLevel::parse(&level_raw);
    let exam_mode = ExamMode::parse(&opt_str_param(entry, "examMode").unwrap_or_default());
    let objective_max = i64_param(entry, "objectiveMax", 0);
    let theory_max = i64_param(entry, "theoryMax", 0);
    let exam_score_max = i64_param(entry, "examScoreMax", 0);
    for v in [objective_max, theory_max, exam_score_max] {
        if !(0..=100).contains(&v) {
            return Err(HandlerErr::bad_params(format!(
                "{} exam maxima must be between 0 and 100.",
                level.as_str().to_uppercase()
            )));
        }
    }
    if exam_mode == ExamMode::Separate && objective_max + theory_max > 100 {
        return Err(HandlerErr::bad_params(format!(
            "{} objective + theory maxima must not exceed 100.",
            level.as_str().to_uppercase()
        )));
    }
    Ok(AssessmentConfig {
        level,
        exam_mode,
        objective_max,
        theory_max,
        exam_score_max,
    })
}

/// Upsert tenant settings. When the current term/year moves, working data is
/// rolled over inside the same transaction as the settings write.
fn school_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let payload = params
        .get("settings")
        .ok_or_else(|| HandlerErr::bad_params("missing settings"))?;

    let previous = school::load_school(conn, &school_id)?;
    let mut settings = previous.clone().unwrap_or_else(|| {
        SchoolSettings::seed(&school_id, &opt_str_param(payload, "schoolName").unwrap_or_default())
    });
    apply_settings_payload(&mut settings, payload)?;
    if settings.school_name.trim().is_empty() {
        return Err(HandlerErr::bad_params("schoolName is required"));
    }

    let assessment_updates: Vec<AssessmentConfig> = match params.get("assessmentConfigs") {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(parse_assessment_payload)
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };

    let changed_term_or_year = previous
        .as_ref()
        .map(|prev| {
            !prev
                .current_term
                .eq_ignore_ascii_case(&settings.current_term)
                || prev.academic_year != settings.academic_year
        })
        .unwrap_or(false);

    let tx = conn.unchecked_transaction().map_err(HandlerErr::from)?;
    school::save_school(&tx, &settings)?;
    let mut rollover_summary = rollover::RolloverSummary::default();
    if changed_term_or_year {
        let prev = previous.as_ref().expect("changed implies previous");
        rollover_summary = rollover::rollover_in_tx(
            &tx,
            &school_id,
            &prev.current_term,
            &settings.current_term,
            &prev.academic_year,
            &settings.academic_year,
        )?;
    }
    for config in &assessment_updates {
        classes::save_assessment_config(&tx, &school_id, config)?;
    }
    tx.commit().map_err(HandlerErr::from)?;

    Ok(json!({
        "school": school_to_json(&settings),
        "rolledOver": changed_term_or_year,
        "rollover": {
            "assignmentsCopied": rollover_summary.assignments_copied,
            "studentsMoved": rollover_summary.students_moved,
        }
    }))
}

fn assessment_configs_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let mut out = serde_json::Map::new();
    for level in [ClassLevel::Primary, ClassLevel::Jss, ClassLevel::Ss] {
        let config = classes::get_assessment_config(conn, &school_id, level)?;
        out.insert(
            level.as_str().to_string(),
            json!({
                "level": config.level.as_str(),
                "examMode": config.exam_mode.as_str(),
                "objectiveMax": config.objective_max,
                "theoryMax": config.theory_max,
                "examScoreMax": config.exam_score_max,
            }),
        );
    }
    Ok(Value::Object(out))
}

/// Assign a teacher to a class for one term/year. The unique key keeps one
/// assignment per class/term; a repeat assignment replaces the teacher.
fn assign_class(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let teacher_id = str_param(params, "teacherId")?;
    let classname = str_param(params, "classname")?;

    let settings = school::require_school(conn, &school_id)?;
    let term = opt_str_param(params, "term").unwrap_or(settings.current_term.clone());
    let academic_year =
        opt_str_param(params, "academicYear").unwrap_or(settings.academic_year.clone());
    if !calc::is_valid_term(&term) {
        return Err(HandlerErr::bad_params("invalid term"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_assignments (id, school_id, teacher_id, classname, term, academic_year)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(school_id, classname, term, academic_year) DO UPDATE SET
           teacher_id = excluded.teacher_id",
        rusqlite::params![id, school_id, teacher_id, classname, term, academic_year],
    )
    .map_err(HandlerErr::from)?;
    Ok(json!({ "assigned": true, "term": term, "academicYear": academic_year }))
}

/// Direct rollover entry point; the same routine also runs implicitly when a
/// `school.update` moves the current term/year.
fn term_rollover(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let school_id = str_param(params, "schoolId")?;
    let from_term = str_param(params, "fromTerm")?;
    let to_term = str_param(params, "toTerm")?;
    let from_year = opt_str_param(params, "fromYear").unwrap_or_default();
    let to_year = opt_str_param(params, "toYear").unwrap_or_default();

    school::require_school(conn, &school_id)?;
    let summary = rollover::rollover_school_term_data(
        conn,
        &school_id,
        &from_term,
        &to_term,
        &from_year,
        &to_year,
    )?;
    Ok(json!({
        "assignmentsCopied": summary.assignments_copied,
        "studentsMoved": summary.students_moved,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let inner: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "school.get" => school_get,
        "school.update" => school_update,
        "school.assessmentConfigs" => assessment_configs_get,
        "setup.assignClass" => assign_class,
        "term.rollover" => term_rollover,
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
