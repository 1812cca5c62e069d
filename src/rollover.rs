use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::classes;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RolloverSummary {
    pub assignments_copied: usize,
    pub students_moved: usize,
}

fn is_noop(from_term: &str, to_term: &str, from_year: &str, to_year: &str) -> bool {
    from_term.eq_ignore_ascii_case(to_term) && from_year == to_year
}

/// Roll working data forward when the tenant's term/year changes, inside the
/// caller's transaction:
/// - copy class assignments to the destination term/year, insert-if-missing;
/// - move every working record at the source term whose class is not
///   GRADUATED to the destination term with an empty score map.
/// Published snapshots and publication gates are never touched.
pub fn rollover_in_tx(
    conn: &Connection,
    school_id: &str,
    from_term: &str,
    to_term: &str,
    from_year: &str,
    to_year: &str,
) -> EngineResult<RolloverSummary> {
    let src_term = from_term.trim();
    let dst_term = to_term.trim();
    let src_year = from_year.trim();
    let dst_year = to_year.trim();
    if src_term.is_empty() || dst_term.is_empty() {
        return Err(EngineError::validation("rollover needs both terms"));
    }
    if is_noop(src_term, dst_term, src_year, dst_year) {
        return Ok(RolloverSummary::default());
    }

    let mut summary = RolloverSummary::default();

    let mut assignment_stmt = conn.prepare(
        "SELECT teacher_id, classname FROM class_assignments
         WHERE school_id = ? AND LOWER(term) = LOWER(?) AND academic_year = ?",
    )?;
    let assignments = assignment_stmt
        .query_map((school_id, src_term, src_year), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (teacher_id, classname) in assignments {
        let id = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT INTO class_assignments (id, school_id, teacher_id, classname, term, academic_year)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(school_id, classname, term, academic_year) DO NOTHING",
            rusqlite::params![id, school_id, teacher_id, classname, dst_term, dst_year],
        )?;
        summary.assignments_copied += inserted;
    }

    let mut student_stmt = conn.prepare(
        "SELECT student_id, classname FROM students
         WHERE school_id = ? AND LOWER(term) = LOWER(?)",
    )?;
    let rows = student_stmt
        .query_map((school_id, src_term), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (student_id, classname) in rows {
        if classes::canonicalize_classname(&classname) == classes::GRADUATED {
            continue;
        }
        summary.students_moved += conn.execute(
            "UPDATE students SET term = ?, scores = '{}', promoted = 0, updated_at = CURRENT_TIMESTAMP
             WHERE school_id = ? AND student_id = ?",
            rusqlite::params![dst_term, school_id, student_id],
        )?;
    }

    Ok(summary)
}

/// Standalone rollover: same semantics, own transaction. All-or-nothing — a
/// failure rolls every moved row back.
pub fn rollover_school_term_data(
    conn: &Connection,
    school_id: &str,
    from_term: &str,
    to_term: &str,
    from_year: &str,
    to_year: &str,
) -> EngineResult<RolloverSummary> {
    if is_noop(from_term.trim(), to_term.trim(), from_year.trim(), to_year.trim()) {
        return Ok(RolloverSummary::default());
    }
    let tx = conn.unchecked_transaction()?;
    let summary = rollover_in_tx(&tx, school_id, from_term, to_term, from_year, to_year)?;
    tx.commit()?;
    tracing::info!(
        school_id,
        from_term,
        to_term,
        students = summary.students_moved,
        "rolled working records to new term"
    );
    Ok(summary)
}
