use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::calc::{self, PublishedTerm, ScoreBlock};
use crate::error::EngineResult;
use crate::school;
use crate::students;

/// Per-(class, term, year) publication gate row: the single authority for
/// whether working scores are still editable.
#[derive(Debug, Clone, Serialize)]
pub struct PublicationGate {
    pub classname: String,
    pub term: String,
    pub academic_year: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub principal_name: String,
    pub is_published: bool,
    pub published_at: Option<String>,
}

/// Frozen per-student result taken at publish time.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedSnapshot {
    pub student_id: String,
    pub firstname: String,
    pub classname: String,
    pub academic_year: String,
    pub term: String,
    pub stream: String,
    pub number_of_subject: i64,
    pub subjects: Vec<String>,
    pub scores: BTreeMap<String, ScoreBlock>,
    pub teacher_comment: String,
    pub average_marks: f64,
    pub grade: String,
    pub status: String,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PublishSummary {
    pub students_published: usize,
}

/// Upsert the gate row. Publishing stamps `published_at`; unpublishing clears
/// it. The unique key makes concurrent writers converge on the last commit.
pub fn set_result_published(
    conn: &Connection,
    school_id: &str,
    classname: &str,
    term: &str,
    academic_year: &str,
    teacher_id: &str,
    teacher_name: &str,
    principal_name: &str,
    is_published: bool,
) -> EngineResult<()> {
    let published_at = if is_published {
        Some(Utc::now().to_rfc3339())
    } else {
        None
    };
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO result_publications
           (id, school_id, classname, term, academic_year, teacher_id, teacher_name,
            principal_name, is_published, published_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(school_id, classname, term, academic_year) DO UPDATE SET
           teacher_id = excluded.teacher_id,
           teacher_name = excluded.teacher_name,
           principal_name = excluded.principal_name,
           is_published = excluded.is_published,
           published_at = excluded.published_at,
           updated_at = CURRENT_TIMESTAMP",
        rusqlite::params![
            id,
            school_id,
            classname,
            term,
            academic_year,
            teacher_id,
            teacher_name,
            principal_name,
            is_published as i64,
            published_at,
        ],
    )?;
    Ok(())
}

pub fn is_result_published(
    conn: &Connection,
    school_id: &str,
    classname: &str,
    term: &str,
    academic_year: &str,
) -> EngineResult<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT is_published FROM result_publications
             WHERE school_id = ? AND classname = ? AND term = ? AND academic_year = ?",
            (school_id, classname, term, academic_year),
            |r| r.get(0),
        )
        .optional()?;
    Ok(row == Some(1))
}

pub fn load_publication_gate(
    conn: &Connection,
    school_id: &str,
    classname: &str,
    term: &str,
    academic_year: &str,
) -> EngineResult<Option<PublicationGate>> {
    let row = conn
        .query_row(
            "SELECT classname, term, academic_year, teacher_id, teacher_name, principal_name,
                    is_published, published_at
             FROM result_publications
             WHERE school_id = ? AND classname = ? AND term = ? AND academic_year = ?",
            (school_id, classname, term, academic_year),
            |r| {
                Ok(PublicationGate {
                    classname: r.get(0)?,
                    term: r.get(1)?,
                    academic_year: r.get(2)?,
                    teacher_id: r.get(3)?,
                    teacher_name: r.get(4)?,
                    principal_name: r.get(5)?,
                    is_published: r.get::<_, i64>(6)? != 0,
                    published_at: r.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Explicit `Published --(any score write)--> Draft` transition. Called in the
/// same transaction as the working-score save so an edit can never land
/// behind a still-published gate.
pub fn reopen_gate_for_edit(
    conn: &Connection,
    school_id: &str,
    classname: &str,
    term: &str,
    academic_year: &str,
    teacher_id: &str,
) -> EngineResult<()> {
    set_result_published(
        conn,
        school_id,
        classname,
        term,
        academic_year,
        teacher_id,
        "",
        "",
        false,
    )
}

/// Publish one class+term as a single transaction: snapshot every working
/// record and flip the gate, or change nothing.
///
/// The caller is responsible for the preconditions (every student
/// score-complete, gate not already published). Two racing publishers are
/// serialized by the unique keys and resolve last-writer-wins; both write the
/// same shapes, so the survivors are consistent.
pub fn publish_class(
    conn: &Connection,
    school_id: &str,
    classname: &str,
    term: &str,
    teacher_id: &str,
    teacher_name: &str,
) -> EngineResult<PublishSummary> {
    let settings = school::require_school(conn, school_id)?;
    let academic_year = settings.academic_year.clone();
    let scale = settings.grade_scale();
    let class_students = students::load_students(conn, school_id, Some(classname), Some(term))?;

    let tx = conn.unchecked_transaction()?;
    let published_at = Utc::now().to_rfc3339();
    for student in &class_students {
        let average = calc::average_marks(&student.scores, &settings);
        let grade = calc::grade_from_score(average, &scale);
        let status = calc::status_from_score(average, &scale);
        let subjects_str =
            serde_json::to_string(&student.subjects).unwrap_or_else(|_| "[]".to_string());
        let scores_str =
            serde_json::to_string(&student.scores).unwrap_or_else(|_| "{}".to_string());
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO published_student_results
               (id, school_id, student_id, firstname, classname, academic_year, term, stream,
                number_of_subject, subjects, scores, teacher_comment, average_marks, grade,
                status, published_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(school_id, student_id, academic_year, term) DO UPDATE SET
               firstname = excluded.firstname,
               classname = excluded.classname,
               stream = excluded.stream,
               number_of_subject = excluded.number_of_subject,
               subjects = excluded.subjects,
               scores = excluded.scores,
               teacher_comment = excluded.teacher_comment,
               average_marks = excluded.average_marks,
               grade = excluded.grade,
               status = excluded.status,
               published_at = excluded.published_at",
            rusqlite::params![
                id,
                school_id,
                student.student_id,
                student.firstname,
                classname,
                academic_year,
                term,
                student.stream,
                student.subjects.len() as i64,
                subjects_str,
                scores_str,
                student.teacher_comment.trim(),
                average,
                grade.as_str(),
                status.as_str(),
                published_at,
            ],
        )?;
    }

    set_result_published(
        &tx,
        school_id,
        classname,
        term,
        &academic_year,
        teacher_id,
        teacher_name,
        &settings.principal_name,
        true,
    )?;
    tx.commit()?;

    tracing::info!(
        school_id,
        classname,
        term,
        students = class_students.len(),
        "published class results"
    );
    Ok(PublishSummary {
        students_published: class_students.len(),
    })
}

fn row_to_snapshot(r: &rusqlite::Row<'_>) -> rusqlite::Result<PublishedSnapshot> {
    Ok(PublishedSnapshot {
        student_id: r.get(0)?,
        firstname: r.get(1)?,
        classname: r.get(2)?,
        academic_year: r.get(3)?,
        term: r.get(4)?,
        stream: r.get(5)?,
        number_of_subject: r.get(6)?,
        subjects: serde_json::from_str(&r.get::<_, String>(7)?).unwrap_or_default(),
        scores: serde_json::from_str(&r.get::<_, String>(8)?).unwrap_or_default(),
        teacher_comment: r.get(9)?,
        average_marks: r.get(10)?,
        grade: r.get(11)?,
        status: r.get(12)?,
        published_at: r.get(13)?,
    })
}

const SNAPSHOT_COLUMNS: &str = "student_id, firstname, classname, academic_year, term, stream,
                                number_of_subject, subjects, scores, teacher_comment,
                                average_marks, grade, status, published_at";

/// Newest published snapshot for one student+term, optionally narrowed by
/// year and class. Never touches working records.
pub fn load_published_student_result(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    term: &str,
    academic_year: Option<&str>,
    classname: Option<&str>,
) -> EngineResult<Option<PublishedSnapshot>> {
    let mut sql = format!(
        "SELECT {} FROM published_student_results
         WHERE school_id = ? AND student_id = ? AND term = ?",
        SNAPSHOT_COLUMNS
    );
    let mut params: Vec<String> = vec![
        school_id.to_string(),
        student_id.to_string(),
        term.to_string(),
    ];
    if let Some(year) = academic_year {
        sql.push_str(" AND academic_year = ?");
        params.push(year.to_string());
    }
    if let Some(class) = classname {
        sql.push_str(" AND LOWER(classname) = LOWER(?)");
        params.push(class.to_string());
    }
    sql.push_str(" ORDER BY published_at DESC LIMIT 1");

    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row(rusqlite::params_from_iter(params), |r| row_to_snapshot(r))
        .optional()?;
    Ok(row)
}

/// Every snapshot of one class+term, for ranking reconstruction.
pub fn load_published_class_results(
    conn: &Connection,
    school_id: &str,
    classname: &str,
    term: &str,
    academic_year: Option<&str>,
) -> EngineResult<Vec<PublishedSnapshot>> {
    let mut sql = format!(
        "SELECT {} FROM published_student_results
         WHERE school_id = ? AND classname = ? AND term = ?",
        SNAPSHOT_COLUMNS
    );
    let mut params: Vec<String> = vec![
        school_id.to_string(),
        classname.to_string(),
        term.to_string(),
    ];
    if let Some(year) = academic_year {
        sql.push_str(" AND academic_year = ?");
        params.push(year.to_string());
    }
    sql.push_str(" ORDER BY student_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| row_to_snapshot(r))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Distinct published (year, term, class) entries for a student, oldest
/// publish first.
pub fn published_terms_for_student(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    classname: Option<&str>,
) -> EngineResult<Vec<PublishedTerm>> {
    let mut sql = "SELECT academic_year, term, classname FROM published_student_results
                   WHERE school_id = ? AND student_id = ?"
        .to_string();
    let mut params: Vec<String> = vec![school_id.to_string(), student_id.to_string()];
    if let Some(class) = classname {
        sql.push_str(" AND LOWER(classname) = LOWER(?)");
        params.push(class.to_string());
    }
    sql.push_str(" ORDER BY published_at ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = std::collections::HashSet::new();
    let mut terms = Vec::new();
    for (academic_year, term, row_class) in rows {
        let key = (
            calc::term_token(&academic_year, &term),
            row_class.trim().to_lowercase(),
        );
        if seen.insert(key) {
            terms.push(PublishedTerm::new(&academic_year, &term, &row_class));
        }
    }
    // Chronological regardless of republish timestamps.
    terms.sort_by(|a, b| {
        (a.academic_year.as_str(), calc::term_sort_value(&a.term))
            .cmp(&(b.academic_year.as_str(), calc::term_sort_value(&b.term)))
    });
    Ok(terms)
}

// ---- Result views ----

/// Record that a student opened a published result. Write-only bookkeeping
/// for admin dashboards; not part of result correctness.
pub fn record_result_view(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    term: &str,
    academic_year: &str,
) -> EngineResult<()> {
    if school_id.is_empty() || student_id.is_empty() || term.is_empty() {
        return Ok(());
    }
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO result_views
           (school_id, student_id, term, academic_year, first_viewed_at, last_viewed_at, view_count)
         VALUES (?, ?, ?, ?, ?, ?, 1)
         ON CONFLICT(school_id, student_id, term, academic_year) DO UPDATE SET
           last_viewed_at = excluded.last_viewed_at,
           view_count = result_views.view_count + 1",
        rusqlite::params![school_id, student_id, term, academic_year, now, now],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClassViewCounts {
    pub published_count: i64,
    pub viewed_count: i64,
}

/// Per-class published vs viewed counts for one term.
pub fn class_published_view_counts(
    conn: &Connection,
    school_id: &str,
    term: &str,
    academic_year: &str,
) -> EngineResult<HashMap<String, ClassViewCounts>> {
    let mut stmt = conn.prepare(
        "SELECT p.classname,
                COUNT(*),
                SUM(CASE WHEN v.student_id IS NOT NULL THEN 1 ELSE 0 END)
         FROM published_student_results p
         LEFT JOIN result_views v
           ON v.school_id = p.school_id
          AND v.student_id = p.student_id
          AND v.term = p.term
          AND v.academic_year = p.academic_year
         WHERE p.school_id = ? AND p.term = ? AND p.academic_year = ?
         GROUP BY p.classname",
    )?;
    let rows = stmt
        .query_map((school_id, term, academic_year), |r| {
            Ok((
                r.get::<_, String>(0)?,
                ClassViewCounts {
                    published_count: r.get(1)?,
                    viewed_count: r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassPublicationStatus {
    pub classname: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub is_published: bool,
    pub published_at: Option<String>,
}

/// Publication status of every class assigned for one term/year.
pub fn school_publication_statuses(
    conn: &Connection,
    school_id: &str,
    term: &str,
    academic_year: &str,
) -> EngineResult<Vec<ClassPublicationStatus>> {
    let mut stmt = conn.prepare(
        "SELECT a.classname, a.teacher_id,
                COALESCE(p.teacher_name, ''), COALESCE(p.is_published, 0), p.published_at
         FROM class_assignments a
         LEFT JOIN result_publications p
           ON p.school_id = a.school_id
          AND p.classname = a.classname
          AND p.term = a.term
          AND p.academic_year = a.academic_year
         WHERE a.school_id = ? AND a.term = ? AND a.academic_year = ?
         ORDER BY a.classname",
    )?;
    let rows = stmt
        .query_map((school_id, term, academic_year), |r| {
            Ok(ClassPublicationStatus {
                classname: r.get(0)?,
                teacher_id: r.get(1)?,
                teacher_name: r.get(2)?,
                is_published: r.get::<_, i64>(3)? != 0,
                published_at: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
