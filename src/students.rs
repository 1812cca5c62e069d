use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::calc::{self, ScoreBlock};
use crate::classes::{self, ClassSubjectConfig};
use crate::error::EngineResult;
use crate::school::SchoolSettings;

/// Mutable working record for one student: the currently-editable class,
/// term, and score map. Destroyed on student removal; frozen copies live in
/// `published_student_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentRecord {
    pub student_id: String,
    pub firstname: String,
    pub classname: String,
    #[serde(default)]
    pub first_year_class: String,
    pub term: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub scores: BTreeMap<String, ScoreBlock>,
    #[serde(default)]
    pub teacher_comment: String,
    #[serde(default)]
    pub promoted: bool,
}

fn default_stream() -> String {
    "N/A".to_string()
}

impl StudentRecord {
    /// Score-complete: every configured subject has a complete score block
    /// and the record sits on the asked-for term.
    pub fn is_score_complete(&self, settings: &SchoolSettings, term: &str) -> bool {
        if self.term != term || self.subjects.is_empty() {
            return false;
        }
        self.subjects
            .iter()
            .all(|subject| calc::is_score_complete_for_subject(self.scores.get(subject), settings))
    }
}

/// Normalize person names with leading-cap style; short all-caps initials
/// pass through.
pub fn normalize_person_name(value: &str) -> String {
    let text = value.split_whitespace().collect::<Vec<_>>().join(" ");
    text.split(' ')
        .map(|word| {
            if word.len() <= 3 && word.chars().all(|c| c.is_ascii_uppercase()) {
                return word.to_string();
            }
            word.split('-')
                .filter(|p| !p.is_empty())
                .map(|piece| {
                    let mut chars = piece.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_ascii_uppercase().to_string() + &chars.as_str().to_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_subjects(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn decode_scores(raw: &str) -> BTreeMap<String, ScoreBlock> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        student_id: r.get(0)?,
        firstname: r.get(1)?,
        classname: r.get(2)?,
        first_year_class: r.get(3)?,
        term: r.get(4)?,
        stream: r.get(5)?,
        subjects: decode_subjects(&r.get::<_, String>(6)?),
        scores: decode_scores(&r.get::<_, String>(7)?),
        teacher_comment: r.get(8)?,
        promoted: r.get::<_, i64>(9)? != 0,
    })
}

const RECORD_COLUMNS: &str = "student_id, firstname, classname, first_year_class, term, stream,
                              subjects, scores, teacher_comment, promoted";

pub fn load_students(
    conn: &Connection,
    school_id: &str,
    class_filter: Option<&str>,
    term_filter: Option<&str>,
) -> EngineResult<Vec<StudentRecord>> {
    let mut sql = format!(
        "SELECT {} FROM students WHERE school_id = ?",
        RECORD_COLUMNS
    );
    let mut params: Vec<String> = vec![school_id.to_string()];
    if let Some(class) = class_filter {
        sql.push_str(" AND classname = ?");
        params.push(class.to_string());
    }
    if let Some(term) = term_filter {
        sql.push_str(" AND term = ?");
        params.push(term.to_string());
    }
    sql.push_str(" ORDER BY student_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| row_to_record(r))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_student(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
) -> EngineResult<Option<StudentRecord>> {
    let sql = format!(
        "SELECT {} FROM students WHERE school_id = ? AND student_id = ?",
        RECORD_COLUMNS
    );
    let row = conn
        .query_row(&sql, (school_id, student_id), |r| row_to_record(r))
        .optional()?;
    Ok(row)
}

pub fn save_student(
    conn: &Connection,
    school_id: &str,
    record: &StudentRecord,
) -> EngineResult<()> {
    let firstname = normalize_person_name(&record.firstname);
    let subjects = classes::dedupe_keep_order(
        record
            .subjects
            .iter()
            .map(|s| classes::normalize_subject_name(s)),
    );
    let subjects_str = serde_json::to_string(&subjects).unwrap_or_else(|_| "[]".to_string());
    let scores_str = serde_json::to_string(&record.scores).unwrap_or_else(|_| "{}".to_string());
    let first_year_class = if record.first_year_class.is_empty() {
        record.classname.clone()
    } else {
        record.first_year_class.clone()
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students
           (id, school_id, student_id, firstname, classname, first_year_class, term, stream,
            number_of_subject, subjects, scores, teacher_comment, promoted, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(school_id, student_id) DO UPDATE SET
           firstname = excluded.firstname,
           classname = excluded.classname,
           first_year_class = excluded.first_year_class,
           term = excluded.term,
           stream = excluded.stream,
           number_of_subject = excluded.number_of_subject,
           subjects = excluded.subjects,
           scores = excluded.scores,
           teacher_comment = excluded.teacher_comment,
           promoted = excluded.promoted,
           updated_at = CURRENT_TIMESTAMP",
        rusqlite::params![
            id,
            school_id,
            record.student_id,
            firstname,
            record.classname,
            first_year_class,
            record.term,
            record.stream,
            subjects.len() as i64,
            subjects_str,
            scores_str,
            record.teacher_comment.trim(),
            record.promoted as i64,
        ],
    )?;
    Ok(())
}

pub fn delete_student(conn: &Connection, school_id: &str, student_id: &str) -> EngineResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM students WHERE school_id = ? AND student_id = ?",
        (school_id, student_id),
    )?;
    Ok(deleted > 0)
}

/// Re-align one student's subject list with the current class configuration,
/// keeping whichever optional subjects they already take. Scores for dropped
/// subjects are discarded. Returns whether anything changed.
pub fn sync_subjects_to_config(
    record: &mut StudentRecord,
    config: &ClassSubjectConfig,
    settings: &SchoolSettings,
) -> EngineResult<bool> {
    let current = classes::dedupe_keep_order(record.subjects.iter().map(|s| s.as_str()));
    let selected_optional: Vec<String> = current
        .iter()
        .filter(|s| config.optional_subjects.contains(*s))
        .cloned()
        .collect();

    let (desired, stream) = classes::build_subjects_from_config(
        settings,
        &record.classname,
        &record.stream,
        config,
        &selected_optional,
    )?;
    let desired_stream = stream
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(default_stream);

    if desired == current && record.stream == desired_stream {
        return Ok(false);
    }

    record.scores.retain(|subject, _| desired.contains(subject));
    record.subjects = desired;
    record.stream = desired_stream;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{finalize_block, GradeScale, ScoreEntry};

    #[test]
    fn person_name_normalization() {
        assert_eq!(normalize_person_name("  ada   OBI "), "Ada OBI");
        assert_eq!(normalize_person_name("mary-jane okafor"), "Mary-Jane Okafor");
    }

    #[test]
    fn completeness_requires_every_subject_on_term() {
        let settings = SchoolSettings::seed("s", "School");
        let scale = GradeScale::default();
        let mut record = StudentRecord {
            student_id: "STU1".into(),
            firstname: "Ada".into(),
            classname: "JSS1".into(),
            first_year_class: "JSS1".into(),
            term: "First Term".into(),
            stream: "N/A".into(),
            subjects: vec!["English Language".into(), "Mathematics".into()],
            scores: BTreeMap::new(),
            teacher_comment: String::new(),
            promoted: false,
        };
        assert!(!record.is_score_complete(&settings, "First Term"));

        let block = finalize_block(
            ScoreEntry::CombinedExam {
                tests: vec![10.0],
                exam_score: 40.0,
            },
            &settings,
            &scale,
        );
        record
            .scores
            .insert("English Language".into(), block.clone());
        assert!(!record.is_score_complete(&settings, "First Term"));

        record.scores.insert("Mathematics".into(), block);
        assert!(record.is_score_complete(&settings, "First Term"));
        assert!(!record.is_score_complete(&settings, "Second Term"));
    }

    #[test]
    fn sync_drops_scores_of_removed_subjects() {
        let settings = SchoolSettings::seed("s", "School");
        let scale = GradeScale::default();
        let config = ClassSubjectConfig {
            classname: "JSS1".into(),
            core_subjects: vec!["English Language".into(), "Basic Science".into()],
            ..Default::default()
        };
        let mut record = StudentRecord {
            student_id: "STU1".into(),
            firstname: "Ada".into(),
            classname: "JSS1".into(),
            first_year_class: "JSS1".into(),
            term: "First Term".into(),
            stream: "N/A".into(),
            subjects: vec!["English Language".into(), "History".into()],
            scores: BTreeMap::new(),
            teacher_comment: String::new(),
            promoted: false,
        };
        let block = finalize_block(
            ScoreEntry::CombinedExam {
                tests: vec![],
                exam_score: 30.0,
            },
            &settings,
            &scale,
        );
        record.scores.insert("History".into(), block);

        let changed = sync_subjects_to_config(&mut record, &config, &settings).expect("sync");
        assert!(changed);
        assert_eq!(
            record.subjects,
            vec!["English Language".to_string(), "Basic Science".to_string()]
        );
        assert!(record.scores.is_empty());
    }
}
