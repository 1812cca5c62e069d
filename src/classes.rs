use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::school::SchoolSettings;

pub const GRADUATED: &str = "GRADUATED";

/// Canonical class key, e.g. "Primary 1" -> "PRIMARY1".
pub fn canonicalize_classname(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Only senior-secondary classes carry streams.
pub fn class_uses_stream(classname: &str) -> bool {
    matches!(
        canonicalize_classname(classname).as_str(),
        "SS1" | "SS2" | "SS3" | "SSS1" | "SSS2" | "SSS3"
    )
}

pub fn is_ss1_class(classname: &str) -> bool {
    matches!(canonicalize_classname(classname).as_str(), "SS1" | "SSS1")
}

/// Stream treatment for one class under one tenant's settings: SS1 drops out
/// of stream handling when the tenant runs it in combined mode.
pub fn class_uses_stream_for_school(settings: &SchoolSettings, classname: &str) -> bool {
    if !class_uses_stream(classname) {
        return false;
    }
    !(is_ss1_class(classname) && settings.ss1_stream_mode == Ss1StreamMode::Combined)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassLevel {
    Primary,
    Jss,
    Ss,
}

impl ClassLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassLevel::Primary => "primary",
            ClassLevel::Jss => "jss",
            ClassLevel::Ss => "ss",
        }
    }

    pub fn parse(raw: &str) -> ClassLevel {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ss" => ClassLevel::Ss,
            "jss" => ClassLevel::Jss,
            _ => ClassLevel::Primary,
        }
    }
}

pub fn class_level(classname: &str) -> ClassLevel {
    let key = canonicalize_classname(classname);
    if key.starts_with("SS") || key.starts_with("SSS") {
        ClassLevel::Ss
    } else if key.starts_with("JSS") {
        ClassLevel::Jss
    } else {
        ClassLevel::Primary
    }
}

/// Next class in the promotion sequence, or None for terminal/unknown classes.
pub fn next_class_in_sequence(classname: &str) -> Option<&'static str> {
    match canonicalize_classname(classname).as_str() {
        "NURSERY1" => Some("NURSERY2"),
        "NURSERY2" => Some("NURSERY3"),
        "NURSERY3" => Some("PRIMARY1"),
        "PRIMARY1" => Some("PRIMARY2"),
        "PRIMARY2" => Some("PRIMARY3"),
        "PRIMARY3" => Some("PRIMARY4"),
        "PRIMARY4" => Some("PRIMARY5"),
        "PRIMARY5" => Some("PRIMARY6"),
        "PRIMARY6" => Some("JSS1"),
        "JSS1" => Some("JSS2"),
        "JSS2" => Some("JSS3"),
        "JSS3" => Some("SS1"),
        "SS1" => Some("SS2"),
        "SS2" => Some("SS3"),
        "SS3" => Some(GRADUATED),
        _ => None,
    }
}

pub fn is_valid_promotion_target(from_class: &str, to_class: &str) -> bool {
    match next_class_in_sequence(from_class) {
        Some(expected) => canonicalize_classname(to_class) == expected,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stream {
    Science,
    Art,
    Commercial,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Science => "Science",
            Stream::Art => "Art",
            Stream::Commercial => "Commercial",
        }
    }

    pub fn parse(raw: &str) -> Option<Stream> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "science" => Some(Stream::Science),
            "art" => Some(Stream::Art),
            "commercial" => Some(Stream::Commercial),
            _ => None,
        }
    }
}

/// Working/published records store the stream as text, "N/A" when unassigned.
pub fn stream_is_unassigned(raw: &str) -> bool {
    let s = raw.trim();
    s.is_empty() || s.eq_ignore_ascii_case("n/a") || s.eq_ignore_ascii_case("na") || s == "-"
}

/// Validate a stream selection for a class. Non-stream classes resolve to
/// None; stream classes require one of the three named streams.
pub fn normalize_stream_for_class(
    settings: &SchoolSettings,
    classname: &str,
    raw: &str,
) -> EngineResult<Option<Stream>> {
    if !class_uses_stream_for_school(settings, classname) {
        return Ok(None);
    }
    Stream::parse(raw).map(Some).ok_or_else(|| {
        EngineError::validation(
            "Please select a valid stream (Science, Art, or Commercial) for SS classes.",
        )
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ss1StreamMode {
    Separate,
    Combined,
}

impl Ss1StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ss1StreamMode::Separate => "separate",
            Ss1StreamMode::Combined => "combined",
        }
    }

    pub fn parse(raw: &str) -> Ss1StreamMode {
        if raw.trim().eq_ignore_ascii_case("combined") {
            Ss1StreamMode::Combined
        } else {
            Ss1StreamMode::Separate
        }
    }
}

/// Normalize subject names with leading-cap style; short all-caps tokens
/// (acronyms) pass through.
pub fn normalize_subject_name(value: &str) -> String {
    let text = value.split_whitespace().collect::<Vec<_>>().join(" ");
    text.split(' ')
        .map(|word| {
            if word.len() <= 4 && word.chars().all(|c| c.is_ascii_uppercase()) {
                word.to_string()
            } else {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_ascii_uppercase().to_string() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn dedupe_keep_order<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = item.as_ref().trim();
        let key = trimmed.to_lowercase();
        if !key.is_empty() && seen.insert(key) {
            out.push(trimmed.to_string());
        }
    }
    out
}

// ---- Class subject configuration ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassSubjectConfig {
    pub classname: String,
    pub core_subjects: Vec<String>,
    pub science_subjects: Vec<String>,
    pub art_subjects: Vec<String>,
    pub commercial_subjects: Vec<String>,
    pub optional_subjects: Vec<String>,
    pub optional_subject_limit: i64,
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

pub fn get_class_subject_config(
    conn: &Connection,
    school_id: &str,
    classname: &str,
) -> EngineResult<Option<ClassSubjectConfig>> {
    let class_key = canonicalize_classname(classname);
    let row = conn
        .query_row(
            "SELECT classname, core_subjects, science_subjects, art_subjects,
                    commercial_subjects, optional_subjects, optional_subject_limit
             FROM class_subject_configs
             WHERE school_id = ? AND classname = ?",
            (school_id, &class_key),
            |r| {
                Ok(ClassSubjectConfig {
                    classname: r.get(0)?,
                    core_subjects: decode_list(&r.get::<_, String>(1)?),
                    science_subjects: decode_list(&r.get::<_, String>(2)?),
                    art_subjects: decode_list(&r.get::<_, String>(3)?),
                    commercial_subjects: decode_list(&r.get::<_, String>(4)?),
                    optional_subjects: decode_list(&r.get::<_, String>(5)?),
                    optional_subject_limit: r.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn save_class_subject_config(
    conn: &Connection,
    school_id: &str,
    config: &ClassSubjectConfig,
) -> EngineResult<()> {
    let class_key = canonicalize_classname(&config.classname);
    if class_key.is_empty() {
        return Err(EngineError::validation("class name is required"));
    }
    let core = dedupe_keep_order(config.core_subjects.iter().map(|s| normalize_subject_name(s)));
    let science = dedupe_keep_order(
        config
            .science_subjects
            .iter()
            .map(|s| normalize_subject_name(s)),
    );
    let art = dedupe_keep_order(config.art_subjects.iter().map(|s| normalize_subject_name(s)));
    let commercial = dedupe_keep_order(
        config
            .commercial_subjects
            .iter()
            .map(|s| normalize_subject_name(s)),
    );
    let optional = dedupe_keep_order(
        config
            .optional_subjects
            .iter()
            .map(|s| normalize_subject_name(s)),
    );
    if class_uses_stream(&class_key)
        && science.is_empty()
        && art.is_empty()
        && commercial.is_empty()
    {
        return Err(EngineError::validation(
            "stream classes need at least one non-empty stream subject bucket",
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_subject_configs
           (id, school_id, classname, core_subjects, science_subjects, art_subjects,
            commercial_subjects, optional_subjects, optional_subject_limit, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(school_id, classname) DO UPDATE SET
           core_subjects = excluded.core_subjects,
           science_subjects = excluded.science_subjects,
           art_subjects = excluded.art_subjects,
           commercial_subjects = excluded.commercial_subjects,
           optional_subjects = excluded.optional_subjects,
           optional_subject_limit = excluded.optional_subject_limit,
           updated_at = CURRENT_TIMESTAMP",
        rusqlite::params![
            id,
            school_id,
            class_key,
            encode_list(&core),
            encode_list(&science),
            encode_list(&art),
            encode_list(&commercial),
            encode_list(&optional),
            config.optional_subject_limit.max(0),
        ],
    )?;
    Ok(())
}

pub fn delete_class_subject_config(
    conn: &Connection,
    school_id: &str,
    classname: &str,
) -> EngineResult<usize> {
    let class_key = canonicalize_classname(classname);
    let deleted = conn.execute(
        "DELETE FROM class_subject_configs WHERE school_id = ? AND classname = ?",
        (school_id, &class_key),
    )?;
    Ok(deleted)
}

/// Build a student's final subject list from the class configuration:
/// core subjects, plus the stream bucket for stream classes, plus a validated
/// optional selection. SS1 in combined mode flattens every bucket.
pub fn build_subjects_from_config(
    settings: &SchoolSettings,
    classname: &str,
    stream_raw: &str,
    config: &ClassSubjectConfig,
    selected_optional: &[String],
) -> EngineResult<(Vec<String>, Option<Stream>)> {
    let uses_stream = class_uses_stream_for_school(settings, classname);
    let stream = normalize_stream_for_class(settings, classname, stream_raw)?;

    let mut subjects = config.core_subjects.clone();

    let ss1_combined =
        is_ss1_class(classname) && settings.ss1_stream_mode == Ss1StreamMode::Combined;
    if ss1_combined && !uses_stream {
        subjects = dedupe_keep_order(
            config
                .core_subjects
                .iter()
                .chain(config.science_subjects.iter())
                .chain(config.art_subjects.iter())
                .chain(config.commercial_subjects.iter())
                .chain(config.optional_subjects.iter()),
        );
    }

    if let Some(kind) = stream {
        let track = match kind {
            Stream::Science => &config.science_subjects,
            Stream::Art => &config.art_subjects,
            Stream::Commercial => &config.commercial_subjects,
        };
        if track.is_empty() {
            return Err(EngineError::validation(format!(
                "No {} subjects configured for {}.",
                kind.as_str(),
                classname
            )));
        }
        subjects.extend(track.iter().cloned());
    }

    let allowed_optional: &[String] = if uses_stream {
        &config.optional_subjects
    } else {
        &[]
    };
    let selected = dedupe_keep_order(
        selected_optional
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| normalize_subject_name(s)),
    );
    let invalid: Vec<&String> = selected
        .iter()
        .filter(|s| !allowed_optional.contains(*s))
        .collect();
    if !invalid.is_empty() {
        return Err(EngineError::validation("Invalid optional subject selection."));
    }
    let limit = if uses_stream {
        config.optional_subject_limit.max(0)
    } else {
        0
    };
    if limit > 0 && selected.len() as i64 > limit {
        return Err(EngineError::validation(format!(
            "Select at most {} optional subject(s).",
            limit
        )));
    }

    subjects.extend(selected);
    Ok((dedupe_keep_order(subjects), stream))
}

// ---- Assessment configuration ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamMode {
    Combined,
    Separate,
}

impl ExamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamMode::Combined => "combined",
            ExamMode::Separate => "separate",
        }
    }

    pub fn parse(raw: &str) -> ExamMode {
        if raw.trim().eq_ignore_ascii_case("separate") {
            ExamMode::Separate
        } else {
            ExamMode::Combined
        }
    }
}

/// Per-level exam entry shape and ceilings.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentConfig {
    pub level: ClassLevel,
    pub exam_mode: ExamMode,
    pub objective_max: i64,
    pub theory_max: i64,
    pub exam_score_max: i64,
}

pub fn default_assessment_config(level: ClassLevel) -> AssessmentConfig {
    match level {
        ClassLevel::Primary => AssessmentConfig {
            level,
            exam_mode: ExamMode::Combined,
            objective_max: 0,
            theory_max: 0,
            exam_score_max: 60,
        },
        ClassLevel::Jss => AssessmentConfig {
            level,
            exam_mode: ExamMode::Combined,
            objective_max: 0,
            theory_max: 0,
            exam_score_max: 70,
        },
        ClassLevel::Ss => AssessmentConfig {
            level,
            exam_mode: ExamMode::Separate,
            objective_max: 30,
            theory_max: 40,
            exam_score_max: 70,
        },
    }
}

pub fn get_assessment_config(
    conn: &Connection,
    school_id: &str,
    level: ClassLevel,
) -> EngineResult<AssessmentConfig> {
    let row = conn
        .query_row(
            "SELECT exam_mode, objective_max, theory_max, exam_score_max
             FROM assessment_configs
             WHERE school_id = ? AND level = ?",
            (school_id, level.as_str()),
            |r| {
                Ok(AssessmentConfig {
                    level,
                    exam_mode: ExamMode::parse(&r.get::<_, String>(0)?),
                    objective_max: r.get(1)?,
                    theory_max: r.get(2)?,
                    exam_score_max: r.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row.unwrap_or_else(|| default_assessment_config(level)))
}

pub fn assessment_config_for_class(
    conn: &Connection,
    school_id: &str,
    classname: &str,
) -> EngineResult<AssessmentConfig> {
    get_assessment_config(conn, school_id, class_level(classname))
}

pub fn save_assessment_config(
    conn: &Connection,
    school_id: &str,
    config: &AssessmentConfig,
) -> EngineResult<()> {
    let objective_max = config.objective_max.clamp(0, 100);
    let theory_max = config.theory_max.clamp(0, 100);
    let exam_score_max = match config.exam_mode {
        // Separate mode derives its total ceiling from the two parts.
        ExamMode::Separate => (objective_max + theory_max).min(100),
        ExamMode::Combined => config.exam_score_max.clamp(0, 100),
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessment_configs
           (id, school_id, level, exam_mode, objective_max, theory_max, exam_score_max, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(school_id, level) DO UPDATE SET
           exam_mode = excluded.exam_mode,
           objective_max = excluded.objective_max,
           theory_max = excluded.theory_max,
           exam_score_max = excluded.exam_score_max,
           updated_at = CURRENT_TIMESTAMP",
        rusqlite::params![
            id,
            school_id,
            config.level.as_str(),
            config.exam_mode.as_str(),
            objective_max,
            theory_max,
            exam_score_max,
        ],
    )?;
    Ok(())
}
