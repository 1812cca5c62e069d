use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::calc::GradeScale;
use crate::classes::Ss1StreamMode;
use crate::error::{EngineError, EngineResult};
use crate::rank::StreamRankingMode;

/// Tenant configuration record. One row per school; every engine operation is
/// scoped by `school_id`.
#[derive(Debug, Clone, Serialize)]
pub struct SchoolSettings {
    pub school_id: String,
    pub school_name: String,
    pub principal_name: String,
    pub academic_year: String,
    pub current_term: String,
    pub operations_enabled: bool,
    pub test_enabled: bool,
    pub exam_enabled: bool,
    pub max_tests: i64,
    pub test_score_max: f64,
    pub grade_a_min: i64,
    pub grade_b_min: i64,
    pub grade_c_min: i64,
    pub grade_d_min: i64,
    pub pass_mark: i64,
    pub ss_ranking_mode: StreamRankingMode,
    pub ss1_stream_mode: Ss1StreamMode,
}

impl SchoolSettings {
    pub fn grade_scale(&self) -> GradeScale {
        GradeScale {
            a_min: self.grade_a_min,
            b_min: self.grade_b_min,
            c_min: self.grade_c_min,
            d_min: self.grade_d_min,
            pass_mark: self.pass_mark,
        }
    }

    /// Fresh settings row with platform defaults.
    pub fn seed(school_id: &str, school_name: &str) -> Self {
        SchoolSettings {
            school_id: school_id.to_string(),
            school_name: school_name.to_string(),
            principal_name: String::new(),
            academic_year: String::new(),
            current_term: "First Term".to_string(),
            operations_enabled: true,
            test_enabled: true,
            exam_enabled: true,
            max_tests: 3,
            test_score_max: 30.0,
            grade_a_min: 70,
            grade_b_min: 60,
            grade_c_min: 50,
            grade_d_min: 40,
            pass_mark: 50,
            ss_ranking_mode: StreamRankingMode::Together,
            ss1_stream_mode: Ss1StreamMode::Separate,
        }
    }
}

pub fn load_school(conn: &Connection, school_id: &str) -> EngineResult<Option<SchoolSettings>> {
    let row = conn
        .query_row(
            "SELECT school_id, school_name, principal_name, academic_year, current_term,
                    operations_enabled, test_enabled, exam_enabled, max_tests, test_score_max,
                    grade_a_min, grade_b_min, grade_c_min, grade_d_min, pass_mark,
                    ss_ranking_mode, ss1_stream_mode
             FROM schools WHERE school_id = ?",
            [school_id],
            |r| {
                Ok(SchoolSettings {
                    school_id: r.get(0)?,
                    school_name: r.get(1)?,
                    principal_name: r.get(2)?,
                    academic_year: r.get(3)?,
                    current_term: r.get(4)?,
                    operations_enabled: r.get::<_, i64>(5)? != 0,
                    test_enabled: r.get::<_, i64>(6)? != 0,
                    exam_enabled: r.get::<_, i64>(7)? != 0,
                    max_tests: r.get::<_, i64>(8)?.clamp(1, 10),
                    test_score_max: r.get::<_, f64>(9)?.max(0.0),
                    grade_a_min: r.get(10)?,
                    grade_b_min: r.get(11)?,
                    grade_c_min: r.get(12)?,
                    grade_d_min: r.get(13)?,
                    pass_mark: r.get(14)?,
                    ss_ranking_mode: StreamRankingMode::parse(&r.get::<_, String>(15)?),
                    ss1_stream_mode: Ss1StreamMode::parse(&r.get::<_, String>(16)?),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Load a tenant for a write path. Publish and rollover must not fall back to
/// defaults for a school that was never configured.
pub fn require_school(conn: &Connection, school_id: &str) -> EngineResult<SchoolSettings> {
    load_school(conn, school_id)?.ok_or_else(|| EngineError::TenantNotConfigured {
        school_id: school_id.to_string(),
    })
}

pub fn save_school(conn: &Connection, settings: &SchoolSettings) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO schools
           (school_id, school_name, principal_name, academic_year, current_term,
            operations_enabled, test_enabled, exam_enabled, max_tests, test_score_max,
            grade_a_min, grade_b_min, grade_c_min, grade_d_min, pass_mark,
            ss_ranking_mode, ss1_stream_mode, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(school_id) DO UPDATE SET
           school_name = excluded.school_name,
           principal_name = excluded.principal_name,
           academic_year = excluded.academic_year,
           current_term = excluded.current_term,
           operations_enabled = excluded.operations_enabled,
           test_enabled = excluded.test_enabled,
           exam_enabled = excluded.exam_enabled,
           max_tests = excluded.max_tests,
           test_score_max = excluded.test_score_max,
           grade_a_min = excluded.grade_a_min,
           grade_b_min = excluded.grade_b_min,
           grade_c_min = excluded.grade_c_min,
           grade_d_min = excluded.grade_d_min,
           pass_mark = excluded.pass_mark,
           ss_ranking_mode = excluded.ss_ranking_mode,
           ss1_stream_mode = excluded.ss1_stream_mode,
           updated_at = CURRENT_TIMESTAMP",
        rusqlite::params![
            settings.school_id,
            settings.school_name,
            settings.principal_name,
            settings.academic_year,
            settings.current_term,
            settings.operations_enabled as i64,
            settings.test_enabled as i64,
            settings.exam_enabled as i64,
            settings.max_tests.clamp(1, 10),
            settings.test_score_max.max(0.0),
            settings.grade_a_min,
            settings.grade_b_min,
            settings.grade_c_min,
            settings.grade_d_min,
            settings.pass_mark,
            settings.ss_ranking_mode.as_str(),
            settings.ss1_stream_mode.as_str(),
        ],
    )?;
    Ok(())
}
