use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("resultd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            school_id TEXT PRIMARY KEY,
            school_name TEXT NOT NULL,
            principal_name TEXT NOT NULL DEFAULT '',
            academic_year TEXT NOT NULL DEFAULT '',
            current_term TEXT NOT NULL DEFAULT 'First Term',
            operations_enabled INTEGER NOT NULL DEFAULT 1,
            test_enabled INTEGER NOT NULL DEFAULT 1,
            exam_enabled INTEGER NOT NULL DEFAULT 1,
            max_tests INTEGER NOT NULL DEFAULT 3,
            test_score_max REAL NOT NULL DEFAULT 30,
            grade_a_min INTEGER NOT NULL DEFAULT 70,
            grade_b_min INTEGER NOT NULL DEFAULT 60,
            grade_c_min INTEGER NOT NULL DEFAULT 50,
            grade_d_min INTEGER NOT NULL DEFAULT 40,
            pass_mark INTEGER NOT NULL DEFAULT 50,
            ss_ranking_mode TEXT NOT NULL DEFAULT 'together',
            ss1_stream_mode TEXT NOT NULL DEFAULT 'separate',
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            firstname TEXT NOT NULL,
            classname TEXT NOT NULL,
            first_year_class TEXT NOT NULL DEFAULT '',
            term TEXT NOT NULL,
            stream TEXT NOT NULL DEFAULT 'N/A',
            number_of_subject INTEGER NOT NULL DEFAULT 0,
            subjects TEXT NOT NULL DEFAULT '[]',
            scores TEXT NOT NULL DEFAULT '{}',
            teacher_comment TEXT NOT NULL DEFAULT '',
            promoted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(school_id, student_id),
            FOREIGN KEY(school_id) REFERENCES schools(school_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school_class ON students(school_id, classname)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school_term ON students(school_id, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subject_configs(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            classname TEXT NOT NULL,
            core_subjects TEXT NOT NULL DEFAULT '[]',
            science_subjects TEXT NOT NULL DEFAULT '[]',
            art_subjects TEXT NOT NULL DEFAULT '[]',
            commercial_subjects TEXT NOT NULL DEFAULT '[]',
            optional_subjects TEXT NOT NULL DEFAULT '[]',
            optional_subject_limit INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(school_id, classname),
            FOREIGN KEY(school_id) REFERENCES schools(school_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_configs(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            level TEXT NOT NULL,
            exam_mode TEXT NOT NULL,
            objective_max INTEGER NOT NULL DEFAULT 0,
            theory_max INTEGER NOT NULL DEFAULT 0,
            exam_score_max INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(school_id, level),
            FOREIGN KEY(school_id) REFERENCES schools(school_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_assignments(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            classname TEXT NOT NULL,
            term TEXT NOT NULL,
            academic_year TEXT NOT NULL DEFAULT '',
            UNIQUE(school_id, classname, term, academic_year),
            FOREIGN KEY(school_id) REFERENCES schools(school_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_assignments_teacher
         ON class_assignments(school_id, teacher_id)",
        [],
    )?;

    // Publication gate: the single authority for whether working scores for a
    // class/term are still editable.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_publications(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            classname TEXT NOT NULL,
            term TEXT NOT NULL,
            academic_year TEXT NOT NULL DEFAULT '',
            teacher_id TEXT NOT NULL DEFAULT '',
            teacher_name TEXT NOT NULL DEFAULT '',
            principal_name TEXT NOT NULL DEFAULT '',
            is_published INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            updated_at TEXT,
            UNIQUE(school_id, classname, term, academic_year),
            FOREIGN KEY(school_id) REFERENCES schools(school_id)
        )",
        [],
    )?;

    // Frozen per-student copy taken at publish time; the only record the
    // student read path may touch.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS published_student_results(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            firstname TEXT NOT NULL DEFAULT '',
            classname TEXT NOT NULL,
            academic_year TEXT NOT NULL DEFAULT '',
            term TEXT NOT NULL,
            stream TEXT NOT NULL DEFAULT 'N/A',
            number_of_subject INTEGER NOT NULL DEFAULT 0,
            subjects TEXT NOT NULL DEFAULT '[]',
            scores TEXT NOT NULL DEFAULT '{}',
            teacher_comment TEXT NOT NULL DEFAULT '',
            average_marks REAL NOT NULL DEFAULT 0,
            grade TEXT NOT NULL DEFAULT 'F',
            status TEXT NOT NULL DEFAULT 'Fail',
            published_at TEXT,
            UNIQUE(school_id, student_id, academic_year, term),
            FOREIGN KEY(school_id) REFERENCES schools(school_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_published_results_class
         ON published_student_results(school_id, classname, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_views(
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            term TEXT NOT NULL,
            academic_year TEXT NOT NULL DEFAULT '',
            first_viewed_at TEXT NOT NULL,
            last_viewed_at TEXT NOT NULL,
            view_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(school_id, student_id, term, academic_year),
            FOREIGN KEY(school_id) REFERENCES schools(school_id)
        )",
        [],
    )?;

    Ok(conn)
}
