use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::school::SchoolSettings;

/// Letter grades in ascending order, so `Ord` gives F < D < C < B < A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    F,
    D,
    C,
    B,
    A,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Pass,
    Fail,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pass => "Pass",
            ResultStatus::Fail => "Fail",
        }
    }
}

/// Tenant grade thresholds. Invariant: a >= b >= c >= d, all in [0,100].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GradeScale {
    pub a_min: i64,
    pub b_min: i64,
    pub c_min: i64,
    pub d_min: i64,
    pub pass_mark: i64,
}

impl Default for GradeScale {
    fn default() -> Self {
        GradeScale {
            a_min: 70,
            b_min: 60,
            c_min: 50,
            d_min: 40,
            pass_mark: 50,
        }
    }
}

pub fn grade_from_score(score: f64, scale: &GradeScale) -> Grade {
    let score = finite_or_zero(score);
    if score >= scale.a_min as f64 {
        Grade::A
    } else if score >= scale.b_min as f64 {
        Grade::B
    } else if score >= scale.c_min as f64 {
        Grade::C
    } else if score >= scale.d_min as f64 {
        Grade::D
    } else {
        Grade::F
    }
}

pub fn status_from_score(score: f64, scale: &GradeScale) -> ResultStatus {
    if finite_or_zero(score) >= scale.pass_mark as f64 {
        ResultStatus::Pass
    } else {
        ResultStatus::Fail
    }
}

/// Raw score components for one subject. Each variant carries only the fields
/// valid for its entry mode; `Legacy` covers rows that predate component
/// tracking and hold nothing but a precomputed overall mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum ScoreEntry {
    Tests {
        #[serde(default)]
        tests: Vec<f64>,
    },
    CombinedExam {
        #[serde(default)]
        tests: Vec<f64>,
        exam_score: f64,
    },
    SeparateExam {
        #[serde(default)]
        tests: Vec<f64>,
        objective: f64,
        theory: f64,
    },
    Legacy {
        overall_mark: f64,
    },
}

impl ScoreEntry {
    pub fn tests(&self) -> &[f64] {
        match self {
            ScoreEntry::Tests { tests }
            | ScoreEntry::CombinedExam { tests, .. }
            | ScoreEntry::SeparateExam { tests, .. } => tests,
            ScoreEntry::Legacy { .. } => &[],
        }
    }
}

/// One subject's stored scores: raw components plus derived fields frozen at
/// save time. Complete iff `overall_mark` is present and the totals required
/// by the tenant's test/exam tracking are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBlock {
    #[serde(flatten)]
    pub entry: ScoreEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_test: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_exam: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_mark: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<Grade>,
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn test_contribution(entry: &ScoreEntry, settings: &SchoolSettings) -> f64 {
    if !settings.test_enabled {
        return 0.0;
    }
    entry.tests().iter().copied().map(finite_or_zero).sum()
}

fn exam_contribution(entry: &ScoreEntry, settings: &SchoolSettings) -> f64 {
    if !settings.exam_enabled {
        return 0.0;
    }
    match entry {
        ScoreEntry::CombinedExam { exam_score, .. } => finite_or_zero(*exam_score),
        ScoreEntry::SeparateExam {
            objective, theory, ..
        } => finite_or_zero(*objective) + finite_or_zero(*theory),
        ScoreEntry::Tests { .. } | ScoreEntry::Legacy { .. } => 0.0,
    }
}

/// Compute one subject's overall mark from its raw components.
///
/// A `Legacy` block returns its stored mark directly; any block with real
/// components is recomputed from those components, so a stale derived
/// `overall_mark` never wins over entered scores. Pure over its inputs.
pub fn compute_overall_mark(block: &ScoreBlock, settings: &SchoolSettings) -> f64 {
    match &block.entry {
        ScoreEntry::Legacy { overall_mark } => finite_or_zero(*overall_mark),
        entry => test_contribution(entry, settings) + exam_contribution(entry, settings),
    }
}

/// Recompute the derived fields for freshly entered components.
pub fn finalize_block(
    entry: ScoreEntry,
    settings: &SchoolSettings,
    scale: &GradeScale,
) -> ScoreBlock {
    let total_test = test_contribution(&entry, settings);
    let total_exam = exam_contribution(&entry, settings);
    let overall = match &entry {
        ScoreEntry::Legacy { overall_mark } => finite_or_zero(*overall_mark),
        _ => total_test + total_exam,
    };
    ScoreBlock {
        entry,
        total_test: Some(total_test),
        total_exam: Some(total_exam),
        overall_mark: Some(overall),
        grade: Some(grade_from_score(overall, scale)),
    }
}

/// Simple arithmetic mean of all subjects' overall marks; 0 with no subjects.
pub fn average_marks(scores: &BTreeMap<String, ScoreBlock>, settings: &SchoolSettings) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let total: f64 = scores
        .values()
        .map(|b| compute_overall_mark(b, settings))
        .sum();
    total / scores.len() as f64
}

pub fn is_score_complete_for_subject(block: Option<&ScoreBlock>, settings: &SchoolSettings) -> bool {
    let Some(block) = block else {
        return false;
    };
    if block.overall_mark.is_none() {
        return false;
    }
    if settings.test_enabled && block.total_test.is_none() {
        return false;
    }
    if settings.exam_enabled && block.total_exam.is_none() {
        return false;
    }
    true
}

// ---- Term helpers ----

pub const TERMS: [&str; 3] = ["First Term", "Second Term", "Third Term"];

pub fn is_valid_term(term: &str) -> bool {
    TERMS.contains(&term)
}

pub fn term_sort_value(term: &str) -> i64 {
    match term.trim().to_ascii_lowercase().as_str() {
        "first term" => 1,
        "second term" => 2,
        "third term" => 3,
        _ => 99,
    }
}

pub fn term_token(academic_year: &str, term: &str) -> String {
    format!("{}::{}", academic_year.trim(), term.trim())
}

pub fn parse_term_token(raw: &str) -> (String, String) {
    let raw = raw.trim();
    match raw.split_once("::") {
        Some((year, term)) => (year.trim().to_string(), term.trim().to_string()),
        None => (String::new(), raw.to_string()),
    }
}

/// One published (year, term) a student can open.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedTerm {
    pub academic_year: String,
    pub term: String,
    pub classname: String,
    pub token: String,
    pub label: String,
}

impl PublishedTerm {
    pub fn new(academic_year: &str, term: &str, classname: &str) -> Self {
        let label = if academic_year.is_empty() {
            term.to_string()
        } else {
            format!("{} ({})", term, academic_year)
        };
        PublishedTerm {
            academic_year: academic_year.to_string(),
            term: term.to_string(),
            classname: classname.to_string(),
            token: term_token(academic_year, term),
            label,
        }
    }
}

/// Prefer the current year+term; otherwise the newest published entry.
pub fn pick_default_published_term<'a>(
    terms: &'a [PublishedTerm],
    current_term: &str,
    current_year: &str,
) -> Option<&'a PublishedTerm> {
    let term_key = current_term.trim();
    let year_key = current_year.trim();
    terms
        .iter()
        .find(|t| t.term.trim() == term_key && t.academic_year.trim() == year_key)
        .or_else(|| terms.last())
}

/// Resolve a requested term selector against published terms. Accepts the
/// token form "YYYY-YYYY::First Term" or a plain term name.
pub fn resolve_requested_published_term<'a>(
    terms: &'a [PublishedTerm],
    requested: &str,
    current_term: &str,
    current_year: &str,
) -> Option<&'a PublishedTerm> {
    let raw = requested.trim();
    if raw.is_empty() {
        return pick_default_published_term(terms, current_term, current_year);
    }

    let (req_year, req_term) = parse_term_token(raw);
    if !req_year.is_empty() {
        let token = term_token(&req_year, &req_term);
        return terms.iter().find(|t| t.token == token);
    }

    let term_key = req_term.trim().to_ascii_lowercase();
    let matches: Vec<&PublishedTerm> = terms
        .iter()
        .filter(|t| t.term.trim().to_ascii_lowercase() == term_key)
        .collect();
    if matches.is_empty() {
        return None;
    }
    let year_key = current_year.trim();
    matches
        .iter()
        .find(|t| t.academic_year.trim() == year_key)
        .copied()
        .or_else(|| matches.last().copied())
}

/// When a tenant's operations are switched off, hide current-term results
/// from students; previously published terms stay visible.
pub fn filter_visible_terms(
    settings: &SchoolSettings,
    terms: Vec<PublishedTerm>,
) -> Vec<PublishedTerm> {
    if settings.operations_enabled {
        return terms;
    }
    let current_term = settings.current_term.trim();
    let current_year = settings.academic_year.trim();
    terms
        .into_iter()
        .filter(|t| {
            let is_current = t.term.trim() == current_term
                && (current_year.is_empty() || t.academic_year.trim() == current_year);
            !is_current
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::school::SchoolSettings;

    fn settings() -> SchoolSettings {
        SchoolSettings::seed("sch-1", "Test School")
    }

    #[test]
    fn combined_mode_sums_tests_and_exam() {
        let s = settings();
        let block = finalize_block(
            ScoreEntry::CombinedExam {
                tests: vec![8.0, 9.0, 7.0],
                exam_score: 55.0,
            },
            &s,
            &GradeScale::default(),
        );
        assert_eq!(compute_overall_mark(&block, &s), 79.0);
        assert_eq!(block.total_test, Some(24.0));
        assert_eq!(block.total_exam, Some(55.0));
        assert_eq!(block.grade, Some(Grade::A));
    }

    #[test]
    fn separate_mode_adds_objective_and_theory() {
        let s = settings();
        let block = finalize_block(
            ScoreEntry::SeparateExam {
                tests: vec![10.0, 10.0],
                objective: 25.0,
                theory: 30.0,
            },
            &s,
            &GradeScale::default(),
        );
        assert_eq!(compute_overall_mark(&block, &s), 75.0);
    }

    #[test]
    fn disabled_tracking_zeroes_that_contribution() {
        let mut s = settings();
        s.test_enabled = false;
        let block = finalize_block(
            ScoreEntry::CombinedExam {
                tests: vec![10.0, 10.0],
                exam_score: 40.0,
            },
            &s,
            &GradeScale::default(),
        );
        assert_eq!(compute_overall_mark(&block, &s), 40.0);

        s.test_enabled = true;
        s.exam_enabled = false;
        assert_eq!(compute_overall_mark(&block, &s), 20.0);
    }

    #[test]
    fn legacy_block_returns_stored_mark() {
        let s = settings();
        let block = ScoreBlock {
            entry: ScoreEntry::Legacy { overall_mark: 63.5 },
            total_test: None,
            total_exam: None,
            overall_mark: Some(63.5),
            grade: None,
        };
        assert_eq!(compute_overall_mark(&block, &s), 63.5);
    }

    #[test]
    fn components_win_over_stale_derived_mark() {
        let s = settings();
        let block = ScoreBlock {
            entry: ScoreEntry::CombinedExam {
                tests: vec![5.0],
                exam_score: 50.0,
            },
            total_test: Some(5.0),
            total_exam: Some(50.0),
            // Stale value from an earlier save; the sum must win.
            overall_mark: Some(99.0),
            grade: None,
        };
        assert_eq!(compute_overall_mark(&block, &s), 55.0);
    }

    #[test]
    fn non_finite_components_degrade_to_zero() {
        let s = settings();
        let block = ScoreBlock {
            entry: ScoreEntry::SeparateExam {
                tests: vec![f64::NAN, 10.0],
                objective: f64::INFINITY,
                theory: 20.0,
            },
            total_test: None,
            total_exam: None,
            overall_mark: None,
            grade: None,
        };
        assert_eq!(compute_overall_mark(&block, &s), 30.0);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let s = settings();
        let block = finalize_block(
            ScoreEntry::CombinedExam {
                tests: vec![6.0, 7.5],
                exam_score: 41.0,
            },
            &s,
            &GradeScale::default(),
        );
        let first = compute_overall_mark(&block, &s);
        let second = compute_overall_mark(&block, &s);
        assert_eq!(first, second);
    }

    #[test]
    fn grade_thresholds_and_default_f() {
        let scale = GradeScale::default();
        assert_eq!(grade_from_score(70.0, &scale), Grade::A);
        assert_eq!(grade_from_score(69.9, &scale), Grade::B);
        assert_eq!(grade_from_score(60.0, &scale), Grade::B);
        assert_eq!(grade_from_score(50.0, &scale), Grade::C);
        assert_eq!(grade_from_score(40.0, &scale), Grade::D);
        assert_eq!(grade_from_score(39.9, &scale), Grade::F);
    }

    #[test]
    fn grade_is_monotonic_in_score() {
        let scale = GradeScale::default();
        let mut prev = grade_from_score(0.0, &scale);
        for step in 1..=1000 {
            let score = step as f64 / 10.0;
            let g = grade_from_score(score, &scale);
            assert!(g >= prev, "grade dropped at score {}", score);
            prev = g;
        }
    }

    #[test]
    fn two_subject_average_lands_on_grade_a_pass() {
        let s = settings();
        let scale = GradeScale::default();
        let mut scores = BTreeMap::new();
        scores.insert(
            "English Language".to_string(),
            finalize_block(
                ScoreEntry::CombinedExam {
                    tests: vec![20.0],
                    exam_score: 45.0,
                },
                &s,
                &scale,
            ),
        );
        scores.insert(
            "Mathematics".to_string(),
            finalize_block(
                ScoreEntry::CombinedExam {
                    tests: vec![25.0],
                    exam_score: 50.0,
                },
                &s,
                &scale,
            ),
        );
        let avg = average_marks(&scores, &s);
        assert_eq!(avg, 70.0);
        assert_eq!(grade_from_score(avg, &scale), Grade::A);
        assert_eq!(status_from_score(avg, &scale), ResultStatus::Pass);
    }

    #[test]
    fn completeness_requires_enabled_totals() {
        let s = settings();
        let complete = finalize_block(
            ScoreEntry::CombinedExam {
                tests: vec![10.0],
                exam_score: 30.0,
            },
            &s,
            &GradeScale::default(),
        );
        assert!(is_score_complete_for_subject(Some(&complete), &s));
        assert!(!is_score_complete_for_subject(None, &s));

        let partial = ScoreBlock {
            entry: ScoreEntry::Tests { tests: vec![10.0] },
            total_test: Some(10.0),
            total_exam: None,
            overall_mark: Some(10.0),
            grade: None,
        };
        assert!(!is_score_complete_for_subject(Some(&partial), &s));

        let mut exam_off = settings();
        exam_off.exam_enabled = false;
        assert!(is_score_complete_for_subject(Some(&partial), &exam_off));
    }

    #[test]
    fn score_block_json_round_trip() {
        let s = settings();
        let block = finalize_block(
            ScoreEntry::SeparateExam {
                tests: vec![9.0],
                objective: 22.0,
                theory: 31.0,
            },
            &s,
            &GradeScale::default(),
        );
        let json = serde_json::to_string(&block).expect("serialize");
        assert!(json.contains("\"entry\":\"separate_exam\""));
        let back: ScoreBlock = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, block);
    }

    #[test]
    fn term_token_parse_and_build() {
        assert_eq!(term_token("2025-2026", "First Term"), "2025-2026::First Term");
        assert_eq!(
            parse_term_token("2025-2026::Second Term"),
            ("2025-2026".to_string(), "Second Term".to_string())
        );
        assert_eq!(
            parse_term_token("Third Term"),
            (String::new(), "Third Term".to_string())
        );
    }

    #[test]
    fn requested_term_resolution_prefers_current_year() {
        let terms = vec![
            PublishedTerm::new("2024-2025", "First Term", "JSS1"),
            PublishedTerm::new("2025-2026", "First Term", "JSS2"),
            PublishedTerm::new("2025-2026", "Second Term", "JSS2"),
        ];
        let hit = resolve_requested_published_term(&terms, "First Term", "Second Term", "2025-2026")
            .expect("resolved");
        assert_eq!(hit.academic_year, "2025-2026");

        let by_token =
            resolve_requested_published_term(&terms, "2024-2025::First Term", "", "").expect("token");
        assert_eq!(by_token.classname, "JSS1");

        assert!(resolve_requested_published_term(&terms, "Third Term", "", "2025-2026").is_none());

        let default = resolve_requested_published_term(&terms, "", "Second Term", "2025-2026")
            .expect("default");
        assert_eq!(default.term, "Second Term");
    }

    #[test]
    fn disabled_operations_hide_current_term_only() {
        let mut s = settings();
        s.operations_enabled = false;
        s.current_term = "Second Term".to_string();
        s.academic_year = "2025-2026".to_string();
        let terms = vec![
            PublishedTerm::new("2025-2026", "First Term", "JSS1"),
            PublishedTerm::new("2025-2026", "Second Term", "JSS1"),
        ];
        let visible = filter_visible_terms(&s, terms);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].term, "First Term");
    }
}
