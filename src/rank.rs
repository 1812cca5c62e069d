use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::calc::{self, ScoreBlock};
use crate::classes;
use crate::school::SchoolSettings;

/// Two averages closer than this share a position.
pub const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRankingMode {
    Together,
    Separate,
}

impl StreamRankingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRankingMode::Together => "together",
            StreamRankingMode::Separate => "separate",
        }
    }

    pub fn parse(raw: &str) -> StreamRankingMode {
        if raw.trim().eq_ignore_ascii_case("separate") {
            StreamRankingMode::Separate
        } else {
            StreamRankingMode::Together
        }
    }
}

/// One student's input to class-level ranking. Built identically from working
/// records and from published snapshots so the two read paths can never
/// disagree on standing.
#[derive(Debug, Clone)]
pub struct RankEntry {
    pub student_id: String,
    pub classname: String,
    pub term: String,
    pub stream: String,
    pub average_marks: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub position: usize,
    pub cohort_size: usize,
    pub classname: String,
    pub term: String,
    pub stream: String,
    pub stream_label: String,
    pub is_stream_separate: bool,
    pub group: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubjectPosition {
    pub position: usize,
    pub cohort_size: usize,
}

fn same_score(a: f64, b: f64) -> bool {
    (clean(a) - clean(b)).abs() <= TIE_EPSILON
}

fn clean(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub fn pretty_stream_name(raw: &str) -> String {
    let stream = raw.trim();
    if classes::stream_is_unassigned(stream) {
        return "Unassigned".to_string();
    }
    if stream.len() <= 5 && stream.chars().all(|c| c.is_ascii_uppercase()) {
        return stream.to_string();
    }
    let mut chars = stream.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn group_key(settings: &SchoolSettings, entry: &RankEntry) -> (String, bool) {
    let split_by_stream = settings.ss_ranking_mode == StreamRankingMode::Separate
        && classes::class_uses_stream_for_school(settings, &entry.classname);
    let key = if split_by_stream {
        let stream = entry.stream.trim();
        let bucket = if stream.is_empty() { "Unassigned" } else { stream };
        format!("{}__{}__{}", entry.classname, entry.term, bucket)
    } else {
        format!("{}__{}", entry.classname, entry.term)
    };
    (key, split_by_stream)
}

/// Walk a descending-sorted list assigning competition ranks: ties share the
/// earlier position, and the next distinct score resumes at its own 1-based
/// index (two tied for 1st leaves the next at 3rd).
fn ranked_walk(sorted: &[(String, f64)]) -> Vec<(String, usize)> {
    let mut out = Vec::with_capacity(sorted.len());
    let mut prev_score: Option<f64> = None;
    let mut current_pos = 0usize;
    for (index, (student_id, score)) in sorted.iter().enumerate() {
        match prev_score {
            Some(prev) if same_score(*score, prev) => {}
            _ => current_pos = index + 1,
        }
        out.push((student_id.clone(), current_pos));
        prev_score = Some(*score);
    }
    out
}

fn sort_descending(scored: &mut [(String, f64)]) {
    scored.sort_by(|a, b| {
        clean(b.1)
            .partial_cmp(&clean(a.1))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Class-level standings. Groups by (class, term), additionally by stream in
/// stream-separate mode; students without an average rank with mark 0.
pub fn compute_positions(
    entries: &[RankEntry],
    settings: &SchoolSettings,
) -> HashMap<String, Position> {
    let mut groups: BTreeMap<String, (bool, Vec<&RankEntry>)> = BTreeMap::new();
    for entry in entries {
        if entry.student_id.is_empty() {
            continue;
        }
        let (key, split) = group_key(settings, entry);
        groups.entry(key).or_insert((split, Vec::new())).1.push(entry);
    }

    let mut positions = HashMap::new();
    for (key, (split, members)) in groups {
        let mut scored: Vec<(String, f64)> = members
            .iter()
            .map(|m| (m.student_id.clone(), clean(m.average_marks)))
            .collect();
        sort_descending(&mut scored);
        let size = scored.len();
        let by_id: HashMap<&str, &&RankEntry> =
            members.iter().map(|m| (m.student_id.as_str(), m)).collect();
        for (student_id, pos) in ranked_walk(&scored) {
            let Some(entry) = by_id.get(student_id.as_str()) else {
                continue;
            };
            positions.insert(
                student_id.clone(),
                Position {
                    position: pos,
                    cohort_size: size,
                    classname: entry.classname.clone(),
                    term: entry.term.clone(),
                    stream: entry.stream.clone(),
                    stream_label: pretty_stream_name(&entry.stream),
                    is_stream_separate: split,
                    group: key.clone(),
                },
            );
        }
    }
    positions
}

/// Per-student score-map source for subject-level ranking; works over both
/// working records and published snapshot rows.
pub struct SubjectRankSource<'a> {
    pub student_id: &'a str,
    pub stream: &'a str,
    pub scores: &'a BTreeMap<String, ScoreBlock>,
}

/// Subject-by-subject standing of one student within their cohort, using the
/// same cohort split and tie epsilon as the class-level walk.
pub fn compute_subject_positions(
    sources: &[SubjectRankSource<'_>],
    subjects: &[String],
    student_id: &str,
    student_stream: &str,
    classname: &str,
    settings: &SchoolSettings,
) -> HashMap<String, SubjectPosition> {
    let split_by_stream = settings.ss_ranking_mode == StreamRankingMode::Separate
        && classes::class_uses_stream_for_school(settings, classname);
    let cohort: Vec<&SubjectRankSource<'_>> = if split_by_stream {
        let stream_key = student_stream.trim();
        sources
            .iter()
            .filter(|s| s.stream.trim() == stream_key)
            .collect()
    } else {
        sources.iter().collect()
    };

    let mut out = HashMap::new();
    for subject in subjects {
        let mut scored: Vec<(String, f64)> = cohort
            .iter()
            .map(|s| {
                let mark = s
                    .scores
                    .get(subject)
                    .map(|block| calc::compute_overall_mark(block, settings))
                    .unwrap_or(0.0);
                (s.student_id.to_string(), mark)
            })
            .collect();
        sort_descending(&mut scored);
        let size = scored.len();
        for (sid, pos) in ranked_walk(&scored) {
            if sid == student_id {
                out.insert(
                    subject.clone(),
                    SubjectPosition {
                        position: pos,
                        cohort_size: size,
                    },
                );
                break;
            }
        }
    }
    out
}
