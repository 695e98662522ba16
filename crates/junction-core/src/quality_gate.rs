//! Deterministic quality gate for candidate artifacts.
//!
//! Evaluation runs four fixed steps with no model call:
//!
//! 1. **Stop** – snapshot the structural facts of the artifact.
//! 2. **Task** – keyword overlap with the source instruction and the
//!    type-specific structural checklist.
//! 3. **Assess** – integer score out of 100 (task alignment 30, structure 30,
//!    length band 25, formatting 15).
//! 4. **Process** – pass / revise / archive against the configured thresholds.
//!
//! [`QualityGate::evaluate`] is a pure function of its inputs. Every
//! evaluation the pipeline makes is appended to the [`ValidationLog`].

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;
use crate::domain::{ContentDigest, Result};

/// Lines longer than this count as a formatting defect.
pub const MAX_LINE_CHARS: usize = 1_000;
/// Overlap ratio that earns the full task-alignment score.
const FULL_ALIGNMENT_RATIO: f64 = 0.6;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "old", "see",
    "two", "who", "did", "get", "let", "say", "she", "too", "use", "this", "that", "with", "from",
    "they", "will", "would", "there", "their", "what", "about", "which", "when", "make", "like",
    "than", "then", "them", "these", "some", "into", "your", "just", "also", "more", "been",
    "were", "does", "each", "very", "should", "could", "write", "please",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    Article,
    Summary,
    Post,
}

type Check = fn(&Snapshot) -> bool;

impl ArtifactType {
    /// Inclusive word-count band.
    pub fn word_band(self) -> (usize, usize) {
        match self {
            ArtifactType::Article => (300, 2_000),
            ArtifactType::Summary => (50, 400),
            ArtifactType::Post => (20, 300),
        }
    }

    fn checklist(self) -> &'static [(&'static str, Check)] {
        match self {
            ArtifactType::Article => ARTICLE_CHECKS,
            ArtifactType::Summary => SUMMARY_CHECKS,
            ArtifactType::Post => POST_CHECKS,
        }
    }
}

fn has_title(s: &Snapshot) -> bool {
    s.title.is_some()
}

fn has_sections(s: &Snapshot) -> bool {
    s.section_headings >= 2
}

fn has_paragraph(s: &Snapshot) -> bool {
    s.paragraphs >= 1
}

fn has_three_paragraphs(s: &Snapshot) -> bool {
    s.paragraphs >= 3
}

fn opens_with_prose(s: &Snapshot) -> bool {
    s.opens_with_prose
}

fn has_key_points(s: &Snapshot) -> bool {
    s.list_items >= 2
}

fn short_first_line(s: &Snapshot) -> bool {
    s.first_line_chars < 120
}

fn few_headings(s: &Snapshot) -> bool {
    s.headings <= 1
}

const ARTICLE_CHECKS: &[(&str, Check)] = &[
    ("a title heading", has_title),
    ("at least two section headings", has_sections),
    ("at least three paragraphs", has_three_paragraphs),
    ("an opening paragraph before the first section", opens_with_prose),
];

const SUMMARY_CHECKS: &[(&str, Check)] = &[
    ("a title heading", has_title),
    ("at least one paragraph", has_paragraph),
    ("at least two listed key points", has_key_points),
];

const POST_CHECKS: &[(&str, Check)] = &[
    ("at least one paragraph", has_paragraph),
    ("a first line under 120 characters", short_first_line),
    ("at most one heading", few_headings),
];

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactType::Article => "article",
            ArtifactType::Summary => "summary",
            ArtifactType::Post => "post",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "article" => Ok(ArtifactType::Article),
            "summary" => Ok(ArtifactType::Summary),
            "post" => Ok(ArtifactType::Post),
            other => Err(format!("unknown artifact type: {other}")),
        }
    }
}

/// Structural facts gathered by the Stop step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub chars: usize,
    pub words: usize,
    pub lines: usize,
    pub headings: usize,
    /// Headings of level two or deeper.
    pub section_headings: usize,
    pub title: Option<String>,
    pub paragraphs: usize,
    pub list_items: usize,
    pub longest_line: usize,
    pub first_line_chars: usize,
    pub max_blank_run: usize,
    /// Lines starting with `#` that are not valid headings (`#Title`, `#######`).
    pub malformed_headings: usize,
    pub opens_with_prose: bool,
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(\S.*)$").expect("heading pattern compiles"))
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([-*+]|\d+[.)])\s+\S").expect("list pattern compiles"))
}

fn is_word(token: &str) -> bool {
    token.chars().any(char::is_alphanumeric)
}

/// Stop: snapshot the artifact.
pub fn snapshot(artifact: &str) -> Snapshot {
    let mut snap = Snapshot {
        chars: artifact.chars().count(),
        words: artifact.split_whitespace().filter(|t| is_word(t)).count(),
        ..Snapshot::default()
    };

    let mut blank_run = 0usize;
    let mut in_paragraph = false;
    let mut seen_block = false;
    let mut seen_first_line = false;

    for line in artifact.lines() {
        snap.lines += 1;
        let chars = line.chars().count();
        snap.longest_line = snap.longest_line.max(chars);
        let trimmed = line.trim();

        if trimmed.is_empty() {
            blank_run += 1;
            snap.max_blank_run = snap.max_blank_run.max(blank_run);
            in_paragraph = false;
            continue;
        }
        blank_run = 0;
        if !seen_first_line {
            snap.first_line_chars = trimmed.chars().count();
            seen_first_line = true;
        }

        if let Some(caps) = heading_re().captures(trimmed) {
            let level = caps.get(1).map_or(1, |m| m.as_str().len());
            snap.headings += 1;
            if level == 1 && snap.title.is_none() && !seen_block {
                snap.title = caps.get(2).map(|m| m.as_str().trim().to_string());
            } else {
                if !seen_block {
                    seen_block = true;
                }
                if level >= 2 {
                    snap.section_headings += 1;
                }
            }
            in_paragraph = false;
        } else if trimmed.starts_with('#') {
            snap.malformed_headings += 1;
            in_paragraph = false;
        } else if list_item_re().is_match(line) {
            snap.list_items += 1;
            seen_block = true;
            in_paragraph = false;
        } else if !in_paragraph {
            snap.paragraphs += 1;
            if !seen_block {
                snap.opens_with_prose = true;
                seen_block = true;
            }
            in_paragraph = true;
        }
    }
    snap
}

/// Lowercased content words of at least three characters.
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Task: share of instruction keywords present in the artifact. An
/// instruction without keywords imposes nothing and scores 1.0.
pub fn keyword_overlap(instruction: &str, artifact: &str) -> f64 {
    let wanted = keywords(instruction);
    if wanted.is_empty() {
        return 1.0;
    }
    let present = keywords(artifact);
    wanted.intersection(&present).count() as f64 / wanted.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Revise,
    Archive,
}

impl Decision {
    /// Process: map a score onto the thresholds.
    pub fn from_score(score: u32, thresholds: &QualityConfig) -> Self {
        if score >= thresholds.pass_threshold {
            Decision::Pass
        } else if score >= thresholds.revise_floor {
            Decision::Revise
        } else {
            Decision::Archive
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Pass => "pass",
            Decision::Revise => "revise",
            Decision::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-criterion points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Out of 30.
    pub task_alignment: u32,
    /// Out of 30.
    pub structure: u32,
    /// Out of 25.
    pub length: u32,
    /// Out of 15.
    pub formatting: u32,
    pub keyword_overlap_pct: u32,
    pub checklist_passed: Vec<String>,
    pub checklist_failed: Vec<String>,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.task_alignment + self.structure + self.length + self.formatting
    }
}

/// The outcome of one evaluation. Carries no timestamp so identical inputs
/// give identical judgments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityJudgment {
    pub score: u32,
    pub breakdown: ScoreBreakdown,
    pub decision: Decision,
    pub recommendations: Vec<String>,
    pub artifact_type: ArtifactType,
    pub artifact_digest: ContentDigest,
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    thresholds: QualityConfig,
}

impl QualityGate {
    pub fn new(thresholds: QualityConfig) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &QualityConfig {
        &self.thresholds
    }

    pub fn evaluate(&self, artifact: &str, instruction: &str, kind: ArtifactType) -> QualityJudgment {
        let snap = snapshot(artifact);
        let mut recommendations = Vec::new();

        // Task alignment
        let overlap = keyword_overlap(instruction, artifact);
        let task_alignment = (30.0 * (overlap / FULL_ALIGNMENT_RATIO).min(1.0)).round() as u32;
        if task_alignment < 30 {
            recommendations.push(format!(
                "address the source more directly: only {:.0}% of its key terms appear",
                overlap * 100.0
            ));
        }

        // Structure
        let checklist = kind.checklist();
        let mut checklist_passed = Vec::new();
        let mut checklist_failed = Vec::new();
        for (name, check) in checklist {
            if check(&snap) {
                checklist_passed.push(name.to_string());
            } else {
                checklist_failed.push(name.to_string());
                recommendations.push(format!("add {name}"));
            }
        }
        let total = checklist.len() as u32;
        let structure = if total == 0 {
            30
        } else {
            (30 * checklist_passed.len() as u32 + total / 2) / total
        };

        // Length band
        let (min, max) = kind.word_band();
        let length = if (min..=max).contains(&snap.words) {
            25
        } else if snap.words < min {
            recommendations.push(format!(
                "expand to at least {min} words (currently {})",
                snap.words
            ));
            if snap.words * 2 >= min {
                12
            } else {
                0
            }
        } else {
            recommendations.push(format!("trim to at most {max} words (currently {})", snap.words));
            if snap.words <= max * 2 {
                15
            } else {
                0
            }
        };

        // Formatting
        let mut formatting = 0;
        if snap.longest_line <= MAX_LINE_CHARS {
            formatting += 5;
        } else {
            recommendations.push(format!("break lines longer than {MAX_LINE_CHARS} characters"));
        }
        if snap.max_blank_run <= 2 {
            formatting += 5;
        } else {
            recommendations.push("collapse runs of more than two blank lines".to_string());
        }
        if snap.malformed_headings == 0 {
            formatting += 5;
        } else {
            recommendations.push(format!(
                "fix {} malformed heading(s): use '# ' followed by text",
                snap.malformed_headings
            ));
        }

        let breakdown = ScoreBreakdown {
            task_alignment,
            structure,
            length,
            formatting,
            keyword_overlap_pct: (overlap * 100.0).round() as u32,
            checklist_passed,
            checklist_failed,
        };
        let score = breakdown.total().min(100);

        QualityJudgment {
            score,
            decision: Decision::from_score(score, &self.thresholds),
            breakdown,
            recommendations,
            artifact_type: kind,
            artifact_digest: ContentDigest::from_bytes(artifact.as_bytes()),
        }
    }
}

/// One line of the validation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub timestamp: DateTime<Utc>,
    pub signal_id: Option<String>,
    pub run_id: Option<String>,
    /// 0 for the first evaluation, then one per revision.
    pub attempt: u32,
    pub judgment: QualityJudgment,
}

/// Append-only JSON-lines log of gate evaluations.
#[derive(Debug, Clone)]
pub struct ValidationLog {
    path: PathBuf,
}

impl ValidationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line. Existing lines are never rewritten.
    pub fn append(&self, record: &ValidationRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<ValidationRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
