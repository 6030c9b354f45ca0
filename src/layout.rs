use anyhow::{Result, anyhow};
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::geometry::{BBox, union_all};
use crate::ocr::Word;

/// Deterministic composite key naming the k-th text line attributed to
/// question n on a page, rendered as `Q{n}-L{k}`. `line` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineId {
    pub question: u32,
    pub line: u32,
}

impl LineId {
    pub fn new(question: u32, line: u32) -> Self {
        Self { question, line }
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}-L{}", self.question, self.line)
    }
}

impl FromStr for LineId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let rest = trimmed
            .strip_prefix('Q')
            .or_else(|| trimmed.strip_prefix('q'))
            .ok_or_else(|| anyhow!("invalid line id '{}': missing Q prefix", value))?;
        let (question, line) = rest
            .split_once('-')
            .ok_or_else(|| anyhow!("invalid line id '{}': missing '-'", value))?;
        let line = line
            .strip_prefix('L')
            .or_else(|| line.strip_prefix('l'))
            .ok_or_else(|| anyhow!("invalid line id '{}': missing L prefix", value))?;
        let question = question
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid question number in line id '{}'", value))?;
        let line = line
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid line index in line id '{}'", value))?;
        if line == 0 {
            return Err(anyhow!("line index is 1-based in '{}'", value));
        }
        Ok(LineId { question, line })
    }
}

impl Serialize for LineId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LineId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

/// One clustered text line with its assigned identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Line {
    pub id: LineId,
    pub text: String,
    pub bbox: BBox,
}

/// A line before identifier assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub text: String,
    pub bbox: BBox,
}

/// Compiled question-boundary patterns, one per configured question number.
/// A boundary line starts with an optional "Q"/"Q.", the number, and an
/// optional `.` `)` `:` `-` separator, case-insensitive.
#[derive(Debug, Clone)]
pub struct QuestionPatterns {
    patterns: Vec<(u32, Regex)>,
    first_question: u32,
}

impl QuestionPatterns {
    pub fn compile(question_numbers: &[u32]) -> Result<Self> {
        if question_numbers.is_empty() {
            return Err(anyhow!("question number set is empty"));
        }
        let mut numbers = question_numbers.to_vec();
        numbers.sort_unstable();
        numbers.dedup();
        let mut patterns = Vec::with_capacity(numbers.len());
        for number in &numbers {
            let pattern = format!(r"(?i)^\s*(?:q\.?\s*)?{}\s*(?:[.):\-]\s*|\s+|$)", number);
            let regex = Regex::new(&pattern)
                .map_err(|err| anyhow!("bad boundary pattern for question {}: {}", number, err))?;
            patterns.push((*number, regex));
        }
        Ok(Self {
            first_question: numbers[0],
            patterns,
        })
    }

    pub fn first_question(&self) -> u32 {
        self.first_question
    }

    fn match_boundary(&self, text: &str) -> Option<u32> {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(text))
            .map(|(number, _)| *number)
    }
}

/// Per-page map from line identifier to line, plus the question active at
/// the bottom of the page (threaded into the next page as carry-over).
#[derive(Debug, Clone)]
pub struct LineMap {
    lines: Vec<Line>,
    index: HashMap<LineId, usize>,
    carry_out: u32,
}

impl LineMap {
    pub fn get(&self, id: LineId) -> Option<&Line> {
        self.index.get(&id).map(|idx| &self.lines[*idx])
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Question number active at the end of this page.
    pub fn carry_out(&self) -> u32 {
        self.carry_out
    }

    /// First line whose text contains `anchor` as a case-insensitive
    /// substring, in top-to-bottom order.
    pub fn find_anchor(&self, anchor: &str) -> Option<&Line> {
        let needle = anchor.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.lines
            .iter()
            .find(|line| line.text.to_lowercase().contains(&needle))
    }
}

/// Clustering threshold: a fixed fraction of page height with a floor so
/// very small pages still cluster sensibly.
pub fn cluster_threshold(image_height: u32) -> f32 {
    (0.012 * image_height as f32).round().max(10.0)
}

/// Cluster words into text lines by vertical-center proximity. Words are
/// sorted by `(yc, x1)` and greedily joined while the vertical-center gap to
/// the previous member stays within the threshold. Zero words yield zero
/// lines.
pub fn build_lines(words: &[Word], image_height: u32) -> Vec<RawLine> {
    if words.is_empty() {
        return Vec::new();
    }
    let threshold = cluster_threshold(image_height);

    let mut sorted = words.to_vec();
    sorted.sort_by(|a, b| {
        let ay = a.bbox.center_y();
        let by = b.bbox.center_y();
        ay.total_cmp(&by).then(a.bbox.x1.total_cmp(&b.bbox.x1))
    });

    let mut clusters: Vec<Vec<Word>> = Vec::new();
    for word in sorted {
        let joins_current = clusters
            .last()
            .and_then(|cluster| cluster.last())
            .is_some_and(|last| (word.bbox.center_y() - last.bbox.center_y()).abs() <= threshold);
        if joins_current && let Some(cluster) = clusters.last_mut() {
            cluster.push(word);
        } else {
            clusters.push(vec![word]);
        }
    }

    clusters
        .into_iter()
        .map(|mut cluster| {
            cluster.sort_by(|a, b| a.bbox.x1.total_cmp(&b.bbox.x1));
            let boxes = cluster.iter().map(|word| word.bbox).collect::<Vec<_>>();
            let bbox = union_all(&boxes).unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0));
            let text = cluster
                .iter()
                .map(|word| word.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            RawLine { text, bbox }
        })
        .collect()
}

/// Walk lines top-to-bottom, switch the active question on boundary matches,
/// and assign every line a `Q{n}-L{k}` identifier with a per-run counter
/// that resets whenever the active question changes. Leading lines before
/// the first boundary belong to the carry-over question, or to the first
/// configured question when there is none.
pub fn assign_ids(
    lines: Vec<RawLine>,
    patterns: &QuestionPatterns,
    carry_over: Option<u32>,
) -> LineMap {
    let mut current = carry_over.unwrap_or_else(|| patterns.first_question());
    let mut run_count = 0u32;
    let mut assigned = Vec::with_capacity(lines.len());
    let mut index = HashMap::with_capacity(lines.len());

    for raw in lines {
        if let Some(question) = patterns.match_boundary(&raw.text)
            && question != current
        {
            current = question;
            run_count = 0;
        }
        run_count += 1;
        let id = LineId::new(current, run_count);
        index.entry(id).or_insert(assigned.len());
        assigned.push(Line {
            id,
            text: raw.text,
            bbox: raw.bbox,
        });
    }

    LineMap {
        lines: assigned,
        index,
        carry_out: current,
    }
}

/// The whole placement pipeline for one page, as a pure function so the
/// grading pass and the rendering pass can recompute identical results.
pub fn build_line_map(
    words: &[Word],
    image_height: u32,
    patterns: &QuestionPatterns,
    carry_over: Option<u32>,
) -> LineMap {
    assign_ids(build_lines(words, image_height), patterns, carry_over)
}
