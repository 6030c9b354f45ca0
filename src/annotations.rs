use serde::{Deserialize, Serialize};

use crate::layout::LineId;

/// Closed set of pen mark kinds. Each variant has a fixed geometric recipe
/// relative to its resolved region (see `pen.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkKind {
    /// Checkmark in the left margin beside the line.
    Tick,
    /// Cross in the left margin beside the line.
    Cross,
    /// Jittered hand-drawn underline beneath the line.
    Underline,
    /// Soft box around the line.
    Highlight,
    /// Short examiner note in the right margin.
    Comment,
    /// Small point label ("+2") at the right end of the line.
    PointLabel,
    /// Score with a hand-drawn ellipse around it.
    CircledScore,
    /// Vertical bracket spanning a line range, with a label.
    Bracket,
    /// Total-score badge pinned to the top-right of the first page.
    PageTotal,
}

/// Inclusive line-identifier range; both ends must share a question number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: LineId,
    pub end: LineId,
}

/// One grading decision to place on a page. Addressing is one of: a single
/// `line_id`, a `line_range`, or an `anchor_text` substring fallback;
/// `page_total` needs none of them. Produced by the external grading
/// collaborator, typically as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRequest {
    pub kind: MarkKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub color: Option<String>,
    /// Relative mark scale; 1.0 is the default recipe size.
    #[serde(default = "default_size")]
    pub size: f32,
    /// Zero-based index of the page this request targets.
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub line_id: Option<LineId>,
    #[serde(default)]
    pub line_range: Option<LineRange>,
    #[serde(default)]
    pub anchor_text: Option<String>,
}

fn default_size() -> f32 {
    1.0
}

/// Opaque pen ink color. Parsing accepts a small named set and `#rrggbb`
/// hex, defaulting to red so a malformed color never drops a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InkColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

pub const INK_RED: InkColor = InkColor {
    r: 204,
    g: 10,
    b: 10,
};

impl InkColor {
    pub fn parse(value: Option<&str>) -> InkColor {
        let Some(value) = value else {
            return INK_RED;
        };
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "red" => INK_RED,
            "green" => InkColor { r: 0, g: 140, b: 60 },
            "blue" => InkColor { r: 20, g: 70, b: 190 },
            "black" => InkColor { r: 25, g: 25, b: 25 },
            _ => Self::parse_hex(value).unwrap_or(INK_RED),
        }
    }

    fn parse_hex(value: &str) -> Option<InkColor> {
        let hex = value.strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(InkColor { r, g, b })
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LineId;

    #[test]
    fn color_parsing_accepts_names_and_hex() {
        assert_eq!(InkColor::parse(Some("red")), INK_RED);
        assert_eq!(InkColor::parse(Some("GREEN")).g, 140);
        assert_eq!(
            InkColor::parse(Some("#1a2b3c")),
            InkColor {
                r: 0x1a,
                g: 0x2b,
                b: 0x3c
            }
        );
    }

    #[test]
    fn color_parsing_defaults_to_red() {
        assert_eq!(InkColor::parse(None), INK_RED);
        assert_eq!(InkColor::parse(Some("fuchsia")), INK_RED);
        assert_eq!(InkColor::parse(Some("#12345")), INK_RED);
        assert_eq!(InkColor::parse(Some("#zzzzzz")), INK_RED);
    }

    #[test]
    fn hex_output_round_trips() {
        let color = InkColor::parse(Some("#0f8040"));
        assert_eq!(color.hex(), "#0f8040");
    }

    #[test]
    fn request_deserializes_from_grading_json() {
        let json = r#"{
            "kind": "circled_score",
            "text": "4/5",
            "color": "red",
            "page": 0,
            "line_id": "Q1-L1"
        }"#;
        let request: AnnotationRequest = serde_json::from_str(json).expect("parse");
        assert_eq!(request.kind, MarkKind::CircledScore);
        assert_eq!(request.line_id, Some(LineId::new(1, 1)));
        assert_eq!(request.size, 1.0);
        assert!(request.line_range.is_none());
        assert!(request.anchor_text.is_none());
    }

    #[test]
    fn request_deserializes_range_addressing() {
        let json = r#"{
            "kind": "bracket",
            "text": "good reasoning",
            "page": 1,
            "line_range": {"start": "Q2-L1", "end": "Q2-L3"}
        }"#;
        let request: AnnotationRequest = serde_json::from_str(json).expect("parse");
        let range = request.line_range.expect("range");
        assert_eq!(range.start, LineId::new(2, 1));
        assert_eq!(range.end, LineId::new(2, 3));
    }
}
