use serde::Serialize;
use tracing::warn;

use crate::annotations::{AnnotationRequest, MarkKind};
use crate::geometry::BBox;
use crate::layout::{LineId, LineMap};

/// An annotation request with its resolved pixel regions, ready to draw.
/// `page_total` carries no regions; everything else has at least one.
#[derive(Debug, Clone)]
pub struct PlacedAnnotation {
    pub request: AnnotationRequest,
    pub regions: Vec<BBox>,
}

/// Per-page diagnostic counts, surfaced to operators rather than end users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionSummary {
    pub resolved: usize,
    /// Ranges where only a subset of the referenced lines was found.
    pub partial: usize,
    pub unresolved: usize,
}

/// Resolve every request against the page's line map, in the order received.
/// Unresolvable requests are dropped and counted, never fatal.
pub fn resolve_page(
    map: &LineMap,
    requests: &[AnnotationRequest],
) -> (Vec<PlacedAnnotation>, ResolutionSummary) {
    let mut placed = Vec::with_capacity(requests.len());
    let mut summary = ResolutionSummary::default();

    for request in requests {
        match resolve_request(map, request) {
            Resolution::Full(regions) => {
                summary.resolved += 1;
                placed.push(PlacedAnnotation {
                    request: request.clone(),
                    regions,
                });
            }
            Resolution::Partial(regions) => {
                summary.partial += 1;
                placed.push(PlacedAnnotation {
                    request: request.clone(),
                    regions,
                });
            }
            Resolution::Unresolved => {
                summary.unresolved += 1;
                warn!(
                    "dropping unresolvable {:?} annotation ({})",
                    request.kind,
                    describe_address(request)
                );
            }
        }
    }

    (placed, summary)
}

enum Resolution {
    Full(Vec<BBox>),
    Partial(Vec<BBox>),
    Unresolved,
}

fn resolve_request(map: &LineMap, request: &AnnotationRequest) -> Resolution {
    // The page-total badge is pinned to a corner and never references a line.
    if request.kind == MarkKind::PageTotal {
        return Resolution::Full(Vec::new());
    }

    if let Some(id) = request.line_id {
        return match map.get(id) {
            Some(line) => Resolution::Full(vec![line.bbox]),
            None => Resolution::Unresolved,
        };
    }

    if let Some(range) = request.line_range {
        return resolve_range(map, range.start, range.end);
    }

    if let Some(anchor) = request.anchor_text.as_deref() {
        return match map.find_anchor(anchor) {
            Some(line) => Resolution::Full(vec![line.bbox]),
            None => Resolution::Unresolved,
        };
    }

    Resolution::Unresolved
}

/// Inclusive range expansion. A partially-on-page range degrades to the
/// subset of lines actually found; only a fully missing range is dropped.
fn resolve_range(map: &LineMap, start: LineId, end: LineId) -> Resolution {
    if start.question != end.question || start.line > end.line {
        return Resolution::Unresolved;
    }
    let span = (end.line - start.line + 1) as usize;
    let mut regions = Vec::with_capacity(span);
    for index in start.line..=end.line {
        if let Some(line) = map.get(LineId::new(start.question, index)) {
            regions.push(line.bbox);
        }
    }
    if regions.is_empty() {
        Resolution::Unresolved
    } else if regions.len() < span {
        Resolution::Partial(regions)
    } else {
        Resolution::Full(regions)
    }
}

fn describe_address(request: &AnnotationRequest) -> String {
    if let Some(id) = request.line_id {
        return format!("line {}", id);
    }
    if let Some(range) = request.line_range {
        return format!("range {}..{}", range.start, range.end);
    }
    if let Some(anchor) = request.anchor_text.as_deref() {
        return format!("anchor '{}'", anchor);
    }
    "no address".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::LineRange;
    use crate::layout::{QuestionPatterns, RawLine, assign_ids};

    fn page_map() -> LineMap {
        let patterns = QuestionPatterns::compile(&[1]).expect("patterns");
        let lines = vec![
            RawLine {
                text: "Q1. Describe the process".to_string(),
                bbox: BBox::new(40.0, 120.0, 360.0, 140.0),
            },
            RawLine {
                text: "Answer continues".to_string(),
                bbox: BBox::new(60.0, 200.0, 240.0, 220.0),
            },
            RawLine {
                text: "and concludes".to_string(),
                bbox: BBox::new(60.0, 260.0, 200.0, 280.0),
            },
        ];
        assign_ids(lines, &patterns, None)
    }

    fn request_for(kind: MarkKind) -> AnnotationRequest {
        AnnotationRequest {
            kind,
            text: String::new(),
            color: None,
            size: 1.0,
            page: 0,
            line_id: None,
            line_range: None,
            anchor_text: None,
        }
    }

    #[test]
    fn single_line_id_resolves_to_its_bbox() {
        let map = page_map();
        let mut request = request_for(MarkKind::Tick);
        request.line_id = Some(LineId::new(1, 2));
        let (placed, summary) = resolve_page(&map, &[request]);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].regions, vec![BBox::new(60.0, 200.0, 240.0, 220.0)]);
        assert_eq!(summary.resolved, 1);
    }

    #[test]
    fn range_degrades_to_found_subset() {
        let map = page_map();
        let mut request = request_for(MarkKind::Bracket);
        request.line_range = Some(LineRange {
            start: LineId::new(1, 2),
            end: LineId::new(1, 4),
        });
        let (placed, summary) = resolve_page(&map, &[request]);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].regions.len(), 2);
        assert_eq!(summary.partial, 1);
        assert_eq!(summary.unresolved, 0);
    }

    #[test]
    fn range_across_questions_is_unresolved() {
        let map = page_map();
        let mut request = request_for(MarkKind::Bracket);
        request.line_range = Some(LineRange {
            start: LineId::new(1, 1),
            end: LineId::new(2, 1),
        });
        let (placed, summary) = resolve_page(&map, &[request]);
        assert!(placed.is_empty());
        assert_eq!(summary.unresolved, 1);
    }

    #[test]
    fn anchor_text_falls_back_to_substring_match() {
        let map = page_map();
        let mut request = request_for(MarkKind::Underline);
        request.anchor_text = Some("Describe the process".to_string());
        let (placed, summary) = resolve_page(&map, &[request]);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].regions, vec![BBox::new(40.0, 120.0, 360.0, 140.0)]);
        assert_eq!(summary.resolved, 1);
    }

    #[test]
    fn unresolved_request_is_dropped_without_affecting_others() {
        let map = page_map();
        let mut missing = request_for(MarkKind::Tick);
        missing.line_id = Some(LineId::new(5, 1));
        let mut present = request_for(MarkKind::Tick);
        present.line_id = Some(LineId::new(1, 1));
        let (placed, summary) = resolve_page(&map, &[missing, present]);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].request.line_id, Some(LineId::new(1, 1)));
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.unresolved, 1);
    }

    #[test]
    fn page_total_resolves_without_an_address() {
        let map = page_map();
        let request = request_for(MarkKind::PageTotal);
        let (placed, summary) = resolve_page(&map, &[request]);
        assert_eq!(placed.len(), 1);
        assert!(placed[0].regions.is_empty());
        assert_eq!(summary.resolved, 1);
    }

    #[test]
    fn request_without_address_is_unresolved() {
        let map = page_map();
        let request = request_for(MarkKind::Comment);
        let (placed, summary) = resolve_page(&map, &[request]);
        assert!(placed.is_empty());
        assert_eq!(summary.unresolved, 1);
    }
}
