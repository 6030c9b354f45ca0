use std::io::Cursor;

use exam_marker_rust::{
    AnnotationRequest, BBox, Engine, LineId, MarkKind, Settings, Word, WordSource, WordsFuture,
    resolve_page,
};
use image::{DynamicImage, ImageFormat, Rgb};

/// Deterministic stand-in for the OCR provider.
#[derive(Clone)]
struct StubSource {
    words: Vec<Word>,
}

impl WordSource for StubSource {
    fn detect_words(&self, _image: &[u8], _language_hints: &[String]) -> WordsFuture {
        let words = self.words.clone();
        Box::pin(std::future::ready(words))
    }
}

fn word(text: &str, x1: f32, y1: f32, x2: f32, y2: f32) -> Word {
    Word {
        text: text.to_string(),
        bbox: BBox::new(x1, y1, x2, y2),
    }
}

fn exam_page_words() -> Vec<Word> {
    vec![
        word("Q1.", 40.0, 120.0, 80.0, 140.0),
        word("Describe", 90.0, 120.0, 220.0, 140.0),
        word("the", 230.0, 120.0, 260.0, 140.0),
        word("process", 270.0, 120.0, 360.0, 140.0),
        word("Answer", 60.0, 200.0, 240.0, 220.0),
    ]
}

fn white_png(width: u32, height: u32) -> Vec<u8> {
    let page = image::RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(page)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode page");
    bytes
}

fn engine(words: Vec<Word>) -> Engine<StubSource> {
    Engine::new(StubSource { words }, Settings::default(), &[1]).expect("engine")
}

fn request(kind: MarkKind, line_id: Option<LineId>) -> AnnotationRequest {
    AnnotationRequest {
        kind,
        text: "4/5".to_string(),
        color: None,
        size: 1.0,
        page: 0,
        line_id,
        line_range: None,
        anchor_text: None,
    }
}

fn has_ink_within(image: &[u8], region: BBox) -> bool {
    let decoded = image::load_from_memory(image).expect("decode").to_rgb8();
    let x1 = region.x1.max(0.0) as u32;
    let y1 = region.y1.max(0.0) as u32;
    let x2 = (region.x2 as u32).min(decoded.width() - 1);
    let y2 = (region.y2 as u32).min(decoded.height() - 1);
    for y in y1..=y2 {
        for x in x1..=x2 {
            let pixel = decoded.get_pixel(x, y);
            if pixel[0] < 240 || pixel[1] < 240 || pixel[2] < 240 {
                return true;
            }
        }
    }
    false
}

#[tokio::test]
async fn line_map_matches_spec_scenario() {
    let engine = engine(exam_page_words());
    let page = white_png(800, 1200);

    let map = engine.line_map(&page, None).await.expect("line map");
    assert_eq!(map.lines().len(), 2);

    let header = map.get(LineId::new(1, 1)).expect("Q1-L1");
    assert_eq!(header.text, "Q1. Describe the process");
    assert_eq!(header.bbox, BBox::new(40.0, 120.0, 360.0, 140.0));

    let answer = map.get(LineId::new(1, 2)).expect("Q1-L2");
    assert_eq!(answer.bbox, BBox::new(60.0, 200.0, 240.0, 220.0));

    // The two passes rebuild the map independently and must agree.
    let again = engine.line_map(&page, None).await.expect("line map again");
    assert_eq!(map.lines(), again.lines());
}

#[tokio::test]
async fn circled_score_resolves_and_inks_the_page() {
    let engine = engine(exam_page_words());
    let page = white_png(800, 1200);

    let map = engine.line_map(&page, None).await.expect("line map");
    let score = request(MarkKind::CircledScore, Some(LineId::new(1, 1)));
    let (placed, _) = resolve_page(&map, std::slice::from_ref(&score));
    assert_eq!(placed[0].regions, vec![BBox::new(40.0, 120.0, 360.0, 140.0)]);

    // A highlight addressed to the same line guarantees ink inside its bbox.
    let highlight = request(MarkKind::Highlight, Some(LineId::new(1, 1)));
    let annotated = engine.render_page(&page, &[score, highlight]).await;
    assert_eq!(annotated.summary.resolved, 2);
    assert!(has_ink_within(
        &annotated.bytes,
        BBox::new(40.0, 120.0, 360.0, 140.0)
    ));
}

#[tokio::test]
async fn unresolved_request_never_fails_the_page() {
    let engine = engine(exam_page_words());
    let page = white_png(800, 1200);

    let missing = request(MarkKind::Tick, Some(LineId::new(5, 1)));
    let present = request(MarkKind::Underline, Some(LineId::new(1, 2)));
    let annotated = engine.render_page(&page, &[missing, present]).await;

    assert_eq!(annotated.summary.unresolved, 1);
    assert_eq!(annotated.summary.resolved, 1);
    // The underline sits just below Q1-L2.
    assert!(has_ink_within(
        &annotated.bytes,
        BBox::new(60.0, 218.0, 240.0, 232.0)
    ));
}

#[tokio::test]
async fn zero_words_degrade_to_a_passthrough_page() {
    let engine = engine(Vec::new());
    let page = white_png(800, 1200);

    let tick = request(MarkKind::Tick, Some(LineId::new(1, 1)));
    let annotated = engine.render_page(&page, &[tick]).await;
    assert_eq!(annotated.summary.unresolved, 1);
    // Still a decodable image of the same dimensions.
    let decoded = image::load_from_memory(&annotated.bytes).expect("decode");
    assert_eq!(decoded.width(), 800);
}

#[tokio::test]
async fn undecodable_page_is_returned_unmodified() {
    let engine = engine(exam_page_words());
    let garbage = b"definitely not an image".to_vec();

    let tick = request(MarkKind::Tick, Some(LineId::new(1, 1)));
    let annotated = engine.render_page(&garbage, &[tick]).await;
    assert_eq!(annotated.bytes, garbage);
    assert_eq!(annotated.summary.unresolved, 1);
}

#[tokio::test]
async fn submission_threads_question_carry_over_across_pages() {
    // Page 0 establishes Q1; page 1 continues the answer with no header.
    let engine = Engine::new(
        StubSource {
            words: vec![
                word("Q1.", 40.0, 120.0, 80.0, 140.0),
                word("Answer", 90.0, 120.0, 200.0, 140.0),
            ],
        },
        Settings::default(),
        &[1, 2],
    )
    .expect("engine");
    let pages = vec![white_png(400, 600), white_png(400, 600)];

    let mut continued = request(MarkKind::Tick, Some(LineId::new(1, 1)));
    continued.page = 1;

    let annotated = engine.render_submission(&pages, &[continued]).await;
    assert_eq!(annotated.len(), 2);
    // The stub reports the same words for page 1; with carry-over active the
    // line is still attributed to Q1 and the request resolves.
    assert_eq!(annotated[1].summary.resolved, 1);
    assert_eq!(annotated[1].summary.unresolved, 0);
}

#[tokio::test]
async fn page_total_badge_only_renders_on_the_first_page() {
    let engine = engine(exam_page_words());
    let pages = vec![white_png(400, 600), white_png(400, 600)];

    let mut first = request(MarkKind::PageTotal, None);
    first.text = "Total: 18/20".to_string();
    let mut second = first.clone();
    second.page = 1;

    let annotated = engine.render_submission(&pages, &[first, second]).await;
    assert_eq!(annotated[0].summary.resolved, 1);
    assert_eq!(annotated[1].summary.unresolved, 1);
    // Badge ink in the top-right corner of page 0 only.
    assert!(has_ink_within(
        &annotated[0].bytes,
        BBox::new(280.0, 8.0, 398.0, 60.0)
    ));
    assert!(!has_ink_within(
        &annotated[1].bytes,
        BBox::new(280.0, 8.0, 398.0, 60.0)
    ));
}
