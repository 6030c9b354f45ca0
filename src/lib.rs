use anyhow::{Context, Result};
use futures_util::future::join_all;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use usvg::fontdb;

pub mod annotations;
pub mod compose;
pub mod fonts;
pub mod geometry;
pub mod layout;
pub mod logging;
pub mod ocr;
pub mod pen;
pub mod resolve;
pub mod settings;
#[cfg(test)]
mod test_util;

pub use annotations::{AnnotationRequest, InkColor, LineRange, MarkKind};
pub use geometry::BBox;
pub use layout::{Line, LineId, LineMap, QuestionPatterns, build_line_map};
pub use ocr::{TesseractWordSource, Word, WordSource, WordsFuture};
pub use resolve::{PlacedAnnotation, ResolutionSummary, resolve_page};
pub use settings::{Settings, load_settings};

/// One annotated page plus its resolution diagnostics. `bytes` is always a
/// valid image: on whole-page failure it is the unmodified input.
#[derive(Debug, Clone)]
pub struct AnnotatedPage {
    pub bytes: Vec<u8>,
    pub summary: ResolutionSummary,
}

/// The OCR-guided annotation placement engine for one exam. Holds the
/// read-only question-boundary patterns and the resolved mark font; all
/// per-page state is request-scoped, so pages can run concurrently.
pub struct Engine<S: WordSource> {
    source: S,
    settings: Settings,
    patterns: QuestionPatterns,
    fonts: Arc<fontdb::Database>,
    mark_font: Option<fonts::MarkFont>,
}

impl<S: WordSource> Engine<S> {
    pub fn new(source: S, settings: Settings, question_numbers: &[u32]) -> Result<Self> {
        let patterns = QuestionPatterns::compile(question_numbers)?;
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        let mark_font = fonts::resolve_mark_font(&db, &settings.font_families);
        Ok(Self {
            source,
            settings,
            patterns,
            fonts: Arc::new(db),
            mark_font,
        })
    }

    /// Build the page's line map: OCR words, cluster into lines, assign
    /// identifiers. The grading pass uses this to cite lines; the rendering
    /// pass recomputes it with the same inputs and gets identical results.
    pub async fn line_map(&self, image: &[u8], carry_over: Option<u32>) -> Result<LineMap> {
        let (_, height) = image_dimensions(image)?;
        let words = self
            .source
            .detect_words(image, &self.language_hints())
            .await;
        Ok(build_line_map(&words, height, &self.patterns, carry_over))
    }

    /// Annotate a single page. Never fails: an unreadable page or a failed
    /// composition returns the input bytes unmodified, with every request
    /// counted as unresolved.
    pub async fn render_page(
        &self,
        image: &[u8],
        requests: &[AnnotationRequest],
    ) -> AnnotatedPage {
        match self.line_map(image, None).await {
            Ok(map) => self.render_with_map(image, &map, requests, true),
            Err(err) => {
                warn!("page unreadable, returning it unannotated: {:#}", err);
                AnnotatedPage {
                    bytes: image.to_vec(),
                    summary: ResolutionSummary {
                        unresolved: requests.len(),
                        ..Default::default()
                    },
                }
            }
        }
    }

    /// Annotate every page of a submission, order-preserving. OCR calls run
    /// concurrently (the only suspending step); line maps are then built in
    /// page order so the active question carries over across page breaks.
    pub async fn render_submission(
        &self,
        pages: &[Vec<u8>],
        requests: &[AnnotationRequest],
    ) -> Vec<AnnotatedPage> {
        let hints = self.language_hints();
        let detections = join_all(
            pages
                .iter()
                .map(|page| self.source.detect_words(page, &hints)),
        )
        .await;

        let mut carry: Option<u32> = None;
        let mut annotated = Vec::with_capacity(pages.len());
        for (index, (page, words)) in pages.iter().zip(detections).enumerate() {
            let page_requests = requests
                .iter()
                .filter(|request| request.page == index)
                .cloned()
                .collect::<Vec<_>>();
            let output = match image_dimensions(page) {
                Ok((_, height)) => {
                    let map = build_line_map(&words, height, &self.patterns, carry);
                    carry = Some(map.carry_out());
                    self.render_with_map(page, &map, &page_requests, index == 0)
                }
                Err(err) => {
                    warn!("page {} unreadable, passing it through: {:#}", index, err);
                    AnnotatedPage {
                        bytes: page.clone(),
                        summary: ResolutionSummary {
                            unresolved: page_requests.len(),
                            ..Default::default()
                        },
                    }
                }
            };
            info!(
                "page {}: {} resolved, {} partial, {} unresolved",
                index, output.summary.resolved, output.summary.partial, output.summary.unresolved
            );
            annotated.push(output);
        }
        annotated
    }

    fn render_with_map(
        &self,
        image: &[u8],
        map: &LineMap,
        requests: &[AnnotationRequest],
        first_page: bool,
    ) -> AnnotatedPage {
        // The total-score badge belongs to the first page only.
        let mut dropped_totals = 0usize;
        let requests = requests
            .iter()
            .filter(|request| {
                if request.kind == MarkKind::PageTotal && !first_page {
                    dropped_totals += 1;
                    warn!("dropping page_total request addressed to a non-first page");
                    return false;
                }
                true
            })
            .cloned()
            .collect::<Vec<_>>();

        let (placed, mut summary) = resolve_page(map, &requests);
        summary.unresolved += dropped_totals;

        let (width, height) = match image_dimensions(image) {
            Ok(dims) => dims,
            Err(err) => {
                warn!("page undecodable at render time: {:#}", err);
                return AnnotatedPage {
                    bytes: image.to_vec(),
                    summary,
                };
            }
        };

        let config = pen::PenConfig {
            margin_ratio: self.settings.margin_ratio,
            comment_max_chars: self.settings.comment_max_chars,
        };
        let mut overlay = pen::OverlayPen::new(
            width,
            height,
            config,
            self.mark_font.clone(),
            SmallRng::from_entropy(),
        );
        for mark in &placed {
            if let Err(err) = overlay.draw(mark) {
                // One bad mark must not take the rest of the page with it.
                warn!("skipping {:?} mark: {:#}", mark.request.kind, err);
            }
        }

        match compose::composite_page(image, &overlay.finish(), Arc::clone(&self.fonts)) {
            Ok(bytes) => AnnotatedPage { bytes, summary },
            Err(err) => {
                warn!("overlay composition failed, returning page unannotated: {:#}", err);
                AnnotatedPage {
                    bytes: image.to_vec(),
                    summary,
                }
            }
        }
    }

    fn language_hints(&self) -> Vec<String> {
        self.settings
            .ocr_languages
            .split(['+', ',', ' '])
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .map(String::from)
            .collect()
    }
}

impl Engine<TesseractWordSource> {
    /// Engine wired to the local tesseract adapter with the settings'
    /// per-call timeout.
    pub fn with_tesseract(settings: Settings, question_numbers: &[u32]) -> Result<Self> {
        let timeout = Duration::from_secs(settings.ocr_timeout_secs);
        Engine::new(TesseractWordSource::new(timeout), settings, question_numbers)
    }
}

fn image_dimensions(image: &[u8]) -> Result<(u32, u32)> {
    let decoded =
        image::load_from_memory(image).with_context(|| "failed to decode page image")?;
    Ok((decoded.width(), decoded.height()))
}
