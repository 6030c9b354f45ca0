use anyhow::{Result, anyhow};
use rand::Rng;

use crate::annotations::{InkColor, MarkKind};
use crate::fonts::{MarkFont, measure_width};
use crate::geometry::{BBox, union_all};
use crate::resolve::PlacedAnnotation;

/// Tick and cross marks stay within this distance of the left page edge so
/// they never sit on top of the answer text.
pub const LEFT_MARGIN_MAX_X: f32 = 35.0;

#[derive(Debug, Clone)]
pub struct PenConfig {
    /// Left edge of the right-hand comment margin as a fraction of width.
    pub margin_ratio: f32,
    /// Margin comments longer than this are truncated with an ellipsis.
    pub comment_max_chars: usize,
}

impl Default for PenConfig {
    fn default() -> Self {
        Self {
            margin_ratio: 0.76,
            comment_max_chars: 28,
        }
    }
}

/// Builds a transparent SVG overlay of pen marks for one page. The RNG
/// drives stroke jitter and is injected so tests can pin exact output while
/// production seeds from entropy.
pub struct OverlayPen<R: Rng> {
    width: f32,
    height: f32,
    config: PenConfig,
    font: Option<MarkFont>,
    rng: R,
    body: String,
}

impl<R: Rng> OverlayPen<R> {
    pub fn new(
        width: u32,
        height: u32,
        config: PenConfig,
        font: Option<MarkFont>,
        rng: R,
    ) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
            config,
            font,
            rng,
            body: String::new(),
        }
    }

    /// Draw one resolved annotation. Errors here abort only this mark; the
    /// caller keeps going with the rest of the page.
    pub fn draw(&mut self, placed: &PlacedAnnotation) -> Result<()> {
        let color = InkColor::parse(placed.request.color.as_deref());
        let scale = placed.request.size.clamp(0.5, 3.0);
        let text = placed.request.text.clone();

        match placed.request.kind {
            MarkKind::Tick => {
                for region in &placed.regions {
                    self.tick(region, color, scale);
                }
            }
            MarkKind::Cross => {
                for region in &placed.regions {
                    self.cross(region, color, scale);
                }
            }
            MarkKind::Underline => {
                for region in &placed.regions {
                    self.underline(region, color, scale);
                }
            }
            MarkKind::Highlight => {
                for region in &placed.regions {
                    self.highlight(region, color, scale);
                }
            }
            MarkKind::Comment => {
                let region = first_region(placed)?;
                self.margin_comment(&region, &text, color, scale);
            }
            MarkKind::PointLabel => {
                let region = first_region(placed)?;
                self.point_label(&region, &text, color, scale);
            }
            MarkKind::CircledScore => {
                let region = first_region(placed)?;
                self.circled_score(&region, &text, color, scale);
            }
            MarkKind::Bracket => {
                let union = union_all(&placed.regions)
                    .ok_or_else(|| anyhow!("bracket mark without a resolved region"))?;
                self.bracket(&union, &text, color, scale);
            }
            MarkKind::PageTotal => {
                self.page_total(&text, color, scale);
            }
        }
        Ok(())
    }

    pub fn finish(self) -> String {
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">{body}</svg>"#,
            w = self.width,
            h = self.height,
            body = self.body
        )
    }

    fn jitter(&mut self, amplitude: f32) -> f32 {
        self.rng.gen_range(-amplitude..=amplitude)
    }

    /// Checkmark in the left margin beside the line, drawn as three
    /// overlapping offset strokes to simulate pen pressure.
    fn tick(&mut self, region: &BBox, color: InkColor, scale: f32) {
        let x = (region.x1 - 30.0).clamp(6.0, LEFT_MARGIN_MAX_X);
        let y = region.center_y();
        let unit = 9.0 * scale;
        for _ in 0..3 {
            let dx = self.jitter(0.9);
            let dy = self.jitter(0.9);
            self.body.push_str(&format!(
                r#"<path d="M {:.1} {:.1} L {:.1} {:.1} L {:.1} {:.1}" fill="none" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.8" stroke-linecap="round" stroke-linejoin="round"/>"#,
                x + dx,
                y + dy,
                x + 0.55 * unit + dx,
                y + 0.8 * unit + dy,
                x + 1.8 * unit + dx,
                y - 1.0 * unit + dy,
                color.hex(),
                2.4 * scale,
            ));
        }
    }

    /// Cross in the left margin, two strokes per diagonal.
    fn cross(&mut self, region: &BBox, color: InkColor, scale: f32) {
        let x = (region.x1 - 30.0).clamp(6.0, LEFT_MARGIN_MAX_X);
        let y = region.center_y();
        let unit = 8.0 * scale;
        for (x1, y1, x2, y2) in [
            (x, y - unit, x + 1.5 * unit, y + unit),
            (x + 1.5 * unit, y - unit, x, y + unit),
        ] {
            for _ in 0..2 {
                let dx = self.jitter(0.9);
                let dy = self.jitter(0.9);
                self.body.push_str(&format!(
                    r#"<path d="M {:.1} {:.1} L {:.1} {:.1}" fill="none" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.8" stroke-linecap="round"/>"#,
                    x1 + dx,
                    y1 + dy,
                    x2 + dx,
                    y2 + dy,
                    color.hex(),
                    2.4 * scale,
                ));
            }
        }
    }

    /// Short connected segments with per-point vertical jitter, then a
    /// second offset pass for thickness; never a perfectly straight line.
    fn underline(&mut self, region: &BBox, color: InkColor, scale: f32) {
        let y = region.y2 + 2.5;
        let segments = ((region.width() / 24.0).ceil() as usize).max(1);
        for pass in 0..2 {
            let offset = pass as f32 * 1.3;
            let mut points = String::new();
            for i in 0..=segments {
                let px = region.x1 + region.width() * (i as f32 / segments as f32);
                let py = y + offset + self.jitter(1.0);
                if i > 0 {
                    points.push(' ');
                }
                points.push_str(&format!("{:.1},{:.1}", px, py));
            }
            self.body.push_str(&format!(
                r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.75" stroke-linecap="round"/>"#,
                points,
                color.hex(),
                1.7 * scale,
            ));
        }
    }

    /// Soft box around the line with a faint ink wash.
    fn highlight(&mut self, region: &BBox, color: InkColor, scale: f32) {
        let dx = self.jitter(0.8);
        let dy = self.jitter(0.8);
        self.body.push_str(&format!(
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" rx="3.5" fill="{}" fill-opacity="0.18" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.65"/>"#,
            region.x1 - 4.0 + dx,
            region.y1 - 3.0 + dy,
            region.width() + 8.0,
            region.height() + 6.0,
            color.hex(),
            color.hex(),
            1.8 * scale,
        ));
    }

    /// Examiner note in the right margin, with a soft background for
    /// legibility; nudged left when it would overflow the page width.
    fn margin_comment(&mut self, region: &BBox, text: &str, color: InkColor, scale: f32) {
        let font_size = 15.0 * scale;
        let text = truncate_comment(text, self.config.comment_max_chars);
        let text_width = measure_width(&text, font_size, self.font.as_ref());
        let pad = 5.0;
        let mut x = self.width * self.config.margin_ratio;
        if x + text_width + pad * 2.0 > self.width {
            x = (self.width - text_width - pad * 2.0).max(2.0);
        }
        let y = region.center_y();
        self.body.push_str(&format!(
            r##"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" rx="4" fill="#ffffff" fill-opacity="0.65"/>"##,
            x - pad,
            y - font_size * 0.75,
            text_width + pad * 2.0,
            font_size * 1.5,
        ));
        let element = self.text_element(x, y + font_size * 0.35, font_size, color, &text, false);
        self.body.push_str(&element);
    }

    /// Small point label ("+2") just past the right end of the line.
    fn point_label(&mut self, region: &BBox, text: &str, color: InkColor, scale: f32) {
        let font_size = 14.0 * scale;
        let text = truncate_comment(text, 8);
        let text_width = measure_width(&text, font_size, self.font.as_ref());
        let x = (region.x2 + 8.0).min(self.width - text_width - 2.0).max(2.0);
        let y = region.center_y() + font_size * 0.35;
        let element = self.text_element(x, y, font_size, color, &text, false);
        self.body.push_str(&element);
    }

    /// Score inside a hand-drawn ellipse, the ellipse sized to the text.
    fn circled_score(&mut self, region: &BBox, text: &str, color: InkColor, scale: f32) {
        let font_size = 18.0 * scale;
        let text_width = measure_width(text, font_size, self.font.as_ref());
        let rx = text_width * 0.5 + 9.0 * scale;
        let ry = font_size * 0.75 + 3.0;
        let cx = (region.x2 + rx + 12.0).min(self.width - rx - 4.0).max(rx + 4.0);
        let cy = region.center_y();
        for _ in 0..2 {
            let dcx = self.jitter(0.8);
            let dcy = self.jitter(0.8);
            let drx = self.jitter(1.2);
            let dry = self.jitter(1.2);
            self.body.push_str(&format!(
                r#"<ellipse cx="{:.1}" cy="{:.1}" rx="{:.1}" ry="{:.1}" fill="none" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.85"/>"#,
                cx + dcx,
                cy + dcy,
                rx + drx,
                ry + dry,
                color.hex(),
                2.0 * scale,
            ));
        }
        let element =
            self.text_element(cx, cy + font_size * 0.35, font_size, color, text, true);
        self.body.push_str(&element);
    }

    /// Vertical bracket in the right margin of the spanned lines, opening
    /// toward the text, with a labelled margin note at its center.
    fn bracket(&mut self, union: &BBox, text: &str, color: InkColor, scale: f32) {
        let x = (union.x2 + 10.0).min(self.width - 8.0);
        let hook = 7.0 * scale;
        for _ in 0..2 {
            let dx = self.jitter(0.8);
            let dy = self.jitter(0.8);
            self.body.push_str(&format!(
                r#"<path d="M {:.1} {:.1} L {:.1} {:.1} L {:.1} {:.1} L {:.1} {:.1}" fill="none" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.8" stroke-linecap="round" stroke-linejoin="round"/>"#,
                x - hook + dx,
                union.y1 + dy,
                x + dx,
                union.y1 + dy,
                x + dx,
                union.y2 + dy,
                x - hook + dx,
                union.y2 + dy,
                color.hex(),
                2.2 * scale,
            ));
        }
        if !text.trim().is_empty() {
            self.margin_comment(union, text, color, scale);
        }
    }

    /// Bordered total-score badge pinned to the top-right corner,
    /// independent of any resolved line.
    fn page_total(&mut self, text: &str, color: InkColor, scale: f32) {
        let font_size = 19.0 * scale;
        let text_width = measure_width(text, font_size, self.font.as_ref());
        let box_w = (text_width + 30.0).max(86.0);
        let box_h = 40.0 + 8.0 * scale;
        let x = (self.width - box_w - 12.0).max(2.0);
        let y = 10.0;
        self.body.push_str(&format!(
            r##"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" rx="5" fill="#fffdf5" fill-opacity="0.85" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.9"/>"##,
            x,
            y,
            box_w,
            box_h,
            color.hex(),
            2.6 * scale,
        ));
        self.body.push_str(&format!(
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" rx="4" fill="none" stroke="{}" stroke-width="{:.1}" stroke-opacity="0.7"/>"#,
            x + 3.0,
            y + 3.0,
            box_w - 6.0,
            box_h - 6.0,
            color.hex(),
            1.2 * scale,
        ));
        let element = self.text_element(
            x + box_w * 0.5,
            y + box_h * 0.5 + font_size * 0.35,
            font_size,
            color,
            text,
            true,
        );
        self.body.push_str(&element);
    }

    fn text_element(
        &self,
        x: f32,
        y: f32,
        font_size: f32,
        color: InkColor,
        text: &str,
        centered: bool,
    ) -> String {
        let anchor = if centered {
            r#" text-anchor="middle""#
        } else {
            ""
        };
        let family = match self.font.as_ref() {
            Some(font) => format!(r#" font-family="{}""#, escape_xml(font.family())),
            None => String::new(),
        };
        format!(
            r#"<text x="{:.1}" y="{:.1}" font-size="{:.1}" fill="{}"{}{}>{}</text>"#,
            x,
            y,
            font_size,
            color.hex(),
            family,
            anchor,
            escape_xml(text),
        )
    }
}

fn first_region(placed: &PlacedAnnotation) -> Result<BBox> {
    placed
        .regions
        .first()
        .copied()
        .ok_or_else(|| anyhow!("{:?} mark without a resolved region", placed.request.kind))
}

fn truncate_comment(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out = trimmed
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
