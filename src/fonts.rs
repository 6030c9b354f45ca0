use std::sync::Arc;
use tracing::debug;
use ttf_parser::{Face, name_id};
use usvg::fontdb;

/// Metrics for the font used by text-bearing marks (comments, scores,
/// badges). Resolved once per engine from an ordered fallback family list.
#[derive(Clone)]
pub struct MarkFont {
    data: Arc<Vec<u8>>,
    units_per_em: u16,
    space_advance: u16,
    family: String,
    face_index: u32,
}

impl MarkFont {
    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Try each family in order against the font database; `None` when nothing
/// resolves (marks then draw geometry only and let the SVG renderer pick a
/// default face for text).
pub fn resolve_mark_font(db: &fontdb::Database, families: &[String]) -> Option<MarkFont> {
    for family in families {
        if let Some(font) = load_family(db, family) {
            debug!("mark font resolved to '{}'", font.family);
            return Some(font);
        }
    }
    debug!("no mark font resolved from fallback list");
    None
}

fn load_family(db: &fontdb::Database, family: &str) -> Option<MarkFont> {
    let query = fontdb::Query {
        families: &[fontdb::Family::Name(family)],
        ..Default::default()
    };
    let id = db.query(&query)?;
    let (data, face_index) = db.with_face_data(id, |data, index| (data.to_vec(), index))?;
    let face = Face::parse(&data, face_index).ok()?;
    let units_per_em = face.units_per_em().max(1);
    let space_advance = face
        .glyph_index(' ')
        .and_then(|id| face.glyph_hor_advance(id))
        .unwrap_or(units_per_em / 2);
    let family = extract_family_name(&face).unwrap_or_else(|| family.to_string());
    Some(MarkFont {
        data: Arc::new(data),
        units_per_em,
        space_advance,
        family,
        face_index,
    })
}

/// Pixel width of a text run at the given size, via glyph advances when a
/// font is available, else a per-character estimate.
pub fn measure_width(text: &str, font_size: f32, font: Option<&MarkFont>) -> f32 {
    if let Some(font) = font
        && let Ok(face) = Face::parse(&font.data, font.face_index)
    {
        let mut advance = 0u32;
        for ch in text.chars() {
            if ch == '\n' {
                continue;
            }
            let glyph_advance = face
                .glyph_index(ch)
                .and_then(|glyph| face.glyph_hor_advance(glyph))
                .unwrap_or(font.space_advance);
            advance = advance.saturating_add(glyph_advance as u32);
        }
        let units = font.units_per_em.max(1) as f32;
        return advance as f32 * (font_size / units);
    }
    estimate_width_units(text) * font_size
}

fn estimate_width_units(text: &str) -> f32 {
    text.chars()
        .map(|ch| {
            if ch.is_whitespace() {
                0.25
            } else if ch.is_ascii_alphanumeric() {
                0.55
            } else if ch.is_ascii() {
                0.35
            } else {
                0.9
            }
        })
        .sum()
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
