use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

/// Alpha-composite the finished overlay over the base page image and
/// flatten to an opaque encoding in the input's raster format. Pure
/// function of (base image, overlay); the caller handles fallback when the
/// whole composition fails.
pub fn composite_page(
    base: &[u8],
    overlay_svg: &str,
    fonts: Arc<fontdb::Database>,
) -> Result<Vec<u8>> {
    let format = image::guess_format(base).unwrap_or(ImageFormat::Png);
    let decoded = image::load_from_memory(base).with_context(|| "failed to decode page image")?;
    let mut page = decoded.to_rgba8();

    let overlay = rasterize_overlay(overlay_svg, fonts)?;
    image::imageops::overlay(&mut page, &overlay, 0, 0);

    encode_opaque(page, format)
}

fn rasterize_overlay(svg: &str, fonts: Arc<fontdb::Database>) -> Result<RgbaImage> {
    let options = Options {
        fontdb: fonts,
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse overlay SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap = Pixmap::new(size.width(), size.height())
        .ok_or_else(|| anyhow!("empty overlay size"))?;
    let mut pixmap_mut = pixmap.as_mut();
    resvg::render(&tree, tiny_skia::Transform::identity(), &mut pixmap_mut);
    RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("failed to build image buffer from overlay"))
}

fn encode_opaque(page: RgbaImage, format: ImageFormat) -> Result<Vec<u8>> {
    let flattened = DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(page).to_rgb8());
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    flattened
        .write_to(&mut cursor, format)
        .with_context(|| format!("failed to encode annotated page as {:?}", format))?;
    Ok(bytes)
}
