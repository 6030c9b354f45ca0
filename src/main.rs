use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::Serialize;

use exam_marker_rust::{AnnotationRequest, Engine, load_settings, logging};

#[derive(Parser, Debug)]
#[command(
    name = "exam-marker-rust",
    version,
    about = "Overlay examiner-style pen marks onto scanned exam pages"
)]
struct Cli {
    /// Page image(s), in page order (repeat for multi-page submissions)
    #[arg(short = 'i', long = "image", required = true)]
    images: Vec<PathBuf>,

    /// JSON file with the grading pass's annotation requests
    #[arg(short = 'a', long = "requests")]
    requests: Option<PathBuf>,

    /// Comma-separated question numbers of the exam (e.g. "1,2,3")
    #[arg(short = 'q', long = "questions", default_value = "1")]
    questions: String,

    /// Output file (single page) or directory (multiple pages)
    #[arg(short = 'o', long = "out")]
    out: Option<PathBuf>,

    /// Print each page's line map as JSON and exit (for the grading pass)
    #[arg(long = "dump-lines")]
    dump_lines: bool,

    /// Override OCR languages, e.g. "eng+deu"
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Serialize)]
struct PageDump<'a> {
    page: usize,
    carry_out: u32,
    lines: &'a [exam_marker_rust::Line],
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let mut settings = load_settings(cli.read_settings.as_deref())?;
    if let Some(lang) = cli.lang.as_deref() {
        settings.ocr_languages = lang.to_string();
    }

    let questions = parse_questions(&cli.questions)?;
    let engine = Engine::with_tesseract(settings, &questions)?;

    let mut pages = Vec::with_capacity(cli.images.len());
    for path in &cli.images {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read image: {}", path.display()))?;
        pages.push(bytes);
    }

    if cli.dump_lines {
        return dump_lines(&engine, &pages).await;
    }

    let requests_path = cli
        .requests
        .as_deref()
        .ok_or_else(|| anyhow!("--requests is required unless --dump-lines is set"))?;
    let requests = read_requests(requests_path)?;

    let annotated = engine.render_submission(&pages, &requests).await;
    for (index, page) in annotated.iter().enumerate() {
        println!(
            "page {}: {} resolved, {} partial, {} unresolved",
            index, page.summary.resolved, page.summary.partial, page.summary.unresolved
        );
    }
    write_outputs(&cli.images, &annotated, cli.out.as_deref())
}

async fn dump_lines(
    engine: &Engine<exam_marker_rust::TesseractWordSource>,
    pages: &[Vec<u8>],
) -> Result<()> {
    let mut carry = None;
    let mut dumps = Vec::with_capacity(pages.len());
    let mut maps = Vec::with_capacity(pages.len());
    for page in pages {
        let map = engine.line_map(page, carry).await?;
        carry = Some(map.carry_out());
        maps.push(map);
    }
    for (index, map) in maps.iter().enumerate() {
        dumps.push(PageDump {
            page: index,
            carry_out: map.carry_out(),
            lines: map.lines(),
        });
    }
    println!("{}", serde_json::to_string_pretty(&dumps)?);
    Ok(())
}

fn parse_questions(value: &str) -> Result<Vec<u32>> {
    let mut numbers = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let number = part
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid question number '{}'", part))?;
        numbers.push(number);
    }
    if numbers.is_empty() {
        return Err(anyhow!("question set is empty"));
    }
    Ok(numbers)
}

fn read_requests(path: &Path) -> Result<Vec<AnnotationRequest>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read requests: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse requests: {}", path.display()))
}

fn write_outputs(
    images: &[PathBuf],
    annotated: &[exam_marker_rust::AnnotatedPage],
    out: Option<&Path>,
) -> Result<()> {
    if images.len() == 1 {
        let target = match out {
            Some(path) if path.is_dir() => path.join(output_name(&images[0], 0)),
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(output_name(&images[0], 0)),
        };
        fs::write(&target, &annotated[0].bytes)
            .with_context(|| format!("failed to write output: {}", target.display()))?;
        println!("wrote {}", target.display());
        return Ok(());
    }

    let dir = out.unwrap_or_else(|| Path::new("annotated"));
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
    for (index, (image, page)) in images.iter().zip(annotated).enumerate() {
        let target = dir.join(output_name(image, index));
        fs::write(&target, &page.bytes)
            .with_context(|| format!("failed to write output: {}", target.display()))?;
        println!("wrote {}", target.display());
    }
    Ok(())
}

fn output_name(image: &Path, index: usize) -> String {
    let stem = image
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("page");
    let ext = image
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or("png");
    format!("{}-marked-{}.{}", stem, index, ext)
}
