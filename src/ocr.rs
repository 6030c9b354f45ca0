use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::geometry::BBox;

/// One recognized word on a page, in image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub bbox: BBox,
}

pub type WordsFuture = Pin<Box<dyn Future<Output = Vec<Word>> + Send>>;

/// Adapter over an external OCR provider. Implementations return an empty
/// word list on provider failure; a blank or unreadable page is a legitimate
/// degraded state, not an error.
pub trait WordSource: Send + Sync {
    fn detect_words(&self, image: &[u8], language_hints: &[String]) -> WordsFuture;
}

/// Word source backed by a local tesseract binary. Fixed `--oem`/`--psm`/
/// `--dpi` flags keep the output stable for identical input images.
#[derive(Debug, Clone)]
pub struct TesseractWordSource {
    timeout: Duration,
}

impl TesseractWordSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl WordSource for TesseractWordSource {
    fn detect_words(&self, image: &[u8], language_hints: &[String]) -> WordsFuture {
        let image = image.to_vec();
        let languages = join_languages(language_hints);
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, run_tesseract(&image, &languages)).await {
                Ok(Ok(words)) => words,
                Ok(Err(err)) => {
                    warn!("ocr failed, degrading to zero words: {:#}", err);
                    Vec::new()
                }
                Err(_) => {
                    warn!("ocr timed out after {:?}, degrading to zero words", timeout);
                    Vec::new()
                }
            }
        })
    }
}

async fn run_tesseract(image: &[u8], languages: &str) -> Result<Vec<Word>> {
    let decoded =
        image::load_from_memory(image).with_context(|| "failed to decode image for OCR")?;
    let mut tmp = tempfile::Builder::new()
        .suffix(".png")
        .tempfile()
        .with_context(|| "failed to create temp file for OCR")?;
    decoded
        .write_to(&mut tmp, image::ImageFormat::Png)
        .with_context(|| "failed to write temp image for OCR")?;
    tmp.flush().ok();

    let output = Command::new("tesseract")
        .arg(tmp.path())
        .arg("stdout")
        .arg("-l")
        .arg(languages)
        .arg("--oem")
        .arg("1")
        .arg("--psm")
        .arg("6")
        .arg("--dpi")
        .arg("300")
        .arg("tsv")
        .output()
        .await
        .with_context(|| "failed to run tesseract (is it installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract failed: {}", stderr.trim()));
    }
    let tsv = String::from_utf8_lossy(&output.stdout);
    let words = parse_tsv_words(&tsv);
    debug!("ocr detected {} words", words.len());
    Ok(words)
}

/// Parse tesseract TSV output, keeping only level-5 (word) rows with a real
/// confidence value and non-empty text.
pub(crate) fn parse_tsv_words(tsv: &str) -> Vec<Word> {
    let mut words = Vec::new();
    for (idx, row) in tsv.lines().enumerate() {
        if idx == 0 {
            continue;
        }
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 {
            continue;
        }
        let level: i32 = cols[0].parse().unwrap_or(0);
        if level != 5 {
            continue;
        }
        let left: f32 = cols[6].parse().unwrap_or(0.0);
        let top: f32 = cols[7].parse().unwrap_or(0.0);
        let width: f32 = cols[8].parse().unwrap_or(0.0);
        let height: f32 = cols[9].parse().unwrap_or(0.0);
        let conf: f32 = cols[10].parse().unwrap_or(-1.0);
        let text = cols[11].trim();
        if text.is_empty() || conf < 0.0 || width <= 0.0 || height <= 0.0 {
            continue;
        }
        words.push(Word {
            text: text.to_string(),
            bbox: BBox::new(left, top, left + width, top + height),
        });
    }
    words
}

fn join_languages(hints: &[String]) -> String {
    let chosen = hints
        .iter()
        .map(|lang| lang.trim())
        .filter(|lang| !lang.is_empty())
        .collect::<Vec<_>>();
    if chosen.is_empty() {
        "eng".to_string()
    } else {
        chosen.join("+")
    }
}
