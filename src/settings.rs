use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub ocr_languages: String,
    pub ocr_timeout_secs: u64,
    pub ink_color: String,
    pub margin_ratio: f32,
    pub comment_max_chars: usize,
    pub font_families: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ocr_languages: "eng".to_string(),
            ocr_timeout_secs: 20,
            ink_color: "red".to_string(),
            margin_ratio: 0.76,
            comment_max_chars: 28,
            font_families: vec![
                "Liberation Sans".to_string(),
                "DejaVu Sans".to_string(),
                "Arial".to_string(),
                "Helvetica".to_string(),
            ],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    ocr: Option<OcrSettings>,
    ink: Option<InkSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct OcrSettings {
    languages: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct InkSettings {
    color: Option<String>,
    margin_ratio: Option<f32>,
    comment_max_chars: Option<usize>,
    font_families: Option<Vec<String>>,
}

/// Layered settings load: compiled defaults, then `settings.toml` and
/// `settings.local.toml` from the working directory and the home config
/// directory, then an explicit extra file. Later files win per field.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings.merge(parsed);
        }
    }

    Ok(settings)
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(ocr) = incoming.ocr {
            if let Some(languages) = ocr.languages
                && !languages.trim().is_empty()
            {
                self.ocr_languages = languages;
            }
            if let Some(timeout) = ocr.timeout_secs
                && timeout > 0
            {
                self.ocr_timeout_secs = timeout;
            }
        }
        if let Some(ink) = incoming.ink {
            if let Some(color) = ink.color
                && !color.trim().is_empty()
            {
                self.ink_color = color;
            }
            if let Some(ratio) = ink.margin_ratio
                && (0.5..1.0).contains(&ratio)
            {
                self.margin_ratio = ratio;
            }
            if let Some(max) = ink.comment_max_chars
                && max > 0
            {
                self.comment_max_chars = max;
            }
            if let Some(families) = ink.font_families
                && !families.is_empty()
            {
                self.font_families = families;
            }
        }
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".exam-marker-rust"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_temp_home;

    #[test]
    fn defaults_apply_without_any_files() {
        with_temp_home(|_| {
            let settings = load_settings(None).expect("load");
            assert_eq!(settings.ink_color, "red");
            assert_eq!(settings.ocr_timeout_secs, 20);
        });
    }

    #[test]
    fn extra_file_overrides_defaults() {
        with_temp_home(|home| {
            let path = home.join("override.toml");
            fs::write(
                &path,
                "[ocr]\nlanguages = \"deu\"\n[ink]\ncolor = \"#004400\"\ncomment_max_chars = 40\n",
            )
            .expect("write");
            let settings = load_settings(Some(&path)).expect("load");
            assert_eq!(settings.ocr_languages, "deu");
            assert_eq!(settings.ink_color, "#004400");
            assert_eq!(settings.comment_max_chars, 40);
            // untouched fields keep their defaults
            assert_eq!(settings.margin_ratio, 0.76);
        });
    }

    #[test]
    fn out_of_range_values_are_ignored() {
        with_temp_home(|home| {
            let path = home.join("override.toml");
            fs::write(&path, "[ink]\nmargin_ratio = 1.4\n[ocr]\ntimeout_secs = 0\n")
                .expect("write");
            let settings = load_settings(Some(&path)).expect("load");
            assert_eq!(settings.margin_ratio, 0.76);
            assert_eq!(settings.ocr_timeout_secs, 20);
        });
    }

    #[test]
    fn missing_extra_file_is_an_error() {
        with_temp_home(|home| {
            let missing = home.join("nope.toml");
            assert!(load_settings(Some(&missing)).is_err());
        });
    }
}
