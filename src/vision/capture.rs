//! Diagnostic screenshot storage
//!
//! Frames land in `<root>/<YYYY-MM-DD>/<device>/<HHMMSS_mmm>_<label>.png`, so no two
//! sessions ever write the same path. Each directory also gets an
//! `index.jsonl` with one line per screenshot.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::navigation::LogicalScreen;

/// Name of the per-directory screenshot index
pub const INDEX_FILE: &str = "index.jsonl";

/// One line of `index.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRecord {
    pub timestamp: DateTime<Local>,
    pub device: String,
    pub label: String,
    pub screen: LogicalScreen,
    pub file: String,
}

/// Per-device screenshot writer
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    root: Option<PathBuf>,
    device: String,
}

impl ScreenshotStore {
    /// Store under `root`
    pub fn new(root: impl Into<PathBuf>, device: impl Into<String>) -> Self {
        Self {
            root: Some(root.into()),
            device: device.into(),
        }
    }

    /// A store that drops every frame
    pub fn disabled(device: impl Into<String>) -> Self {
        Self {
            root: None,
            device: device.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Directory for frames taken at `at`
    pub fn dir_for(&self, at: &DateTime<Local>) -> Option<PathBuf> {
        self.root.as_ref().map(|root| {
            root.join(at.format("%Y-%m-%d").to_string())
                .join(sanitize(&self.device))
        })
    }

    /// Write `frame` and append it to the index. Returns `None` when disabled.
    pub fn save(
        &self,
        frame: &DynamicImage,
        label: &str,
        screen: LogicalScreen,
    ) -> Result<Option<PathBuf>> {
        let now = Local::now();
        let Some(dir) = self.dir_for(&now) else {
            return Ok(None);
        };
        fs::create_dir_all(&dir)?;

        let stem = format!("{}_{}", now.format("%H%M%S_%3f"), sanitize(label));
        let path = unique_path(&dir, &stem);
        frame.save(&path)?;

        let record = ScreenshotRecord {
            timestamp: now,
            device: self.device.clone(),
            label: label.to_string(),
            screen,
            file: path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        append_index(&dir, &record)?;

        log::debug!("Saved screenshot {}", path.display());
        Ok(Some(path))
    }
}

/// Read every record of an `index.jsonl`
pub fn read_index(dir: &Path) -> Result<Vec<ScreenshotRecord>> {
    let text = fs::read_to_string(dir.join(INDEX_FILE))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

fn append_index(dir: &Path, record: &ScreenshotRecord) -> Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(INDEX_FILE))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.png"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}.png")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "frame".to_string()
    } else {
        cleaned
    }
}
