//! Clip file names and their human-readable form.
//!
//! Clips are named `YYYYMMDD-HHMMSS.clip` after the local time recording
//! started. The UI shows the same instant as `dd.mm.yyyy - hh:mm:ss`.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;
use thiserror::Error;

use crate::container::CLIP_EXTENSION;

pub const STEM_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const DISPLAY_FORMAT: &str = "%d.%m.%Y - %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("malformed clip timestamp {0:?}")]
    Malformed(String),
}

/// Parse `value` with `format`, insisting the canonical rendering matches so
/// the two directions stay exact inverses.
fn parse_exact(value: &str, format: &str) -> Result<NaiveDateTime, NameError> {
    NaiveDateTime::parse_from_str(value, format)
        .ok()
        .filter(|parsed| parsed.format(format).to_string() == value)
        .ok_or_else(|| NameError::Malformed(value.to_string()))
}

pub fn clip_stem<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(STEM_FORMAT).to_string()
}

/// Stem for a clip starting at `timestamp_ms`, in local time.
pub fn clip_stem_for_millis(timestamp_ms: i64) -> String {
    let at = Local
        .timestamp_millis_opt(timestamp_ms)
        .earliest()
        .unwrap_or_else(Local::now);
    clip_stem(&at)
}

/// `YYYYMMDD-HHMMSS` to `dd.mm.yyyy - hh:mm:ss`.
pub fn format_timestamp(stem: &str) -> Result<String, NameError> {
    Ok(parse_exact(stem, STEM_FORMAT)?.format(DISPLAY_FORMAT).to_string())
}

/// `dd.mm.yyyy - hh:mm:ss` to `YYYYMMDD-HHMMSS`.
pub fn undo_format_timestamp(display: &str) -> Result<String, NameError> {
    Ok(parse_exact(display, DISPLAY_FORMAT)?.format(STEM_FORMAT).to_string())
}

/// Accept either spelling and return the stem.
pub fn resolve_clip_name(name: &str) -> Result<String, NameError> {
    let name = name.trim();
    let name = name
        .strip_suffix(CLIP_EXTENSION)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(name);
    parse_exact(name, STEM_FORMAT)
        .map(|_| name.to_string())
        .or_else(|_| undo_format_timestamp(name))
}

pub fn clip_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.{CLIP_EXTENSION}"))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClipEntry {
    pub stem: String,
    pub display: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Well-formed clips in `dir`, newest first. A missing directory is empty.
pub fn list_clips(dir: &Path) -> io::Result<Vec<ClipEntry>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut clips = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some(CLIP_EXTENSION)
        {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(display) = format_timestamp(stem) {
            clips.push(ClipEntry {
                stem: stem.to_string(),
                display,
                path: path.clone(),
            });
        }
    }

    // Stems sort chronologically as plain strings.
    clips.sort_by(|a, b| b.stem.cmp(&a.stem));
    Ok(clips)
}
