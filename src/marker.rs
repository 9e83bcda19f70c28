//! Write-once completion markers: `<dir>/<id>.done`, one per terminal item.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::Result;
use crate::model::Status;

pub const MARKER_EXT: &str = "done";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub status: Status,
    pub at: DateTime<Utc>,
}

pub fn marker_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.{MARKER_EXT}"))
}

/// Write the marker for `id` unless one exists. Returns true if this call
/// wrote it. The file appears atomically: readers never see partial JSON.
pub fn write_once(dir: &Path, id: &str, status: Status) -> Result<bool> {
    std::fs::create_dir_all(dir)?;
    let path = marker_path(dir, id);
    if path.exists() {
        return Ok(false);
    }
    let marker = Marker {
        id: id.to_string(),
        status,
        at: Utc::now(),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&serde_json::to_vec(&marker)?)?;
    tmp.write_all(b"\n")?;
    match tmp.persist_noclobber(&path) {
        Ok(_) => Ok(true),
        // Lost a race with another writer for the same id.
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error.into()),
    }
}

pub fn read(dir: &Path, id: &str) -> Result<Option<Marker>> {
    match std::fs::read_to_string(marker_path(dir, id)) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
