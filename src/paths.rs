//! Centralized path resolution for the workq state directory.
//!
//! Everything lives under `$HOME/.workq` unless overridden: `WORKQ_DIR` moves
//! the whole state directory, `WORKQ_DB` and `WORKQ_CONFIG` move single files.

use std::path::PathBuf;

fn home() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".into())
}

/// Resolve the state directory.
/// Checks `WORKQ_DIR` env var, falls back to `$HOME/.workq`.
pub fn state_dir() -> PathBuf {
    std::env::var("WORKQ_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(format!("{}/.workq", home())))
}

/// Resolve the database path.
/// Checks `WORKQ_DB` env var, falls back to `<state dir>/workq.db`.
pub fn db_path() -> String {
    std::env::var("WORKQ_DB")
        .unwrap_or_else(|_| state_dir().join("workq.db").to_string_lossy().into_owned())
}

/// Resolve the config file.
/// Checks `WORKQ_CONFIG` env var, falls back to `<state dir>/config.toml`.
pub fn config_path() -> PathBuf {
    std::env::var("WORKQ_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| state_dir().join("config.toml"))
}

/// Where completion markers are written.
pub fn marker_dir() -> PathBuf {
    state_dir().join("done")
}

pub fn log_path() -> PathBuf {
    state_dir().join("workq.log")
}
