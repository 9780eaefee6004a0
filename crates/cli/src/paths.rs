//! Central path resolution for genstream data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `GENSTREAM_DATA_DIR` env > `~/.genstream`.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub const DATA_DIR_ENV: &str = "GENSTREAM_DATA_DIR";

/// Priority: `explicit` arg > `GENSTREAM_DATA_DIR` env > `~/.genstream` default.
pub fn resolve_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    resolve_with(explicit, std::env::var(DATA_DIR_ENV).ok(), dirs::home_dir())
}

fn resolve_with(
    explicit: Option<&Path>,
    env_val: Option<String>,
    home: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(env_val) = env_val.filter(|v| !v.trim().is_empty()) {
        return Ok(PathBuf::from(env_val));
    }
    home.map(|h| h.join(".genstream"))
        .context("HOME directory not found; pass --data-dir or set GENSTREAM_DATA_DIR")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs(data_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(log_dir(data_dir))?;
    Ok(())
}
