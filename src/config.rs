use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Global configuration loaded from `~/.config/rangefetch/config.toml`.
///
/// Per-call options passed to [`crate::driver::download`] override these
/// field-by-field; this struct only supplies the defaults a caller may omit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    /// Number of parallel segment workers.
    pub threads_count: usize,
    /// Minimum remaining bytes a segment must have on each side of a split.
    pub min_task_length: u64,
    /// Read granularity for the HTTP write callback and merge copy loop.
    pub chunk_size: usize,
    /// Number of retries after the first attempt for HEAD and segment GETs.
    pub retry_times: u32,
    /// Fixed delay between retry attempts, in seconds.
    pub retry_sleep: f64,
    /// Connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Total transfer timeout, in seconds.
    pub total_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            threads_count: 4,
            min_task_length: 1024 * 1024,
            chunk_size: 8192,
            retry_times: 3,
            retry_sleep: 1.0,
            connect_timeout_secs: 15,
            total_timeout_secs: 3600,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("rangefetch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<DownloadConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = DownloadConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: DownloadConfig = toml::from_str(&data)?;
    Ok(cfg)
}
