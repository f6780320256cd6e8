//! Persistent player settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wavstream_core::{ChunkSize, MAX_CHANNELS};

const MIN_POOL_BYTES: usize = 64 * 1024;
const MAX_POOL_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Refill chunk length in seconds. Negative keeps the whole file resident.
    pub chunk_seconds: f64,
    pub channel: usize,
    pub loop_playback: bool,
    pub poll_interval_ms: u64,
    pub pool_capacity_bytes: usize,
    /// `"device"` renders through the default output device, `"null"`
    /// through a silent wall-clock driver.
    pub output: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            chunk_seconds: 2.0,
            channel: 0,
            loop_playback: false,
            poll_interval_ms: 1,
            pool_capacity_bytes: 32 * 1024 * 1024,
            output: "device".into(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        if !self.chunk_seconds.is_finite() || self.chunk_seconds == 0.0 {
            self.chunk_seconds = AppSettings::default().chunk_seconds;
        }
        if self.chunk_seconds > 0.0 {
            self.chunk_seconds = self.chunk_seconds.clamp(0.01, 60.0);
        }
        self.channel = self.channel.min(MAX_CHANNELS - 1);
        self.poll_interval_ms = self.poll_interval_ms.clamp(1, 100);
        self.pool_capacity_bytes = self.pool_capacity_bytes.clamp(MIN_POOL_BYTES, MAX_POOL_BYTES);
        self.output = normalize_output(&self.output);
    }

    pub fn chunk_size(&self) -> ChunkSize {
        ChunkSize::from_seconds(self.chunk_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn null_output(&self) -> bool {
        self.output == "null"
    }
}

pub fn normalize_output(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "null" | "none" | "silent" => "null".into(),
        _ => "device".into(),
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("wavstream")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("wavstream")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
