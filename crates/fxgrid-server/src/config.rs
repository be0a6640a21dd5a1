//! Server configuration
//!
//! Persisted as JSON. Every field has a default, so partial files and a
//! missing file both load.

use fxgrid_protocol::{Result, DEFAULT_SERVER_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenEncoder {
    WebP,
    Ffmpeg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderQuality {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,

    pub enable_au: bool,
    pub enable_vst3: bool,
    pub enable_vst2: bool,
    pub vst3_folders: Vec<PathBuf>,
    pub vst2_folders: Vec<PathBuf>,
    /// Search only the configured folders.
    pub vst_no_standard_folders: bool,

    pub screen_quality: f32,
    pub screen_diff_detection: bool,
    pub screen_capturing_ffmpeg: bool,
    pub screen_capturing_off: bool,
    pub screen_local_mode: bool,
    pub screen_encoder: ScreenEncoder,
    pub screen_encoder_quality: EncoderQuality,
    pub plugin_windows_on_top: bool,

    pub scan_for_plugins: bool,
    pub parallel_plugin_load: bool,
    pub sandboxing: bool,
    pub crash_reporting: bool,

    pub recents_max: usize,
    /// Read timeout of an idle session; pending chain edits run at this pace.
    pub idle_poll_ms: u64,
    pub handshake_timeout_ms: u64,
    pub sandbox_connect_timeout_ms: u64,
    pub sandbox_accept_timeout_ms: u64,
    pub reap_interval_ms: u64,
    /// Scan each plugin in a throwaway child process.
    pub scan_isolated: bool,
    /// Failed scans before a plugin is excluded.
    pub scan_failure_threshold: u32,
    pub catalog_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            enable_au: cfg!(target_os = "macos"),
            enable_vst3: true,
            enable_vst2: true,
            vst3_folders: Vec::new(),
            vst2_folders: Vec::new(),
            vst_no_standard_folders: false,
            screen_quality: 0.9,
            screen_diff_detection: true,
            screen_capturing_ffmpeg: true,
            screen_capturing_off: false,
            screen_local_mode: false,
            screen_encoder: ScreenEncoder::WebP,
            screen_encoder_quality: EncoderQuality::Medium,
            plugin_windows_on_top: false,
            scan_for_plugins: true,
            parallel_plugin_load: false,
            sandboxing: false,
            crash_reporting: true,
            recents_max: 10,
            idle_poll_ms: 10,
            handshake_timeout_ms: 5000,
            sandbox_connect_timeout_ms: 10_000,
            sandbox_accept_timeout_ms: 30_000,
            reap_interval_ms: 1000,
            scan_isolated: true,
            scan_failure_threshold: 2,
            catalog_file: None,
        }
    }
}

impl ServerConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }

    pub fn sandbox_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_connect_timeout_ms)
    }

    pub fn sandbox_accept_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_accept_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
