//! Agent-wide configuration.
//!
//! One module owning where paths and defaults come from. Nothing here
//! persists across restarts except the download directory itself.

use std::path::PathBuf;
use std::time::Duration;

use crate::peers::DEFAULT_TIMEOUT;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub alias: String,
    pub device_model: Option<String>,
    /// 0 means OS-chosen.
    pub http_port: u16,
    pub download_dir: PathBuf,
    pub peer_timeout: Duration,
    pub downloadable: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            alias: whoami_alias(),
            device_model: Some(default_device_model()),
            http_port: 0,
            download_dir: PathBuf::from("./downloads_localsend"),
            peer_timeout: DEFAULT_TIMEOUT,
            downloadable: true,
        }
    }
}

fn whoami_alias() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "lansend-agent".to_string())
}

/// Falls back to the compiled-in OS name when nothing more specific (a
/// real device model string) is available.
pub fn default_device_model() -> String {
    match std::env::consts::OS {
        "macos" => "macOS".to_string(),
        "linux" => "Linux".to_string(),
        "windows" => "Windows".to_string(),
        other => other.to_string(),
    }
}
