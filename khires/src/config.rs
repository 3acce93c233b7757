use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::calibrate::DEFAULT_CALIBRATION_MS;

const DEFAULT_CONFIG_PATH: &str = "/etc/khires/khires.toml";
const ENV_CONFIG_PATH: &str = "KHIRES_CONFIG";

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Where the control socket is bound.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Log2 of the ring capacity in entries.
    #[serde(default = "default_rb_size_log2")]
    pub rb_size_log2: u32,
    /// Calibration measurement interval in milliseconds.
    #[serde(default = "default_calibration_ms")]
    pub calibration_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            rb_size_log2: default_rb_size_log2(),
            calibration_ms: default_calibration_ms(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(hires_common::DEFAULT_SOCKET_PATH)
}

fn default_rb_size_log2() -> u32 {
    hires_common::DEFAULT_RB_SIZE_LOG2
}

fn default_calibration_ms() -> u64 {
    DEFAULT_CALIBRATION_MS
}

impl Config {
    /// Load configuration from `path` if given, else from `KHIRES_CONFIG`,
    /// else from the default location. A missing or unparsable file yields
    /// defaults with a warning.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!(
                        "Failed to parse config file at {}: {}. Using defaults.",
                        path.display(),
                        e
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}
