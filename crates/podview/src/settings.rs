//! Viewer settings
//!
//! Feed list, backend endpoints, and optional timing overrides, persisted as
//! JSON in the user's config directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ViewerError};
use crate::viewer::controller::ControllerConfig;
use crate::viewer::engine::EngineOptions;

/// Directory name under the platform config dir
const APP_DIR: &str = "podview";

/// Settings data file name
const SETTINGS_FILE: &str = "settings.json";

/// Settings file format version for migrations
const SETTINGS_VERSION: u32 = 1;

/// Persisted viewer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// File format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Stream URLs, absolute or relative to `base_url`
    #[serde(default)]
    pub feeds: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Warmup endpoint hit once before the first attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_url: Option<String>,

    /// Relay-status endpoint polled by the health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_status_url: Option<String>,

    #[serde(default)]
    pub timing: TimingOverrides,
}

/// Optional replacements for the built-in timing constants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spinner_reveal_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_probe_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve_delay_ms: Option<u64>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            feeds: Vec::new(),
            base_url: None,
            warmup_url: None,
            relay_status_url: None,
            timing: TimingOverrides::default(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the settings file in the default config directory
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join(APP_DIR).join(SETTINGS_FILE))
            .ok_or_else(|| {
                ViewerError::Config(
                    "Could not determine config directory. HOME environment variable may not be set."
                        .to_string(),
                )
            })
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load settings from `path`. A missing or empty file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(ViewerError::Config(format!(
                    "Permission denied: cannot read {path:?}"
                )))
            }
            Err(e) => {
                return Err(ViewerError::Config(format!("Failed to read {path:?}: {e}")))
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| ViewerError::Config(format!("Failed to parse {path:?}: {e}")))
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    /// Save settings to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ViewerError::Config(format!("Failed to create directory {parent:?}: {e}"))
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .map_err(|e| ViewerError::Config(format!("Failed to write to {path:?}: {e}")))
    }

    /// Controller configuration with overrides applied
    pub fn controller_config(&self) -> ControllerConfig {
        let mut cfg = ControllerConfig {
            warmup_url: self.warmup_url.clone(),
            relay_status_url: self.relay_status_url.clone(),
            ..ControllerConfig::default()
        };
        let t = &self.timing;
        let ms = Duration::from_millis;
        // Zero would make a recurring timer due again on the tick that re-arms it
        let interval = |v: u64| Duration::from_millis(v.max(1));
        if let Some(v) = t.load_timeout_ms {
            cfg.load_timeout = interval(v);
        }
        if let Some(v) = t.spinner_reveal_ms {
            cfg.spinner_reveal = ms(v);
        }
        if let Some(v) = t.max_retries {
            cfg.retry.max_retries = v;
        }
        if let Some(v) = t.initial_delay_ms {
            cfg.retry.initial_delay = ms(v);
        }
        if let Some(v) = t.backoff_factor {
            cfg.retry.factor = v.max(1.0);
        }
        if let Some(v) = t.max_delay_ms {
            cfg.retry.max_delay = ms(v);
        }
        if let Some(v) = t.stall_probe_ms {
            cfg.stall_probe_interval = interval(v);
        }
        if let Some(v) = t.health_check_ms {
            cfg.health_check_interval = interval(v);
        }
        cfg
    }

    /// Engine options for the configured feeds
    pub fn engine_options(&self) -> EngineOptions {
        let mut options = EngineOptions::new(self.feeds.clone());
        options.controller = self.controller_config();
        options.base_url = self.base_url.clone();
        if let Some(v) = self.timing.sweep_ms {
            options.sweep_interval = Duration::from_millis(v.max(1));
        }
        if let Some(v) = self.timing.cache_duration_ms {
            options.cache.cache_duration = Duration::from_millis(v);
        }
        if let Some(v) = self.timing.serve_delay_ms {
            options.cache.serve_delay = Duration::from_millis(v);
        }
        options
    }
}
