use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Filter used when neither `RUST_LOG` nor the settings file provide one.
pub const DEFAULT_LOG_FILTER: &str = "heart_rate_monitor=info,warn";

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directives, e.g. `heart_rate_monitor=debug`
    pub filter: String,
    pub console: bool,
    /// File logging is enabled by setting a directory.
    pub log_dir: Option<PathBuf>,
    pub file_name_prefix: String,
    pub rotation: LogRotation,
    pub show_file_line: bool,
    pub show_target: bool,
    pub ansi_colors: bool,
    /// Every decoded measurement at info level; debug otherwise.
    pub log_measurements: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            console: true,
            log_dir: None,
            file_name_prefix: "heart_rate_monitor".to_string(),
            rotation: LogRotation::Daily,
            show_file_line: false,
            show_target: false,
            ansi_colors: true,
            log_measurements: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Connect to the first heart rate advertiser without waiting for a selection.
    #[serde(default)]
    pub auto_connect: bool,

    /// Stop scanning after this many seconds. 0 scans until stopped.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    /// Forget devices not seen for this many seconds. 0 keeps them for the whole scan.
    #[serde(default)]
    pub device_stale_after_secs: u64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_measurement_uuid")]
    pub ble_measurement_char_uuid: String,
    #[serde(default = "default_sensor_location_uuid")]
    pub ble_sensor_location_char_uuid: String,
    #[serde(default = "default_control_point_uuid")]
    pub ble_control_point_char_uuid: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_connect: false,
            scan_timeout_secs: default_scan_timeout_secs(),
            device_stale_after_secs: 0,
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_measurement_char_uuid: default_measurement_uuid(),
            ble_sensor_location_char_uuid: default_sensor_location_uuid(),
            ble_control_point_char_uuid: default_control_point_uuid(),
        }
    }
}

fn default_scan_timeout_secs() -> u64 {
    30
}
fn default_service_uuid() -> String {
    "180D".to_string()
}
fn default_measurement_uuid() -> String {
    "2A37".to_string()
}
fn default_sensor_location_uuid() -> String {
    "2A38".to_string()
}
fn default_control_point_uuid() -> String {
    "2A39".to_string()
}

/// Read-only access to the settings file.
pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is
    /// missing or malformed.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match Self::load_from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                if path.exists() {
                    warn!("Ignoring settings file {}: {}", path.display(), e);
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path: Some(path),
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HeartRateMonitor");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }
}
