use crate::domain::device::KnownDevice;
use crate::domain::models::DeviceId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Bounded reconnection after an unexpected link loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_delay_ms: default_reconnect_base_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Pairing
    #[serde(default)]
    pub paired_device_id: Option<DeviceId>,
    #[serde(default)]
    pub known_devices: Vec<KnownDevice>,
    #[serde(default = "default_device_name")]
    pub expected_device_name: String,

    // Transfer tuning
    #[serde(default = "default_blefs_chunk_size")]
    pub blefs_chunk_size: u32,
    #[serde(default = "default_dfu_packets_per_receipt")]
    pub dfu_packets_per_receipt: u8,

    // Connection
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            paired_device_id: None,
            known_devices: Vec::new(),
            expected_device_name: default_device_name(),
            blefs_chunk_size: default_blefs_chunk_size(),
            dfu_packets_per_receipt: default_dfu_packets_per_receipt(),
            reconnect: ReconnectSettings::default(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "infinilink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_device_name() -> String {
    crate::infrastructure::bluetooth::protocol::DEVICE_NAME.to_string()
}
fn default_blefs_chunk_size() -> u32 {
    200
}
fn default_dfu_packets_per_receipt() -> u8 {
    10
}
fn default_reconnect_attempts() -> u32 {
    10
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}
fn default_scan_timeout_secs() -> u64 {
    10
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Self::with_path(settings_path)
    }

    /// Loads from `path`, falling back to defaults when the file is missing or unreadable.
    pub fn with_path(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = path.into();
        if let Some(parent) = settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    tracing::warn!("Ignoring unreadable settings file: {}", e);
                }
                Settings::default()
            }
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("InfiniLink");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_paired_device(&mut self, id: Option<DeviceId>) -> anyhow::Result<()> {
        if self.settings.paired_device_id != id {
            self.settings.paired_device_id = id;
            self.save()?;
        }
        Ok(())
    }

    pub fn add_known_device(&mut self, device: KnownDevice) -> anyhow::Result<()> {
        if !self.settings.known_devices.iter().any(|d| d.id == device.id) {
            self.settings.known_devices.push(device);
            self.save()?;
        }
        Ok(())
    }

    pub fn remove_known_device(&mut self, id: &DeviceId) -> anyhow::Result<()> {
        let before = self.settings.known_devices.len();
        self.settings.known_devices.retain(|d| &d.id != id);
        if self.settings.known_devices.len() != before {
            self.save()?;
        }
        Ok(())
    }
}
