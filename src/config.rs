//! # Host Configuration
//!
//! The host reads a single TOML file. Every section and field is optional;
//! missing values fall back to the defaults below.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [mcu]
//! serial = "/dev/ttyS1"
//!
//! [virtual_sdcard]
//! path = "~/gcodes"
//! chunk_size = 8192
//!
//! [resume]
//! enabled = true
//! checkpoint_interval = 50
//! state_dir = "/var/lib/krusty"
//!
//! [timelapse]
//! settings_path = "/etc/krusty/timelapse.toml"
//! camera_device = "/dev/video0"
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration struct for the job streaming host.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub mcu: McuConfig,
    #[serde(default)]
    pub virtual_sdcard: SdCardConfig,
    #[serde(default)]
    pub resume: ResumeConfig,
    #[serde(default)]
    pub timelapse: TimelapseConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_sdcard.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "virtual_sdcard.chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.resume.enabled && self.resume.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "resume.checkpoint_interval",
                reason: "must be greater than zero when resume is enabled".to_string(),
            });
        }
        Ok(())
    }
}

/// Microcontroller link. Only the serial device name is used here: it
/// identifies the printer the resume record belongs to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McuConfig {
    #[serde(default = "default_serial")]
    pub serial: String,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            serial: default_serial(),
        }
    }
}

/// Print file storage and streaming parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SdCardConfig {
    #[serde(default = "default_sd_path")]
    pub path: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Delay between print completion and clearing the finished file.
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
}

impl SdCardConfig {
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

impl Default for SdCardConfig {
    fn default() -> Self {
        Self {
            path: default_sd_path(),
            chunk_size: default_chunk_size(),
            reset_delay_ms: default_reset_delay_ms(),
        }
    }
}

/// Crash-resume checkpointing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResumeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Used when the snapshot carries no bed target.
    #[serde(default = "default_resume_bed_temp")]
    pub bed_temp: f64,
    /// Used when the snapshot carries no extruder target.
    #[serde(default = "default_resume_hotend_temp")]
    pub hotend_temp: f64,
    #[serde(default = "default_resume_travel_feedrate")]
    pub travel_feedrate: f64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            checkpoint_interval: default_checkpoint_interval(),
            state_dir: default_state_dir(),
            bed_temp: default_resume_bed_temp(),
            hotend_temp: default_resume_hotend_temp(),
            travel_feedrate: default_resume_travel_feedrate(),
        }
    }
}

/// Machine-side timelapse parameters. User facing choices (enable, mode,
/// frequency, frame rate) live in the separate settings file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimelapseConfig {
    #[serde(default = "default_timelapse_settings_path")]
    pub settings_path: PathBuf,
    #[serde(default = "default_camera_device")]
    pub camera_device: PathBuf,
    #[serde(default = "default_capture_command")]
    pub capture_command: String,
    #[serde(default = "default_snapshot_url")]
    pub snapshot_url: String,
    #[serde(default = "default_raw_stream_path")]
    pub raw_stream_path: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_capture_x")]
    pub capture_x: f64,
    #[serde(default = "default_capture_y")]
    pub capture_y: f64,
    #[serde(default = "default_travel_feedrate")]
    pub travel_feedrate: f64,
    #[serde(default = "default_return_feedrate")]
    pub return_feedrate: f64,
    #[serde(default = "default_retract_length")]
    pub retract_length: f64,
    #[serde(default = "default_unretract_length")]
    pub unretract_length: f64,
    #[serde(default = "default_lift_height")]
    pub lift_height: f64,
    #[serde(default = "default_retract_settle_ms")]
    pub retract_settle_ms: u64,
    #[serde(default = "default_move_settle_ms")]
    pub move_settle_ms: u64,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            settings_path: default_timelapse_settings_path(),
            camera_device: default_camera_device(),
            capture_command: default_capture_command(),
            snapshot_url: default_snapshot_url(),
            raw_stream_path: default_raw_stream_path(),
            output_dir: default_output_dir(),
            capture_x: default_capture_x(),
            capture_y: default_capture_y(),
            travel_feedrate: default_travel_feedrate(),
            return_feedrate: default_return_feedrate(),
            retract_length: default_retract_length(),
            unretract_length: default_unretract_length(),
            lift_height: default_lift_height(),
            retract_settle_ms: default_retract_settle_ms(),
            move_settle_ms: default_move_settle_ms(),
        }
    }
}

/// Job start/finish notifications.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub stat_file: Option<PathBuf>,
    #[serde(default)]
    pub log_url: Option<String>,
    #[serde(default)]
    pub printer_index: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl LoggingConfig {
    pub fn max_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_serial() -> String { "/dev/ttyS1".to_string() }
fn default_sd_path() -> PathBuf { PathBuf::from("~/gcodes") }
fn default_chunk_size() -> usize { 8192 }
fn default_reset_delay_ms() -> u64 { 5000 }
fn default_checkpoint_interval() -> u64 { 50 }
fn default_state_dir() -> PathBuf { PathBuf::from("/var/lib/krusty") }
fn default_resume_bed_temp() -> f64 { 60.0 }
fn default_resume_hotend_temp() -> f64 { 200.0 }
fn default_resume_travel_feedrate() -> f64 { 3000.0 }
fn default_timelapse_settings_path() -> PathBuf { PathBuf::from("/etc/krusty/timelapse.toml") }
fn default_camera_device() -> PathBuf { PathBuf::from("/dev/video0") }
fn default_capture_command() -> String { "capture".to_string() }
fn default_snapshot_url() -> String { "http://localhost:8080/?action=snapshot".to_string() }
fn default_raw_stream_path() -> PathBuf { PathBuf::from("/var/lib/krusty/timelapse/frames.264") }
fn default_output_dir() -> PathBuf { PathBuf::from("/var/lib/krusty/timelapse") }
fn default_capture_x() -> f64 { 5.0 }
fn default_capture_y() -> f64 { 150.0 }
fn default_travel_feedrate() -> f64 { 9000.0 }
fn default_return_feedrate() -> f64 { 10000.0 }
fn default_retract_length() -> f64 { 4.0 }
fn default_unretract_length() -> f64 { 3.0 }
fn default_lift_height() -> f64 { 2.0 }
fn default_retract_settle_ms() -> u64 { 800 }
fn default_move_settle_ms() -> u64 { 400 }
fn default_listen() -> String { "0.0.0.0:3000".to_string() }
fn default_log_level() -> String { "info".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
