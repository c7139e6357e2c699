//! Layer-paced timelapse capture.
//!
//! A [`TimelapseSession`] is armed at the start of every work cycle from the
//! user settings file. Each line that starts with a layer marker advances the
//! layer counter; every `frequency`-th marker triggers a capture, either as a
//! plain snapshot or after parking the toolhead at the capture pose.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::TimelapseConfig;

/// Line prefixes that start a new layer.
pub const LAYER_MARKERS: [&str; 4] = [";LAYER", "; layer", "; LAYER", ";AFTER_LAYER_CHANGE"];

/// Slicer header that shares a prefix with the first marker.
const LAYER_COUNT_HEADER: &str = ";LAYER_COUNT:";

pub fn is_layer_marker(line: &str) -> bool {
    if line.starts_with(LAYER_COUNT_HEADER) {
        return false;
    }
    LAYER_MARKERS.iter().any(|marker| line.starts_with(marker))
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read timelapse settings '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse timelapse settings '{path}': {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// User facing timelapse choices.
///
/// ```toml
/// enabled = true
/// position = 1    # 0 = snapshot in place, 1 = park the toolhead first
/// frequency = 2   # capture every 2nd layer
/// frame_rate = 15
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimelapseSettings {
    pub enabled: bool,
    pub position: u8,
    pub frequency: u32,
    pub frame_rate: u32,
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            position: 0,
            frequency: 1,
            frame_rate: 15,
        }
    }
}

#[async_trait]
pub trait TimelapseSettingsSource: Send + Sync {
    async fn load(&self) -> Result<TimelapseSettings, SettingsError>;
}

/// Settings read from a TOML file, re-read on every load.
#[derive(Debug, Clone)]
pub struct FileSettingsSource {
    path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TimelapseSettingsSource for FileSettingsSource {
    async fn load(&self) -> Result<TimelapseSettings, SettingsError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SettingsError::Io {
                path: self.path.clone(),
                source,
            })?;
        toml::from_str(&contents).map_err(|source| SettingsError::Toml {
            path: self.path.clone(),
            source,
        })
    }
}

/// Source used when no settings file is wired in.
#[derive(Debug, Default)]
pub struct DisabledTimelapse;

#[async_trait]
impl TimelapseSettingsSource for DisabledTimelapse {
    async fn load(&self) -> Result<TimelapseSettings, SettingsError> {
        Ok(TimelapseSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Snapshot in place, no motion.
    Simple,
    /// Park the toolhead at the capture pose, snapshot, then return.
    Reposition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelapseSession {
    pub armed: bool,
    pub mode: CaptureMode,
    /// Always at least 1.
    pub frequency: u32,
    pub frame_rate: u32,
    pub layer_count: u64,
    pub camera_available: bool,
}

impl TimelapseSession {
    pub fn disarmed() -> Self {
        Self::from_settings(&TimelapseSettings::default(), false)
    }

    pub fn from_settings(settings: &TimelapseSettings, camera_available: bool) -> Self {
        Self {
            armed: settings.enabled,
            mode: if settings.position == 1 {
                CaptureMode::Reposition
            } else {
                CaptureMode::Simple
            },
            frequency: settings.frequency.max(1),
            frame_rate: settings.frame_rate.max(1),
            layer_count: 0,
            camera_available,
        }
    }

    /// Feed one stream line. Returns true when a frame should be captured
    /// before the line is dispatched.
    pub fn on_line(&mut self, line: &str) -> bool {
        if !self.armed || !is_layer_marker(line) {
            return false;
        }
        self.layer_count += 1;
        if self.layer_count % u64::from(self.frequency) != 0 {
            return false;
        }
        if !self.camera_available {
            tracing::debug!("Layer {}: no camera, capture skipped", self.layer_count);
            return false;
        }
        true
    }

    /// Seconds of video the captured frames will play for.
    pub fn play_seconds(&self) -> u64 {
        self.layer_count / u64::from(self.frequency) / u64::from(self.frame_rate)
    }

    /// `timelapse_<file>_<YYYYmmdd_HHMM>@<Reposition?>@<freq>@<fps>@<playSeconds>@`
    pub fn video_stem(&self, filename: &str, now: DateTime<Local>) -> String {
        let reposition = if self.mode == CaptureMode::Reposition { "True" } else { "False" };
        format!(
            "timelapse_{}_{}@{}@{}@{}@{}@",
            filename,
            now.format("%Y%m%d_%H%M"),
            reposition,
            self.frequency,
            self.frame_rate,
            self.play_seconds()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    Command(String),
    Settle(Duration),
    Capture,
}

/// Ordered side-sequence for a reposition capture starting from `position`
/// (X, Y, Z, E).
pub fn reposition_plan(position: [f64; 4], config: &TimelapseConfig) -> Vec<PlanStep> {
    let [x, y, z, _] = position;
    let cmd = |text: String| PlanStep::Command(text);
    vec![
        cmd("M83".to_string()),
        cmd(format!("G1 E-{}", config.retract_length)),
        cmd("M82".to_string()),
        PlanStep::Settle(Duration::from_millis(config.retract_settle_ms)),
        cmd("G91".to_string()),
        cmd(format!("G1 Z{}", config.lift_height)),
        cmd("G90".to_string()),
        PlanStep::Settle(Duration::from_millis(config.move_settle_ms)),
        cmd(format!(
            "G0 X{} Y{} F{}",
            config.capture_x, config.capture_y, config.travel_feedrate
        )),
        cmd("M400".to_string()),
        PlanStep::Capture,
        cmd("M83".to_string()),
        cmd(format!("G1 E{}", config.unretract_length)),
        cmd("M82".to_string()),
        PlanStep::Settle(Duration::from_millis(config.move_settle_ms)),
        cmd(format!("G1 X{} Y{} Z{} F{}", x, y, z, config.return_feedrate)),
        cmd("G91".to_string()),
        cmd(format!("G1 Z-{}", config.lift_height)),
        cmd("G90".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn armed(frequency: u32, camera_available: bool) -> TimelapseSession {
        TimelapseSession::from_settings(
            &TimelapseSettings {
                enabled: true,
                position: 0,
                frequency,
                frame_rate: 15,
            },
            camera_available,
        )
    }

    #[test]
    fn markers() {
        assert!(is_layer_marker(";LAYER:3"));
        assert!(is_layer_marker("; layer 4, Z = 0.8"));
        assert!(is_layer_marker(";AFTER_LAYER_CHANGE"));
        assert!(!is_layer_marker(";LAYER_COUNT:120"));
        assert!(!is_layer_marker("G1 X1 ;LAYER"));
    }

    #[test]
    fn every_third_marker_fires() {
        let mut session = armed(3, true);
        let fired: Vec<bool> = (0..9).map(|_| session.on_line(";LAYER")).collect();
        assert_eq!(
            fired,
            vec![false, false, true, false, false, true, false, false, true]
        );
        assert!(!session.on_line("G1 X1"));
        assert_eq!(session.layer_count, 9);
    }

    #[test]
    fn missing_camera_still_counts() {
        let mut session = armed(1, false);
        assert!(!session.on_line(";LAYER:1"));
        assert!(!session.on_line(";LAYER:2"));
        assert_eq!(session.layer_count, 2);
    }

    #[test]
    fn disarmed_ignores_markers() {
        let mut session = TimelapseSession::disarmed();
        assert!(!session.on_line(";LAYER:1"));
        assert_eq!(session.layer_count, 0);
    }

    #[test]
    fn zero_frequency_is_clamped() {
        let session = armed(0, true);
        assert_eq!(session.frequency, 1);
    }

    #[test]
    fn video_stem_format() {
        let mut session = armed(2, true);
        session.mode = CaptureMode::Reposition;
        session.layer_count = 120;
        let now = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap();
        assert_eq!(
            session.video_stem("cube.gcode", now),
            "timelapse_cube.gcode_20240305_1407@True@2@15@4@"
        );
    }

    #[test]
    fn reposition_plan_order() {
        let plan = reposition_plan([10.0, 20.0, 1.5, 0.0], &TimelapseConfig::default());
        let capture_at = plan.iter().position(|s| *s == PlanStep::Capture).unwrap();
        assert_eq!(plan[capture_at - 1], PlanStep::Command("M400".to_string()));
        assert_eq!(plan[1], PlanStep::Command("G1 E-4".to_string()));
        assert_eq!(plan[8], PlanStep::Command("G0 X5 Y150 F9000".to_string()));
        assert!(plan.contains(&PlanStep::Command("G1 X10 Y20 Z1.5 F10000".to_string())));
        assert_eq!(plan.last(), Some(&PlanStep::Command("G90".to_string())));
    }

    #[test]
    fn settings_defaults_fill_missing_fields() {
        let settings: TimelapseSettings = toml::from_str("enabled = true").unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.frequency, 1);
        assert_eq!(settings.frame_rate, 15);
    }
}
