//! Crash-resume records.
//!
//! While a print runs the controller periodically stores the byte offset of
//! the next line together with a machine snapshot. After a restart the record
//! is read back when the same file is started again; the job then re-heats,
//! restores the toolhead and continues from the stored offset.
//!
//! Records are written atomically (temp file + rename) so a crash mid-write
//! never leaves a torn record behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

use crate::config::ResumeConfig;
use crate::machine::MachineSnapshot;

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed resume record '{path}': {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize resume record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to replace resume record: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("Resume writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a record must match to be applied to an opened file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified: Option<u64>,
}

impl FileIdentity {
    pub fn new(path: PathBuf, size: u64, modified: Option<SystemTime>) -> Self {
        Self {
            path,
            size,
            modified: modified
                .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub link: String,
    pub file: FileIdentity,
    pub file_position: u64,
    pub snapshot: MachineSnapshot,
    pub saved_at: DateTime<Utc>,
}

impl PersistedRecord {
    /// A record applies only to the exact file it was written for, at a
    /// position inside that file.
    pub fn applies_to(&self, link: &str, file: &FileIdentity) -> bool {
        self.link == link && &self.file == file && self.file_position <= file.size
    }
}

/// The hardware link identity: last component of the MCU serial device path.
pub fn link_identity(serial: &str) -> String {
    serial
        .rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or("mcu")
        .to_string()
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
    link: String,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>, link: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            link: link.into(),
        }
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(format!("{}_job_state.json", self.link))
    }

    pub async fn load(&self) -> Result<Option<PersistedRecord>, ResumeError> {
        let path = self.record_path();
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ResumeError::Io { path, source }),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| ResumeError::Json { path, source })
    }

    /// Replace the stored record. The write happens on the blocking pool.
    pub async fn save(&self, record: &PersistedRecord) -> Result<(), ResumeError> {
        let bytes = serde_json::to_vec(record)?;
        let dir = self.dir.clone();
        let path = self.record_path();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &bytes)).await?
    }

    pub async fn remove(&self) -> Result<(), ResumeError> {
        let path = self.record_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ResumeError::Io { path, source }),
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), ResumeError> {
    let io_err = |source| ResumeError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path)?;
    Ok(())
}

/// Bounded re-heat and toolhead restore sequence run before continuing from
/// a record.
pub fn restore_commands(snapshot: &MachineSnapshot, config: &ResumeConfig) -> Vec<String> {
    let bed = if snapshot.bed_target > 0.0 { snapshot.bed_target } else { config.bed_temp };
    let hotend = if snapshot.extruder_target > 0.0 {
        snapshot.extruder_target
    } else {
        config.hotend_temp
    };
    let [x, y, z, e] = snapshot.position;
    vec![
        format!("M140 S{}", bed),
        format!("M109 S{}", hotend),
        format!("G92 Z{:.3}", z),
        "G28 X Y".to_string(),
        "G90".to_string(),
        format!("G1 X{:.3} Y{:.3} F{}", x, y, config.travel_feedrate),
        format!("G92 E{:.5}", e),
        if snapshot.absolute_extrude { "M82" } else { "M83" }.to_string(),
        if snapshot.absolute_coordinates { "G90" } else { "G91" }.to_string(),
        format!("G1 F{}", snapshot.feedrate),
    ]
}
