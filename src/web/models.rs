//! Contains the data models for API requests and responses.

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogEntry;
use crate::print_job::{JobState, StatusSnapshot};
use crate::print_stats::PrintStatsStatus;

/// Current print job as seen by front ends.
#[derive(Serialize)]
pub struct JobStatusResponse {
    pub job: JobState,
    pub status: StatusSnapshot,
    pub print_stats: PrintStatsStatus,
}

/// One printable file.
#[derive(Serialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

impl From<CatalogEntry> for FileEntry {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            path: entry.path,
            size: entry.size,
        }
    }
}

#[derive(Deserialize)]
pub struct FileListQuery {
    #[serde(default)]
    pub recursive: bool,
}

/// Represents a request to execute a G-code command.
#[derive(Deserialize)]
pub struct GcodeCommandRequest {
    pub command: String,
}

/// Response lines produced by a command.
#[derive(Serialize)]
pub struct GcodeCommandResponse {
    pub responses: Vec<String>,
}

/// Failure of a dispatched command.
#[derive(Serialize)]
pub struct CommandErrorResponse {
    pub error: String,
}
