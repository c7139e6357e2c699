//! Errors surfaced by job operations and the reply format used on the
//! command surface.

use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("SD busy")]
    Busy,
    #[error("Unable to open file")]
    FileNotFound(String),
    #[error("Unable to open file")]
    OpenFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to get file list")]
    CatalogUnavailable(#[source] std::io::Error),
    #[error("Unable to extract filename")]
    MissingFilename,
    #[error("SDCARD_RESET_FILE cannot be run from the sdcard")]
    ResetFromStream,
    #[error("No file selected")]
    NoFileSelected,
    #[error("Invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },
    #[error("SD write not supported")]
    WriteUnsupported,
}

impl JobError {
    /// Stable reply code understood by the front end.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Busy => "key217",
            JobError::FileNotFound(_) | JobError::OpenFailed { .. } => "key121",
            JobError::MissingFilename => "key120",
            JobError::ResetFromStream => "key131",
            JobError::CatalogUnavailable(_) => "key122",
            JobError::NoFileSelected => "key123",
            JobError::InvalidParameter { .. } => "key124",
            JobError::WriteUnsupported => "key125",
        }
    }

    pub fn reply(&self) -> ErrorReply {
        let values = match self {
            JobError::FileNotFound(name) | JobError::OpenFailed { name, .. } => vec![name.clone()],
            JobError::InvalidParameter { value, .. } => vec![value.clone()],
            _ => Vec::new(),
        };
        ErrorReply {
            code: self.code(),
            message: self.to_string(),
            values,
        }
    }
}

impl From<CatalogError> for JobError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::FileNotFound(name) => JobError::FileNotFound(name),
            CatalogError::Unavailable(source) => JobError::CatalogUnavailable(source),
        }
    }
}

/// Structured error reply: `{"code": "...", "msg": "...", "values": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    pub code: &'static str,
    #[serde(rename = "msg")]
    pub message: String,
    pub values: Vec<String>,
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_reply_matches_wire_format() {
        let reply = JobError::Busy.reply();
        assert_eq!(reply.to_string(), r#"{"code":"key217","msg":"SD busy","values":[]}"#);
    }

    #[test]
    fn missing_file_carries_name() {
        let reply = JobError::FileNotFound("cube.gcode".to_string()).reply();
        assert_eq!(reply.code, "key121");
        assert_eq!(reply.values, vec!["cube.gcode".to_string()]);
    }
}
