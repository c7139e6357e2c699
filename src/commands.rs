//! SD card command surface.
//!
//! Verbs are matched case-sensitively on the first word of the line:
//!
//! | Command | Action |
//! |---|---|
//! | `M20` | list files |
//! | `M21` | initialize (always succeeds) |
//! | `M23 <name>` | select a file |
//! | `M24` | start or resume |
//! | `M25` | pause |
//! | `M26 S<pos>` | set the byte position |
//! | `M27` | report progress |
//! | `M28`, `M29`, `M30` | refused, writing is not supported |
//! | `SDCARD_RESET_FILE` | clear the loaded file |
//! | `SDCARD_PRINT_FILE FILENAME=<name>` | select and start |

use crate::error::JobError;
use crate::print_job::PrintJobController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdCommand {
    ListFiles,
    Initialize,
    Select { filename: String },
    StartOrResume,
    Pause,
    SetPosition(u64),
    ReportStatus,
    ResetFile,
    PrintFile { filename: String },
    /// One of the write verbs.
    Unsupported(String),
}

impl SdCommand {
    /// Parse a line. `Ok(None)` for lines that are not SD card commands.
    pub fn parse(line: &str) -> Result<Option<SdCommand>, JobError> {
        let line = line.trim();
        let verb = line.split_whitespace().next().unwrap_or("");
        let command = match verb {
            "M20" => SdCommand::ListFiles,
            "M21" => SdCommand::Initialize,
            "M23" => SdCommand::Select {
                filename: m23_filename(line)?,
            },
            "M24" => SdCommand::StartOrResume,
            "M25" => SdCommand::Pause,
            "M26" => SdCommand::SetPosition(s_parameter(line)?),
            "M27" => SdCommand::ReportStatus,
            "M28" | "M29" | "M30" => SdCommand::Unsupported(verb.to_string()),
            "SDCARD_RESET_FILE" => SdCommand::ResetFile,
            "SDCARD_PRINT_FILE" => SdCommand::PrintFile {
                filename: named_parameter(line, "FILENAME").ok_or(JobError::MissingFilename)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// The first word after the verb, cut at a `*` checksum marker.
fn m23_filename(line: &str) -> Result<String, JobError> {
    let rest = line.get(3..).unwrap_or("");
    let word = rest.split_whitespace().next().ok_or(JobError::MissingFilename)?;
    let name = match word.find('*') {
        Some(star) => word[..star].trim(),
        None => word,
    };
    let name = name.strip_prefix('/').unwrap_or(name);
    if name.is_empty() {
        return Err(JobError::MissingFilename);
    }
    Ok(name.to_string())
}

fn s_parameter(line: &str) -> Result<u64, JobError> {
    let word = line
        .split_whitespace()
        .skip(1)
        .find_map(|w| w.strip_prefix('S'))
        .ok_or(JobError::InvalidParameter {
            name: "S",
            value: String::new(),
        })?;
    word.parse().map_err(|_| JobError::InvalidParameter {
        name: "S",
        value: word.to_string(),
    })
}

fn named_parameter(line: &str, name: &str) -> Option<String> {
    line.split_whitespace().skip(1).find_map(|word| {
        let (key, value) = word.split_once('=')?;
        (key.eq_ignore_ascii_case(name) && !value.is_empty()).then(|| value.to_string())
    })
}

/// Run a parsed command against the controller and return the response
/// lines for the requester.
pub async fn execute(controller: &PrintJobController, command: SdCommand) -> Result<Vec<String>, JobError> {
    match command {
        SdCommand::ListFiles => {
            let files = controller.list_files(false).await?;
            let mut out = Vec::with_capacity(files.len() + 2);
            out.push("Begin file list".to_string());
            out.extend(files.iter().map(|f| format!("{} {}", f.path, f.size)));
            out.push("End file list".to_string());
            Ok(out)
        }
        SdCommand::Initialize => Ok(vec!["SD card ok".to_string()]),
        SdCommand::Select { filename } => {
            let (name, size) = controller.select(&filename).await?;
            Ok(opened(&name, size))
        }
        SdCommand::StartOrResume => {
            controller.resume().await?;
            Ok(Vec::new())
        }
        SdCommand::Pause => {
            controller.pause().await;
            Ok(Vec::new())
        }
        SdCommand::SetPosition(position) => {
            controller.set_position(position).await?;
            Ok(Vec::new())
        }
        SdCommand::ReportStatus => {
            if !controller.has_file().await {
                return Ok(vec!["Not SD printing.".to_string()]);
            }
            let status = controller.status().await;
            Ok(vec![format!(
                "SD printing byte {}/{}",
                status.file_position, status.file_size
            )])
        }
        SdCommand::ResetFile => {
            controller.reset().await?;
            Ok(Vec::new())
        }
        SdCommand::PrintFile { filename } => {
            let (name, size) = controller.select_and_print(&filename).await?;
            Ok(opened(&name, size))
        }
        SdCommand::Unsupported(verb) => {
            tracing::debug!("Refusing {}", verb);
            Err(JobError::WriteUnsupported)
        }
    }
}

fn opened(name: &str, size: u64) -> Vec<String> {
    vec![
        format!("File opened:{} Size:{}", name, size),
        "File selected".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sd_verbs() {
        assert_eq!(SdCommand::parse("M20").unwrap(), Some(SdCommand::ListFiles));
        assert_eq!(SdCommand::parse("M24").unwrap(), Some(SdCommand::StartOrResume));
        assert_eq!(
            SdCommand::parse("M26 S120").unwrap(),
            Some(SdCommand::SetPosition(120))
        );
        assert_eq!(
            SdCommand::parse("M30 old.gcode").unwrap(),
            Some(SdCommand::Unsupported("M30".to_string()))
        );
        assert_eq!(SdCommand::parse("G1 X10").unwrap(), None);
        assert_eq!(SdCommand::parse("m20").unwrap(), None);
    }

    #[test]
    fn m23_filename_rules() {
        assert_eq!(
            SdCommand::parse("M23 /benchy.gcode*42").unwrap(),
            Some(SdCommand::Select {
                filename: "benchy.gcode".to_string()
            })
        );
        assert_eq!(
            SdCommand::parse("M23 part one.gcode").unwrap(),
            Some(SdCommand::Select {
                filename: "part".to_string()
            })
        );
        assert!(matches!(SdCommand::parse("M23"), Err(JobError::MissingFilename)));
    }

    #[test]
    fn print_file_needs_filename() {
        assert_eq!(
            SdCommand::parse("SDCARD_PRINT_FILE FILENAME=sub/cube.gcode").unwrap(),
            Some(SdCommand::PrintFile {
                filename: "sub/cube.gcode".to_string()
            })
        );
        assert!(matches!(
            SdCommand::parse("SDCARD_PRINT_FILE"),
            Err(JobError::MissingFilename)
        ));
    }

    #[test]
    fn bad_position_is_rejected() {
        assert!(matches!(
            SdCommand::parse("M26 S-5"),
            Err(JobError::InvalidParameter { name: "S", .. })
        ));
        assert!(matches!(
            SdCommand::parse("M26"),
            Err(JobError::InvalidParameter { name: "S", .. })
        ));
    }
}
