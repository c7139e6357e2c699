//! Job start/finish notifications.
//!
//! Notifications are fire-and-forget: the controller hands them to the
//! reactor's background runner, which logs a failure and moves on.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::NotifyConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started { filename: String },
    Finished,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to write printer stat file '{path}': {source}")]
    StatFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Log endpoint returned status {status}")]
    Status { status: u16 },
}

#[async_trait]
pub trait JobEventNotifier: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<(), NotifyError>;
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl JobEventNotifier for NoopNotifier {
    async fn notify(&self, event: JobEvent) -> Result<(), NotifyError> {
        tracing::debug!("Job event {:?}", event);
        Ok(())
    }
}

/// Writes the printer stat file (`2` while printing, `1` afterwards) and
/// reports the event to a local logging endpoint when one is configured.
#[derive(Debug, Clone)]
pub struct RemoteLogNotifier {
    client: reqwest::Client,
    stat_file: Option<PathBuf>,
    log_url: Option<String>,
    index: String,
}

impl RemoteLogNotifier {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            client,
            stat_file: config.stat_file.clone(),
            log_url: config.log_url.clone(),
            index: config.printer_index.clone().unwrap_or_default(),
        })
    }

    async fn write_stat(&self, value: &str) -> Result<(), NotifyError> {
        let Some(path) = &self.stat_file else {
            return Ok(());
        };
        tokio::fs::write(path, value)
            .await
            .map_err(|source| NotifyError::StatFile {
                path: path.clone(),
                source,
            })
    }

    async fn post_log(&self, query: &[(&str, &str)]) -> Result<(), NotifyError> {
        let Some(url) = &self.log_url else {
            return Ok(());
        };
        let response = self.client.get(url).query(query).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobEventNotifier for RemoteLogNotifier {
    async fn notify(&self, event: JobEvent) -> Result<(), NotifyError> {
        match event {
            JobEvent::Started { filename } => {
                self.write_stat("2").await?;
                self.post_log(&[
                    ("method", "record_log_to_remote_server"),
                    ("message", "start_print"),
                    ("index", self.index.as_str()),
                    ("filename", filename.as_str()),
                ])
                .await
            }
            JobEvent::Finished => {
                self.write_stat("1").await?;
                self.post_log(&[
                    ("method", "record_log_to_remote_server"),
                    ("message", "print_exit_upload_log"),
                    ("index", self.index.as_str()),
                ])
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn stat_file_tracks_printing() {
        let dir = tempdir().unwrap();
        let stat = dir.path().join("printer_stat");
        let notifier = RemoteLogNotifier::new(&NotifyConfig {
            stat_file: Some(stat.clone()),
            log_url: None,
            printer_index: Some("1".to_string()),
        })
        .unwrap();
        notifier
            .notify(JobEvent::Started {
                filename: "cube.gcode".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&stat).unwrap(), "2");
        notifier.notify(JobEvent::Finished).await.unwrap();
        assert_eq!(std::fs::read_to_string(&stat).unwrap(), "1");
    }

    #[tokio::test]
    async fn missing_stat_dir_is_an_error() {
        let dir = tempdir().unwrap();
        let notifier = RemoteLogNotifier::new(&NotifyConfig {
            stat_file: Some(dir.path().join("missing").join("stat")),
            ..NotifyConfig::default()
        })
        .unwrap();
        let result = notifier.notify(JobEvent::Finished).await;
        assert!(matches!(result, Err(NotifyError::StatFile { .. })));
    }
}
