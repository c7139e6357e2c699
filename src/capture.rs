// src/capture.rs - Camera capability used by the timelapse trigger
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command;

use crate::config::TimelapseConfig;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}")]
    Failed { program: String, status: ExitStatus },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for assembling captured frames into a video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    /// Output file name without extension.
    pub stem: String,
    pub frame_rate: u32,
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// True when the camera exists. Checked once per armed work cycle.
    fn is_available(&self) -> bool;

    /// Drop frames left over from an earlier job.
    async fn begin_session(&self) -> Result<(), CaptureError>;

    async fn capture_frame(&self) -> Result<(), CaptureError>;

    /// Render the frames of the finished job and place the preview next to
    /// the video.
    async fn finalize(&self, request: &RenderRequest) -> Result<(), CaptureError>;
}

/// No camera attached.
#[derive(Debug, Default)]
pub struct NullCaptureDevice;

#[async_trait]
impl CaptureDevice for NullCaptureDevice {
    fn is_available(&self) -> bool {
        false
    }

    async fn begin_session(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn capture_frame(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn finalize(&self, _request: &RenderRequest) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Camera driven through external programs: a capture tool that appends to
/// the raw frame stream, `wget` for a preview snapshot and `ffmpeg` for
/// rendering.
#[derive(Debug, Clone)]
pub struct ShellCaptureDevice {
    config: TimelapseConfig,
}

impl ShellCaptureDevice {
    pub fn new(config: TimelapseConfig) -> Self {
        Self { config }
    }

    fn preview_path(&self) -> PathBuf {
        self.config.output_dir.join("test.jpg")
    }
}

async fn run(program: &str, args: &[&str]) -> Result<(), CaptureError> {
    tracing::info!("Running {} {}", program, args.join(" "));
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|source| CaptureError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !status.success() {
        return Err(CaptureError::Failed {
            program: program.to_string(),
            status,
        });
    }
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl CaptureDevice for ShellCaptureDevice {
    fn is_available(&self) -> bool {
        self.config.camera_device.exists()
    }

    async fn begin_session(&self) -> Result<(), CaptureError> {
        match tokio::fs::remove_file(&self.config.raw_stream_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn capture_frame(&self) -> Result<(), CaptureError> {
        run(&self.config.capture_command, &[]).await?;
        let preview = self.preview_path();
        if tokio::fs::try_exists(&preview).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let target = path_arg(&preview);
        run("wget", &[self.config.snapshot_url.as_str(), "-O", target.as_str()]).await
    }

    async fn finalize(&self, request: &RenderRequest) -> Result<(), CaptureError> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let video = path_arg(&self.config.output_dir.join(format!("{}.mp4", request.stem)));
        let frames = path_arg(&self.config.raw_stream_path);
        let frame_rate = request.frame_rate.to_string();
        run(
            "ffmpeg",
            &[
                "-framerate",
                frame_rate.as_str(),
                "-i",
                frames.as_str(),
                "-vcodec",
                "copy",
                "-y",
                "-f",
                "mp4",
                video.as_str(),
            ],
        )
        .await?;
        let preview = self.config.output_dir.join(format!("{}.jpg", request.stem));
        tokio::fs::rename(self.preview_path(), preview).await?;
        Ok(())
    }
}
