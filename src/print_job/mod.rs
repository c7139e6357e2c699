//! # Print Job Controller
//!
//! Owns the selected print file, the byte position cursor and the work cycle
//! that streams the file into the command dispatcher.
//!
//! ```text
//! Idle -> Selected -> Active <-> Paused
//!                       |
//!                       +-> Completed | Cancelled | Errored
//! ```
//!
//! A print is active exactly while a work cycle timer is registered. Every
//! operation that needs an idle controller checks the timer, not the state
//! label.

pub mod lines;
mod work_cycle;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::capture::{CaptureDevice, NullCaptureDevice};
use crate::catalog::{CatalogEntry, JobCatalog};
use crate::config::{Config, ResumeConfig, SdCardConfig, TimelapseConfig};
use crate::dispatch::CommandDispatcher;
use crate::error::JobError;
use crate::machine::{IdleMachine, MachineState};
use crate::notify::{JobEventNotifier, NoopNotifier};
use crate::print_stats::PrintStatsSink;
use crate::reactor::{Reactor, TimerHandle, WakeTime};
use crate::resume::{link_identity, FileIdentity, ResumeStore};
use crate::timelapse::{DisabledTimelapse, TimelapseSettingsSource};

use work_cycle::WorkCycle;

/// Wait between contention checks while another request holds the
/// dispatcher.
pub const BACKPRESSURE_DELAY: Duration = Duration::from_millis(100);

const PAUSE_POLL: Duration = Duration::from_millis(1);

/// Everything the controller talks to. Built once at startup and shared by
/// the controller and its work cycles.
pub struct JobContext {
    pub sdcard: SdCardConfig,
    pub resume: ResumeConfig,
    pub timelapse: TimelapseConfig,
    pub reactor: Reactor,
    pub catalog: JobCatalog,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub stats: Arc<dyn PrintStatsSink>,
    pub machine: Arc<dyn MachineState>,
    pub resume_store: ResumeStore,
    pub timelapse_settings: Arc<dyn TimelapseSettingsSource>,
    pub camera: Arc<dyn CaptureDevice>,
    pub notifier: Arc<dyn JobEventNotifier>,
}

impl JobContext {
    /// Context with no camera, no timelapse settings, no notifications and a
    /// machine that never moves. Use the `with_*` methods to wire in the
    /// real collaborators.
    pub fn new(
        config: &Config,
        dispatcher: Arc<dyn CommandDispatcher>,
        stats: Arc<dyn PrintStatsSink>,
    ) -> Self {
        Self {
            sdcard: config.virtual_sdcard.clone(),
            resume: config.resume.clone(),
            timelapse: config.timelapse.clone(),
            reactor: Reactor::new(),
            catalog: JobCatalog::new(&config.virtual_sdcard.path),
            dispatcher,
            stats,
            machine: Arc::new(IdleMachine),
            resume_store: ResumeStore::new(
                &config.resume.state_dir,
                link_identity(&config.mcu.serial),
            ),
            timelapse_settings: Arc::new(DisabledTimelapse),
            camera: Arc::new(NullCaptureDevice),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_machine(mut self, machine: Arc<dyn MachineState>) -> Self {
        self.machine = machine;
        self
    }

    pub fn with_camera(mut self, camera: Arc<dyn CaptureDevice>) -> Self {
        self.camera = camera;
        self
    }

    pub fn with_timelapse_settings(mut self, source: Arc<dyn TimelapseSettingsSource>) -> Self {
        self.timelapse_settings = source;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn JobEventNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Selected,
    Active,
    Paused,
    Completed,
    Cancelled,
    Errored(Option<String>),
}

/// The opened print file.
#[derive(Debug)]
pub(crate) struct PrintJob {
    /// Fresh for every load of a file.
    pub(crate) id: String,
    pub(crate) path: PathBuf,
    pub(crate) name: String,
    pub(crate) identity: FileIdentity,
    pub(crate) file: tokio::fs::File,
    /// Set once the first work cycle has run for this file.
    pub(crate) streamed: bool,
    pub(crate) layer_count: u64,
    pub(crate) timelapse_armed: bool,
}

#[derive(Debug)]
pub(crate) struct JobShared {
    pub(crate) job: Option<PrintJob>,
    pub(crate) state: JobState,
    pub(crate) file_position: u64,
    pub(crate) file_size: u64,
    pub(crate) next_file_position: u64,
    pub(crate) must_pause_work: bool,
    pub(crate) cmd_from_stream: bool,
    pub(crate) work_timer: Option<TimerHandle>,
    /// Bumped every time a file is loaded.
    pub(crate) generation: u64,
}

impl JobShared {
    fn new() -> Self {
        Self {
            job: None,
            state: JobState::Idle,
            file_position: 0,
            file_size: 0,
            next_file_position: 0,
            must_pause_work: false,
            cmd_from_stream: false,
            work_timer: None,
            generation: 0,
        }
    }

    fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 0.0;
        }
        (self.file_position as f64 / self.file_size as f64).min(1.0)
    }
}

pub(crate) struct Inner {
    pub(crate) ctx: JobContext,
    pub(crate) state: Mutex<JobShared>,
}

/// Status snapshot reported to front ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub job_id: Option<String>,
    pub file_path: Option<PathBuf>,
    pub progress: f64,
    pub is_active: bool,
    pub file_position: u64,
    pub file_size: u64,
}

#[derive(Clone)]
pub struct PrintJobController {
    inner: Arc<Inner>,
}

impl PrintJobController {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                state: Mutex::new(JobShared::new()),
            }),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.inner.ctx
    }

    pub async fn list_files(&self, recursive: bool) -> Result<Vec<CatalogEntry>, JobError> {
        Ok(self.inner.ctx.catalog.list(recursive).await?)
    }

    /// Load `name` (subdirectories allowed) and start printing it.
    pub async fn select_and_print(&self, name: &str) -> Result<(String, u64), JobError> {
        self.ensure_idle().await?;
        self.reset_file().await;
        let loaded = self.load_file(name, true).await?;
        self.resume().await?;
        Ok(loaded)
    }

    /// Load `name` from the top level of the catalog without starting it.
    /// Returns the name as requested and the file size.
    pub async fn select(&self, name: &str) -> Result<(String, u64), JobError> {
        self.ensure_idle().await?;
        self.reset_file().await;
        self.load_file(name, false).await
    }

    /// Start or continue the selected file.
    pub async fn resume(&self) -> Result<(), JobError> {
        let mut shared = self.inner.state.lock().await;
        if shared.work_timer.is_some() {
            tracing::error!("Resume requested while a print is active");
            return Err(JobError::Busy);
        }
        if shared.job.is_none() {
            return Err(JobError::NoFileSelected);
        }
        shared.must_pause_work = false;
        shared.state = JobState::Active;
        let cycle = WorkCycle::new(self.inner.clone());
        shared.work_timer = Some(self.inner.ctx.reactor.register_timer(cycle, WakeTime::Now));
        Ok(())
    }

    /// Ask the work cycle to stop after the line in flight and wait until it
    /// has. Returns immediately when called by a command the cycle itself
    /// dispatched.
    pub async fn pause(&self) {
        {
            let mut shared = self.inner.state.lock().await;
            let Some(timer) = &shared.work_timer else {
                return;
            };
            timer.reschedule(WakeTime::Now);
            shared.must_pause_work = true;
        }
        let reactor = &self.inner.ctx.reactor;
        loop {
            {
                let shared = self.inner.state.lock().await;
                if shared.work_timer.is_none() || shared.cmd_from_stream {
                    return;
                }
            }
            reactor.pause(reactor.monotonic() + PAUSE_POLL).await;
        }
    }

    pub async fn cancel(&self) {
        let had_job = self.inner.state.lock().await.job.is_some();
        if had_job {
            self.pause().await;
        }
        {
            let mut shared = self.inner.state.lock().await;
            if let Some(job) = shared.job.take() {
                tracing::info!("Cancelled print of '{}'", job.name);
                shared.state = JobState::Cancelled;
                self.inner.ctx.stats.note_cancel();
            }
            shared.file_position = 0;
            shared.file_size = 0;
        }
        if had_job {
            if let Err(e) = self.inner.ctx.resume_store.remove().await {
                tracing::warn!("Failed to remove resume record: {}", e);
            }
        }
    }

    /// Clear the loaded file, stopping the print first if necessary. Refused
    /// for commands coming from the print file itself.
    pub async fn reset(&self) -> Result<(), JobError> {
        if self.is_cmd_from_stream().await {
            return Err(JobError::ResetFromStream);
        }
        self.reset_file().await;
        Ok(())
    }

    /// Set the position the next start continues from.
    pub async fn set_position(&self, position: u64) -> Result<(), JobError> {
        let mut shared = self.inner.state.lock().await;
        if shared.work_timer.is_some() {
            tracing::error!("Set position requested while a print is active");
            return Err(JobError::Busy);
        }
        shared.file_position = position;
        Ok(())
    }

    pub async fn status(&self) -> StatusSnapshot {
        let shared = self.inner.state.lock().await;
        StatusSnapshot {
            job_id: shared.job.as_ref().map(|job| job.id.clone()),
            file_path: shared.job.as_ref().map(|job| job.path.clone()),
            progress: shared.progress(),
            is_active: shared.work_timer.is_some(),
            file_position: shared.file_position,
            file_size: shared.file_size,
        }
    }

    pub async fn state(&self) -> JobState {
        self.inner.state.lock().await.state.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.inner.state.lock().await.work_timer.is_some()
    }

    pub async fn has_file(&self) -> bool {
        self.inner.state.lock().await.job.is_some()
    }

    /// True while the line being dispatched came from the print file.
    pub async fn is_cmd_from_stream(&self) -> bool {
        self.inner.state.lock().await.cmd_from_stream
    }

    /// Position the stream continues from once the current line completes.
    pub async fn get_file_position(&self) -> u64 {
        self.inner.state.lock().await.next_file_position
    }

    /// Make the stream continue from `position` once the current line
    /// completes.
    pub async fn set_file_position(&self, position: u64) {
        self.inner.state.lock().await.next_file_position = position;
    }

    /// Periodic host stats: `(active, "sd_pos=N")`.
    pub async fn stats(&self) -> (bool, String) {
        let shared = self.inner.state.lock().await;
        if shared.work_timer.is_none() {
            return (false, String::new());
        }
        (true, format!("sd_pos={}", shared.file_position))
    }

    /// Stop an active print on host shutdown and log the file content around
    /// the current position.
    pub async fn handle_shutdown(&self) {
        let mut shared = self.inner.state.lock().await;
        if shared.work_timer.is_none() {
            return;
        }
        shared.must_pause_work = true;
        let position = shared.file_position;
        let Some(job) = shared.job.as_mut() else {
            return;
        };
        let read_pos = position.saturating_sub(1024);
        let before = (position - read_pos) as usize;
        let mut data = vec![0u8; before + 128];
        let read = async {
            job.file.seek(std::io::SeekFrom::Start(read_pos)).await?;
            let mut filled = 0;
            while filled < data.len() {
                let n = job.file.read(&mut data[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok::<usize, std::io::Error>(filled)
        };
        match read.await {
            Ok(filled) => {
                let split = before.min(filled);
                tracing::info!(
                    "Print file ({}): {:?}\nUpcoming ({}): {:?}",
                    read_pos,
                    String::from_utf8_lossy(&data[..split]),
                    position,
                    String::from_utf8_lossy(&data[split..filled])
                );
            }
            Err(e) => tracing::error!("Print file shutdown read failed: {}", e),
        }
    }

    async fn ensure_idle(&self) -> Result<(), JobError> {
        if self.inner.state.lock().await.work_timer.is_some() {
            tracing::error!("File selection requested while a print is active");
            return Err(JobError::Busy);
        }
        Ok(())
    }

    async fn reset_file(&self) {
        let had_job = self.inner.state.lock().await.job.is_some();
        if had_job {
            self.pause().await;
        }
        let mut shared = self.inner.state.lock().await;
        shared.job = None;
        shared.file_position = 0;
        shared.file_size = 0;
        shared.state = JobState::Idle;
        self.inner.ctx.stats.reset();
    }

    async fn load_file(&self, requested: &str, recursive: bool) -> Result<(String, u64), JobError> {
        let requested = requested.strip_prefix('/').unwrap_or(requested);
        let resolved = self.inner.ctx.catalog.resolve(requested, recursive).await?;
        let open_failed = |source| JobError::OpenFailed {
            name: requested.to_string(),
            source,
        };
        let file = tokio::fs::File::open(&resolved.path).await.map_err(open_failed)?;
        let metadata = file.metadata().await.map_err(open_failed)?;
        let size = metadata.len();
        let identity = FileIdentity::new(resolved.path.clone(), size, metadata.modified().ok());
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!("File opened:{} Size:{} (job {})", requested, size, id);

        let mut shared = self.inner.state.lock().await;
        shared.generation += 1;
        shared.job = Some(PrintJob {
            id,
            path: resolved.path,
            name: resolved.name,
            identity,
            file,
            streamed: false,
            layer_count: 0,
            timelapse_armed: false,
        });
        shared.file_position = 0;
        shared.file_size = size;
        shared.state = JobState::Selected;
        self.inner.ctx.stats.set_current_file(requested);
        Ok((requested.to_string(), size))
    }

    /// Deferred cleanup after a completed print. Skipped when another file
    /// was loaded or a print started in the meantime.
    pub(crate) async fn reset_if_generation(&self, generation: u64) {
        let mut shared = self.inner.state.lock().await;
        if shared.generation != generation || shared.work_timer.is_some() || shared.job.is_some() {
            return;
        }
        tracing::info!("Clearing finished print");
        shared.file_position = 0;
        shared.file_size = 0;
        shared.state = JobState::Idle;
        self.inner.ctx.stats.reset();
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::print_stats::PrintStats;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct AcceptAll;

    #[async_trait]
    impl CommandDispatcher for AcceptAll {
        async fn dispatch(&self, _line: &str) -> Result<(), DispatchError> {
            Ok(())
        }

        fn has_pending_request(&self) -> bool {
            false
        }
    }

    fn controller(root: &std::path::Path) -> PrintJobController {
        let mut config = Config::default();
        config.virtual_sdcard.path = root.to_path_buf();
        config.resume.state_dir = root.join("state");
        PrintJobController::new(JobContext::new(
            &config,
            Arc::new(AcceptAll),
            Arc::new(PrintStats::new()),
        ))
    }

    #[tokio::test]
    async fn select_reports_size_and_status() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cube.gcode"), b"G28\nG1 X1\n").unwrap();
        let controller = controller(dir.path());
        let (name, size) = controller.select("/cube.gcode").await.unwrap();
        assert_eq!(name, "cube.gcode");
        assert_eq!(size, 10);
        let status = controller.status().await;
        assert_eq!(status.file_path, Some(dir.path().join("Cube.gcode")));
        assert_eq!(status.progress, 0.0);
        assert!(!status.is_active);
        assert_eq!(controller.state().await, JobState::Selected);
    }

    #[tokio::test]
    async fn resume_without_file_is_rejected() {
        let dir = tempdir().unwrap();
        let controller = controller(dir.path());
        assert!(matches!(controller.resume().await, Err(JobError::NoFileSelected)));
    }

    #[tokio::test]
    async fn set_position_before_start() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.gcode"), b"G28\n").unwrap();
        let controller = controller(dir.path());
        controller.select("a.gcode").await.unwrap();
        controller.set_position(2).await.unwrap();
        let status = controller.status().await;
        assert_eq!(status.file_position, 2);
        assert_eq!(status.progress, 0.5);
        assert_eq!(controller.stats().await, (false, String::new()));
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.gcode"), b"G28\n").unwrap();
        let controller = controller(dir.path());
        controller.select("a.gcode").await.unwrap();
        controller.set_position(400).await.unwrap();
        assert_eq!(controller.status().await.progress, 1.0);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let controller = controller(dir.path());
        let result = controller.select("nope.gcode").await;
        assert!(matches!(result, Err(JobError::FileNotFound(name)) if name == "nope.gcode"));
        assert_eq!(controller.state().await, JobState::Idle);
    }
}
