// src/print_job/work_cycle.rs - The stepped task that streams a print file
use async_trait::async_trait;
use chrono::{Local, Utc};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;

use super::lines::LineBuffer;
use super::{BACKPRESSURE_DELAY, Inner, JobState, PrintJobController};
use crate::capture::RenderRequest;
use crate::dispatch::DispatchError;
use crate::notify::JobEvent;
use crate::reactor::{StepOutcome, TimerTask, WakeTime};
use crate::resume::{restore_commands, PersistedRecord};
use crate::timelapse::{reposition_plan, CaptureMode, PlanStep, TimelapseSession};

/// Why streaming stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Exit {
    /// Stop flag observed between lines.
    Paused,
    /// The job was cancelled or reset while a line was in flight.
    Detached,
    EndOfFile,
    CommandError(String),
    /// Read, seek or dispatcher failure with no user facing message.
    Failure,
}

enum Phase {
    Starting,
    Streaming,
    Finishing(Exit),
}

pub(crate) struct WorkCycle {
    inner: Arc<Inner>,
    phase: Phase,
    lines: LineBuffer,
    timelapse: TimelapseSession,
    dispatched: u64,
}

#[async_trait]
impl TimerTask for WorkCycle {
    async fn step(&mut self, _eventtime: Instant) -> StepOutcome {
        match std::mem::replace(&mut self.phase, Phase::Streaming) {
            Phase::Starting => {
                if let Err(exit) = self.start().await {
                    self.phase = Phase::Finishing(exit);
                }
                StepOutcome::Continue
            }
            Phase::Streaming => match self.stream_step().await {
                Ok(outcome) => outcome,
                Err(exit) => {
                    self.phase = Phase::Finishing(exit);
                    StepOutcome::Continue
                }
            },
            Phase::Finishing(exit) => {
                self.finish(exit).await;
                StepOutcome::Done
            }
        }
    }
}

impl WorkCycle {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            phase: Phase::Starting,
            lines: LineBuffer::new(),
            timelapse: TimelapseSession::disarmed(),
            dispatched: 0,
        }
    }

    async fn start(&mut self) -> Result<(), Exit> {
        let ctx = &self.inner.ctx;
        let settings = match ctx.timelapse_settings.load().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Timelapse disabled: {}", e);
                Default::default()
            }
        };
        let camera_available = settings.enabled && ctx.camera.is_available();
        let mut session = TimelapseSession::from_settings(&settings, camera_available);

        let (name, first_cycle) = {
            let mut shared = self.inner.state.lock().await;
            let Some(job) = shared.job.as_mut() else {
                return Err(Exit::Detached);
            };
            session.layer_count = job.layer_count;
            job.timelapse_armed |= session.armed;
            (job.name.clone(), !job.streamed)
        };
        tracing::info!(
            "Timelapse armed: {} mode: {:?} every {} layers",
            session.armed,
            session.mode,
            session.frequency
        );
        if session.armed && first_cycle {
            if let Err(e) = ctx.camera.begin_session().await {
                tracing::warn!("Failed to clear previous timelapse frames: {}", e);
            }
        }
        self.timelapse = session;

        let notifier = ctx.notifier.clone();
        ctx.reactor.spawn_background("job started notification", async move {
            notifier.notify(JobEvent::Started { filename: name }).await
        });

        if first_cycle {
            self.restore_from_record().await;
        }

        let mut shared = self.inner.state.lock().await;
        let position = shared.file_position;
        let Some(job) = shared.job.as_mut() else {
            return Err(Exit::Detached);
        };
        job.streamed = true;
        if let Err(e) = job.file.seek(SeekFrom::Start(position)).await {
            tracing::error!("Print file seek failed: {}", e);
            return Err(Exit::Failure);
        }
        tracing::info!("Starting print (position {})", position);
        ctx.stats.note_start();
        Ok(())
    }

    /// Pick up where an interrupted print of the same file left off. Any
    /// problem leaves the position untouched.
    async fn restore_from_record(&self) {
        let ctx = &self.inner.ctx;
        let record = match ctx.resume_store.load().await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Ignoring resume record: {}", e);
                return;
            }
        };
        let identity = match self.inner.state.lock().await.job.as_ref() {
            Some(job) => job.identity.clone(),
            None => return,
        };
        if !record.applies_to(ctx.resume_store.link(), &identity) {
            tracing::info!("Resume record belongs to another file; printing from the start");
            return;
        }
        for command in restore_commands(&record.snapshot, &ctx.resume) {
            tracing::info!("Restore: {}", command);
            if let Err(e) = ctx.dispatcher.dispatch(&command).await {
                tracing::warn!("Restore command '{}' failed: {}", command, e);
                return;
            }
        }
        tracing::info!("Resuming from byte {}", record.file_position);
        self.inner.state.lock().await.file_position = record.file_position;
    }

    async fn stream_step(&mut self) -> Result<StepOutcome, Exit> {
        let ctx = &self.inner.ctx;
        let (line, position, checkpoint) = {
            let mut shared = self.inner.state.lock().await;
            if shared.job.is_none() {
                return Err(Exit::Detached);
            }
            if shared.must_pause_work {
                return Err(Exit::Paused);
            }
            if self.lines.is_empty() {
                let Some(job) = shared.job.as_mut() else {
                    return Err(Exit::Detached);
                };
                let mut chunk = vec![0u8; ctx.sdcard.chunk_size];
                match job.file.read(&mut chunk).await {
                    Ok(0) => {
                        if !self.lines.finish() {
                            return Err(Exit::EndOfFile);
                        }
                    }
                    Ok(n) => {
                        self.lines.feed(&chunk[..n]);
                        return Ok(StepOutcome::Yield(WakeTime::Now));
                    }
                    Err(e) => {
                        tracing::error!("Print file read failed: {}", e);
                        return Err(Exit::Failure);
                    }
                }
            }
            if ctx.dispatcher.has_pending_request() {
                return Ok(StepOutcome::Yield(ctx.reactor.after(BACKPRESSURE_DELAY)));
            }
            let Some(line) = self.lines.pop() else {
                return Ok(StepOutcome::Continue);
            };
            let position = shared.file_position;
            shared.next_file_position = position + line.byte_len + 1;
            shared.cmd_from_stream = true;
            let due = ctx.resume.enabled
                && self.dispatched % ctx.resume.checkpoint_interval.max(1) == 0;
            let checkpoint = match shared.job.as_ref() {
                Some(job) if due => Some(PersistedRecord {
                    link: ctx.resume_store.link().to_string(),
                    file: job.identity.clone(),
                    file_position: position,
                    snapshot: ctx.machine.snapshot(),
                    saved_at: Utc::now(),
                }),
                _ => None,
            };
            (line, position, checkpoint)
        };
        let pending = position + line.byte_len + 1;

        if let Some(record) = checkpoint {
            if let Err(e) = ctx.resume_store.save(&record).await {
                tracing::warn!("Failed to save resume record: {}", e);
            }
        }

        if self.timelapse.on_line(&line.text) {
            self.capture().await?;
            if self.inner.state.lock().await.job.is_none() {
                return Err(Exit::Detached);
            }
        }

        tracing::debug!("Dispatch ({}): {}", position, line.text);
        dispatch_result(ctx.dispatcher.dispatch(&line.text).await)?;
        self.dispatched += 1;

        let mut shared = self.inner.state.lock().await;
        shared.cmd_from_stream = false;
        if shared.job.is_none() {
            return Err(Exit::Detached);
        }
        let next = shared.next_file_position;
        shared.file_position = next;
        if next != pending {
            let Some(job) = shared.job.as_mut() else {
                return Err(Exit::Detached);
            };
            tracing::info!("Stream repositioned to {}", next);
            if let Err(e) = job.file.seek(SeekFrom::Start(next)).await {
                tracing::error!("Print file seek failed: {}", e);
                return Err(Exit::Failure);
            }
            self.lines.clear();
        }
        // let interactive commands in between stream lines
        Ok(StepOutcome::Yield(WakeTime::Now))
    }

    async fn capture(&self) -> Result<(), Exit> {
        let ctx = &self.inner.ctx;
        tracing::info!(
            "Timelapse capture at layer {} ({:?})",
            self.timelapse.layer_count,
            self.timelapse.mode
        );
        match self.timelapse.mode {
            CaptureMode::Simple => {
                let camera = ctx.camera.clone();
                ctx.reactor
                    .spawn_background("timelapse capture", async move { camera.capture_frame().await });
            }
            CaptureMode::Reposition => {
                let position = ctx.machine.snapshot().position;
                for step in reposition_plan(position, &ctx.timelapse) {
                    match step {
                        PlanStep::Command(command) => {
                            tracing::info!("Timelapse: {}", command);
                            dispatch_result(ctx.dispatcher.dispatch(&command).await)?;
                        }
                        PlanStep::Settle(delay) => {
                            ctx.reactor.pause(ctx.reactor.monotonic() + delay).await;
                        }
                        PlanStep::Capture => {
                            if let Err(e) = ctx.camera.capture_frame().await {
                                tracing::warn!("Timelapse capture failed: {}", e);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self, exit: Exit) {
        let ctx = &self.inner.ctx;
        let mut completed = None;
        {
            let mut shared = self.inner.state.lock().await;
            shared.cmd_from_stream = false;
            if let Some(job) = shared.job.as_mut() {
                job.layer_count = self.timelapse.layer_count;
            }
            tracing::info!("Exiting print (position {}): {:?}", shared.file_position, exit);
            match exit {
                Exit::Paused => {
                    if shared.job.is_some() {
                        shared.state = JobState::Paused;
                        ctx.stats.note_pause();
                    }
                }
                Exit::Detached => {}
                Exit::EndOfFile => {
                    if let Some(job) = shared.job.take() {
                        tracing::info!("Finished printing '{}'", job.name);
                        completed = Some((job, shared.generation));
                    }
                    shared.state = JobState::Completed;
                    ctx.stats.note_complete();
                }
                Exit::CommandError(message) => {
                    shared.job = None;
                    ctx.stats.note_error(Some(&message));
                    shared.state = JobState::Errored(Some(message));
                }
                Exit::Failure => {
                    shared.job = None;
                    shared.state = JobState::Errored(None);
                    ctx.stats.note_error(None);
                }
            }
        }

        if let Some((job, generation)) = completed {
            if let Err(e) = ctx.resume_store.remove().await {
                tracing::warn!("Failed to remove resume record: {}", e);
            }
            if job.timelapse_armed {
                let base_name = job
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| job.name.clone());
                let request = RenderRequest {
                    stem: self.timelapse.video_stem(&base_name, Local::now()),
                    frame_rate: self.timelapse.frame_rate,
                };
                if let Err(e) = ctx.camera.finalize(&request).await {
                    tracing::warn!("Timelapse rendering failed: {}", e);
                }
            }
            drop(job);
            let controller = PrintJobController::from_inner(self.inner.clone());
            let delay = ctx.sdcard.reset_delay();
            ctx.reactor.register_callback(async move {
                tokio::time::sleep(delay).await;
                controller.reset_if_generation(generation).await;
            });
        }

        let notifier = ctx.notifier.clone();
        ctx.reactor.spawn_background("job finished notification", async move {
            notifier.notify(JobEvent::Finished).await
        });

        self.inner.state.lock().await.work_timer = None;
    }
}

fn dispatch_result(result: Result<(), DispatchError>) -> Result<(), Exit> {
    match result {
        Ok(()) => Ok(()),
        Err(DispatchError::Command(message)) => {
            tracing::warn!("Print stopped by command error: {}", message);
            Err(Exit::CommandError(message))
        }
        Err(DispatchError::Internal(message)) => {
            tracing::error!("Print dispatch failed: {}", message);
            Err(Exit::Failure)
        }
    }
}
