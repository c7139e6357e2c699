// src/print_stats.rs - Print statistics sink
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receives job lifecycle transitions from the controller.
pub trait PrintStatsSink: Send + Sync {
    fn set_current_file(&self, filename: &str);
    fn note_start(&self);
    fn note_pause(&self);
    fn note_complete(&self);
    fn note_cancel(&self);
    /// `None` when the job stopped for a reason with no user-facing text.
    fn note_error(&self, message: Option<&str>);
    fn reset(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrintStatsStatus {
    pub state: PrintState,
    pub filename: String,
    pub message: String,
    pub total_duration: f64,
    pub print_duration: f64,
}

#[derive(Debug)]
struct Inner {
    state: PrintState,
    filename: String,
    message: String,
    started: Option<Instant>,
    finished: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: PrintState::Standby,
            filename: String::new(),
            message: String::new(),
            started: None,
            finished: None,
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    fn end_pause(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += now - paused_at;
        }
    }

    fn finish(&mut self, state: PrintState) {
        let now = Instant::now();
        self.end_pause(now);
        self.finished = Some(now);
        self.state = state;
    }
}

/// Default sink: tracks state, file name, message and durations for status
/// queries.
#[derive(Debug)]
pub struct PrintStats {
    inner: Mutex<Inner>,
}

impl Default for PrintStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PrintStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn get_status(&self) -> PrintStatsStatus {
        let inner = self.lock();
        let now = Instant::now();
        let end = inner.finished.unwrap_or(now);
        let total = inner.started.map(|s| end - s).unwrap_or_default();
        let mut paused = inner.paused_total;
        if let Some(paused_at) = inner.paused_at {
            paused += now - paused_at;
        }
        PrintStatsStatus {
            state: inner.state,
            filename: inner.filename.clone(),
            message: inner.message.clone(),
            total_duration: total.as_secs_f64(),
            print_duration: total.saturating_sub(paused).as_secs_f64(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PrintStatsSink for PrintStats {
    fn set_current_file(&self, filename: &str) {
        let mut inner = self.lock();
        *inner = Inner::new();
        inner.filename = filename.to_string();
    }

    fn note_start(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        if inner.started.is_none() {
            inner.started = Some(now);
        }
        inner.end_pause(now);
        inner.finished = None;
        inner.message.clear();
        inner.state = PrintState::Printing;
    }

    fn note_pause(&self) {
        let mut inner = self.lock();
        if inner.paused_at.is_none() {
            inner.paused_at = Some(Instant::now());
        }
        inner.state = PrintState::Paused;
    }

    fn note_complete(&self) {
        self.lock().finish(PrintState::Complete);
    }

    fn note_cancel(&self) {
        self.lock().finish(PrintState::Cancelled);
    }

    fn note_error(&self, message: Option<&str>) {
        let mut inner = self.lock();
        inner.finish(PrintState::Error);
        inner.message = message.unwrap_or_default().to_string();
    }

    fn reset(&self) {
        *self.lock() = Inner::new();
    }
}
