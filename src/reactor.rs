//! Cooperative scheduling primitives on top of tokio.
//!
//! A recurring timer is a [`TimerTask`] whose `step` is invoked until it
//! reports [`StepOutcome::Done`]. Between steps the timer sleeps until the
//! wake time it asked for, or until its [`TimerHandle`] reschedules it.

use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// When a timer should next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeTime {
    Now,
    At(Instant),
    Never,
}

/// Result of one timer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Run the next step without giving up control.
    Continue,
    /// Hand control back to the scheduler until the given time.
    Yield(WakeTime),
    /// No more work; the timer is unregistered.
    Done,
}

#[async_trait]
pub trait TimerTask: Send + 'static {
    async fn step(&mut self, eventtime: Instant) -> StepOutcome;
}

/// Handle to a registered timer. Dropping it unregisters a timer that is
/// waiting for its next wake time.
#[derive(Debug)]
pub struct TimerHandle {
    wake: watch::Sender<WakeTime>,
    join: JoinHandle<()>,
}

impl TimerHandle {
    /// Move the next invocation. Takes effect once the current step returns.
    pub fn reschedule(&self, waketime: WakeTime) {
        self.wake.send_replace(waketime);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reactor;

impl Reactor {
    pub fn new() -> Self {
        Self
    }

    pub fn monotonic(&self) -> Instant {
        Instant::now()
    }

    /// Register a recurring timer first invoked at `waketime`.
    pub fn register_timer<T: TimerTask>(&self, task: T, waketime: WakeTime) -> TimerHandle {
        let (wake, rx) = watch::channel(waketime);
        let join = tokio::spawn(run_timer(task, rx, waketime));
        TimerHandle { wake, join }
    }

    /// Cooperatively wait until `until`, letting other tasks run.
    pub async fn pause(&self, until: Instant) {
        tokio::time::sleep_until(until).await;
    }

    /// Run `fut` once, detached from the caller.
    pub fn register_callback<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut);
    }

    /// Run `fut` once in the background; a failure is logged and otherwise
    /// ignored.
    pub fn spawn_background<F, E>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!("Background task '{}' failed: {}", label, e);
            }
        });
    }

    pub fn after(&self, delay: Duration) -> WakeTime {
        WakeTime::At(Instant::now() + delay)
    }
}

async fn run_timer<T: TimerTask>(mut task: T, mut rx: watch::Receiver<WakeTime>, first: WakeTime) {
    let mut next = first;
    loop {
        match next {
            WakeTime::Now => tokio::task::yield_now().await,
            WakeTime::At(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        next = *rx.borrow_and_update();
                        continue;
                    }
                }
            }
            WakeTime::Never => {
                if rx.changed().await.is_err() {
                    break;
                }
                next = *rx.borrow_and_update();
                continue;
            }
        }
        let mut outcome = task.step(Instant::now()).await;
        while outcome == StepOutcome::Continue {
            outcome = task.step(Instant::now()).await;
        }
        match outcome {
            StepOutcome::Yield(wake) => next = wake,
            StepOutcome::Done | StepOutcome::Continue => break,
        }
    }
}
