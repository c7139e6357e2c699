//! Contract between the job stream and the G-code command dispatcher.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The command was understood and rejected; the text is reported to the user.
    #[error("{0}")]
    Command(String),
    /// Anything else went wrong while running the command.
    #[error("internal dispatch failure: {0}")]
    Internal(String),
}

#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Run one line of G-code to completion.
    async fn dispatch(&self, line: &str) -> Result<(), DispatchError>;

    /// True while another request is waiting for (or holding) the dispatcher.
    fn has_pending_request(&self) -> bool;
}

/// Serializes command execution and reports contention.
#[derive(Debug, Default)]
pub struct GCodeMutex {
    lock: Mutex<()>,
    waiting: AtomicUsize,
}

impl GCodeMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` while holding the mutex.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.lock.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        let result = fut.await;
        drop(guard);
        result
    }

    /// True if the mutex is held or somebody is queued for it.
    pub fn test(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > 0 || self.lock.try_lock().is_err()
    }
}
