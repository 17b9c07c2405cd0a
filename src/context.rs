//! Cancellation handle threaded through batch work and background workers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, Result};

#[derive(Default)]
struct Flag {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// Cloning shares the flag; cancelling any clone cancels all of them.
#[derive(Clone, Default)]
pub struct Context {
    flag: Arc<Flag>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.flag.cancelled.lock();
        *cancelled = true;
        self.flag.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.cancelled.lock()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps up to `timeout`; returns true if the context was cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut cancelled = self.flag.cancelled.lock();
        if !*cancelled {
            self.flag.cond.wait_for(&mut cancelled, timeout);
        }
        *cancelled
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("cancelled", &self.is_cancelled()).finish()
    }
}
