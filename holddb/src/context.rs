// Request context: deadline + cancellation, honored by every store call.

use crate::error::{HoldError, Result};
use rusqlite::{Connection, ErrorCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of SQLite VM instructions between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

/// Shared flag that cancels every operation running under the contexts it
/// was handed to.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-request deadline and cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancelHandle,
}

impl Context {
    /// A context that never expires unless cancelled.
    pub fn background() -> Self {
        Context::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Context::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            deadline: Some(deadline),
            cancel: CancelHandle::default(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Handle that can cancel this context (and its clones) from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_done() {
            Err(HoldError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `op` on `conn` with a progress handler that interrupts SQLite once
    /// this context is done. Interrupted statements surface as `Cancelled`.
    pub(crate) fn run<T>(
        &self,
        conn: &mut Connection,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        self.check()?;

        let deadline = self.deadline;
        let cancel = self.cancel.clone();
        conn.progress_handler(
            PROGRESS_OPS,
            Some(move || {
                cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)
            }),
        );

        let result = op(conn);
        conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|e| match e {
            HoldError::Storage(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::OperationInterrupted =>
            {
                HoldError::Cancelled
            }
            other => other,
        })
    }
}
