//! Global transport state: one start/stop switch for the whole engine.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::queue::CancelToken;

/// The engine's global start/stop switch.
///
/// Capturing starts for all open input devices at once and playback
/// for all routed output devices at once; there is no per-device
/// start. Each `begin()` issues a fresh [`CancelToken`] generation
/// that every engine thread of that run polls; `stop()` fires the
/// token, and threads blocked on queue operations wake within one
/// cancellation poll interval.
///
/// A stream fault anywhere calls [`stop()`](Transport::stop) on this
/// object, so `is_running()` doubles as the "did anything fault"
/// check between explicit stops.
#[derive(Debug)]
pub struct Transport {
    running: AtomicBool,
    cancel_tx: Mutex<Option<crossbeam_channel::Sender<()>>>,
}

impl Transport {
    /// Creates a stopped transport.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            cancel_tx: Mutex::new(None),
        }
    }

    /// Starts a new transport generation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] if the transport is
    /// already started.
    pub fn begin(&self) -> Result<CancelToken, EngineError> {
        let mut guard = self.cancel_tx.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let (tx, token) = CancelToken::pair();
        *guard = Some(tx);
        Ok(token)
    }

    /// Stops the current generation.
    ///
    /// Idempotent; stopping a stopped transport is a no-op.
    pub fn stop(&self) {
        let mut guard = self.cancel_tx.lock();
        if self.running.swap(false, Ordering::SeqCst) {
            // Dropping the sender fires every outstanding token clone.
            *guard = None;
        }
    }

    /// Returns `true` while a generation is active and unfaulted.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
