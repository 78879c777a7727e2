//! Bounded queues with timeout and cancellation semantics.
//!
//! Every producer-consumer edge in the engine is one of these: a
//! bounded, ordered channel where both ends block with an explicit
//! timeout, never an unbounded wait. Pops distinguish "no data yet"
//! from "producer gone" ([`Pop::TimedOut`] vs [`Pop::Closed`]) so the
//! fault policy can tell a transient stall apart from a torn-down
//! peer, and every blocking operation can be woken early by a
//! [`CancelToken`].

use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, TryRecvError};

/// Slice length for blocking operations between cancellation checks.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Cooperative cancellation token shared by all threads of one
/// transport generation.
///
/// The token is backed by a channel that never carries messages: it
/// "fires" when its sender side is dropped, which both flips
/// [`is_cancelled()`](CancelToken::is_cancelled) and wakes any thread
/// blocked in [`Receiver::pop_cancellable`] or
/// [`Sender::push_blocking`]. A cancelled token stays cancelled
/// forever; restarting the transport issues a fresh one.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: crossbeam_channel::Receiver<()>,
}

impl CancelToken {
    /// Creates a token plus the sender whose drop cancels it.
    pub(crate) fn pair() -> (crossbeam_channel::Sender<()>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (tx, Self { rx })
    }

    /// Creates a token that is already cancelled.
    pub fn cancelled() -> Self {
        let (_, token) = Self::pair();
        token
    }

    /// Returns `true` once the transport generation has been stopped.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Blocks until the token fires or the timeout elapses.
    ///
    /// Returns `true` if the token fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

/// Result of a queue pop.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    /// An item was received.
    Item(T),
    /// No item arrived within the timeout; the producer still exists.
    TimedOut,
    /// The producer side has been dropped.
    Closed,
    /// The cancellation token fired while waiting.
    Cancelled,
}

/// Reason a queue push did not complete.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// The queue stayed full past the timeout.
    TimedOut,
    /// The consumer side has been dropped.
    Closed,
    /// The cancellation token fired while waiting.
    Cancelled,
}

/// Creates a bounded queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (Sender { tx }, Receiver { rx })
}

/// Producer end of a bounded queue.
///
/// Cloneable so registration tables can retain an end while a loop
/// thread holds its own clone.
#[derive(Debug, Clone)]
pub struct Sender<T> {
    tx: crossbeam_channel::Sender<T>,
}

impl<T> Sender<T> {
    /// Pushes an item, blocking at most `timeout` for queue space.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(PushError::TimedOut),
            Err(SendTimeoutError::Disconnected(_)) => Err(PushError::Closed),
        }
    }

    /// Pushes an item, blocking for space until the token cancels.
    ///
    /// This is the output mixer's intentional backpressure: the mixer
    /// must not run ahead of what the device can play, so a full queue
    /// holds the producer for as long as the transport runs.
    pub fn push_blocking(&self, item: T, token: &CancelToken) -> Result<(), PushError> {
        let mut item = item;
        loop {
            if token.is_cancelled() {
                return Err(PushError::Cancelled);
            }
            match self.tx.send_timeout(item, CANCEL_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Err(PushError::Closed),
            }
        }
    }
}

/// Consumer end of a bounded queue.
#[derive(Debug, Clone)]
pub struct Receiver<T> {
    rx: crossbeam_channel::Receiver<T>,
}

impl<T> Receiver<T> {
    /// Pops an item, blocking at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Pop::Item(item),
            Err(RecvTimeoutError::Timeout) => Pop::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    /// Pops an item, waking early if the token cancels.
    ///
    /// Unlike a plain timed pop, a thread blocked here notices a stop
    /// immediately instead of within one timeout interval.
    pub fn pop_cancellable(&self, timeout: Duration, token: &CancelToken) -> Pop<T> {
        if token.is_cancelled() {
            return Pop::Cancelled;
        }
        let deadline = Instant::now() + timeout;
        crossbeam_channel::select! {
            recv(self.rx) -> msg => match msg {
                Ok(item) => Pop::Item(item),
                Err(_) => Pop::Closed,
            },
            recv(token.rx) -> _ => Pop::Cancelled,
            default(deadline.saturating_duration_since(Instant::now())) => Pop::TimedOut,
        }
    }

    /// Pops without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Discards everything currently queued.
    ///
    /// Restart hygiene: a stopped transport must not replay stale data
    /// when it starts again.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

}
