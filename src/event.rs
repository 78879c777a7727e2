//! Runtime events and the collaborator callback seams.
//!
//! Engine threads never return `Result`s to anyone; anything that goes
//! wrong after transport has started is reported through the event
//! callback while the transport stops. Level data for meter widgets
//! flows through a separate fire-and-forget callback that the engine
//! never waits on.

use std::sync::Arc;

/// Runtime events emitted by engine threads.
///
/// # Example
///
/// ```
/// use uspro_engine::EngineEvent;
///
/// fn handle_event(event: EngineEvent) {
///     match event {
///         EngineEvent::StreamFault { device } => {
///             eprintln!("stream fault on '{device}', transport stopped");
///         }
///         EngineEvent::QueueOverrun { device, listener, dropped_samples } => {
///             eprintln!(
///                 "listener '{listener}' missed {dropped_samples} samples from '{device}'"
///             );
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A device or speaker stopped producing or consuming mid-session.
    ///
    /// This is fatal for the whole transport: partial mixing would
    /// silently desynchronize every listener and route sharing the
    /// device, so the engine stops globally instead. The external
    /// layer is expected to notify the user.
    StreamFault {
        /// Name of the device (or speaker-fed device) that faulted.
        device: String,
    },

    /// A listener's capture queue stayed full past the queue timeout.
    ///
    /// The packet was dropped for that listener only; capture for
    /// other listeners of the same device continues. Recurring
    /// overruns mean the listener's channel cannot keep up with
    /// real time.
    QueueOverrun {
        /// Device whose samples were dropped.
        device: String,
        /// Listener that missed the packet.
        listener: String,
        /// Number of samples in the dropped packet.
        dropped_samples: usize,
    },
}

/// Callback invoked for every [`EngineEvent`].
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use uspro_engine::{event_callback, EngineEvent};
///
/// let callback = event_callback(|event| {
///     println!("engine event: {event:?}");
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Callback fed with raw device-boundary samples for level metering.
///
/// Arguments are the device name, the sample batch, and whether the
/// samples came from the input (capture) side. Invocations happen on
/// engine threads; implementations must be fast and must not block.
pub type LevelCallback = Arc<dyn Fn(&str, &[i16], bool) + Send + Sync>;

/// Creates a [`LevelCallback`] from a closure.
pub fn level_callback<F>(f: F) -> LevelCallback
where
    F: Fn(&str, &[i16], bool) + Send + Sync + 'static,
{
    Arc::new(f)
}
