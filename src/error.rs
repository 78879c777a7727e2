//! Error types for uspro-engine.
//!
//! Errors are split into two categories:
//! - **Registration errors** ([`EngineError`]): returned synchronously
//!   from registry, registration, and builder calls
//! - **Stream faults**: runtime failures on engine threads, surfaced
//!   via [`EventCallback`](crate::EventCallback) while the transport
//!   stops; see [`EngineEvent::StreamFault`](crate::EngineEvent)

use std::path::PathBuf;

/// Errors returned from device acquisition, registration, and
/// configuration calls.
///
/// All of these are detected before transport starts; none of them
/// reach the steady-state capture, mixing, or playback loops. A
/// failed registration leaves the engine's tables and device
/// reference counts unchanged.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No device with the given name exists on the host.
    #[error("device not found: {name}")]
    DeviceNotFound {
        /// Name of the device that wasn't found.
        name: String,
    },

    /// The device exists but the host refused to open it.
    ///
    /// Typically the line is in use by another application or the
    /// fixed mono/16-bit/44.1kHz format is unsupported. This is
    /// reported, not retried.
    #[error("device unavailable: {name} - {reason}")]
    DeviceUnavailable {
        /// Name of the unavailable device.
        name: String,
        /// Reason the device is unavailable.
        reason: String,
    },

    /// A listener with this name is already registered.
    #[error("duplicate listener: {name}")]
    DuplicateListener {
        /// The listener name that collided.
        name: String,
    },

    /// A speaker with this name already has routes registered.
    #[error("duplicate speaker: {name}")]
    DuplicateSpeaker {
        /// The speaker name that collided.
        name: String,
    },

    /// A listener was registered with an empty device list.
    #[error("listener '{name}' has no subscribed devices")]
    NoDevicesSubscribed {
        /// The listener that was registered without devices.
        name: String,
    },

    /// A speaker was registered with an empty device list.
    #[error("speaker '{name}' has no routed devices")]
    NoDevicesRouted {
        /// The speaker that was registered without devices.
        name: String,
    },

    /// An operation referenced a listener that isn't registered.
    #[error("unknown listener: {name}")]
    UnknownListener {
        /// The unknown listener name.
        name: String,
    },

    /// An operation referenced a speaker that isn't registered.
    #[error("unknown speaker: {name}")]
    UnknownSpeaker {
        /// The unknown speaker name.
        name: String,
    },

    /// A sine generator was configured with an unusable frequency.
    ///
    /// Frequencies must be positive and below the Nyquist limit of
    /// the fixed 44.1kHz format.
    #[error("invalid generator frequency: {frequency} Hz")]
    InvalidFrequency {
        /// The rejected frequency.
        frequency: f64,
    },

    /// A sine generator was configured with an amplitude outside (0, 1].
    #[error("invalid generator amplitude: {amplitude}")]
    InvalidAmplitude {
        /// The rejected amplitude.
        amplitude: f64,
    },

    /// An audio file could not be used as a virtual source.
    #[error("unsupported audio file: {path}: {reason}")]
    UnsupportedFile {
        /// Path to the file.
        path: PathBuf,
        /// Why the file was rejected.
        reason: String,
    },

    /// File I/O failed while loading a file-backed source.
    #[error("file error: {path}: {source}")]
    FileError {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An error from the underlying audio library (CPAL).
    #[error("audio backend error: {0}")]
    Backend(String),

    /// `start()` was called while the transport was already running.
    #[error("transport already running")]
    AlreadyRunning,
}
