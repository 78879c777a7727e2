//! Configuration types and the fixed stream format.

use std::time::Duration;

/// Sampling rate of every device and virtual source, in Hz.
///
/// The engine runs a single fixed format end to end: mono, 16-bit
/// signed, 44.1 kHz, big-endian on the byte level. Mixed-rate graphs
/// are out of scope.
pub const SAMPLE_RATE: u32 = 44_100;

/// Bytes per sample on the device boundary (16-bit signed).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Tuning knobs for the distribution and mixing engine.
///
/// Use [`EngineConfig::default()`] for the standard cadence, or
/// customize before building an engine. Frame sizes are fixed for the
/// lifetime of an engine; they are configuration, not negotiation.
///
/// # Example
///
/// ```
/// use uspro_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     queue_timeout: Duration::from_millis(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Samples per mixed frame delivered to each listener.
    ///
    /// Default: 100
    pub distribution_frame: usize,

    /// Samples per chunk written to an output device line.
    ///
    /// Smaller chunks reduce latency but add per-write overhead and
    /// jitter on the host audio API. Default: 50
    pub playback_chunk: usize,

    /// Sleep between non-blocking device probes on the capture side.
    ///
    /// The device's own buffering governs actual pacing; this only
    /// keeps the probe loop from busy-spinning. Default: 2ms
    pub capture_poll: Duration,

    /// Upper bound on every blocking queue operation.
    ///
    /// A producer or consumer that stays silent past this bound during
    /// active transport is treated as a stream fault. Default: 200ms
    pub queue_timeout: Duration,

    /// Delay before an output device's playback thread starts reading.
    ///
    /// Lets the mixing thread build a small buffer ahead of the
    /// hardware. Default: 20ms
    pub playback_latency: Duration,

    /// Capacity, in sample packets, of each listener's per-device queue.
    ///
    /// Default: 64
    pub capture_queue_capacity: usize,

    /// Capacity, in samples, of each output device's playback queue.
    ///
    /// This is where the output mixer's intentional backpressure lives:
    /// the mixer blocks once it is this far ahead of the hardware.
    /// Default: 4410 (100ms)
    pub playback_queue_capacity: usize,

    /// Capacity, in frames, of each router consumer's queue.
    ///
    /// Default: 32
    pub router_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            distribution_frame: 100,
            playback_chunk: 50,
            capture_poll: Duration::from_millis(2),
            queue_timeout: Duration::from_millis(200),
            playback_latency: Duration::from_millis(20),
            capture_queue_capacity: 64,
            playback_queue_capacity: 4410,
            router_queue_capacity: 32,
        }
    }
}
