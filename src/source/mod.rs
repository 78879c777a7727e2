//! Virtual sources: wall-clock-paced synthetic and file-backed streams.
//!
//! A virtual source substitutes for a physical capture device at the
//! [`InputDistributor`](crate::InputDistributor) boundary. The crate
//! provides two variants:
//!
//! - [`Generator`]: an infinite sine wave from a precomputed periodic
//!   buffer
//! - [`FileSource`]: a WAV file read into memory once, degrading to
//!   silence past its end
//!
//! Both are paced by the wall clock: [`available()`](VirtualSource::available)
//! reports how many bytes real time would have produced by now, minus
//! what the cursor has already consumed. Callers only ever request
//! what real time allows, so a virtual source can never flood
//! downstream consumers faster than hardware would.

mod file;
mod generator;

pub use file::FileSource;
pub use generator::Generator;

use std::time::Instant;

use crate::config::{BYTES_PER_SAMPLE, SAMPLE_RATE};

/// A wall-clock-paced byte producer.
///
/// Implementations expose "produce `n` bytes starting at the cursor",
/// independent of any physical device. Registering one with
/// [`DeviceRegistry::register_virtual_input`](crate::DeviceRegistry::register_virtual_input)
/// makes it acquirable by name exactly like hardware.
pub trait VirtualSource: Send {
    /// Resets the cursor and stamps the wall clock.
    ///
    /// Called when the source is acquired; `available()` returns 0
    /// immediately afterwards.
    fn start(&mut self);

    /// Copies `n` bytes starting at the cursor and advances it.
    fn read(&mut self, n: usize) -> Vec<u8>;

    /// Bytes the wall clock has earned since `start()`, minus bytes
    /// already consumed.
    ///
    /// Monotonically non-decreasing in wall-clock time between reads.
    fn available(&self) -> usize;
}

/// Wall-clock pacing state shared by the source variants.
///
/// Tracks a byte cursor and a start timestamp; the number of bytes
/// "earned" is a pure function of elapsed time and the fixed sampling
/// rate, not of how fast the consumer reads.
#[derive(Debug)]
pub(crate) struct Pacer {
    started_at: Instant,
    consumed: u64,
}

impl Pacer {
    pub(crate) fn new() -> Self {
        Self {
            started_at: Instant::now(),
            consumed: 0,
        }
    }

    /// Resets the cursor and restarts the clock.
    pub(crate) fn restart(&mut self) {
        self.started_at = Instant::now();
        self.consumed = 0;
    }

    /// Byte position of the cursor since the last restart.
    pub(crate) fn cursor(&self) -> u64 {
        self.consumed
    }

    /// Advances the cursor by `n` bytes.
    pub(crate) fn advance(&mut self, n: usize) {
        self.consumed += n as u64;
    }

    /// Bytes elapsed wall-clock time has earned, minus the cursor.
    pub(crate) fn available(&self) -> usize {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let earned_samples = (elapsed * f64::from(SAMPLE_RATE)) as u64;
        let earned_bytes = earned_samples * BYTES_PER_SAMPLE as u64;
        earned_bytes.saturating_sub(self.consumed) as usize
    }
}
