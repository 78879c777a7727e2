//! The frame type and sample wire codec.

use crate::config::BYTES_PER_SAMPLE;

/// A fixed-length, ordered sequence of samples exchanged between
/// pipeline stages.
///
/// Samples are carried as `i32` between stages: the input distributor
/// sums subscribed devices without clipping, so a frame position can
/// hold values outside the 16-bit range while it travels through a
/// channel's plugin graph. Values are clipped back to `i16` exactly
/// once, by the output mixer, before they reach hardware.
///
/// `Clone` is a deep copy. Fan-out points rely on this: a consumer
/// mutating its frame in place must never corrupt a sibling's data.
///
/// # Example
///
/// ```
/// use uspro_engine::Frame;
///
/// let frame = Frame::new(vec![100; 100]);
/// let mut copy = frame.clone();
/// copy.samples_mut()[0] = -5;
/// assert_eq!(frame.samples()[0], 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: Vec<i32>,
}

impl Frame {
    /// Creates a frame from raw samples.
    pub fn new(samples: Vec<i32>) -> Self {
        Self { samples }
    }

    /// Creates a frame of `len` zero samples.
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![0; len],
        }
    }

    /// Returns the samples as a slice.
    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    /// Returns the samples as a mutable slice.
    ///
    /// Processing stages mutate frames in place; the fan-out deep-copy
    /// guarantee makes this safe.
    pub fn samples_mut(&mut self) -> &mut [i32] {
        &mut self.samples
    }

    /// Consumes the frame, returning its samples.
    pub fn into_samples(self) -> Vec<i32> {
        self.samples
    }

    /// Returns the number of samples in the frame.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if the frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<i32>> for Frame {
    fn from(samples: Vec<i32>) -> Self {
        Self::new(samples)
    }
}

/// Decodes big-endian byte pairs into 16-bit signed samples.
///
/// A trailing odd byte (a torn read from the device buffer) is
/// dropped.
pub fn decode_be(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Drains complete big-endian byte pairs from `buf` as 16-bit samples.
///
/// A trailing odd byte stays in `buf` so the next read can complete the
/// pair. Capture paths use this instead of [`decode_be`]: device reads
/// can split a sample across two reads, and dropping the torn byte
/// would shift every later sample by one byte.
pub(crate) fn drain_samples(buf: &mut Vec<u8>) -> Vec<i16> {
    let whole = buf.len() - buf.len() % BYTES_PER_SAMPLE;
    let samples = decode_be(&buf[..whole]);
    buf.drain(..whole);
    samples
}

/// Encodes 16-bit signed samples into big-endian byte pairs.
pub fn encode_be(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_be_bytes());
    }
    bytes
}

/// Clips an accumulated mix value to the valid 16-bit sample range.
///
/// This is the single place where the engine collapses headroom:
/// `32768` clips to `32767`, `-32769` clips to `-32768`.
#[inline]
pub fn clip(sum: i64) -> i16 {
    sum.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
}
