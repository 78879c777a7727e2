//! Sine generator backed by a precomputed periodic buffer.

use std::f64::consts::PI;

use crate::config::{BYTES_PER_SAMPLE, SAMPLE_RATE};
use crate::error::EngineError;
use crate::frame::encode_be;
use crate::source::{Pacer, VirtualSource};

/// Minimum length of the precomputed buffer, in samples.
///
/// At least one distribution frame so a single delivery package never
/// needs to wrap more than once.
const MIN_BUFFER_SAMPLES: usize = 100;

/// An infinite sine wave, paced like a capture device.
///
/// The constructor precomputes one buffer holding an integer number
/// of periods at the configured frequency and amplitude;
/// [`read`](VirtualSource::read) copies bytes starting at
/// `cursor mod buffer_len`, wrapping around. Producing the signal is
/// allocation-light and needs no runtime trigonometry, and because the
/// buffer spans whole periods the wrap point is phase-exact: segmented
/// reads reproduce the same byte stream as one unsegmented read.
///
/// # Example
///
/// ```
/// use uspro_engine::source::{Generator, VirtualSource};
///
/// let mut gen = Generator::new(440.0, 0.5).unwrap();
/// gen.start();
/// let bytes = gen.read(200);
/// assert_eq!(bytes.len(), 200);
/// ```
#[derive(Debug)]
pub struct Generator {
    buffer: Vec<u8>,
    pacer: Pacer,
}

impl Generator {
    /// Creates a generator for a sine at `frequency` Hz scaled by
    /// `amplitude`.
    ///
    /// # Errors
    ///
    /// Rejects non-positive frequencies and frequencies at or above
    /// the Nyquist limit with [`EngineError::InvalidFrequency`], and
    /// amplitudes outside `(0, 1]` with
    /// [`EngineError::InvalidAmplitude`].
    pub fn new(frequency: f64, amplitude: f64) -> Result<Self, EngineError> {
        if !frequency.is_finite()
            || frequency <= 0.0
            || frequency >= f64::from(SAMPLE_RATE) / 2.0
        {
            return Err(EngineError::InvalidFrequency { frequency });
        }
        if !amplitude.is_finite() || amplitude <= 0.0 || amplitude > 1.0 {
            return Err(EngineError::InvalidAmplitude { amplitude });
        }

        // Smallest whole number of periods that reaches the minimum
        // buffer length, then the sample count closest to spanning
        // exactly that many periods. Synthesizing over `periods`
        // within `total` samples keeps the wrap point phase-exact.
        let samples_per_period = f64::from(SAMPLE_RATE) / frequency;
        let periods = (MIN_BUFFER_SAMPLES as f64 / samples_per_period).ceil().max(1.0);
        let total = (periods * samples_per_period).round() as usize;

        let peak = amplitude * f64::from(i16::MAX);
        let samples: Vec<i16> = (0..total)
            .map(|i| {
                let phase = 2.0 * PI * periods * i as f64 / total as f64;
                (phase.sin() * peak).round() as i16
            })
            .collect();

        Ok(Self {
            buffer: encode_be(&samples),
            pacer: Pacer::new(),
        })
    }

    /// Length of the precomputed buffer in bytes.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

impl VirtualSource for Generator {
    fn start(&mut self) {
        self.pacer.restart();
    }

    fn read(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let len = self.buffer.len();
        let mut pos = (self.pacer.cursor() % len as u64) as usize;
        for _ in 0..n {
            out.push(self.buffer[pos]);
            pos = (pos + 1) % len;
        }
        self.pacer.advance(n);
        out
    }

    fn available(&self) -> usize {
        self.pacer.available()
    }
}
