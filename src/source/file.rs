//! File-backed virtual source (WAV).

use std::path::{Path, PathBuf};

use crate::config::SAMPLE_RATE;
use crate::error::EngineError;
use crate::frame::encode_be;
use crate::source::{Pacer, VirtualSource};

/// A virtual source that plays a WAV file, then silence.
///
/// The whole file is decoded into memory once at open time. Reads past
/// the end of the audio data return zero bytes rather than erroring:
/// a finished file degrades to silence, it does not terminate the
/// stream.
///
/// Stereo files are averaged down to mono; bit depths other than
/// 16-bit PCM are rejected at open time. A source sampled at a rate
/// other than the engine's 44.1 kHz plays at the wrong pitch and is
/// logged as a warning, not rejected; resampling is out of scope.
#[derive(Debug)]
pub struct FileSource {
    data: Vec<u8>,
    pacer: Pacer,
}

impl FileSource {
    /// Loads a WAV file into memory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::FileError`] if the file cannot be read
    /// and [`EngineError::UnsupportedFile`] if it is not 16-bit
    /// integer PCM.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(EngineError::UnsupportedFile {
                path: path.to_path_buf(),
                reason: format!(
                    "{}-bit {:?} PCM, expected 16-bit Int",
                    spec.bits_per_sample, spec.sample_format
                ),
            });
        }
        if spec.sample_rate != SAMPLE_RATE {
            tracing::warn!(
                path = %path.display(),
                file_rate = spec.sample_rate,
                engine_rate = SAMPLE_RATE,
                "sample rate mismatch, file will play at the wrong pitch"
            );
        }

        let raw: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| wav_error(path, e))?;

        let mono = match spec.channels {
            1 => raw,
            2 => stereo_to_mono(&raw),
            channels => {
                return Err(EngineError::UnsupportedFile {
                    path: path.to_path_buf(),
                    reason: format!("{channels} channels, expected mono or stereo"),
                });
            }
        };

        tracing::debug!(
            path = %path.display(),
            samples = mono.len(),
            "loaded file-backed source"
        );

        Ok(Self {
            data: encode_be(&mono),
            pacer: Pacer::new(),
        })
    }

    /// Length of the decoded audio data in bytes.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Averages interleaved stereo pairs down to mono.
fn stereo_to_mono(stereo: &[i16]) -> Vec<i16> {
    stereo
        .chunks_exact(2)
        .map(|pair| {
            let left = i32::from(pair[0]);
            let right = i32::from(pair[1]);
            ((left + right) / 2) as i16
        })
        .collect()
}

fn wav_error(path: &Path, e: hound::Error) -> EngineError {
    match e {
        hound::Error::IoError(source) => EngineError::FileError {
            path: path.to_path_buf(),
            source,
        },
        other => EngineError::UnsupportedFile {
            path: PathBuf::from(path),
            reason: other.to_string(),
        },
    }
}

impl VirtualSource for FileSource {
    fn start(&mut self) {
        self.pacer.restart();
    }

    fn read(&mut self, n: usize) -> Vec<u8> {
        let cursor = self.pacer.cursor() as usize;
        let mut out = vec![0u8; n];
        if cursor < self.data.len() {
            let take = n.min(self.data.len() - cursor);
            out[..take].copy_from_slice(&self.data[cursor..cursor + take]);
        }
        self.pacer.advance(n);
        out
    }

    fn available(&self) -> usize {
        self.pacer.available()
    }
}
