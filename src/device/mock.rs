//! Mock host backend for testing without audio hardware.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::BYTES_PER_SAMPLE;
use crate::device::backend::{CaptureLine, HostBackend, PlaybackLine};
use crate::error::EngineError;
use crate::frame::encode_be;

/// A [`HostBackend`] that serves scripted capture devices and
/// recording playback devices.
///
/// This allows testing the full engine without hardware, making it
/// suitable for CI. Capture devices replay a sample script in
/// fixed-size probes; playback devices record every byte written so
/// tests can assert the exact stream that reached the "hardware".
///
/// # Example
///
/// ```
/// use uspro_engine::device::MockBackend;
///
/// let backend = MockBackend::new();
/// // A device that forever delivers the constant sample 100,
/// // 50 samples per probe.
/// backend.add_constant_input("mic", 100, 50);
/// let sink = backend.add_output("speakers");
/// // ... build an engine on the backend, run it ...
/// let written: Vec<u8> = sink.written();
/// # assert!(written.is_empty());
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    inputs: HashMap<String, MockInput>,
    outputs: HashMap<String, MockOutputHandle>,
}

struct MockInput {
    script: Script,
    probe_samples: usize,
}

enum Script {
    /// The same sample forever.
    Constant(i16),
    /// A finite sequence, then nothing.
    Sequence(Vec<i16>),
}

impl MockBackend {
    /// Creates an empty mock host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capture device that delivers `value` forever,
    /// `probe_samples` samples per probe.
    pub fn add_constant_input(&self, name: &str, value: i16, probe_samples: usize) {
        self.inner.lock().inputs.insert(
            name.to_string(),
            MockInput {
                script: Script::Constant(value),
                probe_samples,
            },
        );
    }

    /// Adds a capture device that delivers `samples` once, then
    /// nothing, which is how tests provoke stream faults.
    pub fn add_sequence_input(&self, name: &str, samples: Vec<i16>, probe_samples: usize) {
        self.inner.lock().inputs.insert(
            name.to_string(),
            MockInput {
                script: Script::Sequence(samples),
                probe_samples,
            },
        );
    }

    /// Adds a playback device and returns the handle that collects
    /// everything written to it.
    pub fn add_output(&self, name: &str) -> MockOutputHandle {
        let handle = MockOutputHandle::default();
        self.inner
            .lock()
            .outputs
            .insert(name.to_string(), handle.clone());
        handle
    }
}

impl HostBackend for MockBackend {
    fn input_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().inputs.keys().cloned().collect();
        names.sort();
        names
    }

    fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().outputs.keys().cloned().collect();
        names.sort();
        names
    }

    fn open_capture(&self, name: &str) -> Result<Box<dyn CaptureLine>, EngineError> {
        let inner = self.inner.lock();
        let input = inner
            .inputs
            .get(name)
            .ok_or_else(|| EngineError::DeviceNotFound {
                name: name.to_string(),
            })?;
        let line: MockCaptureLine = match &input.script {
            Script::Constant(value) => MockCaptureLine {
                constant: Some(*value),
                remaining: Vec::new(),
                probe_bytes: input.probe_samples * BYTES_PER_SAMPLE,
            },
            Script::Sequence(samples) => MockCaptureLine {
                constant: None,
                remaining: encode_be(samples),
                probe_bytes: input.probe_samples * BYTES_PER_SAMPLE,
            },
        };
        Ok(Box::new(line))
    }

    fn open_playback(&self, name: &str) -> Result<Box<dyn PlaybackLine>, EngineError> {
        let inner = self.inner.lock();
        let handle = inner
            .outputs
            .get(name)
            .ok_or_else(|| EngineError::DeviceNotFound {
                name: name.to_string(),
            })?;
        Ok(Box::new(MockPlaybackLine {
            handle: handle.clone(),
        }))
    }
}

struct MockCaptureLine {
    constant: Option<i16>,
    remaining: Vec<u8>,
    probe_bytes: usize,
}

impl CaptureLine for MockCaptureLine {
    fn start(&mut self) {}

    fn read_available(&mut self) -> Vec<u8> {
        match self.constant {
            Some(value) => {
                let samples = vec![value; self.probe_bytes / BYTES_PER_SAMPLE];
                encode_be(&samples)
            }
            None => {
                let take = self.probe_bytes.min(self.remaining.len());
                self.remaining.drain(..take).collect()
            }
        }
    }
}

/// Shared view of everything written to a mock playback device.
#[derive(Clone, Default)]
pub struct MockOutputHandle {
    written: Arc<Mutex<Vec<u8>>>,
}

impl MockOutputHandle {
    /// All bytes written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    /// The written bytes decoded back into samples.
    pub fn written_samples(&self) -> Vec<i16> {
        crate::frame::decode_be(&self.written.lock())
    }
}

struct MockPlaybackLine {
    handle: MockOutputHandle,
}

impl PlaybackLine for MockPlaybackLine {
    fn write(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.handle.written.lock().extend_from_slice(bytes);
        Ok(())
    }
}
