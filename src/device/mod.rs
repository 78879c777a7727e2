//! Device lifecycle: enumeration, reference-counted open lines, and
//! virtual-source registration.
//!
//! Every component other than the registry refers to a device by name
//! only; the open line itself is owned here. A device is open if and
//! only if its reference count is greater than zero: the first
//! acquire opens the line, the last release closes it.

pub mod backend;
pub mod mock;

pub use backend::{CaptureLine, CpalBackend, HostBackend, PlaybackLine};
pub use mock::{MockBackend, MockOutputHandle};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::source::VirtualSource;

/// Shared handle to an open capture line.
///
/// Handed out by [`DeviceRegistry::acquire_input`] and used only by
/// the input distributor's capture threads.
pub type CaptureHandle = Arc<Mutex<Box<dyn CaptureLine>>>;

/// Shared handle to an open playback line.
pub type PlaybackHandle = Arc<Mutex<Box<dyn PlaybackLine>>>;

/// Reference-counted owner of every open device line.
///
/// # Example
///
/// ```
/// use uspro_engine::device::{DeviceRegistry, MockBackend};
///
/// let backend = MockBackend::new();
/// backend.add_constant_input("mic", 0, 10);
/// let registry = DeviceRegistry::new(Box::new(backend));
///
/// registry.acquire_input("mic").unwrap();
/// registry.acquire_input("mic").unwrap();
/// registry.release_input("mic");
/// assert!(registry.is_input_open("mic")); // one subscriber left
/// registry.release_input("mic");
/// assert!(!registry.is_input_open("mic"));
/// ```
pub struct DeviceRegistry {
    backend: Box<dyn HostBackend>,
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    virtual_inputs: HashMap<String, Arc<Mutex<Box<dyn VirtualSource>>>>,
    open_inputs: HashMap<String, OpenLine<CaptureHandle>>,
    open_outputs: HashMap<String, OpenLine<PlaybackHandle>>,
}

struct OpenLine<H> {
    handle: H,
    refs: usize,
}

impl DeviceRegistry {
    /// Creates a registry over the given host backend.
    pub fn new(backend: Box<dyn HostBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Registers a virtual source, acquirable by name exactly like a
    /// physical capture device.
    ///
    /// A virtual name shadows a physical device of the same name.
    pub fn register_virtual_input(&self, name: &str, source: Box<dyn VirtualSource>) {
        self.inner
            .lock()
            .virtual_inputs
            .insert(name.to_string(), Arc::new(Mutex::new(source)));
        tracing::debug!(device = name, "registered virtual input");
    }

    /// Removes a virtual source registration.
    ///
    /// Open acquisitions keep their line until released; only future
    /// acquires are affected. Unknown names are a no-op.
    pub fn unregister_virtual_input(&self, name: &str) {
        self.inner.lock().virtual_inputs.remove(name);
    }

    /// Names of the capture devices currently available: the host's
    /// plus every registered virtual input.
    pub fn input_devices(&self) -> Vec<String> {
        let mut names = self.backend.input_names();
        for name in self.inner.lock().virtual_inputs.keys() {
            if !names.iter().any(|n| n == name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    /// Names of the playback devices currently available.
    pub fn output_devices(&self) -> Vec<String> {
        let mut names = self.backend.output_names();
        names.sort();
        names
    }

    /// Opens the named input on first acquire and increments its
    /// reference count.
    ///
    /// # Errors
    ///
    /// Propagates the backend's [`EngineError::DeviceNotFound`] /
    /// [`EngineError::DeviceUnavailable`]; on error nothing is opened
    /// and no count changes.
    pub fn acquire_input(&self, name: &str) -> Result<CaptureHandle, EngineError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.open_inputs.get_mut(name) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.handle));
        }

        let line: Box<dyn CaptureLine> = match inner.virtual_inputs.get(name) {
            Some(source) => Box::new(VirtualCaptureLine {
                source: Arc::clone(source),
            }),
            None => self.backend.open_capture(name)?,
        };
        tracing::debug!(device = name, "opened input device");

        let handle: CaptureHandle = Arc::new(Mutex::new(line));
        inner.open_inputs.insert(
            name.to_string(),
            OpenLine {
                handle: Arc::clone(&handle),
                refs: 1,
            },
        );
        Ok(handle)
    }

    /// Opens the named output on first acquire and increments its
    /// reference count.
    ///
    /// # Errors
    ///
    /// Same contract as [`acquire_input`](DeviceRegistry::acquire_input).
    pub fn acquire_output(&self, name: &str) -> Result<PlaybackHandle, EngineError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.open_outputs.get_mut(name) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.handle));
        }

        let line = self.backend.open_playback(name)?;
        tracing::debug!(device = name, "opened output device");

        let handle: PlaybackHandle = Arc::new(Mutex::new(line));
        inner.open_outputs.insert(
            name.to_string(),
            OpenLine {
                handle: Arc::clone(&handle),
                refs: 1,
            },
        );
        Ok(handle)
    }

    /// Decrements an input's reference count, closing the line when it
    /// reaches zero. Releasing a device that was never acquired is a
    /// no-op.
    pub fn release_input(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.open_inputs.get_mut(name) {
            entry.refs -= 1;
            if entry.refs == 0 {
                inner.open_inputs.remove(name);
                tracing::debug!(device = name, "closed input device");
            }
        }
    }

    /// Output counterpart of [`release_input`](DeviceRegistry::release_input).
    pub fn release_output(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.open_outputs.get_mut(name) {
            entry.refs -= 1;
            if entry.refs == 0 {
                inner.open_outputs.remove(name);
                tracing::debug!(device = name, "closed output device");
            }
        }
    }

    /// Returns `true` if the named input line is currently open.
    pub fn is_input_open(&self, name: &str) -> bool {
        self.inner.lock().open_inputs.contains_key(name)
    }

    /// Returns `true` if the named output line is currently open.
    pub fn is_output_open(&self, name: &str) -> bool {
        self.inner.lock().open_outputs.contains_key(name)
    }

    /// Handle of an already-open input line, if any.
    ///
    /// Used by the distributor when capture starts; acquisition must
    /// have happened at registration time.
    pub(crate) fn input_handle(&self, name: &str) -> Option<CaptureHandle> {
        self.inner
            .lock()
            .open_inputs
            .get(name)
            .map(|entry| Arc::clone(&entry.handle))
    }

    /// Handle of an already-open output line, if any.
    pub(crate) fn output_handle(&self, name: &str) -> Option<PlaybackHandle> {
        self.inner
            .lock()
            .open_outputs
            .get(name)
            .map(|entry| Arc::clone(&entry.handle))
    }
}

/// Adapts a [`VirtualSource`] to the [`CaptureLine`] contract.
///
/// `read_available` asks the source how many bytes real time has
/// earned and reads exactly that, so the line paces itself like
/// hardware.
struct VirtualCaptureLine {
    source: Arc<Mutex<Box<dyn VirtualSource>>>,
}

impl CaptureLine for VirtualCaptureLine {
    fn start(&mut self) {
        self.source.lock().start();
    }

    fn read_available(&mut self) -> Vec<u8> {
        let mut source = self.source.lock();
        let n = source.available();
        if n == 0 {
            return Vec::new();
        }
        source.read(n)
    }
}
