//! Engine composition: builder, lifecycle, and access to the stages.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::device::{CpalBackend, DeviceRegistry, HostBackend};
use crate::error::EngineError;
use crate::event::{event_callback, level_callback, EngineEvent, EventCallback, LevelCallback};
use crate::input::InputDistributor;
use crate::output::OutputMixer;
use crate::transport::Transport;

/// The assembled engine: device registry, input distribution, and
/// output mixing behind one start/stop transport.
///
/// Registration (listeners, speaker routes, virtual inputs) happens
/// through the stage accessors at any time; `start()` snapshots the
/// current registrations into one running generation and `stop()`
/// tears it down. A stream fault on any engine thread stops the
/// transport on its own; `stop()` afterwards just reaps the threads.
///
/// ```ignore
/// use uspro_engine::{Engine, Generator};
///
/// let engine = Engine::builder()
///     .on_event(|event| eprintln!("{event:?}"))
///     .build();
///
/// engine
///     .registry()
///     .register_virtual_input("tone", Box::new(Generator::new(440.0, 0.5)?));
/// engine.input().register_listener(my_channel, &["tone"])?;
/// engine.start()?;
/// ```
pub struct Engine {
    registry: Arc<DeviceRegistry>,
    transport: Arc<Transport>,
    input: InputDistributor,
    output: OutputMixer,
}

impl Engine {
    /// Creates a builder with default settings.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The device registry, for enumeration and virtual inputs.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The input distribution stage.
    pub fn input(&self) -> &InputDistributor {
        &self.input
    }

    /// The output mixing stage.
    pub fn output(&self) -> &OutputMixer {
        &self.output
    }

    /// Starts one capture-and-playback generation over everything
    /// currently registered.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyRunning`] if a generation is active.
    pub fn start(&self) -> Result<(), EngineError> {
        let token = self.transport.begin()?;
        self.input.start_capture(&token);
        self.output.start_playback(&token);
        tracing::info!("engine started");
        Ok(())
    }

    /// Stops the running generation and joins every engine thread.
    /// A no-op when nothing runs.
    pub fn stop(&self) {
        self.transport.stop();
        self.input.stop_capture();
        self.output.stop_playback();
        tracing::info!("engine stopped");
    }

    /// Whether a generation is currently active.
    ///
    /// Turns false on `stop()` and also when a stream fault stops the
    /// transport from an engine thread.
    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builder for [`Engine`].
///
/// The backend defaults to CPAL hardware; tests substitute a
/// [`MockBackend`](crate::device::MockBackend).
#[must_use]
pub struct EngineBuilder {
    backend: Option<Box<dyn HostBackend>>,
    config: EngineConfig,
    events: Option<EventCallback>,
    level: Option<LevelCallback>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            backend: None,
            config: EngineConfig::default(),
            events: None,
            level: None,
        }
    }

    /// Substitutes the host backend. Defaults to CPAL.
    pub fn backend(mut self, backend: Box<dyn HostBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Overrides the timing and capacity configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets a callback for runtime events.
    ///
    /// Events include queue overruns and stream faults.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        self.events = Some(event_callback(callback));
        self
    }

    /// Sets a callback receiving raw sample batches per device, for
    /// level metering. The flag distinguishes capture (`true`) from
    /// playback (`false`).
    pub fn on_level<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &[i16], bool) + Send + Sync + 'static,
    {
        self.level = Some(level_callback(callback));
        self
    }

    /// Assembles the engine.
    pub fn build(self) -> Engine {
        let backend = self
            .backend
            .unwrap_or_else(|| Box::new(CpalBackend::new()));
        let registry = Arc::new(DeviceRegistry::new(backend));
        let transport = Arc::new(Transport::new());
        let input = InputDistributor::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            self.config.clone(),
            self.events.clone(),
            self.level.clone(),
        );
        let output = OutputMixer::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            self.config.clone(),
            self.events,
            self.level,
        );
        Engine {
            registry,
            transport,
            input,
            output,
        }
    }
}
