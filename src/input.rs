//! Input distribution: per-device capture threads and per-listener
//! mixing threads.
//!
//! Each subscribed input device gets one capture thread that probes
//! the device line for whatever bytes are available, converts them to
//! samples, and fans copies out to every subscribed listener's
//! per-device queue. Each registered listener gets one mixing thread
//! that draws one sample per device per output position, sums them
//! without clipping, and delivers fixed-size frames through the
//! [`Listener`] boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::channel::Listener;
use crate::config::EngineConfig;
use crate::device::DeviceRegistry;
use crate::error::EngineError;
use crate::event::{EngineEvent, EventCallback, LevelCallback};
use crate::frame::{drain_samples, Frame};
use crate::queue::{self, CancelToken, Pop};
use crate::transport::Transport;

/// Distributes captured device streams to registered listeners.
///
/// Subscription mutations (`register_listener`, `add_device`,
/// `remove_device`, `unregister_listener`) serialize on one internal
/// lock and reference-count devices through the
/// [`DeviceRegistry`]. The capture and mixing loops never take that
/// lock: thread membership and queue assignments are snapshotted when
/// capture starts, so mutations made while capturing take effect on
/// the next start.
pub struct InputDistributor {
    registry: Arc<DeviceRegistry>,
    transport: Arc<Transport>,
    config: EngineConfig,
    events: Option<EventCallback>,
    level: Option<LevelCallback>,
    inner: Mutex<DistributorInner>,
}

#[derive(Default)]
struct DistributorInner {
    listeners: HashMap<String, ListenerEntry>,
    threads: Vec<JoinHandle<()>>,
    capturing: bool,
}

struct ListenerEntry {
    listener: Arc<dyn Listener>,
    queues: HashMap<String, PacketQueue>,
}

/// Both ends of one listener's per-device packet queue.
///
/// The table keeps both so loop threads can clone whichever end they
/// need at start time and `stop_capture` can drain leftovers.
struct PacketQueue {
    tx: queue::Sender<Vec<i16>>,
    rx: queue::Receiver<Vec<i16>>,
}

impl InputDistributor {
    /// Creates a distributor over the given registry and transport.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transport: Arc<Transport>,
        config: EngineConfig,
        events: Option<EventCallback>,
        level: Option<LevelCallback>,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            events,
            level,
            inner: Mutex::new(DistributorInner::default()),
        }
    }

    /// Registers a listener subscribed to the given devices.
    ///
    /// Acquires every device or none: a failed open rolls back the
    /// devices acquired so far and leaves the tables untouched.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoDevicesSubscribed`] for an empty device list,
    /// [`EngineError::DuplicateListener`] for a name collision, plus
    /// any acquisition error from the registry.
    pub fn register_listener(
        &self,
        listener: Arc<dyn Listener>,
        devices: &[&str],
    ) -> Result<(), EngineError> {
        let name = listener.name().to_string();
        if devices.is_empty() {
            return Err(EngineError::NoDevicesSubscribed { name });
        }

        let mut inner = self.inner.lock();
        if inner.listeners.contains_key(&name) {
            return Err(EngineError::DuplicateListener { name });
        }

        // A repeated name in the list counts once.
        let mut devices = devices.to_vec();
        devices.sort_unstable();
        devices.dedup();

        let mut acquired = Vec::new();
        for &device in &devices {
            match self.registry.acquire_input(device) {
                Ok(_) => acquired.push(device),
                Err(e) => {
                    for &done in &acquired {
                        self.registry.release_input(done);
                    }
                    return Err(e);
                }
            }
        }

        let queues = devices
            .iter()
            .map(|&device| (device.to_string(), self.new_queue()))
            .collect();

        tracing::debug!(listener = %name, ?devices, "registered listener");
        inner
            .listeners
            .insert(name, ListenerEntry { listener, queues });
        Ok(())
    }

    /// Subscribes an existing listener to one more device.
    ///
    /// Subscribing to an already-subscribed device is a no-op.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownListener`] or an acquisition error.
    pub fn add_device(&self, listener: &str, device: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .listeners
            .get_mut(listener)
            .ok_or_else(|| EngineError::UnknownListener {
                name: listener.to_string(),
            })?;
        if entry.queues.contains_key(device) {
            return Ok(());
        }

        self.registry.acquire_input(device)?;
        entry.queues.insert(device.to_string(), self.new_queue());
        Ok(())
    }

    /// Drops one device subscription, releasing the device reference
    /// and discarding the queue. Unknown devices are a no-op.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownListener`] if no such listener exists.
    pub fn remove_device(&self, listener: &str, device: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .listeners
            .get_mut(listener)
            .ok_or_else(|| EngineError::UnknownListener {
                name: listener.to_string(),
            })?;
        if entry.queues.remove(device).is_some() {
            self.registry.release_input(device);
        }
        Ok(())
    }

    /// Removes a listener and releases all of its device references.
    /// Unknown listeners are a no-op.
    pub fn unregister_listener(&self, listener: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.listeners.remove(listener) {
            for device in entry.queues.keys() {
                self.registry.release_input(device);
            }
            tracing::debug!(listener, "unregistered listener");
        }
    }

    /// Starts capture for every subscribed device and mixing for
    /// every registered listener, under the given transport
    /// generation.
    ///
    /// Thread membership is snapshotted here; later subscription
    /// edits apply on the next start.
    pub fn start_capture(&self, token: &CancelToken) {
        let mut inner = self.inner.lock();
        if inner.capturing {
            return;
        }

        // Per-device fan-out lists across all listeners.
        let mut fanout: HashMap<String, Vec<(String, queue::Sender<Vec<i16>>)>> = HashMap::new();
        for (listener_name, entry) in &inner.listeners {
            for (device, packet_queue) in &entry.queues {
                fanout
                    .entry(device.clone())
                    .or_default()
                    .push((listener_name.clone(), packet_queue.tx.clone()));
            }
        }

        let mut threads = Vec::new();
        for (device, senders) in fanout {
            let Some(handle) = self.registry.input_handle(&device) else {
                // Registration acquired the device, so a missing line
                // means it was torn down behind our back.
                tracing::error!(device = %device, "input line missing at capture start");
                continue;
            };
            let worker = CaptureWorker {
                device: device.clone(),
                handle,
                senders,
                poll: self.config.capture_poll,
                queue_timeout: self.config.queue_timeout,
                token: token.clone(),
                events: self.events.clone(),
                level: self.level.clone(),
            };
            threads.push(spawn_named(format!("capture-{device}"), move || {
                worker.run();
            }));
        }

        for (listener_name, entry) in &inner.listeners {
            let mut feeds: Vec<DeviceFeed> = entry
                .queues
                .iter()
                .map(|(device, packet_queue)| DeviceFeed {
                    device: device.clone(),
                    rx: packet_queue.rx.clone(),
                    buffer: VecDeque::new(),
                })
                .collect();
            // Stable iteration order each cycle.
            feeds.sort_by(|a, b| a.device.cmp(&b.device));

            let worker = MixWorker {
                listener: Arc::clone(&entry.listener),
                listener_name: listener_name.clone(),
                feeds,
                frame_len: self.config.distribution_frame,
                queue_timeout: self.config.queue_timeout,
                token: token.clone(),
                transport: Arc::clone(&self.transport),
                events: self.events.clone(),
            };
            threads.push(spawn_named(format!("mix-{listener_name}"), move || {
                worker.run();
            }));
        }

        inner.threads = threads;
        inner.capturing = true;
        tracing::debug!("input distribution started");
    }

    /// Joins all capture and mixing threads and drains every packet
    /// queue so a restart starts clean.
    ///
    /// The transport generation must already be cancelled; this only
    /// reaps.
    pub fn stop_capture(&self) {
        let threads = {
            let mut inner = self.inner.lock();
            if !inner.capturing {
                return;
            }
            inner.capturing = false;
            std::mem::take(&mut inner.threads)
        };
        for thread in threads {
            let _ = thread.join();
        }

        let inner = self.inner.lock();
        for entry in inner.listeners.values() {
            for packet_queue in entry.queues.values() {
                let dropped = packet_queue.rx.drain();
                if dropped > 0 {
                    tracing::debug!(dropped, "drained stale capture packets");
                }
            }
        }
        tracing::debug!("input distribution stopped");
    }

    /// Names of the devices any listener is currently subscribed to.
    pub fn subscribed_devices(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .listeners
            .values()
            .flat_map(|entry| entry.queues.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn new_queue(&self) -> PacketQueue {
        let (tx, rx) = queue::bounded(self.config.capture_queue_capacity);
        PacketQueue { tx, rx }
    }
}

fn spawn_named(name: String, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .unwrap_or_else(|e| panic!("failed to spawn thread '{name}': {e}"))
}

/// One device's capture loop.
struct CaptureWorker {
    device: String,
    handle: crate::device::CaptureHandle,
    senders: Vec<(String, queue::Sender<Vec<i16>>)>,
    poll: std::time::Duration,
    queue_timeout: std::time::Duration,
    token: CancelToken,
    events: Option<EventCallback>,
    level: Option<LevelCallback>,
}

impl CaptureWorker {
    fn run(self) {
        self.handle.lock().start();
        let mut discarded_first = false;
        // A read can end mid-sample; the torn byte waits here for the
        // next read to complete the pair.
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let bytes = self.handle.lock().read_available();
            if !bytes.is_empty() {
                if discarded_first {
                    pending.extend_from_slice(&bytes);
                    let samples = drain_samples(&mut pending);
                    if !samples.is_empty() {
                        self.distribute(samples);
                    }
                } else {
                    // The host typically buffers an oversized first
                    // chunk; delivering it would add a latency spike.
                    // Whole samples are dropped, but a torn trailing
                    // byte stays pending so later reads keep their
                    // pair alignment.
                    discarded_first = true;
                    pending.extend_from_slice(&bytes);
                    let dropped = drain_samples(&mut pending);
                    tracing::debug!(
                        device = %self.device,
                        samples = dropped.len(),
                        "discarded first capture read"
                    );
                }
            }
            // The sleep doubles as the cancellation check.
            if self.token.wait(self.poll) {
                return;
            }
        }
    }

    fn distribute(&self, samples: Vec<i16>) {
        for (listener, tx) in &self.senders {
            if tx.push_timeout(samples.clone(), self.queue_timeout).is_err() {
                tracing::warn!(
                    device = %self.device,
                    listener = %listener,
                    dropped = samples.len(),
                    "capture queue overrun, packet dropped"
                );
                if let Some(events) = &self.events {
                    events(EngineEvent::QueueOverrun {
                        device: self.device.clone(),
                        listener: listener.clone(),
                        dropped_samples: samples.len(),
                    });
                }
            }
        }
        if let Some(level) = &self.level {
            level(&self.device, &samples, true);
        }
    }
}

/// One subscribed device's feed into a listener's mix.
struct DeviceFeed {
    device: String,
    rx: queue::Receiver<Vec<i16>>,
    buffer: VecDeque<i16>,
}

/// One listener's mixing loop.
struct MixWorker {
    listener: Arc<dyn Listener>,
    listener_name: String,
    feeds: Vec<DeviceFeed>,
    frame_len: usize,
    queue_timeout: std::time::Duration,
    token: CancelToken,
    transport: Arc<Transport>,
    events: Option<EventCallback>,
}

impl MixWorker {
    fn run(mut self) {
        // Prefill one packet per device before the first frame.
        for i in 0..self.feeds.len() {
            if !self.refill(i) {
                return;
            }
        }

        while !self.token.is_cancelled() {
            let mut samples = Vec::with_capacity(self.frame_len);
            for _ in 0..self.frame_len {
                let mut sum: i32 = 0;
                for i in 0..self.feeds.len() {
                    if self.feeds[i].buffer.is_empty() && !self.refill(i) {
                        return;
                    }
                    // Refill guarantees at least one sample.
                    if let Some(sample) = self.feeds[i].buffer.pop_front() {
                        sum += i32::from(sample);
                    }
                }
                // No clipping here: listeners get the raw accumulator
                // so downstream stages keep their headroom.
                samples.push(sum);
            }
            self.listener.put_data(Frame::new(samples));
        }
    }

    /// Pops the next packet for feed `i` into its local buffer.
    ///
    /// Returns `false` if the loop must exit: cancellation, or a
    /// fatal stream fault on the device.
    fn refill(&mut self, i: usize) -> bool {
        let feed = &mut self.feeds[i];
        loop {
            match feed.rx.pop_cancellable(self.queue_timeout, &self.token) {
                Pop::Item(packet) => {
                    if packet.is_empty() {
                        continue;
                    }
                    feed.buffer.extend(packet);
                    return true;
                }
                Pop::Cancelled => return false,
                Pop::TimedOut | Pop::Closed => {
                    // An open device that stops producing would
                    // desynchronize every listener sharing it;
                    // stopping everything beats silently skipping.
                    tracing::error!(
                        device = %feed.device,
                        listener = %self.listener_name,
                        "input stream fault, stopping transport"
                    );
                    if let Some(events) = &self.events {
                        events(EngineEvent::StreamFault {
                            device: feed.device.clone(),
                        });
                    }
                    self.transport.stop();
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CollectingListener {
        name: String,
        frames: Mutex<Vec<Frame>>,
        received: AtomicUsize,
    }

    impl CollectingListener {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                frames: Mutex::new(Vec::new()),
                received: AtomicUsize::new(0),
            })
        }

        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().clone()
        }
    }

    impl Listener for CollectingListener {
        fn name(&self) -> &str {
            &self.name
        }

        fn put_data(&self, frame: Frame) {
            self.frames.lock().push(frame);
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn distributor(backend: MockBackend) -> (InputDistributor, Arc<Transport>) {
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());
        let distributor = InputDistributor::new(
            registry,
            Arc::clone(&transport),
            EngineConfig::default(),
            None,
            None,
        );
        (distributor, transport)
    }

    #[test]
    fn test_register_requires_devices() {
        let (distributor, _) = distributor(MockBackend::new());
        let listener = CollectingListener::new("ch");
        assert!(matches!(
            distributor.register_listener(listener, &[]),
            Err(EngineError::NoDevicesSubscribed { .. })
        ));
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic", 0, 10);
        let (distributor, _) = distributor(backend);

        distributor
            .register_listener(CollectingListener::new("ch"), &["mic"])
            .unwrap();
        assert!(matches!(
            distributor.register_listener(CollectingListener::new("ch"), &["mic"]),
            Err(EngineError::DuplicateListener { .. })
        ));
    }

    #[test]
    fn test_register_rolls_back_on_bad_device() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic", 0, 10);
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());
        let distributor = InputDistributor::new(
            Arc::clone(&registry),
            transport,
            EngineConfig::default(),
            None,
            None,
        );

        let result =
            distributor.register_listener(CollectingListener::new("ch"), &["mic", "ghost"]);
        assert!(result.is_err());
        assert!(!registry.is_input_open("mic"));
    }

    #[test]
    fn test_unregister_releases_devices() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic", 0, 10);
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());
        let distributor = InputDistributor::new(
            Arc::clone(&registry),
            transport,
            EngineConfig::default(),
            None,
            None,
        );

        distributor
            .register_listener(CollectingListener::new("ch"), &["mic"])
            .unwrap();
        assert!(registry.is_input_open("mic"));

        distributor.unregister_listener("ch");
        assert!(!registry.is_input_open("mic"));
    }

    #[test]
    fn test_single_device_frames_are_passthrough() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic", 100, 50);
        let (distributor, transport) = distributor(backend);

        let listener = CollectingListener::new("ch");
        distributor
            .register_listener(Arc::clone(&listener) as Arc<dyn Listener>, &["mic"])
            .unwrap();

        let token = transport.begin().unwrap();
        distributor.start_capture(&token);

        wait_for(|| listener.received.load(Ordering::SeqCst) >= 2);
        transport.stop();
        distributor.stop_capture();

        let frames = listener.frames();
        assert!(frames.len() >= 2);
        for frame in &frames {
            assert_eq!(frame.len(), 100);
            assert!(frame.samples().iter().all(|&s| s == 100));
        }
    }

    #[test]
    fn test_two_devices_mix_pointwise() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic-a", 100, 50);
        backend.add_constant_input("mic-b", 50, 50);
        let (distributor, transport) = distributor(backend);

        let listener = CollectingListener::new("ch");
        distributor
            .register_listener(
                Arc::clone(&listener) as Arc<dyn Listener>,
                &["mic-a", "mic-b"],
            )
            .unwrap();

        let token = transport.begin().unwrap();
        distributor.start_capture(&token);

        wait_for(|| listener.received.load(Ordering::SeqCst) >= 2);
        transport.stop();
        distributor.stop_capture();

        for frame in listener.frames() {
            assert_eq!(frame.len(), 100);
            assert!(frame.samples().iter().all(|&s| s == 150));
        }
    }

    /// Listener that sleeps in `put_data`, backing up its own queue.
    struct SlowListener {
        name: String,
        received: AtomicUsize,
    }

    impl Listener for SlowListener {
        fn name(&self) -> &str {
            &self.name
        }

        fn put_data(&self, _frame: Frame) {
            self.received.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_slow_listener_overruns_its_own_queue() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic", 1, 50);
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());

        let overruns = Arc::new(AtomicUsize::new(0));
        let overruns_clone = Arc::clone(&overruns);
        let events = crate::event::event_callback(move |event| {
            if matches!(event, EngineEvent::QueueOverrun { .. }) {
                overruns_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        // A tiny queue and a short push timeout make the overrun
        // deterministic against a listener that cannot keep up.
        let config = EngineConfig {
            capture_queue_capacity: 2,
            queue_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let distributor = InputDistributor::new(
            registry,
            Arc::clone(&transport),
            config,
            Some(events),
            None,
        );

        let listener = Arc::new(SlowListener {
            name: "slow".to_string(),
            received: AtomicUsize::new(0),
        });
        distributor
            .register_listener(Arc::clone(&listener) as Arc<dyn Listener>, &["mic"])
            .unwrap();

        let token = transport.begin().unwrap();
        distributor.start_capture(&token);

        wait_for(|| overruns.load(Ordering::SeqCst) >= 1);
        transport.stop();
        distributor.stop_capture();

        // The listener still made progress; overruns drop packets,
        // they do not stop the stream.
        assert!(listener.received.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_add_device_acquires_and_deduplicates() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic-a", 0, 10);
        backend.add_constant_input("mic-b", 0, 10);
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());
        let distributor = InputDistributor::new(
            Arc::clone(&registry),
            transport,
            EngineConfig::default(),
            None,
            None,
        );

        distributor
            .register_listener(CollectingListener::new("ch"), &["mic-a"])
            .unwrap();
        distributor.add_device("ch", "mic-b").unwrap();
        assert!(registry.is_input_open("mic-b"));
        assert_eq!(distributor.subscribed_devices(), vec!["mic-a", "mic-b"]);

        // Re-adding a subscribed device is a no-op, not a second hold.
        distributor.add_device("ch", "mic-b").unwrap();
        distributor.remove_device("ch", "mic-b").unwrap();
        assert!(!registry.is_input_open("mic-b"));

        assert!(matches!(
            distributor.add_device("ghost", "mic-a"),
            Err(EngineError::UnknownListener { .. })
        ));
    }

    #[test]
    fn test_remove_device_releases_and_ignores_unknown() {
        let backend = MockBackend::new();
        backend.add_constant_input("mic-a", 0, 10);
        backend.add_constant_input("mic-b", 0, 10);
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());
        let distributor = InputDistributor::new(
            Arc::clone(&registry),
            transport,
            EngineConfig::default(),
            None,
            None,
        );

        distributor
            .register_listener(CollectingListener::new("ch"), &["mic-a", "mic-b"])
            .unwrap();
        distributor.remove_device("ch", "mic-b").unwrap();
        assert!(!registry.is_input_open("mic-b"));
        assert!(registry.is_input_open("mic-a"));
        assert_eq!(distributor.subscribed_devices(), vec!["mic-a"]);

        // Unknown device names are tolerated, unknown listeners are not.
        distributor.remove_device("ch", "ghost").unwrap();
        assert!(matches!(
            distributor.remove_device("ghost", "mic-a"),
            Err(EngineError::UnknownListener { .. })
        ));
    }

    /// Capture line that replays a fixed set of raw byte reads.
    struct ChunkedLine {
        chunks: VecDeque<Vec<u8>>,
    }

    impl crate::device::CaptureLine for ChunkedLine {
        fn start(&mut self) {}

        fn read_available(&mut self) -> Vec<u8> {
            self.chunks.pop_front().unwrap_or_default()
        }
    }

    #[test]
    fn test_capture_reassembles_samples_torn_across_reads() {
        use crate::frame::encode_be;

        // The first sample is the discarded warm-up read; every chunk
        // boundary after it lands mid-sample.
        let encoded = encode_be(&[9, 1000, -1000, 257, -2]);
        let mut chunks = VecDeque::new();
        chunks.push_back(encoded[..3].to_vec());
        chunks.push_back(encoded[3..7].to_vec());
        chunks.push_back(encoded[7..9].to_vec());
        chunks.push_back(encoded[9..].to_vec());

        let (tx, rx) = queue::bounded(16);
        let (cancel, token) = CancelToken::pair();
        let worker = CaptureWorker {
            device: "mic".to_string(),
            handle: Arc::new(Mutex::new(
                Box::new(ChunkedLine { chunks }) as Box<dyn crate::device::CaptureLine>
            )),
            senders: vec![("ch".to_string(), tx)],
            poll: Duration::from_millis(1),
            queue_timeout: Duration::from_millis(200),
            token,
            events: None,
            level: None,
        };
        let handle = std::thread::spawn(move || worker.run());

        let mut received: Vec<i16> = Vec::new();
        while received.len() < 4 {
            match rx.pop_timeout(Duration::from_secs(5)) {
                crate::queue::Pop::Item(packet) => received.extend(packet),
                other => panic!("capture packet not delivered: {other:?}"),
            }
        }
        assert_eq!(received, vec![1000, -1000, 257, -2]);

        drop(cancel);
        handle.join().unwrap();
    }

    #[test]
    fn test_dry_device_is_a_stream_fault() {
        let backend = MockBackend::new();
        // Enough for a couple of frames, then the device goes silent.
        backend.add_sequence_input("mic", vec![1; 250], 50);
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());

        let faulted = Arc::new(AtomicUsize::new(0));
        let faulted_clone = Arc::clone(&faulted);
        let events = crate::event::event_callback(move |event| {
            if matches!(event, EngineEvent::StreamFault { .. }) {
                faulted_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let distributor = InputDistributor::new(
            registry,
            Arc::clone(&transport),
            EngineConfig::default(),
            Some(events),
            None,
        );

        let listener = CollectingListener::new("ch");
        distributor
            .register_listener(Arc::clone(&listener) as Arc<dyn Listener>, &["mic"])
            .unwrap();

        let token = transport.begin().unwrap();
        distributor.start_capture(&token);

        // The fault both fires the callback and stops the transport.
        wait_for(|| !transport.is_running());
        distributor.stop_capture();
        assert!(faulted.load(Ordering::SeqCst) >= 1);
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition not met within 5s"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
