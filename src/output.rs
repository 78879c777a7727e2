//! Output mixing: per-device mixing threads that pull from routed
//! speakers, and per-device playback threads that feed the hardware
//! line.
//!
//! The mixing side is deliberately backpressured: the playback queue
//! holds a bounded number of samples, and the mixer blocks on a full
//! queue so it never runs ahead of what the device actually plays.
//! Summation happens in i64 and clips exactly once, here, to the
//! 16-bit device range.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{Fetch, Speaker};
use crate::config::EngineConfig;
use crate::device::{DeviceRegistry, PlaybackHandle};
use crate::error::EngineError;
use crate::event::{EngineEvent, EventCallback, LevelCallback};
use crate::frame::{clip, encode_be};
use crate::queue::{self, CancelToken, Pop};
use crate::transport::Transport;

/// Mixes routed speaker streams into output devices.
///
/// Route mutations serialize on one internal lock and reference-count
/// devices through the [`DeviceRegistry`]. Unlike the input side,
/// removing the last route of a device while playing tears that
/// device's threads down immediately; there is no speaker left to
/// feed its mix, so keeping it alive would only fault.
pub struct OutputMixer {
    registry: Arc<DeviceRegistry>,
    transport: Arc<Transport>,
    config: EngineConfig,
    events: Option<EventCallback>,
    level: Option<LevelCallback>,
    inner: Mutex<MixerInner>,
}

#[derive(Default)]
struct MixerInner {
    speakers: HashMap<String, SpeakerEntry>,
    playing: Option<PlaybackSet>,
}

struct SpeakerEntry {
    speaker: Arc<dyn Speaker>,
    devices: HashSet<String>,
}

/// Thread handles for one active playback generation.
struct PlaybackSet {
    devices: HashMap<String, DevicePlayback>,
}

/// One routed device's live mixing and playback threads.
struct DevicePlayback {
    stop: Arc<AtomicBool>,
    mix: JoinHandle<()>,
    play: JoinHandle<()>,
    rx: queue::Receiver<i16>,
}

impl DevicePlayback {
    /// Stops both threads and drains the playback queue.
    ///
    /// The playback thread goes first so the mixer's blocking push has
    /// somewhere to drain into while it notices the stop flag.
    fn shut_down(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.play.join();
        while !self.mix.is_finished() {
            self.rx.drain();
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = self.mix.join();
        self.rx.drain();
    }
}

impl OutputMixer {
    /// Creates a mixer over the given registry and transport.
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
            inner: Mutex::new(MixerInner::default()),
        }
    }

    /// Registers a speaker routed to the given output devices.
    ///
    /// Acquires every device or none, like listener registration.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoDevicesRouted`] for an empty device list,
    /// [`EngineError::DuplicateSpeaker`] for a name collision, plus
    /// any acquisition error from the registry.
    pub fn register_route(
        &self,
        speaker: Arc<dyn Speaker>,
        devices: &[&str],
    ) -> Result<(), EngineError> {
        let name = speaker.name().to_string();
        if devices.is_empty() {
            return Err(EngineError::NoDevicesRouted { name });
        }

        let mut inner = self.inner.lock();
        if inner.speakers.contains_key(&name) {
            return Err(EngineError::DuplicateSpeaker { name });
        }

        // A repeated name in the list counts once.
        let mut devices = devices.to_vec();
        devices.sort_unstable();
        devices.dedup();

        let mut acquired = Vec::new();
        for &device in &devices {
            match self.registry.acquire_output(device) {
                Ok(_) => acquired.push(device),
                Err(e) => {
                    for &done in &acquired {
                        self.registry.release_output(done);
                    }
                    return Err(e);
                }
            }
        }

        let devices = devices.iter().map(|&d| d.to_string()).collect();
        tracing::debug!(speaker = %name, "registered speaker route");
        inner.speakers.insert(name, SpeakerEntry { speaker, devices });
        Ok(())
    }

    /// Routes an existing speaker to one more device.
    ///
    /// Routing to an already-routed device is a no-op. The new device
    /// starts playing at the next playback start.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSpeaker`] or an acquisition error.
    pub fn add_route(&self, speaker: &str, device: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .speakers
            .get_mut(speaker)
            .ok_or_else(|| EngineError::UnknownSpeaker {
                name: speaker.to_string(),
            })?;
        if entry.devices.contains(device) {
            return Ok(());
        }

        self.registry.acquire_output(device)?;
        entry.devices.insert(device.to_string());
        Ok(())
    }

    /// Drops one route, releasing the device reference.
    ///
    /// If this was the last route to a currently playing device, its
    /// mixing and playback threads are torn down before returning.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSpeaker`] if no such speaker exists.
    pub fn remove_route(&self, speaker: &str, device: &str) -> Result<(), EngineError> {
        let teardown = {
            let mut inner = self.inner.lock();
            let entry = inner
                .speakers
                .get_mut(speaker)
                .ok_or_else(|| EngineError::UnknownSpeaker {
                    name: speaker.to_string(),
                })?;
            if !entry.devices.remove(device) {
                return Ok(());
            }
            self.registry.release_output(device);
            self.take_orphaned_playback(&mut inner, device)
        };
        if let Some(playback) = teardown {
            tracing::debug!(device, "last route removed, stopping device playback");
            playback.shut_down();
        }
        Ok(())
    }

    /// Removes a speaker and all of its routes. Unknown speakers are
    /// a no-op.
    pub fn unregister_all_routes(&self, speaker: &str) {
        let teardowns = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.speakers.remove(speaker) else {
                return;
            };
            let mut teardowns = Vec::new();
            for device in &entry.devices {
                self.registry.release_output(device);
                if let Some(playback) = self.take_orphaned_playback(&mut inner, device) {
                    teardowns.push((device.clone(), playback));
                }
            }
            tracing::debug!(speaker, "unregistered speaker routes");
            teardowns
        };
        for (device, playback) in teardowns {
            tracing::debug!(device = %device, "last route removed, stopping device playback");
            playback.shut_down();
        }
    }

    /// Takes the device's live playback out of the active set if no
    /// remaining speaker routes to it.
    fn take_orphaned_playback(
        &self,
        inner: &mut MixerInner,
        device: &str,
    ) -> Option<DevicePlayback> {
        let still_routed = inner
            .speakers
            .values()
            .any(|entry| entry.devices.contains(device));
        if still_routed {
            return None;
        }
        inner
            .playing
            .as_mut()
            .and_then(|set| set.devices.remove(device))
    }

    /// Starts a mixing and playback thread pair for every routed
    /// device, under the given transport generation.
    pub fn start_playback(&self, token: &CancelToken) {
        let mut inner = self.inner.lock();
        if inner.playing.is_some() {
            return;
        }

        // Per-device speaker lists across all routes.
        let mut routed: HashMap<String, Vec<(String, Arc<dyn Speaker>)>> = HashMap::new();
        for (name, entry) in &inner.speakers {
            for device in &entry.devices {
                routed
                    .entry(device.clone())
                    .or_default()
                    .push((name.clone(), Arc::clone(&entry.speaker)));
            }
        }

        let mut devices = HashMap::new();
        for (device, mut speakers) in routed {
            let Some(handle) = self.registry.output_handle(&device) else {
                tracing::error!(device = %device, "output line missing at playback start");
                continue;
            };
            // Stable summation order each cycle.
            speakers.sort_by(|a, b| a.0.cmp(&b.0));

            let (tx, rx) = queue::bounded(self.config.playback_queue_capacity);
            let stop = Arc::new(AtomicBool::new(false));

            let mix_worker = OutMixWorker {
                device: device.clone(),
                speakers,
                tx,
                chunk: self.config.playback_chunk,
                token: token.clone(),
                stop: Arc::clone(&stop),
                transport: Arc::clone(&self.transport),
                events: self.events.clone(),
                level: self.level.clone(),
            };
            let play_worker = PlayWorker {
                device: device.clone(),
                handle,
                rx: rx.clone(),
                chunk: self.config.playback_chunk,
                latency: self.config.playback_latency,
                timeout: self.config.queue_timeout,
                token: token.clone(),
                stop: Arc::clone(&stop),
                transport: Arc::clone(&self.transport),
                events: self.events.clone(),
            };

            let mix = spawn_named(format!("outmix-{device}"), move || mix_worker.run());
            let play = spawn_named(format!("play-{device}"), move || play_worker.run());
            devices.insert(device, DevicePlayback { stop, mix, play, rx });
        }

        inner.playing = Some(PlaybackSet { devices });
        tracing::debug!("output mixing started");
    }

    /// Stops every device's thread pair and drains the playback
    /// queues.
    ///
    /// The transport generation must already be cancelled; this only
    /// reaps.
    pub fn stop_playback(&self) {
        let set = {
            let mut inner = self.inner.lock();
            inner.playing.take()
        };
        let Some(set) = set else {
            return;
        };
        for (_, playback) in set.devices {
            playback.shut_down();
        }
        tracing::debug!("output mixing stopped");
    }

    /// Names of the devices any speaker is currently routed to.
    pub fn routed_devices(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .speakers
            .values()
            .flat_map(|entry| entry.devices.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn spawn_named(name: String, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .unwrap_or_else(|e| panic!("failed to spawn thread '{name}': {e}"))
}

/// One device's speaker feed.
struct SpeakerFeed {
    name: String,
    speaker: Arc<dyn Speaker>,
    buffer: VecDeque<i32>,
}

/// One routed device's mixing loop.
struct OutMixWorker {
    device: String,
    speakers: Vec<(String, Arc<dyn Speaker>)>,
    tx: queue::Sender<i16>,
    chunk: usize,
    token: CancelToken,
    stop: Arc<AtomicBool>,
    transport: Arc<Transport>,
    events: Option<EventCallback>,
    level: Option<LevelCallback>,
}

impl OutMixWorker {
    fn run(self) {
        let mut feeds: Vec<SpeakerFeed> = self
            .speakers
            .iter()
            .map(|(name, speaker)| SpeakerFeed {
                name: name.clone(),
                speaker: Arc::clone(speaker),
                buffer: VecDeque::new(),
            })
            .collect();

        // Prefill one frame per speaker before the first sample.
        for feed in &mut feeds {
            if !self.refill(feed) {
                return;
            }
        }

        let mut batch: Vec<i16> = Vec::with_capacity(self.chunk);
        loop {
            if self.token.is_cancelled() || self.stop.load(Ordering::SeqCst) {
                return;
            }

            let mut sum: i64 = 0;
            for feed in &mut feeds {
                if feed.buffer.is_empty() && !self.refill(feed) {
                    return;
                }
                if let Some(sample) = feed.buffer.pop_front() {
                    sum += i64::from(sample);
                }
            }
            let sample = clip(sum);
            if self.tx.push_blocking(sample, &self.token).is_err() {
                return;
            }

            if let Some(level) = &self.level {
                batch.push(sample);
                if batch.len() >= self.chunk {
                    level(&self.device, &batch, false);
                    batch.clear();
                }
            }
        }
    }

    /// Pulls the speaker's next frame into its local buffer.
    ///
    /// Returns `false` if the loop must exit: cancellation, device
    /// teardown, or a closed speaker during active playback (a fatal
    /// stream fault).
    fn refill(&self, feed: &mut SpeakerFeed) -> bool {
        loop {
            // Empty frames are legal and skipped; the check here keeps
            // a speaker serving nothing but empties from pinning the
            // thread past a stop.
            if self.token.is_cancelled() || self.stop.load(Ordering::SeqCst) {
                return false;
            }
            match feed.speaker.fetch_data() {
                Fetch::Frame(frame) => {
                    if frame.is_empty() {
                        continue;
                    }
                    feed.buffer.extend(frame.samples());
                    return true;
                }
                Fetch::Closed => {
                    // A stop issued while we were blocked in fetch_data
                    // is a normal teardown, not a fault.
                    if self.token.is_cancelled() || self.stop.load(Ordering::SeqCst) {
                        return false;
                    }
                    tracing::error!(
                        device = %self.device,
                        speaker = %feed.name,
                        "speaker closed during playback, stopping transport"
                    );
                    if let Some(events) = &self.events {
                        events(EngineEvent::StreamFault {
                            device: self.device.clone(),
                        });
                    }
                    self.transport.stop();
                    return false;
                }
            }
        }
    }
}

/// One routed device's playback loop.
struct PlayWorker {
    device: String,
    handle: PlaybackHandle,
    rx: queue::Receiver<i16>,
    chunk: usize,
    latency: Duration,
    timeout: Duration,
    token: CancelToken,
    stop: Arc<AtomicBool>,
    transport: Arc<Transport>,
    events: Option<EventCallback>,
}

impl PlayWorker {
    fn run(mut self) {
        // Let the mixer build up a cushion before the first write.
        if self.token.wait(self.latency) {
            return;
        }

        let mut pending: Vec<i16> = Vec::with_capacity(self.chunk);
        loop {
            if self.token.is_cancelled() || self.stop.load(Ordering::SeqCst) {
                return;
            }
            match self.rx.pop_cancellable(self.timeout, &self.token) {
                Pop::Item(sample) => {
                    pending.push(sample);
                    while pending.len() < self.chunk {
                        match self.rx.try_pop() {
                            Some(sample) => pending.push(sample),
                            None => break,
                        }
                    }
                    if pending.len() >= self.chunk && !self.write_chunk(&mut pending) {
                        return;
                    }
                }
                // A partial chunk persists across timed-out pops.
                Pop::TimedOut => continue,
                Pop::Closed | Pop::Cancelled => return,
            }
        }
    }

    fn write_chunk(&mut self, pending: &mut Vec<i16>) -> bool {
        let bytes = encode_be(pending);
        pending.clear();
        if let Err(e) = self.handle.lock().write(&bytes) {
            tracing::error!(
                device = %self.device,
                error = %e,
                "playback write failed, stopping transport"
            );
            if let Some(events) = &self.events {
                events(EngineEvent::StreamFault {
                    device: self.device.clone(),
                });
            }
            self.transport.stop();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockBackend, MockOutputHandle};
    use crate::frame::Frame;
    use std::sync::atomic::AtomicUsize;

    /// Speaker that hands out the same frame forever.
    struct ConstantSpeaker {
        name: String,
        value: i32,
        frame_len: usize,
    }

    impl Speaker for ConstantSpeaker {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch_data(&self) -> Fetch {
            Fetch::Frame(Frame::new(vec![self.value; self.frame_len]))
        }
    }

    fn constant(name: &str, value: i32) -> Arc<dyn Speaker> {
        Arc::new(ConstantSpeaker {
            name: name.to_string(),
            value,
            frame_len: 100,
        })
    }

    /// Speaker that serves a fixed number of frames, then closes.
    struct FiniteSpeaker {
        name: String,
        frames_left: AtomicUsize,
    }

    impl Speaker for FiniteSpeaker {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch_data(&self) -> Fetch {
            let left = self.frames_left.load(Ordering::SeqCst);
            if left == 0 {
                return Fetch::Closed;
            }
            self.frames_left.store(left - 1, Ordering::SeqCst);
            Fetch::Frame(Frame::silence(100))
        }
    }

    struct Fixture {
        mixer: OutputMixer,
        transport: Arc<Transport>,
        registry: Arc<DeviceRegistry>,
        output: MockOutputHandle,
        faults: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let backend = MockBackend::new();
        let output = backend.add_output("spk");
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());
        let faults = Arc::new(AtomicUsize::new(0));
        let faults_clone = Arc::clone(&faults);
        let events = crate::event::event_callback(move |event| {
            if matches!(event, EngineEvent::StreamFault { .. }) {
                faults_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mixer = OutputMixer::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            EngineConfig::default(),
            Some(events),
            None,
        );
        Fixture {
            mixer,
            transport,
            registry,
            output,
            faults,
        }
    }

    #[test]
    fn test_register_requires_devices() {
        let f = fixture();
        assert!(matches!(
            f.mixer.register_route(constant("ch", 1), &[]),
            Err(EngineError::NoDevicesRouted { .. })
        ));
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let f = fixture();
        f.mixer.register_route(constant("ch", 1), &["spk"]).unwrap();
        assert!(matches!(
            f.mixer.register_route(constant("ch", 1), &["spk"]),
            Err(EngineError::DuplicateSpeaker { .. })
        ));
    }

    #[test]
    fn test_unregister_releases_devices() {
        let f = fixture();
        f.mixer.register_route(constant("ch", 1), &["spk"]).unwrap();
        assert!(f.registry.is_output_open("spk"));
        f.mixer.unregister_all_routes("ch");
        assert!(!f.registry.is_output_open("spk"));
    }

    #[test]
    fn test_add_route_acquires_and_deduplicates() {
        let backend = MockBackend::new();
        let _a = backend.add_output("spk-a");
        let _b = backend.add_output("spk-b");
        let registry = Arc::new(DeviceRegistry::new(Box::new(backend)));
        let transport = Arc::new(Transport::new());
        let mixer = OutputMixer::new(
            Arc::clone(&registry),
            transport,
            EngineConfig::default(),
            None,
            None,
        );

        mixer.register_route(constant("ch", 1), &["spk-a"]).unwrap();
        mixer.add_route("ch", "spk-b").unwrap();
        assert!(registry.is_output_open("spk-b"));
        assert_eq!(mixer.routed_devices(), vec!["spk-a", "spk-b"]);

        // Re-routing to an already-routed device is a no-op, not a
        // second hold.
        mixer.add_route("ch", "spk-b").unwrap();
        mixer.remove_route("ch", "spk-b").unwrap();
        assert!(!registry.is_output_open("spk-b"));

        assert!(matches!(
            mixer.add_route("ghost", "spk-a"),
            Err(EngineError::UnknownSpeaker { .. })
        ));
    }

    #[test]
    fn test_two_speakers_sum_and_clip() {
        let f = fixture();
        f.mixer
            .register_route(constant("a", 20_000), &["spk"])
            .unwrap();
        f.mixer
            .register_route(constant("b", 20_000), &["spk"])
            .unwrap();

        let token = f.transport.begin().unwrap();
        f.mixer.start_playback(&token);

        wait_for(|| f.output.written_samples().len() >= 100);
        f.transport.stop();
        f.mixer.stop_playback();

        let written = f.output.written_samples();
        assert!(written.iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn test_closed_speaker_is_a_stream_fault() {
        let f = fixture();
        let speaker = Arc::new(FiniteSpeaker {
            name: "ch".to_string(),
            frames_left: AtomicUsize::new(3),
        });
        f.mixer
            .register_route(speaker as Arc<dyn Speaker>, &["spk"])
            .unwrap();

        let token = f.transport.begin().unwrap();
        f.mixer.start_playback(&token);

        wait_for(|| !f.transport.is_running());
        f.mixer.stop_playback();
        assert!(f.faults.load(Ordering::SeqCst) >= 1);
    }

    /// Speaker that never has data ready: every fetch is an empty frame.
    struct DrySpeaker {
        name: String,
    }

    impl Speaker for DrySpeaker {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch_data(&self) -> Fetch {
            Fetch::Frame(Frame::new(Vec::new()))
        }
    }

    /// Speaker that blocks for a while, then reports itself closed.
    struct SleepyClosedSpeaker {
        name: String,
    }

    impl Speaker for SleepyClosedSpeaker {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch_data(&self) -> Fetch {
            std::thread::sleep(Duration::from_millis(200));
            Fetch::Closed
        }
    }

    #[test]
    fn test_stop_completes_with_empty_frame_speaker() {
        let f = fixture();
        let speaker = Arc::new(DrySpeaker {
            name: "ch".to_string(),
        });
        f.mixer
            .register_route(speaker as Arc<dyn Speaker>, &["spk"])
            .unwrap();

        let token = f.transport.begin().unwrap();
        f.mixer.start_playback(&token);
        std::thread::sleep(Duration::from_millis(50));
        f.transport.stop();

        let Fixture { mixer, faults, .. } = f;
        let mixer = Arc::new(mixer);
        let done = Arc::new(AtomicBool::new(false));
        let worker = Arc::clone(&mixer);
        let finished = Arc::clone(&done);
        std::thread::spawn(move || {
            worker.stop_playback();
            finished.store(true, Ordering::SeqCst);
        });

        wait_for(|| done.load(Ordering::SeqCst));
        assert_eq!(faults.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_during_blocked_fetch_is_not_a_fault() {
        let f = fixture();
        let speaker = Arc::new(SleepyClosedSpeaker {
            name: "ch".to_string(),
        });
        f.mixer
            .register_route(speaker as Arc<dyn Speaker>, &["spk"])
            .unwrap();

        let token = f.transport.begin().unwrap();
        f.mixer.start_playback(&token);

        std::thread::sleep(Duration::from_millis(50));
        f.transport.stop();
        f.mixer.stop_playback();

        assert_eq!(f.faults.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removing_last_route_stops_device() {
        let f = fixture();
        f.mixer.register_route(constant("ch", 1), &["spk"]).unwrap();

        let token = f.transport.begin().unwrap();
        f.mixer.start_playback(&token);
        wait_for(|| !f.output.written_samples().is_empty());

        f.mixer.remove_route("ch", "spk").unwrap();
        assert!(!f.registry.is_output_open("spk"));

        f.transport.stop();
        f.mixer.stop_playback();
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
