//! Signal router: fans one frame stream out to several consumers.
//!
//! Every consumer gets its own bounded queue and delivery thread, so
//! one slow consumer never stalls its siblings; a full queue drops
//! the frame for that consumer only. Consumers receive deep copies
//! (the last one gets the original by move) and may mutate their
//! frame freely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::channel::Listener;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::frame::Frame;
use crate::queue::{self, Pop};

/// Fan-out stage between a frame producer and its consumers.
///
/// Unlike capture and playback, the router's membership is fully
/// dynamic: consumers can be added and removed while frames are
/// flowing, each behind its own stop flag.
pub struct SignalRouter {
    config: EngineConfig,
    inner: Mutex<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    consumers: Vec<Consumer>,
    playing: bool,
}

struct Consumer {
    name: String,
    listener: Arc<dyn Listener>,
    tx: queue::Sender<Frame>,
    rx: queue::Receiver<Frame>,
    live: Option<LiveConsumer>,
}

struct LiveConsumer {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl LiveConsumer {
    fn shut_down(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.thread.join();
    }
}

impl SignalRouter {
    /// Creates an empty router.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RouterInner::default()),
        }
    }

    /// Adds a consumer. Safe while frames are flowing; a playing
    /// router starts the consumer's delivery thread immediately.
    ///
    /// # Errors
    ///
    /// [`EngineError::DuplicateListener`] if a consumer with the same
    /// name is already attached.
    pub fn add_output(&self, listener: Arc<dyn Listener>) -> Result<(), EngineError> {
        let name = listener.name().to_string();
        let mut inner = self.inner.lock();
        if inner.consumers.iter().any(|c| c.name == name) {
            return Err(EngineError::DuplicateListener { name });
        }

        let (tx, rx) = queue::bounded(self.config.router_queue_capacity);
        let live = inner.playing.then(|| {
            spawn_delivery(
                name.clone(),
                Arc::clone(&listener),
                rx.clone(),
                self.config.queue_timeout,
            )
        });
        tracing::debug!(consumer = %name, "router output added");
        inner.consumers.push(Consumer {
            name,
            listener,
            tx,
            rx,
            live,
        });
        Ok(())
    }

    /// Removes a consumer, stopping its delivery thread and draining
    /// its queue. Unknown names are a no-op.
    pub fn remove_output(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            let position = inner.consumers.iter().position(|c| c.name == name);
            position.map(|i| inner.consumers.remove(i))
        };
        if let Some(consumer) = removed {
            if let Some(live) = consumer.live {
                live.shut_down();
            }
            consumer.rx.drain();
            tracing::debug!(consumer = %name, "router output removed");
        }
    }

    /// Distributes one frame to every attached consumer.
    ///
    /// Each consumer other than the last receives a deep copy; the
    /// last receives the frame itself. A consumer whose queue stays
    /// full past the push timeout loses this frame, with a warning,
    /// and its siblings are unaffected. Frames arriving while the
    /// router is stopped are discarded.
    pub fn put_data(&self, frame: Frame) {
        let mut targets: Vec<(String, queue::Sender<Frame>)> = {
            let inner = self.inner.lock();
            if !inner.playing {
                return;
            }
            inner
                .consumers
                .iter()
                .map(|c| (c.name.clone(), c.tx.clone()))
                .collect()
        };
        let Some((last_name, last_tx)) = targets.pop() else {
            return;
        };

        let timeout = self.config.queue_timeout;
        for (name, tx) in targets {
            if tx.push_timeout(frame.clone(), timeout).is_err() {
                tracing::warn!(consumer = %name, "router queue full, frame dropped");
            }
        }
        // The last consumer takes the original by move.
        if last_tx.push_timeout(frame, timeout).is_err() {
            tracing::warn!(consumer = %last_name, "router queue full, frame dropped");
        }
    }

    /// Starts a delivery thread per consumer.
    pub fn play(&self) {
        let mut inner = self.inner.lock();
        if inner.playing {
            return;
        }
        inner.playing = true;
        let timeout = self.config.queue_timeout;
        for consumer in &mut inner.consumers {
            consumer.live = Some(spawn_delivery(
                consumer.name.clone(),
                Arc::clone(&consumer.listener),
                consumer.rx.clone(),
                timeout,
            ));
        }
        tracing::debug!("router playing");
    }

    /// Stops all delivery threads and drains every queue.
    pub fn stop(&self) {
        let stopped = {
            let mut inner = self.inner.lock();
            if !inner.playing {
                return;
            }
            inner.playing = false;
            inner
                .consumers
                .iter_mut()
                .filter_map(|c| c.live.take().map(|live| (live, c.rx.clone())))
                .collect::<Vec<_>>()
        };
        for (live, rx) in stopped {
            live.shut_down();
            rx.drain();
        }
        tracing::debug!("router stopped");
    }

    /// Names of the currently attached consumers, in fan-out order.
    pub fn outputs(&self) -> Vec<String> {
        self.inner
            .lock()
            .consumers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }
}

fn spawn_delivery(
    name: String,
    listener: Arc<dyn Listener>,
    rx: queue::Receiver<Frame>,
    timeout: std::time::Duration,
) -> LiveConsumer {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);
    let thread = std::thread::Builder::new()
        .name(format!("route-{name}"))
        .spawn(move || {
            while !stop_clone.load(Ordering::SeqCst) {
                match rx.pop_timeout(timeout) {
                    Pop::Item(frame) => listener.put_data(frame),
                    Pop::TimedOut => continue,
                    Pop::Closed | Pop::Cancelled => return,
                }
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn thread 'route-{name}': {e}"));
    LiveConsumer { stop, thread }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RecordingConsumer {
        name: String,
        frames: Mutex<Vec<Frame>>,
    }

    impl RecordingConsumer {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().clone()
        }
    }

    impl Listener for RecordingConsumer {
        fn name(&self) -> &str {
            &self.name
        }

        fn put_data(&self, frame: Frame) {
            self.frames.lock().push(frame);
        }
    }

    /// Consumer that zeroes every frame it receives in place.
    struct MutatingConsumer {
        name: String,
    }

    impl Listener for MutatingConsumer {
        fn name(&self) -> &str {
            &self.name
        }

        fn put_data(&self, mut frame: Frame) {
            for sample in frame.samples_mut() {
                *sample = 0;
            }
        }
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

    #[test]
    fn test_duplicate_output_rejected() {
        let router = SignalRouter::new(EngineConfig::default());
        router.add_output(RecordingConsumer::new("a")).unwrap();
        assert!(matches!(
            router.add_output(RecordingConsumer::new("a")),
            Err(EngineError::DuplicateListener { .. })
        ));
    }

    #[test]
    fn test_every_consumer_receives_every_frame() {
        let router = SignalRouter::new(EngineConfig::default());
        let a = RecordingConsumer::new("a");
        let b = RecordingConsumer::new("b");
        router
            .add_output(Arc::clone(&a) as Arc<dyn Listener>)
            .unwrap();
        router
            .add_output(Arc::clone(&b) as Arc<dyn Listener>)
            .unwrap();

        router.play();
        for i in 0..5 {
            router.put_data(Frame::new(vec![i; 10]));
        }
        wait_for(|| a.frames().len() == 5 && b.frames().len() == 5);
        router.stop();

        for (i, frame) in a.frames().iter().enumerate() {
            assert_eq!(frame.samples(), vec![i as i32; 10]);
        }
        assert_eq!(a.frames().len(), b.frames().len());
    }

    #[test]
    fn test_consumers_get_isolated_copies() {
        let router = SignalRouter::new(EngineConfig::default());
        let mutator = Arc::new(MutatingConsumer {
            name: "mutator".to_string(),
        });
        let witness = RecordingConsumer::new("witness");
        router.add_output(mutator as Arc<dyn Listener>).unwrap();
        router
            .add_output(Arc::clone(&witness) as Arc<dyn Listener>)
            .unwrap();

        router.play();
        router.put_data(Frame::new(vec![7; 10]));
        wait_for(|| witness.frames().len() == 1);
        router.stop();

        // The mutator zeroed its copy; the witness still sees 7s.
        assert_eq!(witness.frames()[0].samples(), vec![7; 10]);
    }

    #[test]
    fn test_add_and_remove_while_playing() {
        let router = SignalRouter::new(EngineConfig::default());
        let a = RecordingConsumer::new("a");
        router
            .add_output(Arc::clone(&a) as Arc<dyn Listener>)
            .unwrap();
        router.play();

        router.put_data(Frame::silence(10));
        wait_for(|| a.frames().len() == 1);

        let b = RecordingConsumer::new("b");
        router
            .add_output(Arc::clone(&b) as Arc<dyn Listener>)
            .unwrap();
        router.put_data(Frame::silence(10));
        wait_for(|| b.frames().len() == 1 && a.frames().len() == 2);

        router.remove_output("a");
        router.put_data(Frame::silence(10));
        wait_for(|| b.frames().len() == 2);
        assert_eq!(a.frames().len(), 2);

        router.stop();
    }

    #[test]
    fn test_frames_discarded_while_stopped() {
        let router = SignalRouter::new(EngineConfig::default());
        let a = RecordingConsumer::new("a");
        router
            .add_output(Arc::clone(&a) as Arc<dyn Listener>)
            .unwrap();

        router.put_data(Frame::silence(10));
        router.play();
        std::thread::sleep(Duration::from_millis(50));
        router.stop();
        assert!(a.frames().is_empty());
    }
}
