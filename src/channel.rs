//! Collaborator traits for the channel / plugin-graph boundary.
//!
//! The signal-processing stages themselves live outside this crate.
//! The engine only needs two contracts: a [`Listener`] accepts mixed
//! input frames, a [`Speaker`] supplies frames toward an output
//! device. A channel typically implements both and runs a plugin
//! graph in between.

use crate::frame::Frame;

/// A consumer of mixed input frames.
///
/// The [`InputDistributor`](crate::InputDistributor) calls
/// [`put_data`](Listener::put_data) once per mixed frame, from the
/// listener's dedicated mixing thread. Implementations route the
/// frame into their processing graph; they should hand it off quickly
/// rather than process inline, since a slow listener backs up its own
/// queues only until they overrun.
///
/// # Example
///
/// ```
/// use uspro_engine::{Frame, Listener};
///
/// struct PrintChannel;
///
/// impl Listener for PrintChannel {
///     fn name(&self) -> &str {
///         "print"
///     }
///
///     fn put_data(&self, frame: Frame) {
///         println!("received {} samples", frame.len());
///     }
/// }
/// ```
pub trait Listener: Send + Sync {
    /// Human-readable name, used as the registration key and in logs.
    fn name(&self) -> &str;

    /// Accepts one mixed frame.
    fn put_data(&self, frame: Frame);
}

/// Result of a [`Speaker::fetch_data`] call.
///
/// An explicit type instead of a null sentinel, so "the speaker has
/// been torn down" is distinguishable from ordinary data flow. During
/// active playback a [`Closed`](Fetch::Closed) fetch is a stream
/// fault and stops the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    /// The next frame of the speaker's stream.
    Frame(Frame),
    /// The speaker has no more data and never will.
    Closed,
}

/// A producer of frames routed toward output devices.
///
/// The [`OutputMixer`](crate::OutputMixer) pulls via
/// [`fetch_data`](Speaker::fetch_data) whenever this speaker's local
/// buffer runs dry. A live speaker must always return a frame:
/// silence is a valid frame, absence is a fault.
pub trait Speaker: Send + Sync {
    /// Human-readable name, used as the registration key and in logs.
    fn name(&self) -> &str;

    /// Returns the speaker's next frame, or [`Fetch::Closed`].
    fn fetch_data(&self) -> Fetch;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        received: AtomicUsize,
    }

    impl Listener for CountingListener {
        fn name(&self) -> &str {
            "counter"
        }

        fn put_data(&self, _frame: Frame) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_object_safety() {
        let listener: Box<dyn Listener> = Box::new(CountingListener {
            received: AtomicUsize::new(0),
        });
        listener.put_data(Frame::silence(100));
        assert_eq!(listener.name(), "counter");
    }

    struct SilenceSpeaker;

    impl Speaker for SilenceSpeaker {
        fn name(&self) -> &str {
            "silence"
        }

        fn fetch_data(&self) -> Fetch {
            Fetch::Frame(Frame::silence(100))
        }
    }

    #[test]
    fn test_speaker_object_safety() {
        let speaker: Box<dyn Speaker> = Box::new(SilenceSpeaker);
        match speaker.fetch_data() {
            Fetch::Frame(frame) => assert_eq!(frame.len(), 100),
            Fetch::Closed => panic!("expected a frame"),
        }
    }
}
