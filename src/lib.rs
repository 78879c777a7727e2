//! # uspro-engine
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time audio distribution and mixing engine.
//!
//! `uspro-engine` captures from any number of input devices, mixes
//! per-listener combinations of them into fixed-size frames, fans
//! frame streams out through signal routers, and mixes routed streams
//! back onto output devices. Wall-clock-paced virtual sources (sine
//! generators, WAV files) plug in beside hardware devices under the
//! same names and lifecycle.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use uspro_engine::{Engine, Generator};
//!
//! let engine = Engine::builder()
//!     .on_event(|e| tracing::warn!(?e, "engine event"))
//!     .build();
//!
//! // A 440 Hz test tone that behaves exactly like a microphone.
//! engine.registry().register_virtual_input(
//!     "tone",
//!     Box::new(Generator::new(440.0, 0.5)?),
//! );
//!
//! engine.input().register_listener(my_channel, &["tone"])?;
//! engine.output().register_route(my_channel_out, &["Built-in Output"])?;
//! engine.start()?;
//! ```
//!
//! ## Architecture
//!
//! All stages run on plain threads joined at stop:
//!
//! - **Capture threads**: one per open input device, probing the line
//!   and fanning sample packets out to subscribed listeners
//! - **Mixing threads**: one per listener and one per routed output
//!   device, summing streams pointwise
//! - **Playback threads**: one per routed output device, feeding the
//!   hardware line in fixed chunks
//!
//! Bounded queues connect the stages. The capture side drops on
//! overrun so a slow listener never stalls the hardware; the playback
//! side blocks so mixing never runs ahead of the device.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod channel;
mod config;
pub mod device;
mod engine;
mod error;
mod event;
mod frame;
mod input;
mod output;
mod queue;
mod router;
pub mod source;
mod transport;

pub use channel::{Fetch, Listener, Speaker};
pub use config::{EngineConfig, BYTES_PER_SAMPLE, SAMPLE_RATE};
pub use device::{DeviceRegistry, HostBackend, MockBackend};
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use event::{event_callback, level_callback, EngineEvent, EventCallback, LevelCallback};
pub use frame::{decode_be, encode_be, Frame};
pub use input::InputDistributor;
pub use output::OutputMixer;
pub use queue::{CancelToken, Pop, PushError};
pub use router::SignalRouter;
pub use source::{FileSource, Generator, VirtualSource};
pub use transport::Transport;
