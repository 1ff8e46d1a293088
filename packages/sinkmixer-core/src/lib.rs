//! Sink Mixing Engine - the real-time per-sink pipeline that aggregates
//! processed PCM chunks arriving from many independent source pipelines,
//! mixes them on a sink-defined cadence, and fans the mixed result out to a
//! primary network destination plus an arbitrary population of secondary
//! listeners.
//!
//! # Architecture
//!
//! - [`chunk`]: the `ProcessedChunk`/`ReadyChunk` types flowing from source
//!   pipelines through the scheduler into the mixer.
//! - [`queue`]: bounded, mutex-guarded hand-off of chunks to a source's
//!   collector thread.
//! - [`clock`]: one driver thread per unique `(sample_rate, channels,
//!   bit_depth)` tuple, shared by every mixer registered against it.
//! - [`scheduler`]: per-source collector threads draining into per-source
//!   ready deques.
//! - [`rate_controller`]: EMA-smoothed backlog measurement and upstream
//!   rate-scale commands.
//! - [`mixer`]: the sink mixer core itself, plus saturating mix, CSRC
//!   aggregation, stereo downmix, and bit-depth downscaling.
//! - [`mp3_lane`]: the dedicated MP3 encoder worker thread.
//! - [`listener`]: the thread-safe listener fan-out dispatcher.
//! - [`sender`]: the polymorphic `NetworkSender` family.
//! - [`rtp`]: RTP session core plus RTCP and SAP side-channels.
//! - [`context`]: the shared, explicitly-injected registry handed to every
//!   mixer (clock manager, settings, SSRC allocation).
//! - [`config`]: per-sink configuration and validation.
//! - [`settings`]: shared, read-mostly mixer tuning knobs.
//! - [`error`]: centralized error types.
#![warn(clippy::all)]

pub mod chunk;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod listener;
pub mod mixer;
pub mod mp3_lane;
pub mod protocol_constants;
pub mod queue;
pub mod rate_controller;
pub mod rtp;
pub mod scheduler;
pub mod sender;
pub mod settings;
pub mod utils;

pub use chunk::{ProcessedChunk, ReadyChunk};
pub use clock::{ClockConditionHandle, ClockKey, ClockManager};
pub use config::{MultiDeviceReceiver, ProtocolVariant, SinkConfig, SpeakerMatrix};
pub use context::SharedContext;
pub use error::{ConfigError, ErrorCode, RuntimeIssue, SenderError};
pub use listener::{ListenerDispatcher, ListenerSender};
pub use mixer::mixing::{saturating_mix_into, CsrcSet};
pub use mixer::stereo::downmix_to_stereo;
pub use mixer::{MixerStats, SinkMixer};
pub use mp3_lane::{Mp3EncoderLane, Mp3EncoderPort, Mp3OutputQueue};
pub use queue::BoundedChunkQueue;
pub use rate_controller::{RateCommand, RateController};
pub use scheduler::{MixScheduler, SourceLane, SourceLaneStats};
pub use sender::{NetworkSender, OpusEncoderPort};
pub use settings::AudioEngineSettings;
pub use utils::{now_millis, validate_sink_destination_ip, IpValidationError};
