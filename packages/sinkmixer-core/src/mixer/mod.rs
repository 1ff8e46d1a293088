//! Sink mixer core: waits on the shared clock, harvests ready chunks from
//! the scheduler, mixes them with saturation, downscales to the sink's
//! output format, drains the staging ring through the primary sender, and
//! side-chains a stereo buffer to listeners and the MP3 lane.

pub mod downscale;
pub mod mixing;
pub mod stereo;

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, info, warn};

use crate::chunk::ReadyChunk;
use crate::clock::{ClockConditionHandle, ClockKey};
use crate::config::SinkConfig;
use crate::context::SharedContext;
use crate::error::RuntimeIssue;
use crate::listener::ListenerDispatcher;
use crate::mp3_lane::Mp3EncoderLane;
use crate::queue::BoundedChunkQueue;
use crate::rate_controller::RateController;
use crate::scheduler::MixScheduler;
use crate::sender::NetworkSender;

use downscale::{bytes_per_sample, downscale_into, StagingRing};
use mixing::{saturating_mix_into, CsrcSet};
use stereo::downmix_to_stereo;

/// Number of mixer chunks the staging ring holds headroom for, per the
/// component design's "8x chunk-sized staging ring" sizing.
const STAGING_RING_MULTIPLE: usize = 8;

/// Underrun hold state machine: once every active source goes quiet, the
/// mixer keeps emitting silence for `underrun_hold_timeout_ms` before it
/// stops mixing entirely, rather than cutting dead air immediately.
enum HoldState {
    Normal,
    Holding { deadline: Instant },
}

/// Running counters exposed for telemetry. Cheap to snapshot; every field
/// is updated from the single mixer thread, so no synchronization is
/// needed beyond what `Arc<SinkMixer>` callers already imply.
#[derive(Debug, Default, Clone, Copy)]
pub struct MixerStats {
    pub ticks_processed: u64,
    pub chunks_discarded_shape_mismatch: u64,
    pub frames_dispatched: u64,
    pub underrun_events: u64,
    pub csrc_truncation_events: u64,
    pub staging_overflow_events: u64,
}

struct MixerCounters {
    ticks_processed: AtomicU64,
    chunks_discarded_shape_mismatch: AtomicU64,
    frames_dispatched: AtomicU64,
    underrun_events: AtomicU64,
}

impl MixerCounters {
    fn new() -> Self {
        Self {
            ticks_processed: AtomicU64::new(0),
            chunks_discarded_shape_mismatch: AtomicU64::new(0),
            frames_dispatched: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
        }
    }
}

/// The per-sink real-time pipeline described by the component design's
/// "Sink Mixer Core": one instance per configured [`SinkConfig`], driven by
/// its own thread, sharing the clock manager and settings via
/// [`SharedContext`].
pub struct SinkMixer {
    config: SinkConfig,
    context: Arc<SharedContext>,
    scheduler: Arc<MixScheduler>,
    rate_controller: Arc<RateController>,
    dispatcher: Arc<ListenerDispatcher>,
    mp3_lane: Arc<Mp3EncoderLane>,
    sender: parking_lot::Mutex<Box<dyn NetworkSender>>,
    frames_per_chunk: u32,
    /// Current playback channel count, sample rate and bit depth. Normally
    /// fixed to `config`'s values for the mixer's lifetime; a SystemAudio
    /// sender that renegotiates its format during `setup` can shift these
    /// once, via [`Self::update_playback_format_from_sender`].
    channels: AtomicU16,
    bit_depth: AtomicU16,
    sample_rate: AtomicU32,
    chunk_duration_ms: parking_lot::Mutex<f64>,
    counters: MixerCounters,
    csrc_truncation_events: AtomicU64,
    staging_overflow_events: AtomicU64,
    stop: Arc<AtomicBool>,
    worker: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SinkMixer {
    /// Validates `config`, registers a clock condition for its
    /// `(sample_rate, channels, bit_depth)` tuple, and constructs the
    /// scheduler/rate controller/dispatcher/MP3 lane. The mixer does not
    /// start its tick thread until [`Self::start`] is called.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SinkConfig,
        context: Arc<SharedContext>,
        frames_per_chunk: u32,
        mut sender: Box<dyn NetworkSender>,
        mp3_encoder: Option<Box<dyn crate::mp3_lane::Mp3EncoderPort>>,
    ) -> Result<Arc<Self>, crate::error::SenderError> {
        config.validate()?;

        if !sender.setup() {
            return Err(crate::error::SenderError::SocketBind {
                sink_id: config.sink_id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "sender setup failed"),
            });
        }

        let settings = context.settings();
        let chunk_duration_ms = config.chunk_duration_ms(frames_per_chunk);

        let scheduler = Arc::new(MixScheduler::new(
            settings.max_ready_queue_duration_ms,
            settings.max_ready_chunks_per_source,
            settings.max_ready_chunks_per_source.max(16),
        ));
        let rate_controller = Arc::new(RateController::new());
        let dispatcher = Arc::new(ListenerDispatcher::new());
        let mp3_lane = Arc::new(Mp3EncoderLane::new(
            mp3_encoder,
            settings.mp3_output_queue_max_size,
        ));

        let mixer = Arc::new(Self {
            frames_per_chunk,
            channels: AtomicU16::new(config.output_channels),
            bit_depth: AtomicU16::new(config.output_bit_depth),
            sample_rate: AtomicU32::new(config.output_sample_rate),
            chunk_duration_ms: parking_lot::Mutex::new(chunk_duration_ms),
            config,
            context,
            scheduler,
            rate_controller,
            dispatcher,
            mp3_lane,
            sender: parking_lot::Mutex::new(sender),
            counters: MixerCounters::new(),
            csrc_truncation_events: AtomicU64::new(0),
            staging_overflow_events: AtomicU64::new(0),
            stop: Arc::new(AtomicBool::new(false)),
            worker: parking_lot::Mutex::new(None),
        });

        mixer.update_playback_format_from_sender();

        Ok(mixer)
    }

    /// Queries the sender for a renegotiated `(sample_rate, channels,
    /// bit_depth)` (see [`NetworkSender::renegotiated_format`]) and, if it
    /// returned one, updates the mixer's channel count, bit depth, sample
    /// rate and chunk duration to match. Only a SystemAudio sender ever
    /// renegotiates; every other variant's default `renegotiated_format`
    /// returns `None` and this is a no-op. Called once from [`Self::new`]
    /// right after `setup`, before the clock condition is registered in
    /// [`Self::run`], so the tick thread always sees the final format.
    pub fn update_playback_format_from_sender(&self) {
        let Some((sample_rate, channels, bit_depth)) = self.sender.lock().renegotiated_format()
        else {
            return;
        };

        self.channels.store(channels, Ordering::Release);
        self.bit_depth.store(bit_depth, Ordering::Release);
        self.sample_rate.store(sample_rate, Ordering::Release);
        *self.chunk_duration_ms.lock() =
            f64::from(self.frames_per_chunk) * 1000.0 / f64::from(sample_rate.max(1));

        info!(
            "sink '{}': sender renegotiated playback format to {}Hz/{}ch/{}bit",
            self.config.sink_id, sample_rate, channels, bit_depth
        );
    }

    #[must_use]
    pub fn sink_id(&self) -> &str {
        &self.config.sink_id
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<MixScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn rate_controller(&self) -> &Arc<RateController> {
        &self.rate_controller
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<ListenerDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn mp3_lane(&self) -> &Arc<Mp3EncoderLane> {
        &self.mp3_lane
    }

    /// Attaches a new source, registering it with both the scheduler and
    /// the rate controller's command channel.
    pub fn attach_source(
        &self,
        instance_id: u64,
        rate_command_sender: crossbeam_channel::Sender<crate::rate_controller::RateCommand>,
    ) -> Arc<BoundedChunkQueue> {
        let queue = self.scheduler.attach_source(instance_id, *self.chunk_duration_ms.lock());
        self.rate_controller.register_source(instance_id, rate_command_sender);
        queue
    }

    pub fn detach_source(&self, instance_id: u64) {
        self.scheduler.detach_source(instance_id);
        self.rate_controller.unregister_source(instance_id);
    }

    #[must_use]
    pub fn stats(&self) -> MixerStats {
        MixerStats {
            ticks_processed: self.counters.ticks_processed.load(Ordering::Relaxed),
            chunks_discarded_shape_mismatch: self
                .counters
                .chunks_discarded_shape_mismatch
                .load(Ordering::Relaxed),
            frames_dispatched: self.counters.frames_dispatched.load(Ordering::Relaxed),
            underrun_events: self.counters.underrun_events.load(Ordering::Relaxed),
            csrc_truncation_events: self.csrc_truncation_events.load(Ordering::Relaxed),
            staging_overflow_events: self.staging_overflow_events.load(Ordering::Relaxed),
        }
    }

    /// Spawns the mixer's tick thread. Idempotent: calling `start` twice is
    /// a no-op on the second call.
    pub fn start(self: &Arc<Self>) {
        if self.worker.lock().is_some() {
            return;
        }
        let mixer = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("sink-mixer-{}", mixer.config.sink_id))
            .spawn(move || mixer.run())
            .expect("failed to spawn sink mixer thread");
        *self.worker.lock() = Some(handle);
    }

    /// Signals the tick thread to stop, joins it, tears down every attached
    /// source, closes every listener, stops the MP3 lane, closes the
    /// sender, and unregisters the clock condition.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        let key = ClockKey {
            sample_rate: self.sample_rate.load(Ordering::Acquire),
            channels: self.channels.load(Ordering::Acquire),
            bit_depth: self.bit_depth.load(Ordering::Acquire),
        };
        let clock_handle = self
            .context
            .clock_manager()
            .register_clock_condition(key, self.frames_per_chunk);

        info!(
            "sink mixer '{}' started ({}Hz/{}ch/{}bit, {} frames/chunk)",
            self.config.sink_id, key.sample_rate, key.channels, key.bit_depth, self.frames_per_chunk
        );

        self.tick_loop(&clock_handle);

        self.scheduler.detach_all();
        self.dispatcher.close_all();
        self.mp3_lane.stop();
        self.sender.lock().close();
        self.context.clock_manager().unregister_clock_condition(clock_handle);

        info!("sink mixer '{}' stopped", self.config.sink_id);
    }

    fn tick_loop(&self, clock_handle: &ClockConditionHandle) {
        let settings = self.context.settings();
        let channels = self.channels.load(Ordering::Acquire);
        let bit_depth = self.bit_depth.load(Ordering::Acquire);
        let chunk_duration_ms = *self.chunk_duration_ms.lock();
        let frame_count = self.frames_per_chunk as usize;
        let sample_count = frame_count * channels as usize;
        let bytes_per_chunk = frame_count * channels as usize * bytes_per_sample(bit_depth);

        let mut mix_buffer: Vec<i32> = vec![0; sample_count];
        let mut stereo_buffer: Vec<i32> = Vec::with_capacity(frame_count * 2);
        let mut downscale_scratch = BytesMut::with_capacity(bytes_per_chunk);
        let mut staging = StagingRing::new(bytes_per_chunk.max(1), STAGING_RING_MULTIPLE);
        let mut csrcs = CsrcSet::new();

        let mut hold = HoldState::Normal;
        let mut any_active_last_tick = false;
        let mut last_measurement = Instant::now();
        let measurement_interval =
            Duration::from_millis(u64::from(settings.buffer_measurement_interval_ms.max(1)));

        while !self.stop.load(Ordering::Acquire) {
            let Some(_delta) = clock_handle.wait_for_tick(&self.stop) else {
                break;
            };

            self.dispatcher.cleanup_closed();

            let (harvested, drained) = self.scheduler.collect_ready_chunks();
            for instance_id in drained {
                debug!("sink '{}' source {instance_id} drained", self.config.sink_id);
            }

            let mut accepted: Vec<ReadyChunk> = Vec::with_capacity(harvested.len());
            for (instance_id, ready_chunk) in harvested {
                if ready_chunk.chunk().samples().len() != sample_count {
                    self.counters
                        .chunks_discarded_shape_mismatch
                        .fetch_add(1, Ordering::Relaxed);
                    let issue = RuntimeIssue::ChunkShapeMismatch {
                        instance_id,
                        expected: sample_count,
                        actual: ready_chunk.chunk().samples().len(),
                    };
                    warn!("sink '{}': {issue}", self.config.sink_id);
                    continue;
                }
                accepted.push(ready_chunk);
            }

            let any_active_this_tick = !accepted.is_empty();
            if any_active_this_tick {
                hold = HoldState::Normal;
            } else if any_active_last_tick && settings.underrun_hold_timeout_ms > 0 {
                hold = HoldState::Holding {
                    deadline: Instant::now()
                        + Duration::from_millis(u64::from(settings.underrun_hold_timeout_ms)),
                };
                self.counters.underrun_events.fetch_add(1, Ordering::Relaxed);
            }
            any_active_last_tick = any_active_this_tick;

            let should_mix = any_active_this_tick
                || matches!(hold, HoldState::Holding { deadline } if Instant::now() < deadline);

            if !should_mix {
                self.counters.ticks_processed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            mix_buffer.iter_mut().for_each(|s| *s = 0);
            csrcs.clear();
            for ready_chunk in &accepted {
                let chunk = ready_chunk.chunk();
                saturating_mix_into(&mut mix_buffer, chunk.samples());
                csrcs.extend_and_truncate(chunk.contributing_ssrcs());
            }
            if csrcs.truncated_events() > 0 {
                self.csrc_truncation_events.store(csrcs.truncated_events(), Ordering::Relaxed);
            }

            downscale_scratch.clear();
            downscale_into(&mut downscale_scratch, &mix_buffer, bit_depth);
            staging.push(&downscale_scratch);
            self.staging_overflow_events
                .store(staging.overflow_count(), Ordering::Relaxed);

            let mut frames_dispatched_this_tick = 0u64;
            {
                let sender = self.sender.lock();
                while staging.len() >= bytes_per_chunk && bytes_per_chunk > 0 {
                    let payload = staging.drain_chunk(bytes_per_chunk);
                    sender.send_payload(&payload, &csrcs);
                    frames_dispatched_this_tick += self.frames_per_chunk as u64;
                }
            }
            self.counters
                .frames_dispatched
                .fetch_add(frames_dispatched_this_tick, Ordering::Relaxed);

            let wants_side_chain = !self.dispatcher.is_empty() || !self.mp3_lane.is_disabled();
            if wants_side_chain {
                let written = downmix_to_stereo(&mix_buffer, channels, &mut stereo_buffer);
                if written > 0 {
                    let multichannel = if channels != 2 {
                        Some((mix_buffer.as_slice(), channels))
                    } else {
                        None
                    };
                    self.dispatcher.dispatch(&stereo_buffer, multichannel);
                    self.mp3_lane.enqueue(&stereo_buffer);
                } else {
                    warn!(
                        "sink '{}': stereo preprocessor failed for this tick, skipping side-chain",
                        self.config.sink_id
                    );
                }
            }

            if last_measurement.elapsed() >= measurement_interval {
                if settings.enable_adaptive_buffer_drain {
                    self.rate_controller
                        .tick(&self.scheduler, &settings, chunk_duration_ms);
                }
                last_measurement = Instant::now();
            }

            self.counters.ticks_processed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SinkConfig {
        SinkConfig {
            sink_id: "test-sink".into(),
            protocol_variant: crate::config::ProtocolVariant::ScreamLegacy,
            output_ip: "239.1.2.3".parse().unwrap(),
            output_port: 4010,
            output_sample_rate: 48_000,
            output_bit_depth: 16,
            output_channels: 2,
            channel_layout_mask: 0x3,
            multi_device_mode: false,
            rtp_receivers: vec![],
            time_sync_delay_ms: 0,
            speaker_matrix: None,
        }
    }

    struct RecordingSender {
        setup_ok: bool,
        payloads: parking_lot::Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl RecordingSender {
        fn new(setup_ok: bool) -> Self {
            Self {
                setup_ok,
                payloads: parking_lot::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        }
    }

    impl NetworkSender for RecordingSender {
        fn setup(&mut self) -> bool {
            self.setup_ok
        }

        fn send_payload(&self, bytes: &[u8], _csrcs: &CsrcSet) {
            self.payloads.lock().push(bytes.to_vec());
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn construction_fails_when_sender_setup_fails() {
        let context = Arc::new(SharedContext::new(crate::settings::AudioEngineSettings::default()));
        let sender = Box::new(RecordingSender::new(false));
        let result = SinkMixer::new(base_config(), context, 480, sender, None);
        assert!(result.is_err());
    }

    #[test]
    fn construction_succeeds_and_scheduler_starts_empty() {
        let context = Arc::new(SharedContext::new(crate::settings::AudioEngineSettings::default()));
        let sender = Box::new(RecordingSender::new(true));
        let mixer = SinkMixer::new(base_config(), context, 480, sender, None).unwrap();
        assert_eq!(mixer.scheduler().lane_count(), 0);
        assert!(mixer.dispatcher().is_empty());
    }

    #[test]
    fn mixing_one_source_end_to_end_dispatches_a_packet() {
        let context = Arc::new(SharedContext::new(crate::settings::AudioEngineSettings {
            buffer_measurement_interval_ms: 5,
            ..Default::default()
        }));
        let sender = Box::new(RecordingSender::new(true));
        let mixer = SinkMixer::new(base_config(), context, 48, sender, None).unwrap();

        let (tx, _rx) = crossbeam_channel::unbounded();
        let input = mixer.attach_source(1, tx);

        mixer.start();

        for i in 0..5 {
            input.push(crate::chunk::ProcessedChunk::new(
                vec![1000 * (i + 1); 48 * 2],
                2,
                vec![7],
                Instant::now(),
            ));
            std::thread::sleep(Duration::from_millis(15));
        }

        std::thread::sleep(Duration::from_millis(100));
        mixer.detach_source(1);
        mixer.stop();

        let stats = mixer.stats();
        assert!(stats.ticks_processed > 0);
        assert!(stats.frames_dispatched > 0);
        assert_eq!(stats.chunks_discarded_shape_mismatch, 0);
    }

    #[test]
    fn mismatched_chunk_shape_is_discarded_and_counted() {
        let context = Arc::new(SharedContext::new(crate::settings::AudioEngineSettings::default()));
        let sender = Box::new(RecordingSender::new(true));
        let mixer = SinkMixer::new(base_config(), context, 48, sender, None).unwrap();

        let (tx, _rx) = crossbeam_channel::unbounded();
        let input = mixer.attach_source(2, tx);
        mixer.start();

        // wrong sample count for 48 frames/2 channels
        input.push(crate::chunk::ProcessedChunk::new(vec![1; 10], 2, vec![1], Instant::now()));
        std::thread::sleep(Duration::from_millis(60));

        mixer.detach_source(2);
        mixer.stop();

        assert!(mixer.stats().chunks_discarded_shape_mismatch >= 1);
    }

    #[test]
    fn underrun_hold_emits_silence_then_stops() {
        let context = Arc::new(SharedContext::new(crate::settings::AudioEngineSettings {
            underrun_hold_timeout_ms: 50,
            ..Default::default()
        }));
        let sender = Box::new(RecordingSender::new(true));
        let mixer = SinkMixer::new(base_config(), context, 48, sender, None).unwrap();

        let (tx, _rx) = crossbeam_channel::unbounded();
        let input = mixer.attach_source(3, tx);
        mixer.start();

        input.push(crate::chunk::ProcessedChunk::new(vec![5; 48 * 2], 2, vec![3], Instant::now()));
        // give a tick for the source to go active then silent; the hold
        // window should keep the mixer emitting for a little while longer.
        std::thread::sleep(Duration::from_millis(150));

        mixer.detach_source(3);
        mixer.stop();

        assert!(mixer.stats().underrun_events >= 1);
    }
}
