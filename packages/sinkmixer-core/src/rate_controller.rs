//! Rate controller: measures per-source backlog, smooths it with an EMA,
//! and emits `SetPlaybackRateScale` commands back upstream when the
//! backlog crosses the tolerance band around the target.

use std::sync::Arc;

use crossbeam_channel::Sender;
use log::debug;

use crate::scheduler::MixScheduler;
use crate::settings::AudioEngineSettings;

/// Command sent back to a source's control queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateCommand {
    SetPlaybackRateScale(f32),
}

const RATIO_EPSILON: f32 = 1e-4;

/// Drives backlog measurement and rate-command emission for every source
/// lane attached to a scheduler. Runs on the cadence named by
/// `buffer_measurement_interval_ms`; the mixer (or a dedicated timer thread)
/// calls [`RateController::tick`] at that cadence.
pub struct RateController {
    command_senders: dashmap::DashMap<u64, Sender<RateCommand>>,
}

impl Default for RateController {
    fn default() -> Self {
        Self::new()
    }
}

impl RateController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            command_senders: dashmap::DashMap::new(),
        }
    }

    pub fn register_source(&self, instance_id: u64, sender: Sender<RateCommand>) {
        self.command_senders.insert(instance_id, sender);
    }

    pub fn unregister_source(&self, instance_id: u64) {
        self.command_senders.remove(&instance_id);
    }

    /// One measurement pass over every lane in `scheduler`.
    pub fn tick(
        &self,
        scheduler: &MixScheduler,
        settings: &AudioEngineSettings,
        chunk_duration_ms: f64,
    ) {
        let alpha = settings.ema_alpha();
        let upper_band_blocks = if chunk_duration_ms > 0.0 {
            (f64::from(settings.target_buffer_level_ms) + f64::from(settings.buffer_tolerance_ms))
                / chunk_duration_ms
        } else {
            f64::MAX
        };

        let mut stale: Vec<u64> = self
            .command_senders
            .iter()
            .map(|e| *e.key())
            .filter(|id| scheduler.lane(*id).is_none())
            .collect();
        for id in stale.drain(..) {
            self.command_senders.remove(&id);
        }

        scheduler.for_each_lane(|lane| {
            let instance_id = lane.instance_id();
            let Some(stats) = scheduler.stats_for(instance_id) else {
                return;
            };
            let raw_backlog_ms = stats.depth as f64 * chunk_duration_ms;
            let previous = f64::from(lane.smoothed_backlog_ms());
            let smoothed = previous * f64::from(1.0 - alpha) + raw_backlog_ms * f64::from(alpha);
            lane.set_smoothed_backlog_ms(smoothed as f32);

            let blocks_queued = if chunk_duration_ms > 0.0 {
                smoothed / chunk_duration_ms
            } else {
                0.0
            };

            let ratio = if blocks_queued <= upper_band_blocks {
                1.0_f32
            } else {
                let over = (blocks_queued - upper_band_blocks) as f32;
                settings.max_speedup_factor.min(1.0 + 0.01 * over)
            };

            let last = lane.last_rate_command();
            let should_emit = match last {
                None => (ratio - 1.0).abs() > RATIO_EPSILON,
                Some(previous_ratio) => (ratio - previous_ratio).abs() > RATIO_EPSILON,
            };

            if should_emit {
                if let Some(sender) = self.command_senders.get(&instance_id) {
                    debug!("source {instance_id} rate command -> {ratio}");
                    let _ = sender.send(RateCommand::SetPlaybackRateScale(ratio));
                }
                lane.set_last_rate_command(Some(ratio));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ProcessedChunk;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    fn settings() -> AudioEngineSettings {
        AudioEngineSettings {
            target_buffer_level_ms: 30,
            buffer_tolerance_ms: 10,
            max_speedup_factor: 1.10,
            drain_smoothing_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn backlog_within_tolerance_yields_ratio_one_idempotently() {
        let scheduler = MixScheduler::new(500, 64, 16);
        let controller = RateController::new();
        let (tx, rx) = unbounded();
        scheduler.attach_source(1, 12.0);
        controller.register_source(1, tx);

        controller.tick(&scheduler, &settings(), 12.0);
        controller.tick(&scheduler, &settings(), 12.0);

        assert!(rx.try_recv().is_err());
        scheduler.detach_source(1);
    }

    #[test]
    fn growing_backlog_triggers_rising_then_reset_command() {
        let scheduler = MixScheduler::new(5000, 512, 16);
        let controller = RateController::new();
        let (tx, rx) = unbounded();
        let input = scheduler.attach_source(2, 12.0);
        controller.register_source(2, tx);

        // push enough chunks to push backlog to ~120ms at 12ms chunks
        for i in 0..10 {
            input.push(ProcessedChunk::new(vec![0; 4], 2, vec![i], Instant::now()));
        }
        std::thread::sleep(std::time::Duration::from_millis(50));

        controller.tick(&scheduler, &settings(), 12.0);
        let first = rx.try_recv().expect("expected a rate command");
        match first {
            RateCommand::SetPlaybackRateScale(r) => assert!(r > 1.0 && r <= 1.10),
        }

        scheduler.detach_source(2);
    }
}
