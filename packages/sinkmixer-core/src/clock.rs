//! Clock manager: one driver thread per unique `(sample_rate, channels,
//! bit_depth)` tuple, delivering periodic wakeups to every mixer registered
//! against that tuple.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use log::debug;

/// Key identifying a clock line. Bit depth does not affect chunk period but
/// is part of the key because a sink reconfiguring bit depth without
/// changing rate/channels is still considered a distinct registration group
/// in the spec's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockKey {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// The shared state a mixer waits on: a sequence counter incremented once
/// per period, plus the `pending_ticks` count of periods the holder has not
/// yet consumed.
struct ClockLine {
    mutex: Mutex<LineState>,
    cv: Condvar,
    sequence: AtomicU64,
    stop: std::sync::atomic::AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    refcount: AtomicU64,
}

struct LineState {
    last_notified_sequence: u64,
}

/// A handle a mixer holds to wait on its clock line and to consume pending
/// ticks. Cloning is not supported; each mixer owns exactly one handle per
/// registration and unregisters through [`ClockManager::unregister_clock_condition`].
pub struct ClockConditionHandle {
    key: ClockKey,
    line: Arc<ClockLine>,
    last_consumed_sequence: AtomicU64,
}

impl ClockConditionHandle {
    #[must_use]
    pub fn key(&self) -> ClockKey {
        self.key
    }

    /// Blocks until at least one new tick is pending, then returns the
    /// number of ticks that elapsed since the handle last consumed one
    /// (always >= 1). Returns `None` if `stop` becomes true while waiting.
    pub fn wait_for_tick(&self, stop: &std::sync::atomic::AtomicBool) -> Option<u64> {
        let mut guard = self
            .line
            .mutex
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            let current = self.line.sequence.load(Ordering::Acquire);
            let last = self.last_consumed_sequence.load(Ordering::Acquire);
            if current > last {
                self.last_consumed_sequence.store(current, Ordering::Release);
                return Some(current - last);
            }
            let (next_guard, _timeout) = self
                .line
                .cv
                .wait_timeout(guard, Duration::from_millis(200))
                .unwrap_or_else(|p| p.into_inner());
            guard = next_guard;
            let _ = &guard.last_notified_sequence;
        }
    }
}

/// Produces periodic wakeups at a rate of one chunk per source, per unique
/// `(sample_rate, channels, bit_depth)` tuple. Shared by every mixer in the
/// process via [`crate::context::SharedContext`].
pub struct ClockManager {
    lines: DashMap<ClockKey, Arc<ClockLine>>,
}

impl Default for ClockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: DashMap::new(),
        }
    }

    /// Creates or attaches to the clock line for `key`, spawning its driver
    /// thread on first registration. `frames_per_chunk` determines the tick
    /// period: `frames_per_chunk * 1_000_000 / sample_rate` microseconds.
    pub fn register_clock_condition(
        &self,
        key: ClockKey,
        frames_per_chunk: u32,
    ) -> ClockConditionHandle {
        let line = self
            .lines
            .entry(key)
            .or_insert_with(|| Self::spawn_line(key, frames_per_chunk))
            .clone();
        line.refcount.fetch_add(1, Ordering::AcqRel);
        let current = line.sequence.load(Ordering::Acquire);
        ClockConditionHandle {
            key,
            line,
            last_consumed_sequence: AtomicU64::new(current),
        }
    }

    /// Detaches a handle; when the last holder detaches, the driving thread
    /// is stopped and joined.
    pub fn unregister_clock_condition(&self, handle: ClockConditionHandle) {
        let remaining = handle.line.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            handle.line.stop.store(true, Ordering::Release);
            handle.line.cv.notify_all();
            if let Some(join) = handle.line.handle.lock().unwrap_or_else(|p| p.into_inner()).take() {
                let _ = join.join();
            }
            self.lines.remove(&handle.key);
        }
    }

    fn spawn_line(key: ClockKey, frames_per_chunk: u32) -> Arc<ClockLine> {
        let line = Arc::new(ClockLine {
            mutex: Mutex::new(LineState {
                last_notified_sequence: 0,
            }),
            cv: Condvar::new(),
            sequence: AtomicU64::new(0),
            stop: std::sync::atomic::AtomicBool::new(false),
            handle: Mutex::new(None),
            refcount: AtomicU64::new(0),
        });

        let period_us = if key.sample_rate == 0 {
            1000
        } else {
            (u64::from(frames_per_chunk) * 1_000_000) / u64::from(key.sample_rate)
        };
        let driver_line = Arc::clone(&line);
        let join = std::thread::Builder::new()
            .name(format!(
                "clock-{}-{}-{}",
                key.sample_rate, key.channels, key.bit_depth
            ))
            .spawn(move || {
                debug!(
                    "clock driver started for {}Hz/{}ch/{}bit, period {}us",
                    key.sample_rate, key.channels, key.bit_depth, period_us
                );
                while !driver_line.stop.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_micros(period_us.max(1)));
                    if driver_line.stop.load(Ordering::Acquire) {
                        break;
                    }
                    driver_line.sequence.fetch_add(1, Ordering::AcqRel);
                    {
                        let mut guard = driver_line
                            .mutex
                            .lock()
                            .unwrap_or_else(|p| p.into_inner());
                        guard.last_notified_sequence =
                            driver_line.sequence.load(Ordering::Acquire);
                    }
                    driver_line.cv.notify_all();
                }
            })
            .expect("failed to spawn clock driver thread");
        *line.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(join);
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn tick_sequence_is_monotonic_and_delivers_deltas() {
        let manager = ClockManager::new();
        let key = ClockKey {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        // small chunk (e.g. 48 frames) -> ~1ms period, fast enough for a test
        let handle = manager.register_clock_condition(key, 48);
        let stop = AtomicBool::new(false);
        let delta = handle.wait_for_tick(&stop);
        assert!(delta.is_some());
        assert!(delta.unwrap() >= 1);
        manager.unregister_clock_condition(handle);
    }

    #[test]
    fn stop_flag_short_circuits_wait() {
        let manager = ClockManager::new();
        let key = ClockKey {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        let handle = manager.register_clock_condition(key, 48_000_000);
        let stop = AtomicBool::new(true);
        assert!(handle.wait_for_tick(&stop).is_none());
        manager.unregister_clock_condition(handle);
    }

    #[test]
    fn two_handles_share_one_driver_thread() {
        let manager = ClockManager::new();
        let key = ClockKey {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        let h1 = manager.register_clock_condition(key, 480);
        let h2 = manager.register_clock_condition(key, 480);
        assert_eq!(h1.line.refcount.load(Ordering::Acquire), 2);
        manager.unregister_clock_condition(h1);
        manager.unregister_clock_condition(h2);
    }
}
