//! Shared, explicitly-injected registries.
//!
//! The component design calls for a per-engine `SharedContext` that carries
//! the clock manager singleton, the engine settings, and the local SSRC
//! registry, rather than process-wide mutable statics -- every mixer is
//! constructed with an explicit `Arc<SharedContext>` handed down from the
//! host application.

use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;

use crate::clock::ClockManager;
use crate::settings::AudioEngineSettings;

/// Registries and tuning shared, read-mostly, by every sink mixer in the
/// process. Constructed once by the host application and passed down via
/// `Arc` -- never reached through a global.
pub struct SharedContext {
    clock_manager: ClockManager,
    settings: RwLock<Arc<AudioEngineSettings>>,
    /// SSRCs currently in use by any RTP session in this process, so a
    /// newly constructed session can avoid colliding with one already
    /// running.
    active_ssrcs: DashSet<u32>,
}

impl SharedContext {
    #[must_use]
    pub fn new(settings: AudioEngineSettings) -> Self {
        Self {
            clock_manager: ClockManager::new(),
            settings: RwLock::new(Arc::new(settings)),
            active_ssrcs: DashSet::new(),
        }
    }

    #[must_use]
    pub fn clock_manager(&self) -> &ClockManager {
        &self.clock_manager
    }

    #[must_use]
    pub fn settings(&self) -> Arc<AudioEngineSettings> {
        self.settings.read().clone()
    }

    /// Replaces the shared settings object. Existing mixers observe the new
    /// values on their next read; in-flight ticks keep using the `Arc` they
    /// already cloned.
    pub fn update_settings(&self, settings: AudioEngineSettings) {
        *self.settings.write() = Arc::new(settings);
    }

    /// Generates a fresh SSRC that isn't already registered as active, and
    /// marks it active. Pure `rand::random()` collisions are astronomically
    /// unlikely but the registry costs nothing to check.
    pub fn allocate_ssrc(&self) -> u32 {
        loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && self.active_ssrcs.insert(candidate) {
                return candidate;
            }
        }
    }

    pub fn release_ssrc(&self, ssrc: u32) {
        self.active_ssrcs.remove(&ssrc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_ssrc_never_returns_zero() {
        let ctx = SharedContext::new(AudioEngineSettings::default());
        for _ in 0..64 {
            assert_ne!(ctx.allocate_ssrc(), 0);
        }
    }

    #[test]
    fn released_ssrc_can_be_reused() {
        let ctx = SharedContext::new(AudioEngineSettings::default());
        let ssrc = ctx.allocate_ssrc();
        ctx.release_ssrc(ssrc);
        assert!(!ctx.active_ssrcs.contains(&ssrc));
    }

    #[test]
    fn update_settings_is_observed_by_new_reads() {
        let ctx = SharedContext::new(AudioEngineSettings::default());
        let mut updated = AudioEngineSettings::default();
        updated.target_buffer_level_ms = 99;
        ctx.update_settings(updated);
        assert_eq!(ctx.settings().target_buffer_level_ms, 99);
    }
}
