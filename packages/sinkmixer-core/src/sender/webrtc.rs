//! WebRTC data-channel sender: the one variant whose transport setup can't
//! happen synchronously inside [`crate::listener::ListenerDispatcher::add`]
//! because establishing a data channel needs to run on the host runtime's
//! own thread. The dispatcher defers `setup()` for this variant and the
//! host kicks it via `kick_setup` once the channel is open.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use crate::mixer::mixing::CsrcSet;

use super::NetworkSender;

/// The narrow seam into whatever WebRTC stack the host application embeds.
/// This crate never depends on a WebRTC library directly; it only needs to
/// push bytes into an already-negotiated channel.
pub trait DataChannelPort: Send {
    /// Returns `true` once the channel is open and ready to send.
    fn is_open(&self) -> bool;

    /// Best-effort send; failures are logged, not propagated.
    fn send(&self, bytes: &[u8]);

    fn close(&self);
}

/// Tracks how long it has been since the last successful send, so a peer
/// that stopped pulling data (closed tab, dead connection) gets its
/// listener entry reaped instead of accumulating backlog forever.
pub struct WebRtcDataChannelSender {
    listener_id: u64,
    channel: Mutex<Option<Box<dyn DataChannelPort>>>,
    last_activity: Mutex<Instant>,
    inactivity_timeout: Duration,
    closed: Arc<AtomicBool>,
    bytes_sent: AtomicU64,
}

impl WebRtcDataChannelSender {
    #[must_use]
    pub fn new(listener_id: u64, channel: Box<dyn DataChannelPort>, inactivity_timeout: Duration) -> Self {
        Self {
            listener_id,
            channel: Mutex::new(Some(channel)),
            last_activity: Mutex::new(Instant::now()),
            inactivity_timeout,
            closed: Arc::new(AtomicBool::new(false)),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Checked on a timer alongside [`crate::listener::ListenerDispatcher::cleanup_closed`];
    /// marks the sender closed once no bytes have gone out within the
    /// inactivity window, independent of whatever the channel itself
    /// reports.
    pub fn check_inactivity(&self) {
        if self.last_activity.lock().elapsed() >= self.inactivity_timeout {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl NetworkSender for WebRtcDataChannelSender {
    /// Always returns `true`: by the time this sender exists the channel is
    /// either already open or will open asynchronously; a `false` here
    /// would abort mixer construction for a transport whose readiness this
    /// crate cannot observe synchronously.
    fn setup(&mut self) -> bool {
        true
    }

    fn send_payload(&self, bytes: &[u8], _csrcs: &CsrcSet) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let guard = self.channel.lock();
        let Some(channel) = guard.as_ref() else { return };
        if !channel.is_open() {
            return;
        }
        channel.send(bytes);
        self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
    }
}

impl crate::listener::ListenerSender for WebRtcDataChannelSender {
    fn setup(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let guard = self.channel.lock();
        guard.as_ref().is_some_and(|c| c.is_open())
    }

    fn send(&self, buffer: &[i32]) {
        let bytes: Vec<u8> = buffer.iter().flat_map(|s| s.to_ne_bytes()).collect();
        self.send_payload(&bytes, &CsrcSet::default());
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wants_multichannel(&self) -> bool {
        false
    }

    fn channel_count(&self) -> u16 {
        2
    }

    fn needs_deferred_setup(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for WebRtcDataChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcDataChannelSender")
            .field("listener_id", &self.listener_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
