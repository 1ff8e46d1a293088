//! Thread-safe listener map: fans the preprocessed stereo (or multichannel)
//! buffer out to every attached listener, removing closed ones lazily and
//! never closing a sender while the map lock is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

/// What a listener's transport needs the dispatcher to do on its behalf.
/// Senders that trigger host-runtime callbacks (WebRTC-class) require
/// deferred setup: the dispatcher stores them immediately but does not call
/// `setup()` until the host explicitly calls [`ListenerDispatcher::kick_setup`]
/// after releasing its own locks.
pub trait ListenerSender: Send + Sync {
    /// `true` if construction succeeded and data can flow; called
    /// synchronously unless the listener requested deferred setup.
    fn setup(&self) -> bool;

    /// Sends one buffer of interleaved int32 PCM.
    fn send(&self, buffer: &[i32]);

    /// Idempotent; safe to call more than once.
    fn close(&self);

    #[must_use]
    fn is_closed(&self) -> bool;

    /// `true` if this listener wants the multichannel buffer instead of
    /// stereo, when the channel counts match.
    #[must_use]
    fn wants_multichannel(&self) -> bool {
        false
    }

    #[must_use]
    fn channel_count(&self) -> u16 {
        2
    }

    #[must_use]
    fn needs_deferred_setup(&self) -> bool {
        false
    }
}

struct ListenerEntry {
    sender: Arc<dyn ListenerSender>,
    needs_setup: AtomicBool,
}

/// Thread-safe `listener_id -> sender` map with the two-phase deferred
/// setup protocol and lock-released close semantics the component design
/// requires.
pub struct ListenerDispatcher {
    listeners: DashMap<u64, ListenerEntry>,
}

impl Default for ListenerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    /// Adds a listener. If it requires deferred setup, stores it with
    /// `needs_setup = true` and returns without calling `setup()`; the host
    /// must call [`Self::kick_setup`] once it has released its own locks.
    /// Otherwise `setup()` is called synchronously before storing.
    pub fn add(&self, listener_id: u64, sender: Arc<dyn ListenerSender>) {
        if sender.needs_deferred_setup() {
            self.listeners.insert(
                listener_id,
                ListenerEntry {
                    sender,
                    needs_setup: AtomicBool::new(true),
                },
            );
        } else {
            let _ = sender.setup();
            self.listeners.insert(
                listener_id,
                ListenerEntry {
                    sender,
                    needs_setup: AtomicBool::new(false),
                },
            );
        }
    }

    /// Invoked by the host runtime after it has released whatever locks the
    /// sender's `setup()` might reacquire via callback.
    pub fn kick_setup(&self, listener_id: u64) {
        if let Some(entry) = self.listeners.get(&listener_id) {
            if entry.needs_setup.swap(false, Ordering::AcqRel) {
                entry.sender.setup();
            }
        }
    }

    /// Removes `listener_id`, releasing the map's internal lock before
    /// calling `close()` on the sender -- closing may invoke callbacks that
    /// reacquire external runtime locks.
    pub fn remove(&self, listener_id: u64) {
        if let Some((_, entry)) = self.listeners.remove(&listener_id) {
            entry.sender.close();
        }
    }

    /// Fans `stereo_buffer` (or `multichannel_buffer`, when a listener
    /// requests it and the channel counts match) out to every listener,
    /// then removes any that reported closed during the pass.
    pub fn dispatch(&self, stereo_buffer: &[i32], multichannel_buffer: Option<(&[i32], u16)>) {
        let mut closed_ids = Vec::new();
        for entry in self.listeners.iter() {
            let listener_id = *entry.key();
            let sender = &entry.value().sender;
            if sender.is_closed() {
                closed_ids.push(listener_id);
                continue;
            }
            if let (true, Some((multi, channels))) = (sender.wants_multichannel(), multichannel_buffer)
            {
                if sender.channel_count() == channels {
                    sender.send(multi);
                    continue;
                }
            }
            sender.send(stereo_buffer);
        }
        for id in closed_ids {
            debug!("listener {id} reported closed during dispatch");
            self.remove(id);
        }
    }

    /// Identical to the trailing cleanup step of [`Self::dispatch`], for use
    /// on a timer independent of the tick cadence.
    pub fn cleanup_closed(&self) {
        let closed_ids: Vec<u64> = self
            .listeners
            .iter()
            .filter(|e| e.value().sender.is_closed())
            .map(|e| *e.key())
            .collect();
        for id in closed_ids {
            self.remove(id);
        }
    }

    /// Snapshots and clears the map, then closes every sender outside the
    /// lock.
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.listeners.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct TestSender {
        closed: AtomicBool,
        setup_calls: AtomicUsize,
        sends: Mutex<Vec<Vec<i32>>>,
        deferred: bool,
    }

    impl TestSender {
        fn new(deferred: bool) -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
                setup_calls: AtomicUsize::new(0),
                sends: Mutex::new(Vec::new()),
                deferred,
            })
        }
    }

    impl ListenerSender for TestSender {
        fn setup(&self) -> bool {
            self.setup_calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn send(&self, buffer: &[i32]) {
            self.sends.lock().unwrap().push(buffer.to_vec());
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn needs_deferred_setup(&self) -> bool {
            self.deferred
        }
    }

    #[test]
    fn immediate_setup_is_called_synchronously() {
        let dispatcher = ListenerDispatcher::new();
        let sender = TestSender::new(false);
        dispatcher.add(1, sender.clone());
        assert_eq!(sender.setup_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_setup_waits_for_kick_setup() {
        let dispatcher = ListenerDispatcher::new();
        let sender = TestSender::new(true);
        dispatcher.add(1, sender.clone());
        assert_eq!(sender.setup_calls.load(Ordering::SeqCst), 0);
        dispatcher.kick_setup(1);
        assert_eq!(sender.setup_calls.load(Ordering::SeqCst), 1);
        // a second kick is a no-op
        dispatcher.kick_setup(1);
        assert_eq!(sender.setup_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_removes_closed_listener_without_holding_map_lock_during_close() {
        let dispatcher = ListenerDispatcher::new();
        let a = TestSender::new(false);
        let b = TestSender::new(false);
        let c = TestSender::new(false);
        dispatcher.add(1, a.clone());
        dispatcher.add(2, b.clone());
        dispatcher.add(3, c.clone());

        b.closed.store(true, Ordering::SeqCst);
        dispatcher.dispatch(&[1, 2], None);

        assert_eq!(dispatcher.len(), 2);
        assert_eq!(a.sends.lock().unwrap().len(), 1);
        assert_eq!(c.sends.lock().unwrap().len(), 1);
    }

    #[test]
    fn close_all_clears_map_and_closes_every_sender() {
        let dispatcher = ListenerDispatcher::new();
        let a = TestSender::new(false);
        dispatcher.add(1, a.clone());
        dispatcher.close_all();
        assert!(dispatcher.is_empty());
        assert!(a.is_closed());
    }
}
