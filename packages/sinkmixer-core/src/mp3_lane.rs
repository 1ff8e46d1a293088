//! Dedicated MP3 encoder lane: a bounded PCM input queue feeding a worker
//! thread that encodes stereo PCM to MP3 frames on a second bounded output
//! queue. Codec init failure disables the lane but never aborts the mixer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{error, warn};

/// Narrow trait seam over the external MP3 codec, so the crate compiles and
/// is testable without linking a real encoder. A real implementation is
/// provided behind a codec feature in the host application.
pub trait Mp3EncoderPort: Send {
    /// Encodes one block of interleaved stereo int32 PCM, appending encoded
    /// bytes to `out`. Returns `Err` on a negative return code from the
    /// underlying codec.
    fn encode(&mut self, pcm: &[i32], out: &mut Vec<u8>) -> Result<(), String>;

    /// Flushes any residual buffered bytes (e.g. LAME's final frame) into `out`.
    fn flush(&mut self, out: &mut Vec<u8>);
}

enum Command {
    Pcm(Vec<i32>),
    Stop,
}

struct QueueState {
    items: VecDeque<Command>,
}

struct PcmQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
    max_len: usize,
    overflow_count: AtomicU64,
}

impl PcmQueue {
    fn new(max_len: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
            }),
            cv: Condvar::new(),
            max_len: max_len.max(1),
            overflow_count: AtomicU64::new(0),
        }
    }

    fn push(&self, cmd: Command) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.items.len() >= self.max_len {
            // evict the oldest *PCM* entry, never a pending Stop
            if let Some(pos) = state.items.iter().position(|c| matches!(c, Command::Pcm(_))) {
                state.items.remove(pos);
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.items.push_back(cmd);
        drop(state);
        self.cv.notify_one();
    }

    fn pop_blocking(&self) -> Command {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(cmd) = state.items.pop_front() {
                return cmd;
            }
            state = self.cv.wait(state).unwrap_or_else(|p| p.into_inner());
        }
    }
}

/// Bounded output queue of encoded MP3 bytes, consumed by external
/// listeners (e.g. an ICY-style stream). Drops the oldest frame on
/// overflow.
pub struct Mp3OutputQueue {
    state: Mutex<VecDeque<Vec<u8>>>,
    max_len: usize,
    overflow_count: AtomicU64,
}

impl Mp3OutputQueue {
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self {
            state: Mutex::new(VecDeque::new()),
            max_len: max_len.max(1),
            overflow_count: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: Vec<u8>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.len() >= self.max_len {
            state.pop_front();
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
        state.push_back(frame);
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the MP3 lane's worker thread. `enqueue` is cheap and never blocks
/// the mixer thread; encoding happens entirely on the worker.
pub struct Mp3EncoderLane {
    pcm_queue: Arc<PcmQueue>,
    output: Arc<Mp3OutputQueue>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    disabled: AtomicBool,
}

impl Mp3EncoderLane {
    /// Spawns the worker thread with `encoder`. If `encoder` is `None`
    /// (codec init already failed upstream), the lane starts disabled and
    /// `enqueue` becomes a no-op -- fail-open per the component design.
    pub fn new(
        encoder: Option<Box<dyn Mp3EncoderPort>>,
        output_queue_max_size: usize,
    ) -> Self {
        let pcm_queue = Arc::new(PcmQueue::new(output_queue_max_size.max(4)));
        let output = Arc::new(Mp3OutputQueue::new(output_queue_max_size));
        let disabled = AtomicBool::new(encoder.is_none());

        let worker = encoder.map(|mut encoder| {
            let worker_queue = Arc::clone(&pcm_queue);
            let worker_output = Arc::clone(&output);
            std::thread::Builder::new()
                .name("mp3-encoder".into())
                .spawn(move || loop {
                    match worker_queue.pop_blocking() {
                        Command::Pcm(pcm) => {
                            let mut encoded = Vec::new();
                            match encoder.encode(&pcm, &mut encoded) {
                                Ok(()) => {
                                    if !encoded.is_empty() {
                                        worker_output.push(encoded);
                                    }
                                }
                                Err(reason) => {
                                    error!("mp3 codec failure: {reason}");
                                }
                            }
                        }
                        Command::Stop => {
                            let mut tail = Vec::new();
                            encoder.flush(&mut tail);
                            if !tail.is_empty() {
                                worker_output.push(tail);
                            }
                            break;
                        }
                    }
                })
                .expect("failed to spawn mp3 encoder thread")
        });

        if worker.is_none() {
            warn!("mp3 lane disabled: no encoder available");
        }

        Self {
            pcm_queue,
            output,
            worker: Mutex::new(worker),
            disabled,
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn enqueue(&self, samples: &[i32]) {
        if self.is_disabled() {
            return;
        }
        self.pcm_queue.push(Command::Pcm(samples.to_vec()));
    }

    #[must_use]
    pub fn output(&self) -> &Arc<Mp3OutputQueue> {
        &self.output
    }

    #[must_use]
    pub fn pcm_overflow_count(&self) -> u64 {
        self.pcm_queue.overflow_count.load(Ordering::Relaxed)
    }

    /// Stops the worker, flushing residual codec bytes first. Safe to call
    /// even if the lane was constructed disabled.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            self.pcm_queue.push(Command::Stop);
            let _ = handle.join();
        }
    }
}

impl Drop for Mp3EncoderLane {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoEncoder {
        frames_seen: usize,
    }

    impl Mp3EncoderPort for EchoEncoder {
        fn encode(&mut self, pcm: &[i32], out: &mut Vec<u8>) -> Result<(), String> {
            self.frames_seen += 1;
            out.push(pcm.len() as u8);
            Ok(())
        }

        fn flush(&mut self, out: &mut Vec<u8>) {
            out.push(0xFF);
        }
    }

    #[test]
    fn disabled_lane_is_a_safe_no_op() {
        let lane = Mp3EncoderLane::new(None, 8);
        assert!(lane.is_disabled());
        lane.enqueue(&[1, 2, 3, 4]);
        assert!(lane.output().is_empty());
        lane.stop();
    }

    #[test]
    fn enabled_lane_encodes_and_flushes_on_stop() {
        let encoder = Box::new(EchoEncoder { frames_seen: 0 });
        let lane = Mp3EncoderLane::new(Some(encoder), 8);
        assert!(!lane.is_disabled());
        lane.enqueue(&[1, 2, 3, 4]);
        // allow the worker to process
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(lane.output().pop(), Some(vec![4]));
        lane.stop();
        // stop() flushes the codec tail
        assert_eq!(lane.output().pop(), Some(vec![0xFF]));
    }

    #[test]
    fn output_queue_drops_oldest_on_overflow() {
        let q = Mp3OutputQueue::new(2);
        q.push(vec![1]);
        q.push(vec![2]);
        q.push(vec![3]);
        assert_eq!(q.overflow_count(), 1);
        assert_eq!(q.pop(), Some(vec![2]));
    }
}
