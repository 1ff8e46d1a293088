//! Bounded, mutex-guarded MPSC hand-off of [`ProcessedChunk`]s from a
//! source pipeline to its scheduler collector thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::chunk::ProcessedChunk;

struct Inner {
    deque: VecDeque<ProcessedChunk>,
    closed: bool,
}

/// A bounded queue that drops the oldest element on overflow rather than
/// blocking the producer. Consumers either poll (`try_pop`) or block
/// (`pop_blocking`) on a condvar.
pub struct BoundedChunkQueue {
    capacity: usize,
    state: Mutex<Inner>,
    not_empty: Condvar,
    overflow_count: AtomicU64,
    pushed_count: AtomicU64,
    popped_count: AtomicU64,
    closed_flag: AtomicBool,
}

impl BoundedChunkQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(Inner {
                deque: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            overflow_count: AtomicU64::new(0),
            pushed_count: AtomicU64::new(0),
            popped_count: AtomicU64::new(0),
            closed_flag: AtomicBool::new(false),
        }
    }

    /// Pushes a chunk. If the queue is already at capacity the oldest
    /// element is evicted and the overflow counter is incremented.
    pub fn push(&self, chunk: ProcessedChunk) {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if inner.deque.len() >= self.capacity {
            inner.deque.pop_front();
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
        inner.deque.push_back(chunk);
        self.pushed_count.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Non-blocking pop. Returns `true` and fills `out` if something was
    /// available, `false` otherwise (including when closed and empty).
    pub fn try_pop(&self, out: &mut ProcessedChunk) -> bool {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(chunk) = inner.deque.pop_front() {
            *out = chunk;
            self.popped_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Blocks until a chunk is available or the queue is closed and
    /// drained. Returns `false` only once the queue has been closed and no
    /// chunk (including the sentinel used to wake a blocked waiter) remains.
    pub fn pop_blocking(&self, out: &mut ProcessedChunk) -> bool {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(chunk) = inner.deque.pop_front() {
                self.popped_count.fetch_add(1, Ordering::Relaxed);
                if chunk.is_sentinel() {
                    return false;
                }
                *out = chunk;
                return true;
            }
            if inner.closed {
                return false;
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Marks the queue closed and pushes a sentinel so any blocked
    /// `pop_blocking` waiter wakes up and observes the close.
    pub fn close(&self) {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        inner.closed = true;
        inner.deque.push_back(ProcessedChunk::sentinel());
        self.closed_flag.store(true, Ordering::Release);
        drop(inner);
        self.not_empty.notify_all();
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).deque.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pushed_count(&self) -> u64 {
        self.pushed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn popped_count(&self) -> u64 {
        self.popped_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn chunk(tag: i32) -> ProcessedChunk {
        ProcessedChunk::new(vec![tag; 4], 2, vec![], Instant::now())
    }

    #[test]
    fn push_then_try_pop_fifo() {
        let q = BoundedChunkQueue::new(4);
        q.push(chunk(1));
        q.push(chunk(2));
        let mut out = ProcessedChunk::sentinel();
        assert!(q.try_pop(&mut out));
        assert_eq!(out.samples()[0], 1);
        assert!(q.try_pop(&mut out));
        assert_eq!(out.samples()[0], 2);
        assert!(!q.try_pop(&mut out));
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let q = BoundedChunkQueue::new(2);
        q.push(chunk(1));
        q.push(chunk(2));
        q.push(chunk(3));
        assert_eq!(q.overflow_count(), 1);
        let mut out = ProcessedChunk::sentinel();
        assert!(q.try_pop(&mut out));
        assert_eq!(out.samples()[0], 2);
    }

    #[test]
    fn pop_blocking_wakes_on_push() {
        let q = Arc::new(BoundedChunkQueue::new(4));
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            let mut out = ProcessedChunk::sentinel();
            q2.pop_blocking(&mut out)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.push(chunk(9));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn close_unblocks_waiter_with_false() {
        let q = Arc::new(BoundedChunkQueue::new(4));
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            let mut out = ProcessedChunk::sentinel();
            q2.pop_blocking(&mut out)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.close();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn size_reflects_depth() {
        let q = BoundedChunkQueue::new(4);
        assert_eq!(q.size(), 0);
        q.push(chunk(1));
        assert_eq!(q.size(), 1);
    }
}
