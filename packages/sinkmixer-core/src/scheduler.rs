//! Mix scheduler: owns one collector thread per attached source, draining
//! each source's input queue into a per-source ready deque that the mixer
//! harvests from once per tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::chunk::{ProcessedChunk, ReadyChunk};
use crate::queue::BoundedChunkQueue;

/// Per-source statistics exposed for telemetry.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceLaneStats {
    pub depth: usize,
    pub high_water_depth: usize,
    pub received_total: u64,
    pub popped_total: u64,
    pub dropped_total: u64,
}

struct ReadyState {
    deque: VecDeque<ReadyChunk>,
    high_water_depth: usize,
    dropped_total: u64,
}

/// Per-source state the scheduler owns for the lifetime of an attached
/// source.
pub struct SourceLane {
    instance_id: u64,
    input_queue: Arc<BoundedChunkQueue>,
    ready: Mutex<ReadyState>,
    ready_capacity: usize,
    stopping: AtomicBool,
    active: AtomicBool,
    collector_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    smoothed_backlog_ms: Mutex<f32>,
    last_rate_command: Mutex<Option<f32>>,
}

impl SourceLane {
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    #[must_use]
    pub fn input_queue(&self) -> &Arc<BoundedChunkQueue> {
        &self.input_queue
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn smoothed_backlog_ms(&self) -> f32 {
        *self.smoothed_backlog_ms.lock()
    }

    pub fn set_smoothed_backlog_ms(&self, value: f32) {
        *self.smoothed_backlog_ms.lock() = value;
    }

    #[must_use]
    pub fn last_rate_command(&self) -> Option<f32> {
        *self.last_rate_command.lock()
    }

    pub fn set_last_rate_command(&self, ratio: Option<f32>) {
        *self.last_rate_command.lock() = ratio;
    }

    #[must_use]
    pub fn stats(&self, received_total: u64) -> SourceLaneStats {
        let ready = self.ready.lock();
        SourceLaneStats {
            depth: ready.deque.len(),
            high_water_depth: ready.high_water_depth,
            received_total,
            popped_total: 0,
            dropped_total: ready.dropped_total,
        }
    }

    fn push_ready(&self, ready_chunk: ReadyChunk) {
        let mut state = self.ready.lock();
        if state.deque.len() >= self.ready_capacity {
            state.deque.pop_front();
            state.dropped_total += 1;
        }
        state.deque.push_back(ready_chunk);
        state.high_water_depth = state.high_water_depth.max(state.deque.len());
    }

    fn pop_ready(&self) -> Option<ReadyChunk> {
        self.ready.lock().deque.pop_front()
    }
}

/// Keeps one [`SourceLane`] per `instance_id`, each backed by a collector
/// thread that blocks on its input queue and appends arrived chunks to a
/// bounded ready deque.
pub struct MixScheduler {
    lanes: DashMap<u64, Arc<SourceLane>>,
    received_totals: Arc<DashMap<u64, AtomicU64>>,
    max_ready_queue_duration_ms: u32,
    max_ready_chunks_per_source: usize,
    input_queue_capacity: usize,
}

impl MixScheduler {
    #[must_use]
    pub fn new(
        max_ready_queue_duration_ms: u32,
        max_ready_chunks_per_source: usize,
        input_queue_capacity: usize,
    ) -> Self {
        Self {
            lanes: DashMap::new(),
            received_totals: Arc::new(DashMap::new()),
            max_ready_queue_duration_ms,
            max_ready_chunks_per_source,
            input_queue_capacity,
        }
    }

    /// `max(1, ceil(max_ready_queue_duration_ms / chunk_duration_ms))`,
    /// falling back to `max_ready_chunks_per_source` when the chunk duration
    /// is degenerate (zero or unknown).
    fn ready_capacity(&self, chunk_duration_ms: f64) -> usize {
        if chunk_duration_ms <= 0.0 {
            return self.max_ready_chunks_per_source.max(1);
        }
        let by_duration =
            (f64::from(self.max_ready_queue_duration_ms) / chunk_duration_ms).ceil() as usize;
        by_duration.max(1)
    }

    /// Attaches a new source: stores its `SourceLane`, spawns a collector
    /// thread, and returns the input queue the source pipeline should push
    /// chunks into.
    pub fn attach_source(&self, instance_id: u64, chunk_duration_ms: f64) -> Arc<BoundedChunkQueue> {
        let input_queue = Arc::new(BoundedChunkQueue::new(self.input_queue_capacity));
        let ready_capacity = self.ready_capacity(chunk_duration_ms);
        let lane = Arc::new(SourceLane {
            instance_id,
            input_queue: Arc::clone(&input_queue),
            ready: Mutex::new(ReadyState {
                deque: VecDeque::with_capacity(ready_capacity),
                high_water_depth: 0,
                dropped_total: 0,
            }),
            ready_capacity,
            stopping: AtomicBool::new(false),
            active: AtomicBool::new(true),
            collector_thread: Mutex::new(None),
            smoothed_backlog_ms: Mutex::new(0.0),
            last_rate_command: Mutex::new(None),
        });

        self.received_totals.insert(instance_id, AtomicU64::new(0));
        let collector_lane = Arc::clone(&lane);
        let collector_queue = Arc::clone(&input_queue);
        let received = self.received_totals.clone();
        let handle = std::thread::Builder::new()
            .name(format!("collector-{instance_id}"))
            .spawn(move || {
                debug!("collector for source {instance_id} started");
                let mut scratch = ProcessedChunk::sentinel();
                loop {
                    if !collector_queue.pop_blocking(&mut scratch) {
                        break;
                    }
                    if let Some(counter) = received.get(&instance_id) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    let ready_chunk = ReadyChunk::new(scratch.clone(), std::time::Instant::now());
                    collector_lane.push_ready(ready_chunk);
                }
                debug!("collector for source {instance_id} exiting");
            })
            .expect("failed to spawn collector thread");
        *lane.collector_thread.lock() = Some(handle);

        self.lanes.insert(instance_id, lane);
        input_queue
    }

    /// Detaches a source: marks it stopping, closes its input queue (which
    /// pushes the sentinel the collector is blocked on), joins the
    /// collector thread, and purges its lane state.
    pub fn detach_source(&self, instance_id: u64) {
        if let Some((_, lane)) = self.lanes.remove(&instance_id) {
            lane.stopping.store(true, Ordering::Release);
            lane.input_queue.close();
            if let Some(handle) = lane.collector_thread.lock().take() {
                let _ = handle.join();
            }
        }
        self.received_totals.remove(&instance_id);
    }

    /// Atomically takes up to one ready chunk per source. Returns the
    /// harvested chunks keyed by instance id, plus the set of instance ids
    /// whose collector has exited since the previous harvest (drained).
    pub fn collect_ready_chunks(&self) -> (Vec<(u64, ReadyChunk)>, Vec<u64>) {
        let mut harvested = Vec::new();
        let mut drained = Vec::new();
        for entry in self.lanes.iter() {
            let lane = entry.value();
            if let Some(ready_chunk) = lane.pop_ready() {
                harvested.push((lane.instance_id(), ready_chunk));
            }
            let collector_finished = lane
                .collector_thread
                .lock()
                .as_ref()
                .map(std::thread::JoinHandle::is_finished)
                .unwrap_or(true);
            if collector_finished && lane.is_active() {
                lane.active.store(false, Ordering::Release);
                drained.push(lane.instance_id());
                info!("source {} drained (collector exited)", lane.instance_id());
            }
        }
        (harvested, drained)
    }

    #[must_use]
    pub fn lane(&self, instance_id: u64) -> Option<Arc<SourceLane>> {
        self.lanes.get(&instance_id).map(|e| e.value().clone())
    }

    pub fn for_each_lane(&self, mut f: impl FnMut(&Arc<SourceLane>)) {
        for entry in self.lanes.iter() {
            f(entry.value());
        }
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn stats_for(&self, instance_id: u64) -> Option<SourceLaneStats> {
        let lane = self.lanes.get(&instance_id)?;
        let received = self
            .received_totals
            .get(&instance_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0);
        Some(lane.stats(received))
    }

    /// Tears down every remaining lane, e.g. during mixer shutdown.
    pub fn detach_all(&self) {
        let ids: Vec<u64> = self.lanes.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.detach_source(id);
        }
        if self.lane_count() > 0 {
            warn!("detach_all left {} lanes behind", self.lane_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn chunk(tag: i32) -> ProcessedChunk {
        ProcessedChunk::new(vec![tag; 4], 2, vec![7], Instant::now())
    }

    #[test]
    fn attach_then_harvest_fifo() {
        let scheduler = MixScheduler::new(200, 32, 16);
        let input = scheduler.attach_source(1, 12.0);
        input.push(chunk(1));
        input.push(chunk(2));
        // give the collector thread a moment to drain the input queue
        std::thread::sleep(std::time::Duration::from_millis(30));
        let (first, _) = scheduler.collect_ready_chunks();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1.chunk().samples()[0], 1);
        let (second, _) = scheduler.collect_ready_chunks();
        assert_eq!(second[0].1.chunk().samples()[0], 2);
        scheduler.detach_source(1);
    }

    #[test]
    fn detach_joins_collector_and_removes_lane() {
        let scheduler = MixScheduler::new(200, 32, 16);
        scheduler.attach_source(5, 12.0);
        assert_eq!(scheduler.lane_count(), 1);
        scheduler.detach_source(5);
        assert_eq!(scheduler.lane_count(), 0);
    }

    #[test]
    fn drained_source_is_reported_once_collector_exits() {
        let scheduler = MixScheduler::new(200, 32, 16);
        let input = scheduler.attach_source(3, 12.0);
        input.close();
        std::thread::sleep(std::time::Duration::from_millis(30));
        let (_, drained) = scheduler.collect_ready_chunks();
        assert_eq!(drained, vec![3]);
        scheduler.detach_source(3);
    }

    #[test]
    fn ready_deque_drops_oldest_on_overflow() {
        let scheduler = MixScheduler::new(1, 1, 16);
        let input = scheduler.attach_source(9, 1.0);
        for i in 0..5 {
            input.push(chunk(i));
        }
        std::thread::sleep(std::time::Duration::from_millis(30));
        let lane = scheduler.lane(9).unwrap();
        assert!(lane.ready.lock().dropped_total >= 1);
        scheduler.detach_source(9);
    }
}
