//! The chunk types that flow from source pipelines through the scheduler
//! into the mixer.

use std::time::Instant;

/// A finite, immutable batch of interleaved int32 PCM samples produced by a
/// source pipeline.
///
/// `samples.len()` must equal `frames_per_chunk * channels`; the mixer
/// discards (and counts) any chunk that violates this on harvest.
#[derive(Debug, Clone)]
pub struct ProcessedChunk {
    samples: Vec<i32>,
    channels: u16,
    /// SSRCs of the sources that contributed to this chunk (normally one,
    /// but a chunk forwarded from an upstream mix may already carry several).
    contributing_ssrcs: Vec<u32>,
    /// Monotonically non-decreasing production timestamp, source-pipeline time.
    produced_time: Instant,
}

impl ProcessedChunk {
    pub fn new(
        samples: Vec<i32>,
        channels: u16,
        contributing_ssrcs: Vec<u32>,
        produced_time: Instant,
    ) -> Self {
        Self {
            samples,
            channels,
            contributing_ssrcs,
            produced_time,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    #[must_use]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    #[must_use]
    pub fn contributing_ssrcs(&self) -> &[u32] {
        &self.contributing_ssrcs
    }

    #[must_use]
    pub fn produced_time(&self) -> Instant {
        self.produced_time
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// An empty chunk used as a sentinel to unblock a `pop_blocking` waiter
    /// without requiring a separate "closed" channel.
    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            samples: Vec::new(),
            channels: 0,
            contributing_ssrcs: Vec::new(),
            produced_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.samples.is_empty() && self.channels == 0
    }
}

/// A [`ProcessedChunk`] stamped with the time it was pulled off the
/// source's input queue by the scheduler's collector thread.
#[derive(Debug, Clone)]
pub struct ReadyChunk {
    chunk: ProcessedChunk,
    arrival_time: Instant,
}

impl ReadyChunk {
    #[must_use]
    pub fn new(chunk: ProcessedChunk, arrival_time: Instant) -> Self {
        Self { chunk, arrival_time }
    }

    #[must_use]
    pub fn chunk(&self) -> &ProcessedChunk {
        &self.chunk
    }

    #[must_use]
    pub fn into_chunk(self) -> ProcessedChunk {
        self.chunk
    }

    #[must_use]
    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_divides_by_channels() {
        let chunk = ProcessedChunk::new(vec![0; 1152], 2, vec![42], Instant::now());
        assert_eq!(chunk.frame_count(), 576);
    }

    #[test]
    fn sentinel_round_trips() {
        let chunk = ProcessedChunk::sentinel();
        assert!(chunk.is_sentinel());
        assert_eq!(chunk.frame_count(), 0);
    }

    #[test]
    fn ready_chunk_preserves_arrival_time() {
        let chunk = ProcessedChunk::new(vec![0; 4], 2, vec![], Instant::now());
        let now = Instant::now();
        let ready = ReadyChunk::new(chunk, now);
        assert_eq!(ready.arrival_time(), now);
    }
}
