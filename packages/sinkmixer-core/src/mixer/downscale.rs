//! Downscaling the 32-bit mix accumulator into the sink's configured bit
//! depth, written big-endian into a staging ring the sender drains in
//! fixed-size slices.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, BytesMut};

/// Writes `samples` (full 32-bit resolution) into `out` at `bit_depth`,
/// big-endian, appending to whatever `out` already holds. Returns the
/// number of bytes written. `bit_depth` must be one of 8/16/24/32 --
/// validated at sink construction, so this never needs to fail at runtime.
pub fn downscale_into(out: &mut BytesMut, samples: &[i32], bit_depth: u16) -> usize {
    let start = out.len();
    match bit_depth {
        8 => {
            for &s in samples {
                // take the top byte of the 32-bit sample, bias to unsigned
                // the way 8-bit PCM (u8) is conventionally stored
                let shifted = (s >> 24) as i8;
                out.put_u8((shifted as i32 + 128) as u8);
            }
        }
        16 => {
            for &s in samples {
                out.put_i16((s >> 16) as i16);
            }
        }
        24 => {
            for &s in samples {
                let bytes = s.to_be_bytes();
                out.put_slice(&bytes[0..3]);
            }
        }
        32 => {
            for &s in samples {
                out.put_i32(s);
            }
        }
        other => {
            // unreachable given construction-time validation; degrade to
            // 32-bit rather than panic in a real-time thread
            debug_assert!(false, "unsupported bit depth {other}");
            for &s in samples {
                out.put_i32(s);
            }
        }
    }
    out.len() - start
}

#[must_use]
pub fn bytes_per_sample(bit_depth: u16) -> usize {
    match bit_depth {
        8 => 1,
        16 => 2,
        24 => 3,
        32 => 4,
        _ => 4,
    }
}

/// The staging buffer the mixer downscales into on its way to the primary
/// sender. Sized to hold `staging_multiple` mixer chunks; the mixer writes
/// one chunk per tick and drains it again the same tick, so in steady state
/// the ring never approaches its capacity -- the headroom exists for a
/// sender that falls behind a beat, matching the component design's "8x
/// chunk-sized staging ring" sizing. Overflow truncates from the front
/// (oldest bytes) rather than blocking the mixer thread.
pub struct StagingRing {
    bytes: VecDeque<u8>,
    capacity: usize,
    overflow_count: AtomicU64,
}

impl StagingRing {
    #[must_use]
    pub fn new(chunk_size_bytes: usize, staging_multiple: usize) -> Self {
        let capacity = chunk_size_bytes.max(1) * staging_multiple.max(1);
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Pushes freshly downscaled bytes, truncating the oldest bytes if the
    /// ring would otherwise exceed capacity.
    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend(data.iter().copied());
        while self.bytes.len() > self.capacity {
            self.bytes.pop_front();
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drains up to `chunk_size_bytes` from the front of the ring. Returns
    /// fewer bytes than requested only when the ring holds less than a full
    /// chunk (the mixer truncates the payload rather than blocking).
    pub fn drain_chunk(&mut self, chunk_size_bytes: usize) -> Vec<u8> {
        let take = chunk_size_bytes.min(self.bytes.len());
        self.bytes.drain(0..take).collect()
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downscale_16bit_truncates_high_word() {
        let mut out = BytesMut::new();
        let written = downscale_into(&mut out, &[0x1234_5678_i32], 16);
        assert_eq!(written, 2);
        assert_eq!(&out[..], &0x1234_i16.to_be_bytes());
    }

    #[test]
    fn downscale_32bit_is_identity_big_endian() {
        let mut out = BytesMut::new();
        downscale_into(&mut out, &[-1i32], 32);
        assert_eq!(&out[..], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn downscale_24bit_takes_top_three_bytes() {
        let mut out = BytesMut::new();
        downscale_into(&mut out, &[0x01020304_i32], 24);
        assert_eq!(&out[..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn bytes_per_sample_matches_depth() {
        assert_eq!(bytes_per_sample(16), 2);
        assert_eq!(bytes_per_sample(24), 3);
    }
}
