//! Saturating sample mixing and CSRC aggregation.

use crate::protocol_constants::RTP_MAX_CSRC_COUNT;

/// Mixes `addend` into `accumulator` element-wise, saturating each int32
/// lane to `[i32::MIN, i32::MAX]`. Accumulation happens in int64 so the sum
/// never silently wraps before the clamp is applied.
///
/// `accumulator` and `addend` must be the same length; mismatched lengths
/// are a caller bug (chunk-shape validation happens before a chunk reaches
/// the mixer), so this only mixes the overlapping prefix.
pub fn saturating_mix_into(accumulator: &mut [i32], addend: &[i32]) {
    let n = accumulator.len().min(addend.len());
    for i in 0..n {
        let sum = i64::from(accumulator[i]) + i64::from(addend[i]);
        accumulator[i] = sum.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    }
}

/// A sorted, deduplicated, size-bounded set of contributing SSRCs.
///
/// RTP headers can carry at most 15 CSRC identifiers; when the union of
/// active sources' SSRCs exceeds that, the set is truncated by sort order.
/// This is a known, documented approximation -- see `truncated_count`.
#[derive(Debug, Default, Clone)]
pub struct CsrcSet {
    sorted: Vec<u32>,
    truncated_events: u64,
}

impl CsrcSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.sorted.clear();
    }

    /// Merges `ssrcs` into the set, then sorts, dedups, and truncates to
    /// [`RTP_MAX_CSRC_COUNT`], incrementing the truncation counter if the
    /// union exceeded the cap.
    pub fn extend_and_truncate(&mut self, ssrcs: &[u32]) {
        self.sorted.extend_from_slice(ssrcs);
        self.sorted.sort_unstable();
        self.sorted.dedup();
        if self.sorted.len() > RTP_MAX_CSRC_COUNT {
            self.sorted.truncate(RTP_MAX_CSRC_COUNT);
            self.truncated_events += 1;
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.sorted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    #[must_use]
    pub fn truncated_events(&self) -> u64 {
        self.truncated_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_saturates_on_positive_overflow() {
        let mut acc = [i32::MAX - 5];
        saturating_mix_into(&mut acc, &[10]);
        assert_eq!(acc[0], i32::MAX);
    }

    #[test]
    fn mix_saturates_on_negative_overflow() {
        let mut acc = [i32::MIN + 5];
        saturating_mix_into(&mut acc, &[-10]);
        assert_eq!(acc[0], i32::MIN);
    }

    #[test]
    fn mix_cancels_to_zero() {
        let mut acc = [1000i32, 1000];
        saturating_mix_into(&mut acc, &[-1000, -1000]);
        assert_eq!(acc, [0, 0]);
    }

    #[test]
    fn csrc_set_dedups_and_sorts() {
        let mut set = CsrcSet::new();
        set.extend_and_truncate(&[5, 1, 5, 3]);
        assert_eq!(set.as_slice(), &[1, 3, 5]);
    }

    #[test]
    fn csrc_set_truncates_at_fifteen_and_counts() {
        let mut set = CsrcSet::new();
        let many: Vec<u32> = (0..20).collect();
        set.extend_and_truncate(&many);
        assert_eq!(set.len(), RTP_MAX_CSRC_COUNT);
        assert_eq!(set.truncated_events(), 1);
        assert_eq!(set.as_slice(), &(0..15).collect::<Vec<u32>>()[..]);
    }
}
