//! Segment records and eviction planning

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;

/// One finalized continuous-recording file
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Number of oldest segments to evict so the rest fit in `quota_bytes`
///
/// Sizes are summed newest to oldest; the first segment that would push the
/// total over the quota is evicted together with everything older.
/// `segments` is ordered oldest first.
pub fn eviction_count(segments: &VecDeque<Segment>, quota_bytes: u64) -> usize {
    let mut total = 0u64;
    for (i, segment) in segments.iter().enumerate().rev() {
        total = total.saturating_add(segment.size_bytes);
        if total > quota_bytes {
            return i + 1;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn segments(sizes: &[u64]) -> VecDeque<Segment> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| Segment {
                path: PathBuf::from(format!("segment_{i:04}.avi")),
                created_at: Utc::now(),
                size_bytes: *size,
            })
            .collect()
    }

    #[test]
    fn test_under_quota_keeps_everything() {
        assert_eq!(eviction_count(&segments(&[10, 20, 30]), 60), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        // 30 + 20 = 50 fits, adding 10 does not
        assert_eq!(eviction_count(&segments(&[10, 20, 30]), 55), 1);
        assert_eq!(eviction_count(&segments(&[10, 20, 30]), 45), 2);
    }

    #[test]
    fn test_oversized_newest_evicts_all() {
        assert_eq!(eviction_count(&segments(&[1, 1, 100]), 50), 3);
    }

    proptest! {
        #[test]
        fn retained_fit_quota_and_are_newest(
            sizes in prop::collection::vec(0u64..1_000, 0..40),
            quota in 0u64..5_000,
        ) {
            let all = segments(&sizes);
            let evict = eviction_count(&all, quota);
            prop_assert!(evict <= all.len());

            let retained: u64 = all.iter().skip(evict).map(|s| s.size_bytes).sum();
            prop_assert!(retained <= quota);

            // Keeping one more (older) segment would break the quota
            if evict > 0 {
                prop_assert!(retained + all[evict - 1].size_bytes > quota);
            }
        }
    }
}
