//! Segment type and range planning.

use serde::{Deserialize, Serialize};

/// A single segment: byte range `[start, end]` (both inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl Segment {
    /// Length of this segment in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Curl range value (no `bytes=` prefix) for the part after `offset` bytes
    /// already on disk: `start+offset-end`.
    pub fn range_from(&self, offset: u64) -> String {
        format!("{}-{}", self.start + offset, self.end)
    }

    /// HTTP Range header value for the whole segment.
    pub fn range_header_value(&self) -> String {
        format!("bytes={}", self.range_from(0))
    }
}

/// Builds a segment plan for `total_size` bytes and up to `max_connections` segments.
///
/// Segment size is `max(segment_size, total_size / max_connections)`, so small
/// files get fewer, larger-than-minimum segments; the last segment absorbs the
/// remainder. Returns an empty vec if `total_size` is 0.
pub fn plan_segments(total_size: u64, max_connections: usize, segment_size: u64) -> Vec<Segment> {
    if total_size == 0 {
        return Vec::new();
    }

    let connections = max_connections.max(1) as u64;
    let size = segment_size.max(total_size / connections).max(1);
    let count = (total_size / size).clamp(1, connections);

    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * size;
        let end = if i + 1 == count {
            total_size - 1
        } else {
            start + size - 1
        };
        out.push(Segment {
            index: i as usize,
            start,
            end,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_contiguous(segs: &[Segment], total: u64) {
        assert_eq!(segs[0].start, 0);
        for w in segs.windows(2) {
            assert_eq!(w[0].end + 1, w[1].start);
        }
        assert_eq!(segs.last().unwrap().end, total - 1);
        assert_eq!(segs.iter().map(Segment::len).sum::<u64>(), total);
    }

    #[test]
    fn plan_segments_even() {
        let segs = plan_segments(16 * MIB, 4, MIB);
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].start, 0);
        assert_eq!(segs[0].end, 4 * MIB - 1);
        assert_eq!(segs[3].start, 12 * MIB);
        assert_eq!(segs[3].end, 16 * MIB - 1);
        assert_contiguous(&segs, 16 * MIB);
    }

    #[test]
    fn last_segment_absorbs_remainder() {
        let total = 10 * MIB + 3;
        let segs = plan_segments(total, 4, MIB);
        assert_eq!(segs.len(), 4);
        let per = total / 4;
        assert_eq!(segs[0].len(), per);
        assert_eq!(segs[3].len(), total - 3 * per);
        assert_contiguous(&segs, total);
    }

    #[test]
    fn configured_size_limits_segment_count() {
        // 3 MiB with an 1 MiB floor and 8 connections -> three 1 MiB segments.
        let segs = plan_segments(3 * MIB, 8, MIB);
        assert_eq!(segs.len(), 3);
        assert!(segs.iter().all(|s| s.len() == MIB));
        assert_contiguous(&segs, 3 * MIB);
    }

    #[test]
    fn smaller_than_segment_size_is_one_segment() {
        let segs = plan_segments(100, 4, MIB);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start, 0);
        assert_eq!(segs[0].end, 99);
    }

    #[test]
    fn plan_segments_empty() {
        assert!(plan_segments(0, 4, MIB).is_empty());
    }

    #[test]
    fn zero_connections_treated_as_one() {
        let segs = plan_segments(1000, 0, 10);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].len(), 1000);
    }

    #[test]
    fn segment_range_header() {
        let s = Segment {
            index: 0,
            start: 0,
            end: 98,
        };
        assert_eq!(s.range_header_value(), "bytes=0-98");
        assert_eq!(s.len(), 99);
        assert_eq!(s.range_from(10), "10-98");
    }

    #[test]
    fn segment_range_header_single_byte() {
        let s = Segment {
            index: 3,
            start: 42,
            end: 42,
        };
        assert_eq!(s.range_header_value(), "bytes=42-42");
        assert_eq!(s.len(), 1);
    }
}
