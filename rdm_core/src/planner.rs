//! Deterministic function of `PlanMeta` to an ordered list of `Segment`s.
//! Uses a fixed segment-size grid rather than dynamic halving, because
//! resumability requires that re-planning the same `PlanMeta` always
//! yields the same boundaries.

use crate::codec::map_range;
use crate::types::{Segment, PlanMeta};

/// Plans segments covering `[0, meta.total_size)` and returns them together
/// with `total_encrypted`, the sum of each segment's underlying ciphertext
/// length (or plaintext length in plain mode).
pub fn plan_segments(meta: &PlanMeta) -> (Vec<Segment>, u64) {
    if meta.total_size == 0 {
        return (Vec::new(), 0);
    }

    let segment_size = meta.segment_size_bytes.max(1);
    let mut segments = Vec::new();
    let mut offset = 0u64;
    let mut index = 0u64;
    let mut total_encrypted = 0u64;

    while offset < meta.total_size {
        let length = segment_size.min(meta.total_size - offset);
        let mapping = map_range(meta, offset, length);
        total_encrypted += mapping.underlying_limit;
        segments.push(Segment::new(index, offset, length, mapping));
        offset += length;
        index += 1;
    }

    (segments, total_encrypted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EncryptionMode;

    #[test]
    fn plain_passthrough_scenario_1() {
        let meta = PlanMeta {
            total_size: 10 * 1024 * 1024,
            block_data_size: 0,
            block_header_size: 0,
            file_header_size: 0,
            encryption_mode: EncryptionMode::Plain,
            segment_size_bytes: 4 * 1024 * 1024,
        };
        let (segments, total_encrypted) = plan_segments(&meta);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].plaintext_length, 4 * 1024 * 1024);
        assert_eq!(segments[1].plaintext_length, 4 * 1024 * 1024);
        assert_eq!(segments[2].plaintext_length, 2 * 1024 * 1024);
        assert_eq!(total_encrypted, meta.total_size);

        let covered: u64 = segments.iter().map(|s| s.plaintext_length).sum();
        assert_eq!(covered, meta.total_size);
    }

    #[test]
    fn segments_are_contiguous_and_monotonic() {
        let meta = PlanMeta {
            total_size: 12345,
            block_data_size: 0,
            block_header_size: 0,
            file_header_size: 0,
            encryption_mode: EncryptionMode::Plain,
            segment_size_bytes: 1000,
        };
        let (segments, _) = plan_segments(&meta);
        let mut expected_offset = 0u64;
        for (i, seg) in segments.iter().enumerate() {
            assert_eq!(seg.index, i as u64);
            assert_eq!(seg.plaintext_offset, expected_offset);
            assert!(seg.plaintext_length <= meta.segment_size_bytes);
            expected_offset += seg.plaintext_length;
        }
        assert_eq!(expected_offset, meta.total_size);
        // Only the last segment may be shorter than the segment size.
        for seg in &segments[..segments.len() - 1] {
            assert_eq!(seg.plaintext_length, meta.segment_size_bytes);
        }
    }

    #[test]
    fn empty_file_has_no_segments() {
        let meta = PlanMeta {
            total_size: 0,
            block_data_size: 0,
            block_header_size: 0,
            file_header_size: 0,
            encryption_mode: EncryptionMode::Plain,
            segment_size_bytes: 1000,
        };
        let (segments, total) = plan_segments(&meta);
        assert!(segments.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn crypt_mode_segments_use_codec_mapping() {
        let meta = PlanMeta {
            total_size: 100,
            block_data_size: 64,
            block_header_size: 16,
            file_header_size: 32,
            encryption_mode: EncryptionMode::Crypt,
            segment_size_bytes: 2 * 1024 * 1024,
        };
        let (segments, total_encrypted) = plan_segments(&meta);
        assert_eq!(segments.len(), 1);
        let mapping = segments[0].mapping;
        assert_eq!(mapping.underlying_offset, 32);
        assert_eq!(mapping.underlying_limit, 160);
        assert_eq!(total_encrypted, 160);
    }
}
