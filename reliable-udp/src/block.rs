//! Application data split into transmission blocks.
//!
//! A session's payload is cut once, up front, into [`Block`]s whose lengths
//! are drawn uniformly from a configured range.  Blocks are immutable after
//! creation and only the sender ever holds them; the receiver sees byte
//! ranges.
//!
//! Byte offsets are 1-based: the first block starts at byte 1, matching the
//! receiver's initial expected offset.

use std::ops::RangeInclusive;

use rand::Rng;

use crate::config::ConfigError;

/// Offset of the first byte of the first block.
pub const FIRST_BYTE: u32 = 1;

/// Longest stream whose every offset, including the cumulative ACK one past
/// the last byte, fits in 32 bits.
pub const MAX_STREAM_BYTES: u64 = u32::MAX as u64 - FIRST_BYTE as u64;

/// Reject streams too long to number with 32-bit byte offsets.
pub fn check_stream_len(bytes: u64) -> Result<(), ConfigError> {
    if bytes > MAX_STREAM_BYTES {
        return Err(ConfigError::StreamTooLarge(bytes));
    }
    Ok(())
}

/// One unit of application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// 1-based sequence number.
    pub index: usize,
    /// Offset of this block's first byte in the stream.
    pub start_byte: u32,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Offset of this block's last byte.
    pub fn end_byte(&self) -> u32 {
        self.start_byte + self.payload.len() as u32 - 1
    }

    /// Offset of the byte after this block (the cumulative ACK that
    /// acknowledges it in byte-offset mode).
    pub fn next_byte(&self) -> u32 {
        self.start_byte + self.payload.len() as u32
    }
}

/// Split `data` into blocks with lengths drawn from `len_range`.
///
/// The final block takes whatever remains and may be shorter than the lower
/// bound.  Returns an empty vector for empty input.
pub fn partition<R: Rng>(
    data: &[u8],
    len_range: RangeInclusive<usize>,
    rng: &mut R,
) -> Result<Vec<Block>, ConfigError> {
    check_len_range(&len_range)?;
    check_stream_len(data.len() as u64)?;

    let mut blocks = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let want = rng.random_range(len_range.clone());
        let end = (offset + want).min(data.len());
        blocks.push(Block {
            index: blocks.len() + 1,
            start_byte: FIRST_BYTE + offset as u32,
            payload: data[offset..end].to_vec(),
        });
        offset = end;
    }
    Ok(blocks)
}

/// Generate `count` blocks of random uppercase ASCII (`A`–`Z`) whose lengths
/// are drawn from `len_range`.
///
/// Fails up front when `count` blocks of the longest length could overrun
/// the byte-offset space.
pub fn random_blocks<R: Rng>(
    count: usize,
    len_range: RangeInclusive<usize>,
    rng: &mut R,
) -> Result<Vec<Block>, ConfigError> {
    check_len_range(&len_range)?;
    check_stream_len((count as u64).saturating_mul(*len_range.end() as u64))?;

    let mut blocks = Vec::with_capacity(count);
    let mut start_byte = FIRST_BYTE;
    for index in 1..=count {
        let len = rng.random_range(len_range.clone());
        let payload: Vec<u8> = (0..len).map(|_| rng.random_range(b'A'..=b'Z')).collect();
        blocks.push(Block {
            index,
            start_byte,
            payload,
        });
        start_byte += len as u32;
    }
    Ok(blocks)
}

fn check_len_range(len_range: &RangeInclusive<usize>) -> Result<(), ConfigError> {
    let (min, max) = (*len_range.start(), *len_range.end());
    if min == 0 || min > max {
        return Err(ConfigError::BlockLength { min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_contiguous(blocks: &[Block]) {
        let mut expected = FIRST_BYTE;
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.index, i + 1);
            assert_eq!(b.start_byte, expected);
            expected = b.next_byte();
        }
    }

    #[test]
    fn partition_covers_all_bytes_in_order() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let blocks = partition(&data, 5..=10, &mut rng).unwrap();

        assert_contiguous(&blocks);
        let joined: Vec<u8> = blocks.iter().flat_map(|b| b.payload.clone()).collect();
        assert_eq!(joined, data);

        let (last, rest) = blocks.split_last().unwrap();
        assert!(rest.iter().all(|b| (5..=10).contains(&b.len())));
        assert!(last.len() <= 10);
        // ceil(1000 / 7.5) ≈ 134; allow for the spread of a uniform draw.
        assert!((100..=200).contains(&blocks.len()), "got {}", blocks.len());
    }

    #[test]
    fn partition_of_empty_input_is_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(partition(&[], 5..=10, &mut rng).unwrap().is_empty());
    }

    #[test]
    fn random_blocks_respect_length_range_and_alphabet() {
        let mut rng = StdRng::seed_from_u64(42);
        let blocks = random_blocks(20, 40..=80, &mut rng).unwrap();
        assert_eq!(blocks.len(), 20);
        assert_contiguous(&blocks);
        for b in &blocks {
            assert!((40..=80).contains(&b.len()));
            assert!(b.payload.iter().all(u8::is_ascii_uppercase));
        }
    }

    #[test]
    fn end_and_next_byte() {
        let b = Block {
            index: 1,
            start_byte: 1,
            payload: vec![0; 60],
        };
        assert_eq!(b.end_byte(), 60);
        assert_eq!(b.next_byte(), 61);
    }

    #[test]
    fn same_seed_same_blocks() {
        let a = random_blocks(5, 40..=80, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = random_blocks(5, 40..=80, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn oversized_random_stream_is_rejected_before_allocating() {
        let mut rng = StdRng::seed_from_u64(1);
        // 100M blocks of up to 80 bytes would wrap the 32-bit offsets.
        let err = random_blocks(100_000_000, 40..=80, &mut rng).unwrap_err();
        assert_eq!(err, ConfigError::StreamTooLarge(8_000_000_000));
    }

    #[test]
    fn stream_length_limit_is_inclusive() {
        assert_eq!(check_stream_len(MAX_STREAM_BYTES), Ok(()));
        assert_eq!(
            check_stream_len(MAX_STREAM_BYTES + 1),
            Err(ConfigError::StreamTooLarge(MAX_STREAM_BYTES + 1))
        );
        // Largest stream still leaves room for the ACK one past its end.
        assert_eq!(FIRST_BYTE as u64 + MAX_STREAM_BYTES, u32::MAX as u64);
    }

    #[test]
    fn zero_length_blocks_are_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            partition(b"abc", 0..=4, &mut rng).unwrap_err(),
            ConfigError::BlockLength { min: 0, max: 4 }
        );
    }
}
