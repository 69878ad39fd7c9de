//! Chunk-part identity and stripe arithmetic (spec §4.1, component C1).
//!
//! A chunk is a fixed 64 MiB logical segment of a file, made of 1024 blocks
//! of 64 KiB each. It is stored either as a `Standard` whole-chunk replica,
//! or split across an XOR level `L` into `L` data pieces and one parity
//! piece.

use std::fmt;

/// Blocks per chunk (spec GLOSSARY, §3).
pub const BLOCKS_IN_CHUNK: u32 = 1024;
/// Bytes per block (spec GLOSSARY).
pub const BLOCK_SIZE: u32 = 64 * 1024;
/// Bytes per chunk: 64 MiB.
pub const CHUNK_SIZE: u64 = BLOCKS_IN_CHUNK as u64 * BLOCK_SIZE as u64;

/// Minimum and maximum supported XOR level (spec §4.1: `2 <= L <= 9`).
pub const MIN_XOR_LEVEL: u8 = 2;
pub const MAX_XOR_LEVEL: u8 = 9;

/// A chunk part identity: either the whole chunk, or one piece of an XOR
/// stripe set (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkPartType {
    /// The whole chunk is stored as a single replica.
    Standard,
    /// One piece of an XOR level `level`. `piece` is 1-based: `1..=level`
    /// are data slices, `level + 1` is the parity slice.
    Xor { level: u8, piece: u8 },
}

impl ChunkPartType {
    /// Construct an XOR part, validating the level/piece bounds from spec
    /// §4.1 (`2 <= L <= 9`, `1 <= p <= L+1`).
    pub fn xor(level: u8, piece: u8) -> Option<ChunkPartType> {
        if !(MIN_XOR_LEVEL..=MAX_XOR_LEVEL).contains(&level) {
            return None;
        }
        if !(1..=level + 1).contains(&piece) {
            return None;
        }
        Some(ChunkPartType::Xor { level, piece })
    }

    pub fn is_standard(self) -> bool {
        matches!(self, ChunkPartType::Standard)
    }

    /// Whether this part holds a parity slice (the `level + 1`'th piece of
    /// an XOR set). Standard parts are never parity.
    pub fn is_parity(self) -> bool {
        match self {
            ChunkPartType::Standard => false,
            ChunkPartType::Xor { level, piece } => piece == level + 1,
        }
    }

    /// The XOR level of this part, if it is an XOR part.
    pub fn level(self) -> Option<u8> {
        match self {
            ChunkPartType::Standard => None,
            ChunkPartType::Xor { level, .. } => Some(level),
        }
    }

    /// The number of blocks this part type holds, given a chunk that logically
    /// has `blocks_in_chunk` blocks (normally [`BLOCKS_IN_CHUNK`], but the
    /// last chunk of a file may be logically shorter).
    ///
    /// Spec §4.1: "data pieces hold `ceil((1024 - piece_index_among_data)/L)`
    /// blocks, parity holds `ceil(1024/L)` blocks." Generalised here to an
    /// arbitrary block count so truncated chunks are handled the same way.
    pub fn piece_block_count(self, blocks_in_chunk: u32) -> u32 {
        match self {
            ChunkPartType::Standard => blocks_in_chunk,
            ChunkPartType::Xor { level, piece } => {
                let level = level as u32;
                if self.is_parity() {
                    div_ceil(blocks_in_chunk, level)
                } else {
                    // piece is 1-based; the data-piece index among data
                    // pieces is (piece - 1), 0-based.
                    let piece_index = (piece as u32) - 1;
                    div_ceil(blocks_in_chunk.saturating_sub(piece_index), level)
                }
            }
        }
    }

    /// For an XOR data piece, maps logical block index `k` (0-based, within
    /// the whole chunk) to `(piece, stripe_position)` -- spec §4.1: "block
    /// `k` of the logical chunk lives in piece `1 + (k mod L)` at stripe
    /// position `k div L`."
    pub fn locate_block(level: u8, block_index: u32) -> (u8, u32) {
        let level = level as u32;
        let piece = 1 + (block_index % level);
        let stripe = block_index / level;
        (piece as u8, stripe)
    }

    /// Inverse of [`locate_block`](Self::locate_block): logical block index
    /// for a given data piece and stripe position.
    pub fn block_index(level: u8, piece: u8, stripe: u32) -> u32 {
        stripe * (level as u32) + (piece as u32 - 1)
    }
}

impl fmt::Display for ChunkPartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkPartType::Standard => write!(f, "standard"),
            ChunkPartType::Xor { level, piece } if self.is_parity() => {
                write!(f, "xor{}/parity", level)
            }
            ChunkPartType::Xor { level, piece } => write!(f, "xor{}/{}", level, piece),
        }
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// A half-open logical block range `[first, first + count)` within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub first: u32,
    pub count: u32,
}

impl BlockRange {
    pub fn new(first: u32, count: u32) -> Self {
        BlockRange { first, count }
    }

    pub fn end(self) -> u32 {
        self.first + self.count
    }

    pub fn is_empty(self) -> bool {
        self.count == 0
    }

    pub fn contains(self, block: u32) -> bool {
        block >= self.first && block < self.end()
    }

    pub fn intersects(self, other: BlockRange) -> bool {
        self.first < other.end() && other.first < self.end()
    }

    /// Stripe positions (for a given XOR level) touched by this block range.
    pub fn stripes(self, level: u8) -> std::ops::Range<u32> {
        if self.is_empty() {
            return 0..0;
        }
        let level = level as u32;
        let first_stripe = self.first / level;
        let last_stripe = (self.end() - 1) / level;
        first_stripe..(last_stripe + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_bounds_are_enforced() {
        assert!(ChunkPartType::xor(1, 1).is_none());
        assert!(ChunkPartType::xor(10, 1).is_none());
        assert!(ChunkPartType::xor(3, 0).is_none());
        assert!(ChunkPartType::xor(3, 5).is_none());
        assert!(ChunkPartType::xor(3, 4).is_some()); // parity piece
    }

    #[test]
    fn parity_is_the_last_piece() {
        let parity = ChunkPartType::xor(3, 4).unwrap();
        assert!(parity.is_parity());
        for p in 1..=3 {
            assert!(!ChunkPartType::xor(3, p).unwrap().is_parity());
        }
    }

    #[test]
    fn locate_block_and_block_index_are_inverses() {
        let level = 3u8;
        for k in 0..100u32 {
            let (piece, stripe) = ChunkPartType::locate_block(level, k);
            assert_eq!(ChunkPartType::block_index(level, piece, stripe), k);
        }
    }

    #[test]
    fn piece_block_counts_cover_the_full_chunk() {
        // Spec invariant: sum of data piece block counts == total blocks.
        for level in MIN_XOR_LEVEL..=MAX_XOR_LEVEL {
            let mut total = 0u32;
            for piece in 1..=level {
                let part = ChunkPartType::xor(level, piece).unwrap();
                total += part.piece_block_count(BLOCKS_IN_CHUNK);
            }
            assert_eq!(total, BLOCKS_IN_CHUNK);

            // Parity piece block count equals the longest data piece
            // (stripe count), i.e. ceil(1024/L).
            let parity = ChunkPartType::xor(level, level + 1).unwrap();
            assert_eq!(
                parity.piece_block_count(BLOCKS_IN_CHUNK),
                div_ceil(BLOCKS_IN_CHUNK, level as u32)
            );
        }
    }

    #[test]
    fn block_range_stripes_are_half_open_and_correct() {
        let range = BlockRange::new(5, 3); // blocks 5,6,7
        assert_eq!(range.stripes(3), 1..3); // stripe(5)=1, stripe(7)=2
    }
}
