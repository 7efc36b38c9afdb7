mod state;
mod verify;

pub use state::PieceStates;
pub use verify::verify_piece;

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Number of blocks in a piece of `piece_length` bytes
pub fn block_count(piece_length: u64) -> u32 {
    piece_length.div_ceil(BLOCK_SIZE as u64) as u32
}

/// Length of block `block_index`; only the last block may be short
pub fn block_length(piece_length: u64, block_index: u32) -> u32 {
    let offset = block_index as u64 * BLOCK_SIZE as u64;
    std::cmp::min(BLOCK_SIZE as u64, piece_length.saturating_sub(offset)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_geometry() {
        for piece_length in [1u64, 16383, 16384, 16385, 32768, 40000, 262144, 262145] {
            let count = block_count(piece_length);
            assert_eq!(count as u64, piece_length.div_ceil(BLOCK_SIZE as u64));

            let last = block_length(piece_length, count - 1);
            assert_eq!(
                last as u64,
                piece_length - BLOCK_SIZE as u64 * (count as u64 - 1)
            );

            let total: u64 = (0..count).map(|i| block_length(piece_length, i) as u64).sum();
            assert_eq!(total, piece_length);
        }
    }

    #[test]
    fn test_two_block_piece() {
        assert_eq!(block_count(32768), 2);
        assert_eq!(block_length(32768, 0), BLOCK_SIZE);
        assert_eq!(block_length(32768, 1), BLOCK_SIZE);
    }
}
