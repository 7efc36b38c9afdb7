use super::{block_count, BLOCK_SIZE};
use crate::error::{BittorrentError, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Outcome of marking a block as downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMark {
    /// The block was not marked before this call
    pub newly_marked: bool,
    /// This call marked the last missing block of the piece
    pub completed_piece: bool,
}

struct PieceRecord {
    block_count: u32,
    remaining: AtomicU32,
    blocks: Vec<AtomicU64>,
}

impl PieceRecord {
    fn new(block_count: u32) -> Self {
        let words = (block_count as usize).div_ceil(64);
        Self {
            block_count,
            remaining: AtomicU32::new(block_count),
            blocks: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn is_set(&self, block: u32) -> bool {
        let word = self.blocks[block as usize / 64].load(Ordering::Acquire);
        word & (1 << (block % 64)) != 0
    }

    /// Returns (was newly set, completed the piece)
    fn set(&self, block: u32) -> (bool, bool) {
        let bit = 1u64 << (block % 64);
        let previous = self.blocks[block as usize / 64].fetch_or(bit, Ordering::AcqRel);
        if previous & bit != 0 {
            return (false, false);
        }
        let completed = self.remaining.fetch_sub(1, Ordering::AcqRel) == 1;
        (true, completed)
    }

    fn fill(&self) {
        for (i, word) in self.blocks.iter().enumerate() {
            let bits_in_word = std::cmp::min(64, self.block_count as usize - i * 64);
            let mask = if bits_in_word == 64 {
                u64::MAX
            } else {
                (1u64 << bits_in_word) - 1
            };
            word.store(mask, Ordering::Release);
        }
        self.remaining.store(0, Ordering::Release);
    }

    fn clear(&self) {
        for word in &self.blocks {
            word.store(0, Ordering::Release);
        }
        self.remaining.store(self.block_count, Ordering::Release);
    }

    fn is_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

/// Per-torrent record of downloaded blocks, shared by every peer connection.
///
/// Blocks are tracked with atomic bits so connections can mark different
/// blocks of the same piece concurrently. A per-piece countdown of missing
/// blocks makes exactly one caller observe the piece becoming complete.
pub struct PieceStates {
    piece_length: u64,
    total_length: u64,
    pieces: Vec<PieceRecord>,
}

impl PieceStates {
    pub fn new(piece_length: u64, total_length: u64) -> Self {
        assert!(piece_length > 0, "piece length must be positive");

        let piece_count = total_length.div_ceil(piece_length);
        let pieces = (0..piece_count)
            .map(|index| {
                let length = std::cmp::min(piece_length, total_length - index * piece_length);
                PieceRecord::new(block_count(length))
            })
            .collect();

        Self {
            piece_length,
            total_length,
            pieces,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; the last piece may be short
    pub fn piece_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        std::cmp::min(self.piece_length, self.total_length.saturating_sub(start))
    }

    #[cfg(test)]
    pub fn block_count(&self, index: u32) -> u32 {
        self.pieces
            .get(index as usize)
            .map(|p| p.block_count)
            .unwrap_or(0)
    }

    pub fn is_block_done(&self, index: u32, begin: u32) -> bool {
        match self.locate(index, begin) {
            Ok((piece, block)) => piece.is_set(block),
            Err(_) => false,
        }
    }

    /// Record the block starting at `begin` as written. Idempotent.
    pub fn mark_block_done(&self, index: u32, begin: u32) -> Result<BlockMark> {
        let (piece, block) = self.locate(index, begin)?;
        let (newly_marked, completed_piece) = piece.set(block);
        if completed_piece {
            debug!("All {} blocks of piece {} present", piece.block_count, index);
        }
        Ok(BlockMark {
            newly_marked,
            completed_piece,
        })
    }

    pub fn is_piece_done(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .map(PieceRecord::is_done)
            .unwrap_or(false)
    }

    /// Mark every block of a piece, e.g. after it was verified on disk
    pub fn mark_piece_done(&self, index: u32) {
        if let Some(piece) = self.pieces.get(index as usize) {
            piece.fill();
        }
    }

    /// Forget every block of a piece so it can be downloaded again
    pub fn reset_piece(&self, index: u32) {
        if let Some(piece) = self.pieces.get(index as usize) {
            piece.clear();
        }
    }

    #[cfg(test)]
    pub fn completed_pieces(&self) -> Vec<u32> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_done())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_done()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(PieceRecord::is_done)
    }

    fn locate(&self, index: u32, begin: u32) -> Result<(&PieceRecord, u32)> {
        let piece = self.pieces.get(index as usize).ok_or_else(|| {
            BittorrentError::Protocol(format!("piece index {} out of range", index))
        })?;

        if begin % BLOCK_SIZE != 0 || begin / BLOCK_SIZE >= piece.block_count {
            return Err(BittorrentError::Protocol(format!(
                "block offset {} invalid for piece {}",
                begin, index
            )));
        }

        Ok((piece, begin / BLOCK_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_geometry_with_short_last_piece() {
        let states = PieceStates::new(32768, 40000);

        assert_eq!(states.piece_count(), 2);
        assert_eq!(states.piece_len(0), 32768);
        assert_eq!(states.piece_len(1), 40000 - 32768);
        assert_eq!(states.block_count(0), 2);
        assert_eq!(states.block_count(1), 1);
    }

    #[test]
    fn test_mark_is_idempotent() {
        let states = PieceStates::new(32768, 65536);

        let first = states.mark_block_done(0, 0).unwrap();
        assert!(first.newly_marked);
        assert!(!first.completed_piece);

        let second = states.mark_block_done(0, 0).unwrap();
        assert!(!second.newly_marked);
        assert!(!second.completed_piece);

        assert!(states.is_block_done(0, 0));
        assert!(!states.is_block_done(0, BLOCK_SIZE));
        assert!(!states.is_piece_done(0));
    }

    #[test]
    fn test_piece_done_iff_all_blocks_done() {
        let states = PieceStates::new(32768, 65536);

        states.mark_block_done(1, BLOCK_SIZE).unwrap();
        assert!(!states.is_piece_done(1));

        let mark = states.mark_block_done(1, 0).unwrap();
        assert!(mark.completed_piece);
        assert!(states.is_piece_done(1));
        assert!(!states.is_piece_done(0));
        assert_eq!(states.completed_pieces(), vec![1]);
    }

    #[test]
    fn test_rejects_bad_offsets() {
        let states = PieceStates::new(32768, 65536);

        assert!(states.mark_block_done(0, 100).is_err());
        assert!(states.mark_block_done(0, 2 * BLOCK_SIZE).is_err());
        assert!(states.mark_block_done(2, 0).is_err());
        assert!(!states.is_block_done(5, 0));
    }

    #[test]
    fn test_reset_and_fill() {
        let states = PieceStates::new(16384 * 70, 16384 * 140);
        assert_eq!(states.block_count(0), 70);

        states.mark_piece_done(0);
        assert!(states.is_piece_done(0));
        assert!(states.is_block_done(0, 69 * BLOCK_SIZE));

        states.reset_piece(0);
        assert!(!states.is_piece_done(0));
        assert!(!states.is_block_done(0, 0));

        // Counting starts over after a reset
        for block in 0..70 {
            let mark = states.mark_block_done(0, block * BLOCK_SIZE).unwrap();
            assert_eq!(mark.completed_piece, block == 69);
        }
        assert!(!states.is_piece_done(1));
    }

    #[test]
    fn test_concurrent_marks_complete_exactly_once() {
        let states = Arc::new(PieceStates::new(16384 * 64, 16384 * 64));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let states = Arc::clone(&states);
                std::thread::spawn(move || {
                    let mut completions = 0;
                    // Every worker marks every block; overlap is intentional
                    for block in 0..64u32 {
                        let block = (block + worker * 8) % 64;
                        if states.mark_block_done(0, block * BLOCK_SIZE).unwrap().completed_piece {
                            completions += 1;
                        }
                    }
                    completions
                })
            })
            .collect();

        let completions: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(completions, 1);
        assert!(states.is_piece_done(0));
    }
}
