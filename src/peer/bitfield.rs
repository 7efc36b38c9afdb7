use crate::piece::PieceStates;

/// The set of pieces a remote peer claims to have, MSB-first per byte.
///
/// Sized from the torrent's piece count; the peer cannot grow it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Take a received bitfield, dropping bytes past the piece count and
    /// zero-filling a short one
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bitfield = Self::new(piece_count);
        let n = bitfield.bits.len().min(bytes.len());
        bitfield.bits[..n].copy_from_slice(&bytes[..n]);
        bitfield
    }

    pub fn has_piece(&self, piece_index: u32) -> bool {
        let byte_index = piece_index as usize / 8;
        let bit_index = 7 - (piece_index % 8);

        self.bits
            .get(byte_index)
            .map(|byte| (byte >> bit_index) & 1 == 1)
            .unwrap_or(false)
    }

    /// Record a `have` announcement. Returns false for an index past the
    /// piece count, which is ignored.
    pub fn set_piece(&mut self, piece_index: u32) -> bool {
        if piece_index as usize >= self.piece_count {
            return false;
        }
        self.bits[piece_index as usize / 8] |= 1 << (7 - (piece_index % 8));
        true
    }

    /// Pieces the peer has that are not yet complete locally.
    ///
    /// Bits past the torrent's piece count are ignored.
    pub fn wanted_pieces(&self, states: &PieceStates) -> Vec<u32> {
        (0..states.piece_count() as u32)
            .filter(|&index| self.has_piece(index) && !states.is_piece_done(index))
            .collect()
    }
}
