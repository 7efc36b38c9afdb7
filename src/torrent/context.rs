use super::{FileDetail, Metainfo, PieceHashes};
use crate::error::{BittorrentError, Result};
use crate::piece::{verify_piece, PieceStates};
use crate::storage::Storage;
use std::path::Path;
use std::sync::Arc;

/// Everything a peer connection needs to know about the torrent it serves.
///
/// Shared between all connections of one download; the piece states inside
/// are the only mutable part.
pub struct TorrentContext {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub piece_length: u64,
    pub total_length: u64,
    pub hashes: PieceHashes,
    pub storage: Storage,
    pub states: Arc<PieceStates>,
}

impl TorrentContext {
    pub fn new<P: AsRef<Path>>(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        root: P,
        piece_length: u64,
        files: Vec<FileDetail>,
        hashes: PieceHashes,
    ) -> Self {
        let total_length = files.last().map(|f| f.end).unwrap_or(0);
        let states = Arc::new(PieceStates::new(piece_length, total_length));

        Self {
            info_hash,
            peer_id,
            piece_length,
            total_length,
            hashes,
            storage: Storage::new(root, files, piece_length),
            states,
        }
    }

    pub fn from_metainfo<P: AsRef<Path>>(meta: &Metainfo, root: P, peer_id: [u8; 20]) -> Self {
        Self::new(
            meta.info_hash,
            peer_id,
            root,
            meta.info.piece_length,
            meta.info.file_details(),
            meta.info.pieces.clone(),
        )
    }

    pub fn piece_count(&self) -> usize {
        self.states.piece_count()
    }

    pub fn piece_len(&self, index: u32) -> u64 {
        self.states.piece_len(index)
    }

    /// Hash piece `index` as it is on disk against the metainfo digest
    pub async fn check_piece(&self, index: u32) -> Result<()> {
        let expected = self.hashes.get(index).ok_or_else(|| {
            BittorrentError::Protocol(format!("piece {} is out of range", index))
        })?;

        match verify_piece(&self.storage, index, self.piece_len(index), expected).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BittorrentError::PieceCheckFailed(index)),
            Err(e) => {
                // The blocks are not readable, so none of them count as done
                self.states.reset_piece(index);
                Err(e)
            }
        }
    }
}
