use crate::error::{BittorrentError, Result};

/// Expected SHA-1 digests of every piece, in piece order
#[derive(Debug, Clone, Default)]
pub struct PieceHashes {
    hashes: Vec<[u8; 20]>,
}

impl PieceHashes {
    #[cfg(test)]
    pub fn new(hashes: Vec<[u8; 20]>) -> Self {
        Self { hashes }
    }

    /// Split the metainfo `pieces` string into 20-byte digests
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % 20 != 0 {
            return Err(BittorrentError::InvalidTorrent(format!(
                "pieces length {} is not a multiple of 20",
                data.len()
            )));
        }

        let hashes = data
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(Self { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn get(&self, index: u32) -> Option<&[u8; 20]> {
        self.hashes.get(index as usize)
    }
}
