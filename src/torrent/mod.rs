mod context;
mod metainfo;
mod piece;

pub use context::TorrentContext;
pub use metainfo::Metainfo;
pub use piece::PieceHashes;

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A file's position within the torrent payload, `[begin, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDetail {
    pub path: Vec<String>,
    pub begin: u64,
    pub end: u64,
}

impl FileDetail {
    pub fn new(path: Vec<String>, begin: u64, end: u64) -> Self {
        Self { path, begin, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.begin <= offset && offset < self.end
    }

    /// Path relative to the download root
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<Metainfo> {
    let data = fs::read(path).await?;
    Metainfo::from_bytes(&data)
}
