mod region;

pub use region::{map_region, FileBlock};

use crate::error::{BittorrentError, Result};
use crate::torrent::FileDetail;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;

/// Places torrent bytes in the files under the download root.
///
/// Every write is an independent open/seek/write/close at an explicit offset,
/// so several connections can write into the same file without coordination.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    files: Vec<FileDetail>,
    piece_length: u64,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(root: P, files: Vec<FileDetail>, piece_length: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            files,
            piece_length,
        }
    }

    /// Map a block of piece `index` starting at `begin` onto files
    pub fn block_region(&self, index: u32, begin: u32, length: usize) -> Result<Vec<FileBlock>> {
        let offset = index as u64 * self.piece_length + begin as u64;
        map_region(&self.files, offset, length)
    }

    /// Write a received block to every file it overlaps
    pub async fn write_block(&self, index: u32, begin: u32, data: &[u8]) -> Result<()> {
        for block in self.block_region(index, begin, data.len())? {
            let path = self.root.join(&block.path);
            self.write_at(&path, block.file_offset, &data[block.range.clone()])
                .await
                .map_err(|e| BittorrentError::storage(&path, e))?;

            debug!(
                "Wrote {} bytes of piece {} to {:?} at offset {}",
                block.range.len(),
                index,
                path,
                block.file_offset
            );
        }
        Ok(())
    }

    /// Stream `length` bytes of piece `index` from disk into `sink`
    pub async fn read_piece<F>(&self, index: u32, length: u64, mut sink: F) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        let offset = index as u64 * self.piece_length;
        let mut buffer = vec![0u8; READ_CHUNK];

        for block in map_region(&self.files, offset, length as usize)? {
            let path = self.root.join(&block.path);
            let mut file = File::open(&path)
                .await
                .map_err(|e| BittorrentError::storage(&path, e))?;
            file.seek(SeekFrom::Start(block.file_offset))
                .await
                .map_err(|e| BittorrentError::storage(&path, e))?;

            let mut remaining = block.range.len();
            while remaining > 0 {
                let want = std::cmp::min(remaining, buffer.len());
                let n = file
                    .read(&mut buffer[..want])
                    .await
                    .map_err(|e| BittorrentError::storage(&path, e))?;
                if n == 0 {
                    return Err(BittorrentError::storage(
                        &path,
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "file shorter than its torrent range",
                        ),
                    ));
                }
                sink(&buffer[..n]);
                remaining -= n;
            }
        }
        Ok(())
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        // tokio completes file writes in the background; wait for them
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn two_file_storage(temp: &TempDir) -> Storage {
        let files = vec![
            FileDetail::new(vec!["dir".into(), "a".into()], 0, 10),
            FileDetail::new(vec!["dir".into(), "b".into()], 10, 30),
        ];
        Storage::new(temp.path(), files, 16)
    }

    #[tokio::test]
    async fn test_write_block_across_file_boundary() {
        let temp = TempDir::new().unwrap();
        let storage = two_file_storage(&temp);

        let data: Vec<u8> = (0..20).collect();
        // Piece 0, offset 5: torrent bytes [5, 25)
        storage.write_block(0, 5, &data).await.unwrap();

        let a = tokio::fs::read(temp.path().join("dir/a")).await.unwrap();
        let b = tokio::fs::read(temp.path().join("dir/b")).await.unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(&a[5..], &data[..5]);
        assert_eq!(b, &data[5..]);
    }

    #[tokio::test]
    async fn test_writes_land_at_offsets_in_any_order() {
        let temp = TempDir::new().unwrap();
        let storage = two_file_storage(&temp);

        storage.write_block(1, 0, &[2u8; 14]).await.unwrap();
        storage.write_block(0, 0, &[1u8; 16]).await.unwrap();

        let mut piece0 = Vec::new();
        storage
            .read_piece(0, 16, |chunk| piece0.extend_from_slice(chunk))
            .await
            .unwrap();
        assert_eq!(piece0, vec![1u8; 16]);

        let mut piece1 = Vec::new();
        storage
            .read_piece(1, 14, |chunk| piece1.extend_from_slice(chunk))
            .await
            .unwrap();
        assert_eq!(piece1, vec![2u8; 14]);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let storage = two_file_storage(&temp);

        let result = storage.read_piece(0, 16, |_| {}).await;
        assert!(matches!(result, Err(BittorrentError::Storage { .. })));
    }

    #[tokio::test]
    async fn test_write_failure_reports_path() {
        let temp = TempDir::new().unwrap();
        // A regular file where a directory is expected
        std::fs::write(temp.path().join("dir"), b"x").unwrap();
        let storage = two_file_storage(&temp);

        match storage.write_block(0, 0, &[0u8; 4]).await {
            Err(BittorrentError::Storage { path, .. }) => {
                assert_eq!(path, temp.path().join("dir/a"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
