use crate::error::{BittorrentError, Result};
use crate::torrent::FileDetail;
use std::ops::Range;
use std::path::PathBuf;

/// The part of a block that lands in one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    /// Path relative to the download root
    pub path: PathBuf,
    /// Where the slice starts inside that file
    pub file_offset: u64,
    /// Which bytes of the block go there
    pub range: Range<usize>,
}

/// Translate `[offset, offset + length)` of the torrent payload into per-file
/// slices.
///
/// The returned ranges tile `0..length` in order, without gaps or overlaps.
/// Fails if the region runs past the last file.
pub fn map_region(files: &[FileDetail], offset: u64, length: usize) -> Result<Vec<FileBlock>> {
    if length == 0 {
        return Ok(Vec::new());
    }
    let region_end = offset + length as u64;

    // Single-file torrents: one slice at the absolute offset
    if let [file] = files {
        if region_end > file.end {
            return Err(out_of_bounds(offset, length));
        }
        return Ok(vec![FileBlock {
            path: file.relative_path(),
            file_offset: offset - file.begin,
            range: 0..length,
        }]);
    }

    let first = files
        .iter()
        .position(|f| f.contains(offset))
        .ok_or_else(|| out_of_bounds(offset, length))?;

    let mut blocks = Vec::new();
    let mut cursor = offset;
    let mut consumed = 0usize;

    for file in &files[first..] {
        if file.is_empty() {
            continue;
        }

        let file_writable = file.end - cursor;
        let block_writable = (length - consumed) as u64;
        let take = std::cmp::min(file_writable, block_writable) as usize;

        blocks.push(FileBlock {
            path: file.relative_path(),
            file_offset: cursor - file.begin,
            range: consumed..consumed + take,
        });

        consumed += take;
        cursor += take as u64;
        if consumed == length {
            return Ok(blocks);
        }
    }

    Err(out_of_bounds(offset, length))
}

fn out_of_bounds(offset: u64, length: usize) -> BittorrentError {
    BittorrentError::Protocol(format!(
        "region of {} bytes at offset {} lies outside the torrent payload",
        length, offset
    ))
}
