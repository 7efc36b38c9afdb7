use crate::error::Result;
use crate::storage::Storage;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

/// Re-read piece `index` from disk and compare its SHA-1 with `expected`.
///
/// Returns `Ok(false)` on a digest mismatch; read failures are errors.
pub async fn verify_piece(
    storage: &Storage,
    index: u32,
    length: u64,
    expected: &[u8; 20],
) -> Result<bool> {
    let mut hasher = Sha1::new();
    storage
        .read_piece(index, length, |chunk| hasher.update(chunk))
        .await?;
    let digest = hasher.finalize();

    if digest.as_slice() == expected {
        debug!("Piece {} matches its hash", index);
        Ok(true)
    } else {
        warn!(
            "Piece {} hash mismatch: expected {}, got {}",
            index,
            hex::encode(expected),
            hex::encode(digest)
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileDetail;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_verify_piece_spanning_files() {
        let temp = TempDir::new().unwrap();
        let files = vec![
            FileDetail::new(vec!["x".into()], 0, 3),
            FileDetail::new(vec!["y".into()], 3, 4),
            FileDetail::new(vec!["z".into()], 4, 12),
        ];
        let storage = Storage::new(temp.path(), files, 8);

        let payload: Vec<u8> = (100..112).collect();
        storage.write_block(0, 0, &payload[..8]).await.unwrap();
        storage.write_block(1, 0, &payload[8..]).await.unwrap();

        let good: [u8; 20] = Sha1::digest(&payload[..8]).into();
        assert!(verify_piece(&storage, 0, 8, &good).await.unwrap());

        let other: [u8; 20] = Sha1::digest(&payload[8..]).into();
        assert!(verify_piece(&storage, 1, 4, &other).await.unwrap());
        assert!(!verify_piece(&storage, 0, 8, &other).await.unwrap());
    }
}
