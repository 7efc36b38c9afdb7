use crate::error::{BittorrentError, Result};
use crate::peer::{generate_peer_id, PeerConfig, PeerConnection};
use crate::torrent::{Metainfo, TorrentContext};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the BitTorrent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    /// Connections tried per piece before giving up on it
    pub max_attempts: usize,
    pub peer: PeerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            max_attempts: 3,
            peer: PeerConfig::default(),
        }
    }
}

/// Pieces fetched and given up on by one [`TorrentClient::download`] call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub completed: Vec<u32>,
    pub failed: Vec<u32>,
}

/// Drives peer connections to fetch the pieces of a torrent
pub struct TorrentClient {
    config: ClientConfig,
    peer_id: [u8; 20],
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        let peer_id = generate_peer_id();
        info!(
            "Client initialized with peer_id: {}",
            String::from_utf8_lossy(&peer_id)
        );

        Self { config, peer_id }
    }

    #[cfg(test)]
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// Shared download state for `meta`, rooted in the download directory
    pub fn open(&self, meta: &Metainfo) -> Arc<TorrentContext> {
        Arc::new(TorrentContext::from_metainfo(
            meta,
            &self.config.download_dir,
            self.peer_id,
        ))
    }

    /// Hash whatever is already on disk and mark the intact pieces done.
    ///
    /// Returns how many pieces passed.
    pub async fn recheck(&self, torrent: &TorrentContext) -> Result<usize> {
        let mut intact = 0;
        for index in 0..torrent.piece_count() as u32 {
            match torrent.check_piece(index).await {
                Ok(()) => {
                    torrent.states.mark_piece_done(index);
                    intact += 1;
                }
                Err(BittorrentError::PieceCheckFailed(_)) => {}
                // Missing or short files just mean the piece is not there yet
                Err(BittorrentError::Storage { path, source }) => {
                    debug!("Piece {} not on disk ({:?}: {})", index, path, source);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Recheck found {}/{} pieces on disk",
            intact,
            torrent.piece_count()
        );
        Ok(intact)
    }

    /// Fetch `pieces` (all pieces when empty) from `peers`.
    ///
    /// Each attempt opens a fresh connection to the next peer in round-robin
    /// order. A piece that fails its hash check is reset before the retry.
    pub async fn download(
        &self,
        torrent: Arc<TorrentContext>,
        peers: &[SocketAddr],
        pieces: &[u32],
    ) -> Result<DownloadSummary> {
        if peers.is_empty() {
            return Err(BittorrentError::Transport("no peers to download from".to_string()));
        }

        let wanted: Vec<u32> = if pieces.is_empty() {
            (0..torrent.piece_count() as u32).collect()
        } else {
            pieces.to_vec()
        };
        if let Some(&bad) = wanted.iter().find(|&&i| i as usize >= torrent.piece_count()) {
            return Err(BittorrentError::InvalidTorrent(format!(
                "piece {} is out of range (torrent has {})",
                bad,
                torrent.piece_count()
            )));
        }

        info!(
            "Fetching {} pieces of {} bytes ({} bytes total) from {} peers",
            wanted.len(),
            torrent.piece_length,
            torrent.total_length,
            peers.len()
        );

        let mut summary = DownloadSummary::default();
        let mut next_peer = 0usize;

        for index in wanted {
            if torrent.states.is_piece_done(index) {
                debug!("Piece {} already complete", index);
                continue;
            }

            let mut fetched = false;
            for attempt in 1..=self.config.max_attempts {
                let addr = peers[next_peer % peers.len()];
                next_peer += 1;

                match self.fetch_from(addr, &torrent, index).await {
                    Ok(()) => {
                        fetched = true;
                        break;
                    }
                    Err(BittorrentError::PieceCheckFailed(_)) => {
                        warn!(
                            "Piece {} from {} failed verification (attempt {})",
                            index, addr, attempt
                        );
                        torrent.states.reset_piece(index);
                    }
                    Err(e) => {
                        warn!("Piece {} from {} (attempt {}): {}", index, addr, attempt, e);
                    }
                }
            }

            if fetched {
                summary.completed.push(index);
                info!(
                    "Progress: {}/{} pieces",
                    torrent.states.completed_count(),
                    torrent.piece_count()
                );
            } else {
                summary.failed.push(index);
            }
        }

        if torrent.states.is_complete() {
            info!("All {} pieces complete", torrent.piece_count());
        }
        Ok(summary)
    }

    async fn fetch_from(
        &self,
        addr: SocketAddr,
        torrent: &Arc<TorrentContext>,
        index: u32,
    ) -> Result<()> {
        let mut conn = PeerConnection::connect(addr, Arc::clone(torrent), &self.config.peer).await?;
        debug!(
            "Peer {} ({}) ready: {:?}",
            conn.addr(),
            String::from_utf8_lossy(conn.peer_id()),
            conn.state()
        );
        conn.download_piece(index).await
    }
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mse::{self, CryptoMethods};
    use crate::peer::{FrameReader, Handshake, PeerMessage, HANDSHAKE_LEN};
    use crate::torrent::{FileDetail, PieceHashes};
    use bytes::Bytes;
    use sha1::{Digest, Sha1};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const INFO_HASH: [u8; 20] = [0x42; 20];
    const PIECE_LEN: u64 = 16384;

    fn payload() -> Vec<u8> {
        (0..PIECE_LEN as usize * 2 + 500)
            .map(|i| (i * 7 % 256) as u8)
            .collect()
    }

    fn test_torrent(dir: &Path, data: &[u8], peer_id: [u8; 20]) -> Arc<TorrentContext> {
        let hashes = data
            .chunks(PIECE_LEN as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let half = data.len() as u64 / 2;
        Arc::new(TorrentContext::new(
            INFO_HASH,
            peer_id,
            dir,
            PIECE_LEN,
            vec![
                FileDetail::new(vec!["t".into(), "a.bin".into()], 0, half),
                FileDetail::new(vec!["t".into(), "b.bin".into()], half, data.len() as u64),
            ],
            PieceHashes::new(hashes),
        ))
    }

    /// Seed every piece of `data` to one connection, flipping the first byte
    /// of each block when `corrupt` is set
    async fn serve(socket: TcpStream, data: Arc<Vec<u8>>, corrupt: bool) {
        let mut stream = mse::handshake_incoming(socket, &INFO_HASH, CryptoMethods::PLAINTEXT)
            .await
            .unwrap();

        let mut theirs = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut theirs).await.unwrap();
        Handshake::from_bytes(&theirs).unwrap();
        let ours = Handshake::new(INFO_HASH, *b"-XX0001-seeder000001");
        stream.write_all(&ours.to_bytes()).await.unwrap();

        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = FrameReader::new(reader);

        let bitfield = PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0xe0]),
        };
        writer.write_all(&bitfield.to_bytes()).await.unwrap();
        writer.flush().await.unwrap();

        while let Ok(Some(frame)) = frames.next_frame().await {
            let reply = match PeerMessage::from_frame(frame).unwrap() {
                PeerMessage::Unchoke => PeerMessage::Unchoke,
                PeerMessage::Request { block } => {
                    let start = block.piece_index as usize * PIECE_LEN as usize
                        + block.offset as usize;
                    let mut bytes = data[start..start + block.length as usize].to_vec();
                    if corrupt {
                        bytes[0] ^= 0xff;
                    }
                    PeerMessage::Piece {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data: Bytes::from(bytes),
                    }
                }
                _ => continue,
            };
            if writer.write_all(&reply.to_bytes()).await.is_err() {
                return;
            }
            let _ = writer.flush().await;
        }
    }

    /// Accept connections forever; the first `bad_connections` serve
    /// corrupted data
    async fn seeder(data: Vec<u8>, bad_connections: usize) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let data = Arc::new(data);

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, Arc::clone(&data), n < bad_connections));
            }
        });

        (addr, accepted)
    }

    #[tokio::test]
    async fn test_download_all_pieces_across_files() {
        let temp = TempDir::new().unwrap();
        let data = payload();
        let client = TorrentClient::new(ClientConfig::default());
        let torrent = test_torrent(temp.path(), &data, *client.peer_id());
        let (addr, accepted) = seeder(data.clone(), 0).await;

        let summary = client
            .download(Arc::clone(&torrent), &[addr], &[])
            .await
            .unwrap();

        assert_eq!(summary.completed, vec![0, 1, 2]);
        assert!(summary.failed.is_empty());
        assert!(torrent.states.is_complete());
        // One connection per piece
        assert_eq!(accepted.load(Ordering::SeqCst), 3);

        let mut on_disk = std::fs::read(temp.path().join("t").join("a.bin")).unwrap();
        on_disk.extend(std::fs::read(temp.path().join("t").join("b.bin")).unwrap());
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn test_failed_check_is_retried() {
        let temp = TempDir::new().unwrap();
        let data = payload();
        let client = TorrentClient::new(ClientConfig::default());
        let torrent = test_torrent(temp.path(), &data, *client.peer_id());
        let (addr, accepted) = seeder(data.clone(), 1).await;

        let summary = client
            .download(Arc::clone(&torrent), &[addr], &[2])
            .await
            .unwrap();

        assert_eq!(summary.completed, vec![2]);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(torrent.states.completed_pieces(), vec![2]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let temp = TempDir::new().unwrap();
        let data = payload();
        let client = TorrentClient::new(ClientConfig {
            max_attempts: 2,
            ..ClientConfig::default()
        });
        let torrent = test_torrent(temp.path(), &data, *client.peer_id());
        let (addr, accepted) = seeder(data.clone(), usize::MAX).await;

        let summary = client
            .download(Arc::clone(&torrent), &[addr], &[0])
            .await
            .unwrap();

        assert!(summary.completed.is_empty());
        assert_eq!(summary.failed, vec![0]);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        // Reset after the failed check, ready for another try
        assert!(!torrent.states.is_block_done(0, 0));
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        let temp = TempDir::new().unwrap();
        let data = payload();
        let client = TorrentClient::default();
        let torrent = test_torrent(temp.path(), &data, *client.peer_id());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        assert!(client.download(Arc::clone(&torrent), &[], &[]).await.is_err());
        assert!(matches!(
            client.download(torrent, &[addr], &[3]).await,
            Err(BittorrentError::InvalidTorrent(_))
        ));
    }

    #[tokio::test]
    async fn test_recheck_marks_intact_pieces() {
        let temp = TempDir::new().unwrap();
        let data = payload();
        let client = TorrentClient::new(ClientConfig::default());
        let torrent = test_torrent(temp.path(), &data, *client.peer_id());

        // Nothing on disk yet
        assert_eq!(client.recheck(&torrent).await.unwrap(), 0);

        torrent.storage.write_block(0, 0, &data[..16384]).await.unwrap();
        let mut bad = data[16384..32768].to_vec();
        bad[10] ^= 1;
        torrent.storage.write_block(1, 0, &bad).await.unwrap();

        assert_eq!(client.recheck(&torrent).await.unwrap(), 1);
        assert_eq!(torrent.states.completed_pieces(), vec![0]);
    }
}
