use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    BencodeError(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encryption negotiation failed: {0}")]
    Mse(String),

    #[error("Peer is not serving this torrent (info hash mismatch)")]
    WrongSwarm,

    #[error("Peer did not become ready within {0} seconds")]
    SetupTimeout(u64),

    #[error("Peer unchoked us but we are not interested")]
    NotReady,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Piece {0} failed hash check")]
    PieceCheckFailed(u32),

    #[error("Storage error on {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download incomplete: {0} pieces could not be fetched")]
    Incomplete(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BittorrentError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BittorrentError::Storage {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
