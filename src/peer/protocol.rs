use crate::error::{BittorrentError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake on the wire: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn from_bytes(data: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(BittorrentError::Protocol(
                "Invalid protocol string".to_string(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// Send our handshake, read the peer's, and check it is for the same torrent
pub async fn exchange_handshake<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&ours.to_bytes())
        .await
        .map_err(|e| BittorrentError::Transport(format!("sending handshake: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| BittorrentError::Transport(format!("sending handshake: {}", e)))?;

    let mut response = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| BittorrentError::Transport(format!("reading handshake: {}", e)))?;

    let theirs = Handshake::from_bytes(&response)?;
    if theirs.info_hash != ours.info_hash {
        return Err(BittorrentError::WrongSwarm);
    }
    Ok(theirs)
}
