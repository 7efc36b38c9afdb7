use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame accepted from a peer (length prefix excluded)
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Information about a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Piece index
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Messages exchanged between peers after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { block: BlockInfo },
    Piece {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    Cancel { block: BlockInfo },
    /// Extension messages we do not speak (DHT port, BEP 10, ...)
    Unknown { id: u8 },
}

impl PeerMessage {
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;

    /// Serialize with the 4-byte length prefix
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => put_header(&mut buf, Self::CHOKE, 0),
            PeerMessage::Unchoke => put_header(&mut buf, Self::UNCHOKE, 0),
            PeerMessage::Interested => put_header(&mut buf, Self::INTERESTED, 0),
            PeerMessage::NotInterested => put_header(&mut buf, Self::NOT_INTERESTED, 0),
            PeerMessage::Have { piece_index } => {
                put_header(&mut buf, Self::HAVE, 4);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                put_header(&mut buf, Self::BITFIELD, bitfield.len());
                buf.put_slice(bitfield);
            }
            PeerMessage::Request { block } => {
                put_header(&mut buf, Self::REQUEST, 12);
                put_block(&mut buf, block);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                put_header(&mut buf, Self::PIECE, 8 + data.len());
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                put_header(&mut buf, Self::CANCEL, 12);
                put_block(&mut buf, block);
            }
            PeerMessage::Unknown { id } => put_header(&mut buf, *id, 0),
        }

        buf.freeze()
    }

    /// Parse one frame payload, as produced by [`split_frame`]
    pub fn from_frame(mut frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = frame.get_u8();
        let body_len = frame.len();
        let expect = |len: usize, name: &str| {
            if body_len == len {
                Ok(())
            } else {
                Err(BittorrentError::Protocol(format!(
                    "{} message with {} byte payload",
                    name, body_len
                )))
            }
        };

        match id {
            Self::CHOKE => expect(0, "choke").map(|_| PeerMessage::Choke),
            Self::UNCHOKE => expect(0, "unchoke").map(|_| PeerMessage::Unchoke),
            Self::INTERESTED => expect(0, "interested").map(|_| PeerMessage::Interested),
            Self::NOT_INTERESTED => {
                expect(0, "not interested").map(|_| PeerMessage::NotInterested)
            }
            Self::HAVE => {
                expect(4, "have")?;
                Ok(PeerMessage::Have {
                    piece_index: frame.get_u32(),
                })
            }
            Self::BITFIELD => Ok(PeerMessage::Bitfield { bitfield: frame }),
            Self::REQUEST => {
                expect(12, "request")?;
                Ok(PeerMessage::Request {
                    block: get_block(&mut frame),
                })
            }
            Self::PIECE => {
                if body_len < 8 {
                    return Err(BittorrentError::Protocol(format!(
                        "piece message with {} byte payload",
                        body_len
                    )));
                }
                let piece_index = frame.get_u32();
                let offset = frame.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: frame,
                })
            }
            Self::CANCEL => {
                expect(12, "cancel")?;
                Ok(PeerMessage::Cancel {
                    block: get_block(&mut frame),
                })
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }
}

fn put_header(buf: &mut BytesMut, id: u8, body_len: usize) {
    buf.reserve(5 + body_len);
    buf.put_u32((1 + body_len) as u32);
    buf.put_u8(id);
}

fn put_block(buf: &mut BytesMut, block: &BlockInfo) {
    buf.put_u32(block.piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.length);
}

fn get_block(frame: &mut Bytes) -> BlockInfo {
    let piece_index = frame.get_u32();
    let offset = frame.get_u32();
    let length = frame.get_u32();
    BlockInfo::new(piece_index, offset, length)
}

/// Split one length-prefixed frame off the front of `buf`.
///
/// Returns the payload without its prefix (empty for a keepalive), or `None`
/// if `buf` does not yet hold a whole frame.
pub fn split_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_len {
        return Err(BittorrentError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }

    if buf.len() < 4 + len {
        buf.reserve(4 + len - buf.len());
        return Ok(None);
    }

    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Buffers a byte stream and yields whole frames.
///
/// `next_frame` is cancel safe: bytes already read stay buffered if the
/// future is dropped.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Next frame payload, or `None` on a clean end of stream between frames
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = split_frame(&mut self.buffer, MAX_FRAME_LEN)? {
                return Ok(Some(frame));
            }

            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(BittorrentError::Protocol(
                    "stream ended inside a frame".to_string(),
                ));
            }
        }
    }
}
