use super::{Bitfield, FrameReader, PeerMessage, PeerState};
use crate::error::{BittorrentError, Result};
use crate::piece::{block_length, BLOCK_SIZE};
use crate::torrent::TorrentContext;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a peer socket, shared by the download caller, the receive
/// task and the keepalive task.
#[derive(Clone)]
pub(super) struct PeerWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
}

impl PeerWriter {
    pub(super) fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    pub(super) async fn send(&self, message: &PeerMessage) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(BittorrentError::ConnectionClosed)?;

        writer
            .write_all(&message.to_bytes())
            .await
            .map_err(|e| BittorrentError::Transport(format!("writing message: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| BittorrentError::Transport(format!("writing message: {}", e)))
    }

    /// Drop the write half, shutting it down first. Later sends fail.
    pub(super) async fn shutdown(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Idempotent close flag observed by every task of a connection
#[derive(Clone)]
pub(super) struct Closer {
    tx: Arc<watch::Sender<bool>>,
}

impl Closer {
    pub(super) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true for the call that actually closed the connection
    pub(super) fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(super) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub(super) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// A piece the connection owner is downloading through this session
pub(super) struct PieceJob {
    pub(super) index: u32,
    /// In-flight window; one permit goes back per received block
    pub(super) slots: Arc<Semaphore>,
    pub(super) done: oneshot::Sender<Result<()>>,
}

/// The receive side of a connection. Runs as its own task and owns the read
/// half of the socket.
pub(super) struct Session<R> {
    addr: SocketAddr,
    torrent: Arc<TorrentContext>,
    frames: FrameReader<R>,
    writer: PeerWriter,
    closer: Closer,
    state: PeerState,
    state_tx: watch::Sender<PeerState>,
    last_seen: watch::Sender<Instant>,
    bitfield: Bitfield,
    ready: Option<oneshot::Sender<bool>>,
    jobs: mpsc::Receiver<PieceJob>,
    job: Option<PieceJob>,
}

/// Channel ends the session reports through
pub(super) struct SessionLinks {
    pub(super) state: watch::Sender<PeerState>,
    pub(super) last_seen: watch::Sender<Instant>,
    pub(super) ready: oneshot::Sender<bool>,
    pub(super) jobs: mpsc::Receiver<PieceJob>,
}

impl<R> Session<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub(super) fn new(
        addr: SocketAddr,
        torrent: Arc<TorrentContext>,
        reader: R,
        writer: PeerWriter,
        closer: Closer,
        links: SessionLinks,
    ) -> Self {
        let bitfield = Bitfield::new(torrent.piece_count());
        Self {
            addr,
            torrent,
            frames: FrameReader::new(reader),
            writer,
            closer,
            state: PeerState::default(),
            state_tx: links.state,
            last_seen: links.last_seen,
            bitfield,
            ready: Some(links.ready),
            jobs: links.jobs,
            job: None,
        }
    }

    /// Read and dispatch messages until the connection ends, then report why
    /// on `terminated`.
    pub(super) async fn run(mut self, terminated: oneshot::Sender<BittorrentError>) {
        let mut closed = self.closer.subscribe();

        let reason = loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => break BittorrentError::ConnectionClosed,
                Some(job) = self.jobs.recv() => {
                    debug!("Peer {}: downloading piece {}", self.addr, job.index);
                    self.job = Some(job);
                }
                frame = self.frames.next_frame() => {
                    let outcome = match frame {
                        Ok(Some(frame)) => self.handle_frame(frame).await,
                        Ok(None) => Err(BittorrentError::Disconnected),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = outcome {
                        break e;
                    }
                }
            }
        };

        match &reason {
            BittorrentError::ConnectionClosed => debug!("Connection to {} closed", self.addr),
            BittorrentError::Disconnected => info!("Peer {} disconnected", self.addr),
            e => warn!("Connection to {} failed: {}", self.addr, e),
        }

        self.closer.close();
        self.writer.shutdown().await;
        let _ = terminated.send(reason);
    }

    async fn handle_frame(&mut self, frame: Bytes) -> Result<()> {
        self.last_seen.send_replace(Instant::now());

        let message = PeerMessage::from_frame(frame)?;
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                debug!("Peer {} choked us", self.addr);
                self.state.peer_choking = true;
            }
            PeerMessage::Unchoke => {
                debug!("Peer {} unchoked us", self.addr);
                self.state.peer_choking = false;
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(self.state.am_interested);
                }
            }
            PeerMessage::Interested => self.state.peer_interested = true,
            PeerMessage::NotInterested => self.state.peer_interested = false,
            PeerMessage::Have { piece_index } => {
                if !self.bitfield.set_piece(piece_index) {
                    debug!("Ignoring have {} from {}", piece_index, self.addr);
                }
            }
            PeerMessage::Bitfield { bitfield } => self.on_bitfield(&bitfield).await?,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.on_block(piece_index, offset, data).await?,
            // We do not seed
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => {}
            PeerMessage::Unknown { id } => {
                debug!("Ignoring message id {} from {}", id, self.addr);
            }
        }

        self.state_tx.send_replace(self.state);
        Ok(())
    }

    async fn on_bitfield(&mut self, bitfield: &[u8]) -> Result<()> {
        self.bitfield = Bitfield::from_bytes(bitfield, self.torrent.piece_count());

        let wanted = self.bitfield.wanted_pieces(&self.torrent.states);
        if wanted.is_empty() {
            debug!("Peer {} has nothing we need", self.addr);
            return Err(BittorrentError::ConnectionClosed);
        }
        debug!("Peer {} has {} pieces we need", self.addr, wanted.len());

        self.writer.send(&PeerMessage::Interested).await?;
        self.state.am_interested = true;
        self.writer.send(&PeerMessage::Unchoke).await?;
        self.state.am_choking = false;
        Ok(())
    }

    async fn on_block(&mut self, index: u32, begin: u32, data: Bytes) -> Result<()> {
        let active = matches!(&self.job, Some(job) if job.index == index);
        if !active {
            warn!(
                "Dropping unrequested block {}:{} from {}",
                index, begin, self.addr
            );
            return Ok(());
        }

        // Only whole blocks at block boundaries, sized as we requested them
        let piece_len = self.torrent.piece_len(index);
        let expected = (begin % BLOCK_SIZE == 0 && (begin as u64) < piece_len)
            .then(|| block_length(piece_len, begin / BLOCK_SIZE) as usize);
        if expected != Some(data.len()) {
            return Err(BittorrentError::Protocol(format!(
                "block {}:{} of {} bytes does not match the piece layout",
                index,
                begin,
                data.len()
            )));
        }

        if let Err(e) = self.torrent.storage.write_block(index, begin, &data).await {
            error!("Failed to store block {}:{}: {}", index, begin, e);
            self.finish_job(Err(e));
            return Err(BittorrentError::ConnectionClosed);
        }

        let mark = self.torrent.states.mark_block_done(index, begin)?;
        if !mark.newly_marked {
            debug!("Block {}:{} from {} was already done", index, begin, self.addr);
        }
        if let Some(job) = &self.job {
            job.slots.add_permits(1);
        }

        if mark.completed_piece || self.torrent.states.is_piece_done(index) {
            let outcome = self.torrent.check_piece(index).await;
            self.closer.close();
            match &outcome {
                Ok(()) => info!("Piece {} downloaded from {}", index, self.addr),
                Err(e) => warn!("Piece {} from {}: {}", index, self.addr, e),
            }
            self.finish_job(outcome);
            return Err(BittorrentError::ConnectionClosed);
        }

        Ok(())
    }

    fn finish_job(&mut self, outcome: Result<()>) {
        if let Some(job) = self.job.take() {
            let _ = job.done.send(outcome);
        }
    }
}

/// Send a keepalive every `interval`, closing the connection once nothing
/// has been received for longer than `timeout`.
pub(super) async fn keepalive(
    addr: SocketAddr,
    writer: PeerWriter,
    closer: Closer,
    last_seen: watch::Receiver<Instant>,
    interval: Duration,
    timeout: Duration,
) {
    let mut closed = closer.subscribe();
    let mut ticker = time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return,
            _ = ticker.tick() => {}
        }

        let idle = last_seen.borrow().elapsed();
        if idle > timeout {
            info!("Peer {} idle for {:?}, closing", addr, idle);
            closer.close();
            return;
        }

        if let Err(e) = writer.send(&PeerMessage::KeepAlive).await {
            debug!("Keepalive to {} failed: {}", addr, e);
            closer.close();
            return;
        }
    }
}
