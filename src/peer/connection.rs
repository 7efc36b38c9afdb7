use super::session::{keepalive, Closer, PeerWriter, PieceJob, Session, SessionLinks};
use super::{exchange_handshake, mse, BlockInfo, Handshake, PeerConfig, PeerMessage, PeerState};
use crate::error::{BittorrentError, Result};
use crate::piece::{block_count, block_length, BLOCK_SIZE};
use crate::torrent::TorrentContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, info};

/// A live, handshaken connection to one peer.
///
/// Messages are read by a background task; the owner drives downloads with
/// [`PeerConnection::download_piece`]. Once closed a connection is never
/// reused.
pub struct PeerConnection {
    addr: SocketAddr,
    torrent: Arc<TorrentContext>,
    config: PeerConfig,
    peer_id: [u8; 20],
    writer: PeerWriter,
    closer: Closer,
    jobs: mpsc::Sender<PieceJob>,
    state: watch::Receiver<PeerState>,
    terminated: Option<oneshot::Receiver<BittorrentError>>,
}

enum Wait {
    Slot,
    Finished(Option<Result<()>>),
    Terminated(BittorrentError),
}

impl PeerConnection {
    /// Connect to a peer, negotiate encryption, handshake and wait until the
    /// peer unchokes us.
    pub async fn connect(
        addr: SocketAddr,
        torrent: Arc<TorrentContext>,
        config: &PeerConfig,
    ) -> Result<Self> {
        info!("Connecting to peer: {}", addr);

        let stream = time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BittorrentError::Transport(format!("connecting to {} timed out", addr)))?
            .map_err(|e| {
                BittorrentError::Transport(format!("Failed to connect to {}: {}", addr, e))
            })?;

        let stream = mse::handshake_outgoing(stream, &torrent.info_hash, config.crypto)
            .await
            .map_err(|e| {
                BittorrentError::Transport(format!("encryption handshake with {}: {}", addr, e))
            })?;
        debug!(
            "Stream to {} is {}",
            addr,
            if stream.is_encrypted() { "RC4" } else { "plaintext" }
        );

        Self::establish(addr, stream, torrent, config).await
    }

    /// Run the protocol handshake over an already open stream and start the
    /// receive and keepalive tasks.
    pub async fn establish<S>(
        addr: SocketAddr,
        mut stream: S,
        torrent: Arc<TorrentContext>,
        config: &PeerConfig,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ours = Handshake::new(torrent.info_hash, torrent.peer_id);
        let theirs = exchange_handshake(&mut stream, &ours).await?;
        debug!(
            "Handshake with {} complete, peer id {}",
            addr,
            String::from_utf8_lossy(&theirs.peer_id)
        );

        let (reader, writer) = tokio::io::split(stream);
        let writer = PeerWriter::new(writer);
        let closer = Closer::new();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (terminated_tx, terminated_rx) = oneshot::channel();
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(PeerState::default());
        let (seen_tx, seen_rx) = watch::channel(Instant::now());

        let session = Session::new(
            addr,
            Arc::clone(&torrent),
            reader,
            writer.clone(),
            closer.clone(),
            SessionLinks {
                state: state_tx,
                last_seen: seen_tx,
                ready: ready_tx,
                jobs: jobs_rx,
            },
        );
        tokio::spawn(session.run(terminated_tx));
        tokio::spawn(keepalive(
            addr,
            writer.clone(),
            closer.clone(),
            seen_rx,
            config.keepalive_interval,
            config.keepalive_timeout,
        ));

        let mut connection = Self {
            addr,
            torrent,
            config: config.clone(),
            peer_id: theirs.peer_id,
            writer,
            closer,
            jobs: jobs_tx,
            state: state_rx,
            terminated: Some(terminated_rx),
        };

        match connection.wait_ready(ready_rx).await {
            Ok(()) => {
                info!("Successfully connected to peer: {}", addr);
                Ok(connection)
            }
            Err(e) => {
                connection.close();
                Err(e)
            }
        }
    }

    async fn wait_ready(&mut self, ready: oneshot::Receiver<bool>) -> Result<()> {
        let limit = self.config.ready_timeout;
        let deadline = time::sleep(limit);
        tokio::pin!(deadline);

        let signal = tokio::select! {
            biased;
            signal = ready => signal.ok(),
            reason = terminated(&mut self.terminated) => return Err(reason),
            _ = &mut deadline => return Err(BittorrentError::SetupTimeout(limit.as_secs())),
        };

        match signal {
            Some(true) => Ok(()),
            Some(false) => Err(BittorrentError::NotReady),
            // The session ended before unchoking us; its reason follows
            None => tokio::select! {
                reason = terminated(&mut self.terminated) => Err(reason),
                _ = &mut deadline => Err(BittorrentError::SetupTimeout(limit.as_secs())),
            },
        }
    }

    /// Download and verify piece `index` from this peer.
    ///
    /// Blocks already recorded as done are skipped. On any error the
    /// connection is closed. After a verified piece the peer is released as
    /// well, so each connection serves a single piece.
    pub async fn download_piece(&mut self, index: u32) -> Result<()> {
        let result = self.fetch_piece(index).await;
        if let Err(e) = &result {
            debug!("Piece {} from {} failed: {}", index, self.addr, e);
            self.close();
        }
        result
    }

    async fn fetch_piece(&mut self, index: u32) -> Result<()> {
        if self.is_closed() {
            return Err(BittorrentError::ConnectionClosed);
        }
        if index as usize >= self.torrent.piece_count() {
            return Err(BittorrentError::Protocol(format!(
                "piece {} is out of range",
                index
            )));
        }

        let piece_len = self.torrent.piece_len(index);
        let slots = Arc::new(Semaphore::new(self.config.max_in_flight));
        let (done_tx, mut done_rx) = oneshot::channel();

        let job = PieceJob {
            index,
            slots: Arc::clone(&slots),
            done: done_tx,
        };
        if self.jobs.send(job).await.is_err() {
            return Err(terminated(&mut self.terminated).await);
        }

        let mut requested = 0;
        for block in 0..block_count(piece_len) {
            let begin = block * BLOCK_SIZE;
            if self.torrent.states.is_block_done(index, begin) {
                continue;
            }

            let wait = tokio::select! {
                biased;
                done = &mut done_rx => Wait::Finished(done.ok()),
                reason = terminated(&mut self.terminated) => Wait::Terminated(reason),
                permit = slots.acquire() => match permit {
                    Ok(permit) => {
                        permit.forget();
                        Wait::Slot
                    }
                    Err(_) => Wait::Terminated(BittorrentError::ConnectionClosed),
                },
            };

            match wait {
                Wait::Slot => {}
                Wait::Finished(Some(result)) => return result,
                Wait::Finished(None) => return Err(terminated(&mut self.terminated).await),
                Wait::Terminated(reason) => return Err(reason),
            }

            let block = BlockInfo::new(index, begin, block_length(piece_len, block));
            self.writer.send(&PeerMessage::Request { block }).await?;
            requested += 1;
        }

        if requested == 0 {
            debug!("Piece {} already on disk, verifying", index);
            let result = self.torrent.check_piece(index).await;
            self.close();
            return result;
        }
        debug!("Requested {} blocks of piece {} from {}", requested, index, self.addr);

        let wait = tokio::select! {
            biased;
            done = &mut done_rx => Wait::Finished(done.ok()),
            reason = terminated(&mut self.terminated) => Wait::Terminated(reason),
        };

        match wait {
            Wait::Finished(Some(result)) => result,
            Wait::Finished(None) => Err(terminated(&mut self.terminated).await),
            Wait::Terminated(reason) => Err(reason),
            Wait::Slot => Ok(()),
        }
    }

    /// Close the socket. Safe to call any number of times.
    pub fn close(&self) {
        if self.closer.close() {
            debug!("Closing connection to {}", self.addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Follow choke and interest changes as the receive task sees them
    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<PeerState> {
        self.state.clone()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.closer.close();
    }
}

/// Resolve with the reason the receive task ended. Only the first call sees
/// the real reason; the connection is gone after that anyway.
async fn terminated(rx: &mut Option<oneshot::Receiver<BittorrentError>>) -> BittorrentError {
    let reason = match rx.as_mut() {
        Some(inner) => inner.await.unwrap_or(BittorrentError::ConnectionClosed),
        None => return BittorrentError::ConnectionClosed,
    };
    *rx = None;
    reason
}
