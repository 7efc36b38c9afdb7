mod bitfield;
mod connection;
mod message;
pub mod mse;
mod protocol;
mod session;

pub use bitfield::Bitfield;
pub use connection::PeerConnection;
pub use message::{BlockInfo, FrameReader, PeerMessage};
pub use mse::CryptoMethods;
pub use protocol::{exchange_handshake, Handshake};
#[cfg(test)]
pub use protocol::HANDSHAKE_LEN;

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;

const PEER_ID_PREFIX: &[u8; 8] = b"-PW0100-";

/// Build a fresh local peer id: client prefix plus 12 random alphanumerics
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(PEER_ID_PREFIX);

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.sample(Alphanumeric);
    }

    peer_id
}

// Peer connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Per-connection tunables
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub connect_timeout: Duration,
    /// How long to wait after the handshake for the peer to unchoke us
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Close the connection when nothing arrived for this long
    pub keepalive_timeout: Duration,
    /// Outstanding block requests per connection
    pub max_in_flight: usize,
    pub crypto: CryptoMethods,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(120),
            keepalive_timeout: Duration::from_secs(120),
            max_in_flight: 5,
            crypto: CryptoMethods::PLAINTEXT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-PW0100-");
        assert!(peer_id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(generate_peer_id(), peer_id);
    }

    #[test]
    fn test_initial_state_is_choked_and_uninterested() {
        let state = PeerState::default();
        assert!(state.am_choking);
        assert!(state.peer_choking);
        assert!(!state.am_interested);
        assert!(!state.peer_interested);
    }
}
