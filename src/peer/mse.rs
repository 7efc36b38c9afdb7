//! Message Stream Encryption (MSE/PE), the obfuscation layer most clients
//! expect before the BitTorrent handshake.
//!
//! Only the connecting side is implemented. After negotiation the stream is
//! either plaintext or RC4 in both directions, depending on what the peer
//! selected from the methods we offered.
//!
//! See http://wiki.vuze.com/w/Message_Stream_Encryption

use crate::error::{BittorrentError, Result};
use bytes::{Buf, Bytes};
use num_bigint::BigUint;
use rand::{Rng, RngCore};
use rc4::consts::U20;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tracing::debug;

/// 768-bit safe prime shared by every MSE implementation, generator 2
const PRIME: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

const KEY_LEN: usize = 96;
const MAX_PAD: usize = 512;
const VC: [u8; 8] = [0u8; 8];
/// RC4 keystream bytes thrown away before use
const DISCARD: usize = 1024;

/// Bitmask of stream ciphers offered or selected during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoMethods(u32);

impl CryptoMethods {
    pub const PLAINTEXT: Self = Self(0x01);
    pub const RC4: Self = Self(0x02);
    pub const ANY: Self = Self(0x03);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl Default for CryptoMethods {
    fn default() -> Self {
        Self::PLAINTEXT
    }
}

struct DhKey {
    private: BigUint,
    public: [u8; KEY_LEN],
}

impl DhKey {
    fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut secret = [0u8; 20];
        rng.fill_bytes(&mut secret);
        let private = BigUint::from_bytes_be(&secret);
        let public = to_key_bytes(&BigUint::from(2u32).modpow(&private, &prime()));
        Self { private, public }
    }

    fn shared_secret(&self, remote: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN]> {
        let prime = prime();
        let remote = BigUint::from_bytes_be(remote);
        if remote <= BigUint::from(1u32) || remote >= &prime - 1u32 {
            return Err(BittorrentError::Mse("degenerate public key".to_string()));
        }
        Ok(to_key_bytes(&remote.modpow(&self.private, &prime)))
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}

fn to_key_bytes(n: &BigUint) -> [u8; KEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; KEY_LEN];
    out[KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn cipher(label: &[u8], secret: &[u8], skey: &[u8]) -> Rc4<U20> {
    let key = hash(&[label, secret, skey]);
    let mut cipher = Rc4::<U20>::new(&key.into());
    let mut discard = [0u8; DISCARD];
    cipher.apply_keystream(&mut discard);
    cipher
}

/// `HASH('req2', SKEY) xor HASH('req3', S)`
fn skey_proof(secret: &[u8], skey: &[u8]) -> [u8; 20] {
    let req2 = hash(&[b"req2", skey]);
    let req3 = hash(&[b"req3", secret]);
    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = req2[i] ^ req3[i];
    }
    out
}

fn random_pad<R: RngCore>(rng: &mut R) -> Vec<u8> {
    let mut pad = vec![0u8; rng.gen_range(0..=MAX_PAD)];
    rng.fill_bytes(&mut pad);
    pad
}

fn io_error(stage: &str, e: io::Error) -> BittorrentError {
    BittorrentError::Mse(format!("{}: {}", stage, e))
}

/// Read single bytes until the stream ends with `marker`, giving up after
/// `MAX_PAD` bytes of padding. Expects a buffered stream.
async fn sync_on<S: AsyncRead + Unpin>(stream: &mut S, marker: &[u8]) -> Result<()> {
    let mut window = Vec::with_capacity(MAX_PAD + marker.len());
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| io_error("synchronizing", e))?;
        window.push(byte);
        if window.ends_with(marker) {
            return Ok(());
        }
        if window.len() >= MAX_PAD + marker.len() {
            return Err(BittorrentError::Mse(
                "no sync marker within padding limit".to_string(),
            ));
        }
    }
}

/// Run the connecting side of the negotiation, using the info hash as SKEY.
///
/// Offers `provide` and wraps the stream according to the peer's choice.
pub async fn handshake_outgoing<S>(
    stream: S,
    info_hash: &[u8; 20],
    provide: CryptoMethods,
) -> Result<MseStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Writes pass straight through; reads past the negotiation stay in the
    // buffer and are handed to the returned stream
    let mut stream = BufReader::new(stream);

    let (key, pad_a) = {
        let mut rng = rand::thread_rng();
        (DhKey::generate(&mut rng), random_pad(&mut rng))
    };

    // 1. A->B: Ya, PadA
    let mut hello = Vec::with_capacity(KEY_LEN + pad_a.len());
    hello.extend_from_slice(&key.public);
    hello.extend_from_slice(&pad_a);
    stream
        .write_all(&hello)
        .await
        .map_err(|e| io_error("sending public key", e))?;
    stream.flush().await.map_err(|e| io_error("sending public key", e))?;

    // 2. B->A: Yb, PadB (PadB is skipped while syncing below)
    let mut remote = [0u8; KEY_LEN];
    stream
        .read_exact(&mut remote)
        .await
        .map_err(|e| io_error("reading public key", e))?;
    let secret = key.shared_secret(&remote)?;

    let mut encryptor = cipher(b"keyA", &secret, info_hash);
    let mut decryptor = cipher(b"keyB", &secret, info_hash);

    // 3. A->B: HASH('req1', S), proof of SKEY, ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA))
    let mut offer = Vec::with_capacity(8 + 4 + 2 + 2);
    offer.extend_from_slice(&VC);
    offer.extend_from_slice(&provide.bits().to_be_bytes());
    offer.extend_from_slice(&0u16.to_be_bytes());
    offer.extend_from_slice(&0u16.to_be_bytes());
    encryptor.apply_keystream(&mut offer);

    let mut step3 = Vec::with_capacity(40 + offer.len());
    step3.extend_from_slice(&hash(&[b"req1", &secret]));
    step3.extend_from_slice(&skey_proof(&secret, info_hash));
    step3.extend_from_slice(&offer);
    stream
        .write_all(&step3)
        .await
        .map_err(|e| io_error("sending crypto offer", e))?;
    stream.flush().await.map_err(|e| io_error("sending crypto offer", e))?;

    // 4. B->A: ENCRYPT(VC, crypto_select, len(padD), padD)
    let mut encrypted_vc = VC;
    decryptor.apply_keystream(&mut encrypted_vc);
    sync_on(&mut stream, &encrypted_vc).await?;

    let mut header = [0u8; 6];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| io_error("reading crypto select", e))?;
    decryptor.apply_keystream(&mut header);

    let select = CryptoMethods(u32::from_be_bytes([header[0], header[1], header[2], header[3]]));
    let pad_d_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    if pad_d_len > MAX_PAD {
        return Err(BittorrentError::Mse(format!(
            "padding of {} bytes exceeds limit",
            pad_d_len
        )));
    }
    let mut pad_d = vec![0u8; pad_d_len];
    stream
        .read_exact(&mut pad_d)
        .await
        .map_err(|e| io_error("reading padding", e))?;
    decryptor.apply_keystream(&mut pad_d);

    let received = stream.buffer().to_vec();
    let stream = stream.into_inner();

    if select == CryptoMethods::RC4 && provide.contains(CryptoMethods::RC4) {
        debug!("MSE negotiated RC4");
        Ok(MseStream::encrypted(stream, encryptor, decryptor).with_received(received))
    } else if select == CryptoMethods::PLAINTEXT && provide.contains(CryptoMethods::PLAINTEXT) {
        debug!("MSE negotiated plaintext");
        Ok(MseStream::plain(stream).with_received(received))
    } else {
        Err(BittorrentError::Mse(format!(
            "peer selected crypto method {:#x}, offered {:#x}",
            select.bits(),
            provide.bits()
        )))
    }
}

/// Accepting side of the negotiation, used by tests to stand in for a peer.
#[cfg(test)]
pub(crate) async fn handshake_incoming<S>(
    stream: S,
    info_hash: &[u8; 20],
    select: CryptoMethods,
) -> Result<MseStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake_incoming_with(stream, info_hash, select, &[]).await
}

/// Like [`handshake_incoming`], sending `early` in the same write as the
/// crypto select
#[cfg(test)]
async fn handshake_incoming_with<S>(
    mut stream: S,
    info_hash: &[u8; 20],
    select: CryptoMethods,
    early: &[u8],
) -> Result<MseStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut remote = [0u8; KEY_LEN];
    stream
        .read_exact(&mut remote)
        .await
        .map_err(|e| io_error("reading public key", e))?;

    let (key, pad_b) = {
        let mut rng = rand::thread_rng();
        (DhKey::generate(&mut rng), random_pad(&mut rng))
    };
    let mut hello = key.public.to_vec();
    hello.extend_from_slice(&pad_b);
    stream
        .write_all(&hello)
        .await
        .map_err(|e| io_error("sending public key", e))?;
    stream.flush().await.map_err(|e| io_error("sending public key", e))?;

    let secret = key.shared_secret(&remote)?;
    sync_on(&mut stream, &hash(&[b"req1", &secret])).await?;

    let mut proof = [0u8; 20];
    stream
        .read_exact(&mut proof)
        .await
        .map_err(|e| io_error("reading SKEY proof", e))?;
    if proof != skey_proof(&secret, info_hash) {
        return Err(BittorrentError::Mse("unknown SKEY".to_string()));
    }

    let mut decryptor = cipher(b"keyA", &secret, info_hash);
    let mut encryptor = cipher(b"keyB", &secret, info_hash);

    let mut offer = [0u8; 14];
    stream
        .read_exact(&mut offer)
        .await
        .map_err(|e| io_error("reading crypto offer", e))?;
    decryptor.apply_keystream(&mut offer);
    if offer[..8] != VC {
        return Err(BittorrentError::Mse("bad verification constant".to_string()));
    }
    let provide = CryptoMethods(u32::from_be_bytes([offer[8], offer[9], offer[10], offer[11]]));
    let mut pad_c = vec![0u8; u16::from_be_bytes([offer[12], offer[13]]) as usize];
    stream
        .read_exact(&mut pad_c)
        .await
        .map_err(|e| io_error("reading padding", e))?;
    decryptor.apply_keystream(&mut pad_c);

    let mut ia_len = [0u8; 2];
    stream
        .read_exact(&mut ia_len)
        .await
        .map_err(|e| io_error("reading IA length", e))?;
    decryptor.apply_keystream(&mut ia_len);
    let mut ia = vec![0u8; u16::from_be_bytes(ia_len) as usize];
    stream
        .read_exact(&mut ia)
        .await
        .map_err(|e| io_error("reading IA", e))?;
    decryptor.apply_keystream(&mut ia);

    if !provide.contains(select) {
        return Err(BittorrentError::Mse("no common crypto method".to_string()));
    }

    let mut answer = Vec::with_capacity(14 + early.len());
    answer.extend_from_slice(&VC);
    answer.extend_from_slice(&select.bits().to_be_bytes());
    answer.extend_from_slice(&0u16.to_be_bytes());
    encryptor.apply_keystream(&mut answer);
    answer.extend_from_slice(early);
    if select == CryptoMethods::RC4 {
        encryptor.apply_keystream(&mut answer[14..]);
    }
    stream
        .write_all(&answer)
        .await
        .map_err(|e| io_error("sending crypto select", e))?;
    stream.flush().await.map_err(|e| io_error("sending crypto select", e))?;

    if select == CryptoMethods::RC4 {
        Ok(MseStream::encrypted(stream, encryptor, decryptor))
    } else {
        Ok(MseStream::plain(stream))
    }
}

/// A stream after MSE negotiation.
///
/// In RC4 mode written bytes are encrypted into an internal buffer, so
/// callers must flush to push them onto the wire.
pub struct MseStream<S> {
    inner: S,
    encryptor: Option<Rc4<U20>>,
    decryptor: Option<Rc4<U20>>,
    /// Decrypted bytes read during negotiation, served before `inner`
    received: Bytes,
    pending: Vec<u8>,
    written: usize,
}

impl<S> MseStream<S> {
    fn plain(inner: S) -> Self {
        Self {
            inner,
            encryptor: None,
            decryptor: None,
            received: Bytes::new(),
            pending: Vec::new(),
            written: 0,
        }
    }

    fn encrypted(inner: S, encryptor: Rc4<U20>, decryptor: Rc4<U20>) -> Self {
        Self {
            inner,
            encryptor: Some(encryptor),
            decryptor: Some(decryptor),
            received: Bytes::new(),
            pending: Vec::new(),
            written: 0,
        }
    }

    /// Hand over raw bytes the peer sent past the end of the negotiation
    fn with_received(mut self, mut received: Vec<u8>) -> Self {
        if let Some(decryptor) = self.decryptor.as_mut() {
            decryptor.apply_keystream(&mut received);
        }
        self.received = Bytes::from(received);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }
}

impl<S: AsyncWrite + Unpin> MseStream<S> {
    /// Push buffered ciphertext into the inner stream
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MseStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.received.has_remaining() {
            let n = std::cmp::min(this.received.len(), buf.remaining());
            buf.put_slice(&this.received[..n]);
            this.received.advance(n);
            return Poll::Ready(Ok(()));
        }

        let already_filled = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(decryptor) = this.decryptor.as_mut() {
            decryptor.apply_keystream(&mut buf.filled_mut()[already_filled..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MseStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.encryptor.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        ready!(this.poll_drain(cx))?;

        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        if let Some(encryptor) = this.encryptor.as_mut() {
            encryptor.apply_keystream(&mut this.pending[start..]);
        }

        // The keystream has advanced, so the bytes count as written even if
        // the inner stream is not ready for them yet
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const INFO_HASH: [u8; 20] = [0x5a; 20];

    #[test]
    fn test_dh_agreement() {
        let mut rng = rand::thread_rng();
        let a = DhKey::generate(&mut rng);
        let b = DhKey::generate(&mut rng);

        let s1 = a.shared_secret(&b.public).unwrap();
        let s2 = b.shared_secret(&a.public).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_rejects_degenerate_public_key() {
        let key = DhKey::generate(&mut rand::thread_rng());
        let mut one = [0u8; KEY_LEN];
        one[KEY_LEN - 1] = 1;
        assert!(key.shared_secret(&one).is_err());
        assert!(key.shared_secret(&[0u8; KEY_LEN]).is_err());
    }

    #[test]
    fn test_crypto_methods() {
        assert!(CryptoMethods::ANY.contains(CryptoMethods::RC4));
        assert!(CryptoMethods::ANY.contains(CryptoMethods::PLAINTEXT));
        assert!(!CryptoMethods::PLAINTEXT.contains(CryptoMethods::RC4));
        assert!(!CryptoMethods::RC4.contains(CryptoMethods(0)));
    }

    async fn negotiate(
        provide: CryptoMethods,
        select: CryptoMethods,
    ) -> (
        Result<MseStream<tokio::io::DuplexStream>>,
        Result<MseStream<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = duplex(64 * 1024);
        tokio::join!(
            handshake_outgoing(a, &INFO_HASH, provide),
            handshake_incoming(b, &INFO_HASH, select)
        )
    }

    #[tokio::test]
    async fn test_rc4_session_carries_data_both_ways() {
        let (outgoing, incoming) = negotiate(CryptoMethods::ANY, CryptoMethods::RC4).await;
        let mut outgoing = outgoing.unwrap();
        let mut incoming = incoming.unwrap();
        assert!(outgoing.is_encrypted());
        assert!(incoming.is_encrypted());

        outgoing.write_all(b"hello from A").await.unwrap();
        outgoing.flush().await.unwrap();
        let mut buf = [0u8; 12];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from A");

        incoming.write_all(b"hi from B").await.unwrap();
        incoming.flush().await.unwrap();
        let mut buf = [0u8; 9];
        outgoing.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi from B");
    }

    #[tokio::test]
    async fn test_rc4_bytes_are_not_plaintext_on_the_wire() {
        let (a, mut wire) = duplex(64 * 1024);

        let key = cipher(b"keyA", &[1u8; KEY_LEN], &INFO_HASH);
        let decryptor = cipher(b"keyB", &[1u8; KEY_LEN], &INFO_HASH);
        let mut stream = MseStream::encrypted(a, key, decryptor);

        stream.write_all(b"BitTorrent protocol").await.unwrap();
        stream.flush().await.unwrap();

        let mut raw = [0u8; 19];
        wire.read_exact(&mut raw).await.unwrap();
        assert_ne!(&raw, b"BitTorrent protocol");

        let mut check = cipher(b"keyA", &[1u8; KEY_LEN], &INFO_HASH);
        check.apply_keystream(&mut raw);
        assert_eq!(&raw, b"BitTorrent protocol");
    }

    #[tokio::test]
    async fn test_plaintext_selection() {
        let (outgoing, incoming) = negotiate(CryptoMethods::PLAINTEXT, CryptoMethods::PLAINTEXT).await;
        let mut outgoing = outgoing.unwrap();
        let mut incoming = incoming.unwrap();
        assert!(!outgoing.is_encrypted());

        outgoing.write_all(b"plain").await.unwrap();
        outgoing.flush().await.unwrap();
        let mut buf = [0u8; 5];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"plain");
    }

    #[tokio::test]
    async fn test_bytes_sent_with_crypto_select_are_kept() {
        for select in [CryptoMethods::RC4, CryptoMethods::PLAINTEXT] {
            let (a, b) = duplex(64 * 1024);
            let (outgoing, incoming) = tokio::join!(
                handshake_outgoing(a, &INFO_HASH, CryptoMethods::ANY),
                handshake_incoming_with(b, &INFO_HASH, select, b"early bird")
            );
            let mut outgoing = outgoing.unwrap();
            let mut incoming = incoming.unwrap();
            assert_eq!(outgoing.is_encrypted(), select == CryptoMethods::RC4);

            incoming.write_all(b" then more").await.unwrap();
            incoming.flush().await.unwrap();

            let mut buf = [0u8; 20];
            outgoing.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"early bird then more");
        }
    }

    #[tokio::test]
    async fn test_wrong_info_hash_is_refused() {
        let (a, b) = duplex(64 * 1024);
        let (outgoing, incoming) = tokio::join!(
            handshake_outgoing(a, &INFO_HASH, CryptoMethods::PLAINTEXT),
            handshake_incoming(b, &[0x11; 20], CryptoMethods::PLAINTEXT)
        );

        assert!(incoming.is_err());
        // The responder hung up, so the initiator cannot finish either
        assert!(outgoing.is_err());
    }
}
