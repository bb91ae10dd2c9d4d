//! Session key agreement and the per-connection AEAD transform.
//!
//! Each listening endpoint owns an X25519 keypair. Its public half rides in
//! the bind request; a dialing peer that wants an encrypted connection sends
//! its own public key in the dial. Both sides derive a pair of directional
//! ChaCha20-Poly1305 keys from the shared secret, so the initiator's
//! transmit key is the responder's receive key and vice versa.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of keys and public keys, in bytes
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const INFO_I2R: &[u8] = b"overlay conn i2r";
const INFO_R2I: &[u8] = b"overlay conn r2i";

/// Key agreement and cipher failures
#[derive(Error, Debug)]
pub enum KeyError {
    /// Peer public key had the wrong length
    #[error("peer public key must be {KEY_SIZE} bytes, got {0}")]
    PeerKeySize(usize),

    /// HKDF expansion failed
    #[error("key derivation failed")]
    Derivation,

    /// Seal or open failed, the ciphertext is not trustworthy
    #[error("aead failure")]
    Aead,
}

/// Role of this side in the key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxRole {
    /// The side that sent the dial
    Initiator,
    /// The side that accepted the dial
    Responder,
}

/// An endpoint's X25519 keypair
pub struct EndpointKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EndpointKeypair {
    /// Generate a fresh keypair from the OS entropy source
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        EndpointKeypair { secret, public }
    }

    /// The public half
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The public half as raw bytes, as carried in wire headers
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }
}

impl fmt::Debug for EndpointKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Directional symmetric keys for one connection
#[derive(Clone)]
pub struct SessionKeys {
    /// Key for traffic we receive
    pub rx: [u8; KEY_SIZE],
    /// Key for traffic we transmit
    pub tx: [u8; KEY_SIZE],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Derive the directional session keys for one connection.
///
/// The HKDF salt binds both public keys ordered initiator first, so the two
/// sides expand identical key material and only the rx/tx assignment
/// differs by role.
pub fn derive_session_keys(
    local: &EndpointKeypair,
    peer_public: &[u8],
    role: KxRole,
) -> Result<SessionKeys, KeyError> {
    let peer_bytes: [u8; KEY_SIZE] = peer_public
        .try_into()
        .map_err(|_| KeyError::PeerKeySize(peer_public.len()))?;
    let peer_key = PublicKey::from(peer_bytes);
    let shared = local.secret.diffie_hellman(&peer_key);

    let local_pk = local.public.to_bytes();
    let (initiator_pk, responder_pk) = match role {
        KxRole::Initiator => (local_pk, peer_bytes),
        KxRole::Responder => (peer_bytes, local_pk),
    };
    let mut salt = [0u8; KEY_SIZE * 2];
    salt[..KEY_SIZE].copy_from_slice(&initiator_pk);
    salt[KEY_SIZE..].copy_from_slice(&responder_pk);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut i2r = [0u8; KEY_SIZE];
    let mut r2i = [0u8; KEY_SIZE];
    hk.expand(INFO_I2R, &mut i2r)
        .map_err(|_| KeyError::Derivation)?;
    hk.expand(INFO_R2I, &mut r2i)
        .map_err(|_| KeyError::Derivation)?;

    Ok(match role {
        KxRole::Initiator => SessionKeys { rx: r2i, tx: i2r },
        KxRole::Responder => SessionKeys { rx: i2r, tx: r2i },
    })
}

/// One AEAD direction with a counter nonce.
///
/// Nonces are the message counter encoded little endian into the low bytes
/// of the 12-byte nonce. The transport delivers in order, so both sides
/// advance their counters in lockstep.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        CipherState {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    /// Encrypt and authenticate one message
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| KeyError::Aead)
    }

    /// Decrypt and verify one message
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| KeyError::Aead)
    }

    /// Messages processed so far in this direction
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// The two cipher directions of one secured connection
#[derive(Debug)]
pub struct CipherPair {
    /// Transform for outbound traffic
    pub tx: CipherState,
    /// Transform for inbound traffic
    pub rx: CipherState,
}

impl CipherPair {
    /// Start the transform from derived session keys
    pub fn from_keys(keys: &SessionKeys) -> Self {
        CipherPair {
            tx: CipherState::new(&keys.tx),
            rx: CipherState::new(&keys.rx),
        }
    }

    /// Seal one outbound message
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.tx.seal(plaintext)
    }

    /// Open one inbound message
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.rx.open(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_derive_complementary_keys() {
        let a = EndpointKeypair::generate();
        let b = EndpointKeypair::generate();

        let initiator =
            derive_session_keys(&a, &b.public_bytes(), KxRole::Initiator).unwrap();
        let responder =
            derive_session_keys(&b, &a.public_bytes(), KxRole::Responder).unwrap();

        assert_eq!(initiator.tx, responder.rx);
        assert_eq!(initiator.rx, responder.tx);
        assert_ne!(initiator.tx, initiator.rx);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = EndpointKeypair::generate();
        let b = EndpointKeypair::generate();

        let one = derive_session_keys(&a, &b.public_bytes(), KxRole::Initiator).unwrap();
        let two = derive_session_keys(&a, &b.public_bytes(), KxRole::Initiator).unwrap();
        assert_eq!(one.tx, two.tx);
        assert_eq!(one.rx, two.rx);
    }

    #[test]
    fn test_bad_peer_key_length() {
        let a = EndpointKeypair::generate();
        let err = derive_session_keys(&a, &[0u8; 31], KxRole::Initiator).unwrap_err();
        assert!(matches!(err, KeyError::PeerKeySize(31)));
    }

    #[test]
    fn test_seal_open_across_roles() {
        let a = EndpointKeypair::generate();
        let b = EndpointKeypair::generate();
        let mut initiator = CipherPair::from_keys(
            &derive_session_keys(&a, &b.public_bytes(), KxRole::Initiator).unwrap(),
        );
        let mut responder = CipherPair::from_keys(
            &derive_session_keys(&b, &a.public_bytes(), KxRole::Responder).unwrap(),
        );

        let sealed = initiator.seal(b"hello overlay").unwrap();
        assert_ne!(sealed.as_slice(), b"hello overlay");
        let opened = responder.open(&sealed).unwrap();
        assert_eq!(opened, b"hello overlay");

        let back = responder.seal(b"and back").unwrap();
        assert_eq!(initiator.open(&back).unwrap(), b"and back");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let a = EndpointKeypair::generate();
        let b = EndpointKeypair::generate();
        let mut initiator = CipherPair::from_keys(
            &derive_session_keys(&a, &b.public_bytes(), KxRole::Initiator).unwrap(),
        );
        let mut responder = CipherPair::from_keys(
            &derive_session_keys(&b, &a.public_bytes(), KxRole::Responder).unwrap(),
        );

        let mut sealed = initiator.seal(b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(responder.open(&sealed), Err(KeyError::Aead)));
    }

    #[test]
    fn test_counter_advances_per_message() {
        let a = EndpointKeypair::generate();
        let b = EndpointKeypair::generate();
        let mut pair = CipherPair::from_keys(
            &derive_session_keys(&a, &b.public_bytes(), KxRole::Initiator).unwrap(),
        );

        let one = pair.seal(b"same").unwrap();
        let two = pair.seal(b"same").unwrap();
        assert_ne!(one, two);
        assert_eq!(pair.tx.counter(), 2);
    }
}
