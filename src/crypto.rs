//! # Encrypted Envelope
//!
//! When encryption is enabled every frame travels inside an outer
//! envelope:
//!
//! ```text
//! 0   4    magic 'CMSG'
//! 4   4    big-endian length of the following payload
//! 8   len  AES-256-CBC ciphertext of a complete CMSG frame
//! ```
//!
//! The first datagram a client sends on a fresh connection carries a
//! plaintext nonce in the same envelope instead of ciphertext. Both sides
//! feed the nonce to a caller-supplied derivation function which
//! initialises the security association's cipher states; every subsequent
//! frame is encrypted.
//!
//! CBC state chains across frames: each frame is PKCS#7-padded and
//! encrypted with the current IV, and the last ciphertext block becomes
//! the next frame's IV. Sender and receiver stay in step because the
//! chaining value is visible on the wire.
//!
//! The envelope knows nothing about key material. Servers supply
//! `sa_create(peer)` to mint an association on accept; both sides supply
//! `sa_derive(sa, nonce)`.

use std::sync::Arc;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use rand::RngCore;

use crate::error::CryptoError;
use crate::transport::PeerAddr;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Magic bytes opening every encrypted-mode datagram.
pub const ENVELOPE_MAGIC: &[u8; 4] = b"CMSG";

/// Symmetric key size.
pub const KEY_SIZE: usize = 32;

const BLOCK: usize = 16;

/// Nonce length generated by [`generate_nonce`].
pub const NONCE_SIZE: usize = 32;

/// Server-side factory for a peer's security association, called on accept.
/// Returning `None` rejects the peer.
pub type SaCreateFn = Arc<dyn Fn(&PeerAddr) -> Option<SecurityAssociation> + Send + Sync>;

/// Initialises both cipher states of an association from the handshake
/// nonce.
pub type SaDeriveFn =
    Arc<dyn Fn(&mut SecurityAssociation, &[u8]) -> Result<(), CryptoError> + Send + Sync>;

#[derive(Clone, Copy)]
struct CipherState {
    iv: [u8; BLOCK],
}

/// Per-peer key material and chained cipher states.
pub struct SecurityAssociation {
    key: [u8; KEY_SIZE],
    server: bool,
    enc: Option<CipherState>,
    dec: Option<CipherState>,
}

impl SecurityAssociation {
    pub fn new(key: [u8; KEY_SIZE], server: bool) -> Self {
        Self {
            key,
            server,
            enc: None,
            dec: None,
        }
    }

    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Whether the handshake has run and frames can be enciphered.
    pub fn initialised(&self) -> bool {
        self.enc.is_some() && self.dec.is_some()
    }

    /// Flip both cipher states back to uninitialised. The next send will
    /// perform a fresh nonce handshake.
    pub fn reset(&mut self) {
        self.enc = None;
        self.dec = None;
    }

    /// Initialise both cipher states from the nonce. Both directions start
    /// from the same IV; the chains diverge from the first frame onwards.
    pub fn derive_from_nonce(&mut self, nonce: &[u8]) -> Result<(), CryptoError> {
        if nonce.len() < BLOCK {
            return Err(CryptoError::BadNonce(nonce.len()));
        }
        let mut iv = [0u8; BLOCK];
        iv.copy_from_slice(&nonce[..BLOCK]);
        self.enc = Some(CipherState { iv });
        self.dec = Some(CipherState { iv });
        Ok(())
    }

    /// Encrypt one frame and wrap it in the outer envelope.
    pub fn encrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let state = self.enc.as_mut().ok_or(CryptoError::NotInitialised)?;
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &state.iv.into())
            .encrypt_padded_vec::<Pkcs7>(frame);
        state.iv.copy_from_slice(&ciphertext[ciphertext.len() - BLOCK..]);
        Ok(envelope(&ciphertext))
    }

    /// Decrypt an envelope payload back into a complete frame.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let state = self.dec.as_mut().ok_or(CryptoError::NotInitialised)?;
        if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
            return Err(CryptoError::BadLength);
        }
        let next_iv: [u8; BLOCK] = ciphertext[ciphertext.len() - BLOCK..]
            .try_into()
            .map_err(|_| CryptoError::BadLength)?;
        let plaintext = Aes256CbcDec::new(&self.key.into(), &state.iv.into())
            .decrypt_padded_vec::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::BadPadding)?;
        state.iv = next_iv;
        Ok(plaintext)
    }
}

/// The default derivation function: IV taken from the head of the nonce.
pub fn default_derive() -> SaDeriveFn {
    Arc::new(|sa, nonce| sa.derive_from_nonce(nonce))
}

/// Wrap a payload (nonce or ciphertext) in the 8-byte outer prefix.
pub fn envelope(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(ENVELOPE_MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Fresh random nonce for the handshake datagram.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_sas() -> (SecurityAssociation, SecurityAssociation) {
        let key = [0x42u8; KEY_SIZE];
        let mut client = SecurityAssociation::new(key, false);
        let mut server = SecurityAssociation::new(key, true);
        let nonce = generate_nonce();
        client.derive_from_nonce(&nonce).unwrap();
        server.derive_from_nonce(&nonce).unwrap();
        (client, server)
    }

    #[test]
    fn round_trip_under_same_sa() {
        let (mut client, mut server) = paired_sas();
        let frame = b"a complete cmsg frame".to_vec();

        let enveloped = client.encrypt(&frame).unwrap();
        assert_eq!(&enveloped[0..4], ENVELOPE_MAGIC);
        let len = u32::from_be_bytes(enveloped[4..8].try_into().unwrap()) as usize;
        assert_eq!(len, enveloped.len() - 8);

        let plain = server.decrypt(&enveloped[8..]).unwrap();
        assert_eq!(plain, frame);
    }

    #[test]
    fn chaining_survives_multiple_frames() {
        let (mut client, mut server) = paired_sas();
        for i in 0..5u8 {
            let frame = vec![i; 40 + i as usize];
            let enveloped = client.encrypt(&frame).unwrap();
            let plain = server.decrypt(&enveloped[8..]).unwrap();
            assert_eq!(plain, frame);
        }
    }

    #[test]
    fn identical_frames_produce_different_ciphertext() {
        let (mut client, _server) = paired_sas();
        let frame = vec![7u8; 64];
        let first = client.encrypt(&frame).unwrap();
        let second = client.encrypt(&frame).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut client, mut server) = paired_sas();
        let mut enveloped = client.encrypt(b"payload").unwrap();
        let last = enveloped.len() - 1;
        enveloped[last] ^= 0xff;
        assert!(server.decrypt(&enveloped[8..]).is_err());
    }

    #[test]
    fn uninitialised_sa_refuses_frames() {
        let mut sa = SecurityAssociation::new([0u8; KEY_SIZE], false);
        assert!(!sa.initialised());
        assert!(matches!(
            sa.encrypt(b"x"),
            Err(CryptoError::NotInitialised)
        ));
    }

    #[test]
    fn reset_requires_new_handshake() {
        let (mut client, _server) = paired_sas();
        assert!(client.initialised());
        client.reset();
        assert!(!client.initialised());
        assert!(client.encrypt(b"x").is_err());
    }

    #[test]
    fn short_nonce_rejected() {
        let mut sa = SecurityAssociation::new([0u8; KEY_SIZE], false);
        assert!(matches!(
            sa.derive_from_nonce(&[1, 2, 3]),
            Err(CryptoError::BadNonce(3))
        ));
    }
}
