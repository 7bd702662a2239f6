//! Optional AEAD sealing of WAL entries.
//!
//! Cross-tenant streams can wrap each entry's key and value in
//! ChaCha20-Poly1305 with a server-managed 32-byte key. The nonce is
//! random per entry and travels prefixed to the ciphertext.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{RemDbError, ReplicationError, Result};

/// Nonce size for ChaCha20-Poly1305.
const NONCE_LEN: usize = 12;

/// Seals and opens WAL entry payloads.
pub struct EntryCipher {
    cipher: ChaCha20Poly1305,
}

impl EntryCipher {
    /// Creates a cipher from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Seals a payload; output is `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| RemDbError::from(ReplicationError::InvalidEntry("seal failed".into())))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a sealed payload produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(
                ReplicationError::InvalidEntry("sealed payload too short".into()).into(),
            );
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                ReplicationError::InvalidEntry("sealed payload failed authentication".into())
                    .into()
            })
    }
}

impl std::fmt::Debug for EntryCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> EntryCipher {
        EntryCipher::new(&[7u8; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = cipher();
        let sealed = cipher.seal(b"hello wal entry").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"hello wal entry".as_slice());
        assert_eq!(cipher.open(&sealed).unwrap(), b"hello wal entry");
    }

    #[test]
    fn test_nonces_are_unique_per_seal() {
        let cipher = cipher();
        let a = cipher.seal(b"same payload").unwrap();
        let b = cipher.seal(b"same payload").unwrap();
        assert_ne!(a, b, "random nonce must differ per entry");
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let cipher = cipher();
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = cipher().seal(b"payload").unwrap();
        let other = EntryCipher::new(&[8u8; 32]);
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let cipher = cipher();
        assert!(cipher.open(&[1, 2, 3]).is_err());
    }
}
