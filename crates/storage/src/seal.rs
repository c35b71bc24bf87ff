//! AES-256-GCM sealing of object content at rest.
//!
//! The key is derived from the database password, so a store opened with the
//! wrong password cannot read (or silently accept) existing objects. Sealed
//! blobs are laid out as `nonce || ciphertext`.

use crate::{StoreError, StoreResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand_core::{OsRng, RngCore};

const KEY_CONTEXT: &str = "safestore 2024-01-01 object content sealing key";
const NONCE_LEN: usize = 12;

pub struct ContentSealer {
    key: [u8; 32],
}

impl ContentSealer {
    pub fn from_password(password: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, password.as_bytes()),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    fn generate_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    pub fn seal(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let nonce = Self::generate_nonce();
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StoreError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> StoreResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Seal);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Seal)
    }
}
