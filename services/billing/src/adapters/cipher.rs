//! services/billing/src/adapters/cipher.rs
//!
//! AES-256-GCM implementation of the `SecretCipher` port. Ciphertexts are stored
//! as base64 of `nonce || ciphertext+tag`, with a fresh random nonce per value.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use freelance_core::ports::{PortError, PortResult, SecretCipher};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Builds the cipher from a base64 encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> PortResult<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PortError::Unexpected(format!("Encryption key is not valid base64: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| {
            PortError::Unexpected(format!(
                "Encryption key must be 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { cipher })
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> PortResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| PortError::Unexpected("Encryption failed".to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload))
    }

    fn decrypt(&self, encoded: &str) -> PortResult<String> {
        let payload = STANDARD
            .decode(encoded)
            .map_err(|e| PortError::Unexpected(format!("Ciphertext is not valid base64: {e}")))?;
        if payload.len() <= NONCE_LEN {
            return Err(PortError::Unexpected("Ciphertext is too short".to_string()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PortError::Unexpected("Decryption failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| PortError::Unexpected(e.to_string()))
    }
}
