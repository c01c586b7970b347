// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Symmetric encryption of credential-carrying columns.
//!
//! Values are sealed with AES-256-GCM. The key is the SHA-256 digest of the
//! configured secret; every value gets a fresh 96-bit nonce which is stored in
//! front of the ciphertext, and the whole blob is base64 encoded so it fits a
//! text column. An empty secret turns the cipher into a passthrough, which is
//! only meant for local development.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// Errors raised while sealing or opening a value.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The AEAD rejected the plaintext.
    #[error("failed to encrypt value")]
    Encrypt,
    /// Authentication failed; wrong key or tampered data.
    #[error("failed to decrypt value")]
    Decrypt,
    /// The stored value is not valid base64.
    #[error("invalid encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    /// The stored value is shorter than a nonce.
    #[error("ciphertext too short")]
    Truncated,
    /// The decrypted bytes are not UTF-8.
    #[error("decrypted value is not valid UTF-8")]
    Utf8,
}

/// Field-level cipher shared by the persistence backends.
#[derive(Clone)]
pub struct FieldCipher {
    key: Option<Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl FieldCipher {
    /// Build a cipher from the process-supplied secret.
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            return Self::disabled();
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        Self { key: Some(key) }
    }

    /// A cipher that stores values as-is.
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Whether values are actually encrypted.
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Seal a value for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| CryptoError::Encrypt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    /// Open a value read from storage.
    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(stored.to_string());
        };
        if stored.is_empty() {
            return Ok(String::new());
        }

        let blob = STANDARD.decode(stored)?;
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| CryptoError::Decrypt)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Decrypt)?,
        );
        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_hides_plaintext() {
        let cipher = FieldCipher::new("################################");
        let sealed = cipher.encrypt("clientsecret-value").unwrap();

        assert!(!sealed.contains("clientsecret-value"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "clientsecret-value");
    }

    #[test]
    fn test_nonce_differs_per_value() {
        let cipher = FieldCipher::new("key");
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = FieldCipher::new("key-a").encrypt("kubeconfig").unwrap();
        let err = FieldCipher::new("key-b").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt));
    }

    #[test]
    fn test_truncated_value() {
        let cipher = FieldCipher::new("key");
        let err = cipher.decrypt(&STANDARD.encode([1u8, 2, 3])).unwrap_err();
        assert!(matches!(err, CryptoError::Truncated));
    }

    #[test]
    fn test_disabled_cipher_is_passthrough() {
        let cipher = FieldCipher::new("");
        assert!(!cipher.is_enabled());
        assert_eq!(cipher.encrypt("plain").unwrap(), "plain");
        assert_eq!(cipher.decrypt("plain").unwrap(), "plain");
    }
}
