//! XChaCha20-Poly1305 record protection.
//!
//! The AAD of every protected record is its 13-byte header, so the content
//! type, epoch, sequence and length are all authenticated.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroize;

use crate::core::{CryptoError, AEAD_NONCE_SIZE, AEAD_TAG_SIZE};

/// Size of a record key (32 bytes for XChaCha20).
pub const SESSION_KEY_SIZE: usize = 32;

/// A record key. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Create a key from bytes.
    pub fn from_bytes(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Encrypt `plaintext`, returning ciphertext with the 16-byte tag appended.
pub fn encrypt(
    key: &SessionKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .encrypt(xnonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt and authenticate `ciphertext` (tag included).
pub fn decrypt(
    key: &SessionKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .decrypt(xnonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RECORD_HEADER_SIZE;

    const AAD: [u8; RECORD_HEADER_SIZE] = [23, 0xFE, 0xFD, 0, 1, 0, 0, 0, 0, 0, 7, 0, 29];

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SessionKey::from_bytes([0x42; SESSION_KEY_SIZE]);
        let nonce = [0x01; AEAD_NONCE_SIZE];
        let plaintext = b"Hello, netcode";

        let ciphertext = encrypt(&key, &nonce, &AAD, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + AEAD_TAG_SIZE);

        let decrypted = decrypt(&key, &nonce, &AAD, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let key1 = SessionKey::from_bytes([0x42; SESSION_KEY_SIZE]);
        let key2 = SessionKey::from_bytes([0x43; SESSION_KEY_SIZE]);
        let nonce = [0x01; AEAD_NONCE_SIZE];

        let ciphertext = encrypt(&key1, &nonce, &AAD, b"secret").unwrap();
        let result = decrypt(&key2, &nonce, &AAD, &ciphertext);

        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_header_fails() {
        let key = SessionKey::from_bytes([0x42; SESSION_KEY_SIZE]);
        let nonce = [0x01; AEAD_NONCE_SIZE];
        let ciphertext = encrypt(&key, &nonce, &AAD, b"secret").unwrap();

        let mut header = AAD;
        header[0] = 21;
        let result = decrypt(&key, &nonce, &header, &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_short_ciphertext_fails() {
        let key = SessionKey::from_bytes([0x42; SESSION_KEY_SIZE]);
        let nonce = [0x01; AEAD_NONCE_SIZE];
        let result = decrypt(&key, &nonce, &AAD, &[0u8; AEAD_TAG_SIZE - 1]);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }
}
