//! X25519 key management
//!
//! Static keypairs identify endpoints; the handshake authenticates them and
//! the record key schedule mixes in their static-static DH.

use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{CryptoError, NOISE_PATTERN, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

/// Raw X25519 public key.
pub type PublicKeyBytes = [u8; PUBLIC_KEY_SIZE];

/// A static X25519 keypair for long-term identity.
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct StaticKeypair {
    private: [u8; PRIVATE_KEY_SIZE],
    public: PublicKeyBytes,
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        let keypair = snow::Builder::new(params)
            .generate_keypair()
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut private = [0u8; PRIVATE_KEY_SIZE];
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        private.copy_from_slice(&keypair.private);
        public.copy_from_slice(&keypair.public);

        Ok(Self { private, public })
    }

    /// Rebuild a keypair from its private half.
    pub fn from_private(private: [u8; PRIVATE_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret).to_bytes();
        Self { private, public }
    }

    /// The public key.
    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public
    }

    /// The private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }

    /// DH(our_static, their_static), mixed into the record key schedule.
    pub fn compute_static_dh(&self, remote_public: &PublicKeyBytes) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let public = PublicKey::from(*remote_public);
        secret.diffie_hellman(&public).to_bytes()
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = StaticKeypair::generate().unwrap();
        let kp2 = StaticKeypair::generate().unwrap();

        assert_ne!(kp1.public_key(), kp2.public_key());
        assert_ne!(kp1.private_key(), kp2.private_key());
    }

    #[test]
    fn test_from_private_derives_public() {
        let generated = StaticKeypair::generate().unwrap();
        let restored = StaticKeypair::from_private(*generated.private_key());
        assert_eq!(restored.public_key(), generated.public_key());
    }

    #[test]
    fn test_static_dh_agrees() {
        let a = StaticKeypair::generate().unwrap();
        let b = StaticKeypair::generate().unwrap();
        assert_eq!(
            a.compute_static_dh(b.public_key()),
            b.compute_static_dh(a.public_key())
        );
    }

    #[test]
    fn test_debug_hides_private_key() {
        let kp = StaticKeypair::from_private([7u8; PRIVATE_KEY_SIZE]);
        let rendered = format!("{kp:?}");
        assert!(rendered.contains("public"));
        assert!(!rendered.contains("private"));
    }
}
