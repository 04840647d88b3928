//! Noise_IK handshake
//!
//! ```text
//! Noise_IK(s, rs):
//!   <- s                    # Responder's static key known to Initiator
//!   ...
//!   -> e, es, s, ss         # ClientHello
//!   <- e, ee, se            # ServerHello
//! ```
//!
//! After the handshake both sides derive the record keys with HKDF.

use hkdf::Hkdf;
use sha2::Sha256;
use snow::{Builder, HandshakeState};
use zeroize::Zeroize;

use crate::core::{CryptoError, HASH_SIZE, NOISE_PATTERN, PUBLIC_KEY_SIZE};

use super::aead::{SessionKey, SESSION_KEY_SIZE};
use super::keys::{PublicKeyBytes, StaticKeypair};

/// Largest Noise message the protocol allows.
const MAX_NOISE_MESSAGE: usize = 65535;

/// HKDF info label for record key expansion.
const RECORD_KEY_LABEL: &[u8] = b"netcode dtls v1 record keys";

fn handshake_error(e: snow::Error) -> CryptoError {
    CryptoError::HandshakeFailed(e.to_string())
}

fn builder<'a>() -> Result<Builder<'a>, CryptoError> {
    let params = NOISE_PATTERN
        .parse()
        .map_err(|e: snow::Error| handshake_error(e))?;
    Ok(Builder::new(params))
}

/// Result of a completed handshake.
#[derive(Clone)]
pub struct HandshakeResult {
    /// Transcript hash, input to key derivation.
    pub handshake_hash: [u8; HASH_SIZE],
    /// The peer's authenticated static public key.
    pub remote_static: PublicKeyBytes,
}

fn finish(state: HandshakeState, remote_static: PublicKeyBytes) -> Result<HandshakeResult, CryptoError> {
    let mut handshake_hash = [0u8; HASH_SIZE];
    handshake_hash.copy_from_slice(state.get_handshake_hash());

    // fails unless both messages were processed
    let _transport = state.into_transport_mode().map_err(handshake_error)?;

    Ok(HandshakeResult {
        handshake_hash,
        remote_static,
    })
}

/// Initiator side.
pub struct InitiatorHandshake {
    state: HandshakeState,
    remote_public: PublicKeyBytes,
}

impl InitiatorHandshake {
    /// Start a handshake towards a responder whose static key is known.
    pub fn new(local_keypair: &StaticKeypair, remote_public: &PublicKeyBytes) -> Result<Self, CryptoError> {
        let state = builder()?
            .local_private_key(local_keypair.private_key())
            .remote_public_key(remote_public)
            .build_initiator()
            .map_err(handshake_error)?;

        Ok(Self {
            state,
            remote_public: *remote_public,
        })
    }

    /// Write the ClientHello (-> e, es, s, ss).
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.write_message(payload, &mut buf).map_err(handshake_error)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Read the ServerHello (<- e, ee, se) and finish.
    ///
    /// Consumes the handshake: a failed read leaves the Noise state
    /// unusable, and the caller must start over with a fresh ClientHello.
    pub fn read_message(self, message: &[u8]) -> Result<(Vec<u8>, HandshakeResult), CryptoError> {
        let mut state = self.state;
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE];
        let len = state.read_message(message, &mut payload).map_err(handshake_error)?;
        payload.truncate(len);
        Ok((payload, finish(state, self.remote_public)?))
    }
}

/// Responder side.
pub struct ResponderHandshake {
    state: HandshakeState,
    remote_static: Option<PublicKeyBytes>,
}

impl ResponderHandshake {
    /// Prepare to answer one ClientHello.
    pub fn new(local_keypair: &StaticKeypair) -> Result<Self, CryptoError> {
        let state = builder()?
            .local_private_key(local_keypair.private_key())
            .build_responder()
            .map_err(handshake_error)?;

        Ok(Self {
            state,
            remote_static: None,
        })
    }

    /// Read the ClientHello. Returns its payload and the initiator's static key.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(Vec<u8>, PublicKeyBytes), CryptoError> {
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.read_message(message, &mut payload).map_err(handshake_error)?;
        payload.truncate(len);

        let remote_static = self
            .state
            .get_remote_static()
            .ok_or_else(|| CryptoError::HandshakeFailed("no remote static key".into()))?;

        let mut remote_public = [0u8; PUBLIC_KEY_SIZE];
        remote_public.copy_from_slice(remote_static);
        self.remote_static = Some(remote_public);

        Ok((payload, remote_public))
    }

    /// Write the ServerHello (<- e, ee, se) and finish.
    pub fn write_message(mut self, payload: &[u8]) -> Result<(Vec<u8>, HandshakeResult), CryptoError> {
        let remote_static = self
            .remote_static
            .ok_or_else(|| CryptoError::HandshakeFailed("ClientHello not read".into()))?;

        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.write_message(payload, &mut buf).map_err(handshake_error)?;
        buf.truncate(len);

        Ok((buf, finish(self.state, remote_static)?))
    }
}

/// Role in the handshake (selects the send and receive keys).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiator (client)
    Initiator,
    /// Responder (server)
    Responder,
}

/// Record keys derived from a completed handshake.
///
/// ```text
/// PRK = HKDF-Extract(salt = DH(s_i, S_r), IKM = handshake_hash)
/// (initiator_key, responder_key) = HKDF-Expand(PRK, "netcode dtls v1 record keys", 64)
/// ```
pub struct SessionKeys {
    /// Key for initiator → responder records
    pub initiator_key: SessionKey,
    /// Key for responder → initiator records
    pub responder_key: SessionKey,
}

impl SessionKeys {
    /// Derive record keys from the handshake result and static DH secret.
    pub fn derive(result: &HandshakeResult, static_dh_secret: &[u8; 32]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(&static_dh_secret[..]), &result.handshake_hash);
        let mut key_material = [0u8; 2 * SESSION_KEY_SIZE];
        hk.expand(RECORD_KEY_LABEL, &mut key_material)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut initiator_key = [0u8; SESSION_KEY_SIZE];
        let mut responder_key = [0u8; SESSION_KEY_SIZE];
        initiator_key.copy_from_slice(&key_material[..SESSION_KEY_SIZE]);
        responder_key.copy_from_slice(&key_material[SESSION_KEY_SIZE..]);
        key_material.zeroize();

        Ok(Self {
            initiator_key: SessionKey::from_bytes(initiator_key),
            responder_key: SessionKey::from_bytes(responder_key),
        })
    }

    /// Send key for `role`.
    pub fn send_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.initiator_key,
            Role::Responder => &self.responder_key,
        }
    }

    /// Receive key for `role`.
    pub fn recv_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.responder_key,
            Role::Responder => &self.initiator_key,
        }
    }
}
