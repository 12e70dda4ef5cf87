//! X25519 identity keys.
//!
//! Each endpoint holds one keypair per process lifetime (until rotation).
//! The public half is advertised base64-encoded at registration and carried
//! in every join acknowledgment so channel members can derive pairwise keys.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_b64(&self) -> String {
        B64.encode(self.public.as_bytes())
    }

    /// Raw ECDH against a peer public key.
    pub fn shared_point(&self, peer: &PublicKey) -> [u8; 32] {
        *self.secret.diffie_hellman(peer).as_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_b64())
            .finish_non_exhaustive()
    }
}

/// Decode a base64 X25519 public key from the wire.
pub fn decode_public_key(b64: &str) -> Result<PublicKey, CryptoError> {
    let bytes = B64.decode(b64)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(arr))
}
