//! Endpoint cryptography for CloakChat.
//!
//! All of this runs on clients; the broker only ever sees the outputs
//! (base64 public keys, ciphertext, nonces) and routes them opaquely.
//!
//! - X25519 identity keys, advertised base64-encoded at registration.
//! - Pairwise keys: ECDH → HKDF-SHA256 → ChaCha20-Poly1305.
//! - Channel keys: a shared 32-byte AEAD key per channel, distributed by
//!   the broker inside the join acknowledgment.
//! - Rotation: pairwise keys age out by wall-clock time or message count;
//!   rotation regenerates the identity keypair and re-derives every peer
//!   secret.

pub mod aead;
pub mod channel;
pub mod error;
pub mod identity;
pub mod pairwise;

pub use channel::ChannelKeyRing;
pub use error::CryptoError;
pub use identity::IdentityKeyPair;
pub use pairwise::{KeyStats, PeerCrypto, RotationPolicy, RotationReason};

/// HKDF info string binding derived keys to this protocol.
pub const HKDF_INFO: &[u8] = b"JustIRC-E2E-Encryption";

/// AEAD key length in bytes.
pub const KEY_LEN: usize = 32;

/// AEAD nonce length in bytes (IETF ChaCha20-Poly1305).
pub const NONCE_LEN: usize = 12;
