//! Pairwise peer encryption and the rotation policy.
//!
//! For each peer whose public key is loaded we compute the X25519 shared
//! point and expand it through HKDF-SHA256 (empty salt, protocol info
//! string) into a 32-byte ChaCha20-Poly1305 key.
//!
//! A key is due for rotation when its wall-clock age exceeds the configured
//! interval or the outbound message count reaches the cap. Rotation is
//! wholesale: a fresh identity keypair, every peer secret re-derived,
//! counters and timestamps reset. The new public key then travels to peers
//! via the `rekey_request`/`rekey_response` handshake.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::aead;
use crate::error::CryptoError;
use crate::identity::{decode_public_key, IdentityKeyPair};
use crate::{HKDF_INFO, KEY_LEN};

/// When a pairwise key must be retired.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    pub interval: Duration,
    pub max_messages: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_messages: 10_000,
        }
    }
}

/// Why a key is due for rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    Age { elapsed_secs: u64 },
    MessageCount { count: u64 },
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationReason::Age { elapsed_secs } => {
                write!(f, "Time limit reached ({:.1} minutes)", *elapsed_secs as f64 / 60.0)
            }
            RotationReason::MessageCount { count } => {
                write!(f, "Message limit reached ({count} messages)")
            }
        }
    }
}

/// Per-peer key statistics, surfaced to the host UI.
#[derive(Debug, Clone)]
pub struct KeyStats {
    pub peer_id: String,
    pub key_age: Duration,
    pub message_count: u64,
    pub due: Option<RotationReason>,
}

struct PeerState {
    public: PublicKey,
    secret: Zeroizing<[u8; KEY_LEN]>,
    established: Instant,
    outbound: u64,
}

pub struct PeerCrypto {
    identity: IdentityKeyPair,
    peers: HashMap<String, PeerState>,
    policy: RotationPolicy,
}

impl PeerCrypto {
    pub fn new(policy: RotationPolicy) -> Self {
        Self {
            identity: IdentityKeyPair::generate(),
            peers: HashMap::new(),
            policy,
        }
    }

    pub fn public_key_b64(&self) -> String {
        self.identity.public_b64()
    }

    pub fn has_peer_key(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Load (or replace) a peer's public key and derive the shared secret.
    /// Resets that peer's rotation tracking.
    pub fn load_peer_key(&mut self, peer_id: &str, public_b64: &str) -> Result<(), CryptoError> {
        let public = decode_public_key(public_b64)?;
        let secret = derive_pairwise_key(&self.identity, &public)?;
        self.peers.insert(
            peer_id.to_string(),
            PeerState {
                public,
                secret,
                established: Instant::now(),
                outbound: 0,
            },
        );
        Ok(())
    }

    /// Encrypt for a peer. Returns the `(ciphertext_b64, nonce_b64)` wire
    /// tuple and counts the message against the rotation cap.
    pub fn encrypt(&mut self, peer_id: &str, plaintext: &[u8]) -> Result<(String, String), CryptoError> {
        let state = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::UnknownPeer(peer_id.to_string()))?;
        state.outbound += 1;
        aead::seal(&state.secret, plaintext)
    }

    pub fn decrypt(
        &self,
        peer_id: &str,
        ciphertext_b64: &str,
        nonce_b64: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let state = self
            .peers
            .get(peer_id)
            .ok_or_else(|| CryptoError::UnknownPeer(peer_id.to_string()))?;
        aead::open(&state.secret, ciphertext_b64, nonce_b64)
    }

    /// Whether the key for `peer_id` should be rotated, and why.
    pub fn rotation_due(&self, peer_id: &str) -> Option<RotationReason> {
        let state = self.peers.get(peer_id)?;
        let elapsed = state.established.elapsed();
        if elapsed >= self.policy.interval {
            return Some(RotationReason::Age {
                elapsed_secs: elapsed.as_secs(),
            });
        }
        if state.outbound >= self.policy.max_messages {
            return Some(RotationReason::MessageCount {
                count: state.outbound,
            });
        }
        None
    }

    /// Rotate: fresh identity keypair, every peer secret re-derived, all
    /// counters reset. Returns the new public key to send in a
    /// `rekey_request`.
    pub fn rotate(&mut self) -> Result<String, CryptoError> {
        self.identity = IdentityKeyPair::generate();
        for state in self.peers.values_mut() {
            state.secret = derive_pairwise_key(&self.identity, &state.public)?;
            state.established = Instant::now();
            state.outbound = 0;
        }
        Ok(self.identity.public_b64())
    }

    pub fn key_stats(&self, peer_id: &str) -> Option<KeyStats> {
        let state = self.peers.get(peer_id)?;
        Some(KeyStats {
            peer_id: peer_id.to_string(),
            key_age: state.established.elapsed(),
            message_count: state.outbound,
            due: self.rotation_due(peer_id),
        })
    }

    pub fn remove_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }
}

impl Default for PeerCrypto {
    fn default() -> Self {
        Self::new(RotationPolicy::default())
    }
}

fn derive_pairwise_key(
    identity: &IdentityKeyPair,
    peer: &PublicKey,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let shared = Zeroizing::new(identity.shared_point(peer));
    let hk = Hkdf::<Sha256>::new(None, shared.as_ref());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(HKDF_INFO, key.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (PeerCrypto, PeerCrypto) {
        let mut alice = PeerCrypto::default();
        let mut bob = PeerCrypto::default();
        let a_pub = alice.public_key_b64();
        let b_pub = bob.public_key_b64();
        alice.load_peer_key("user_bob", &b_pub).unwrap();
        bob.load_peer_key("user_alice", &a_pub).unwrap();
        (alice, bob)
    }

    #[test]
    fn peers_derive_matching_keys() {
        let (mut alice, bob) = pair();
        let (ct, nonce) = alice.encrypt("user_bob", b"hello bob").unwrap();
        let pt = bob.decrypt("user_alice", &ct, &nonce).unwrap();
        assert_eq!(pt.as_slice(), b"hello bob");
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let mut alice = PeerCrypto::default();
        assert!(matches!(
            alice.encrypt("user_nobody", b"x"),
            Err(CryptoError::UnknownPeer(_))
        ));
    }

    #[test]
    fn rotation_invalidates_old_keys_both_ways() {
        let (mut alice, mut bob) = pair();
        let (old_ct, old_nonce) = alice.encrypt("user_bob", b"before").unwrap();

        // Alice rotates; both sides exchange new public keys.
        let a_new = alice.rotate().unwrap();
        bob.load_peer_key("user_alice", &a_new).unwrap();
        let b_new = bob.rotate().unwrap();
        alice.load_peer_key("user_bob", &b_new).unwrap();

        // Old ciphertext is undecryptable under the new keys.
        assert!(bob.decrypt("user_alice", &old_ct, &old_nonce).is_err());

        // New traffic flows under the new keys.
        let (ct, nonce) = alice.encrypt("user_bob", b"after").unwrap();
        assert_eq!(
            bob.decrypt("user_alice", &ct, &nonce).unwrap().as_slice(),
            b"after"
        );
    }

    #[test]
    fn message_count_triggers_rotation() {
        let mut alice = PeerCrypto::new(RotationPolicy {
            interval: Duration::from_secs(3600),
            max_messages: 3,
        });
        let bob = PeerCrypto::default();
        alice.load_peer_key("user_bob", &bob.public_key_b64()).unwrap();

        assert!(alice.rotation_due("user_bob").is_none());
        for _ in 0..3 {
            alice.encrypt("user_bob", b"x").unwrap();
        }
        assert!(matches!(
            alice.rotation_due("user_bob"),
            Some(RotationReason::MessageCount { count: 3 })
        ));

        alice.rotate().unwrap();
        assert!(alice.rotation_due("user_bob").is_none());
    }

    #[test]
    fn zero_interval_triggers_age_rotation() {
        let mut alice = PeerCrypto::new(RotationPolicy {
            interval: Duration::ZERO,
            max_messages: 10_000,
        });
        let bob = PeerCrypto::default();
        alice.load_peer_key("user_bob", &bob.public_key_b64()).unwrap();
        assert!(matches!(
            alice.rotation_due("user_bob"),
            Some(RotationReason::Age { .. })
        ));
    }

    #[test]
    fn key_stats_reflect_counters() {
        let (mut alice, _bob) = pair();
        alice.encrypt("user_bob", b"one").unwrap();
        alice.encrypt("user_bob", b"two").unwrap();
        let stats = alice.key_stats("user_bob").unwrap();
        assert_eq!(stats.message_count, 2);
        assert!(stats.due.is_none());
    }
}
