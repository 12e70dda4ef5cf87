//! Channel (group) encryption.
//!
//! One shared 32-byte AEAD key per channel, created once at channel
//! construction and handed to each joiner by the broker inside the join
//! acknowledgment. The key is never rotated: queued offline ciphertext must
//! stay decryptable, and a rotation would orphan it.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::CryptoError;
use crate::KEY_LEN;

#[derive(Default)]
pub struct ChannelKeyRing {
    keys: HashMap<String, Zeroizing<[u8; KEY_LEN]>>,
}

impl ChannelKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh channel key, retaining it locally. Returns base64.
    pub fn create_key(&mut self, channel: &str) -> String {
        let key = aead::generate_key();
        let b64 = B64.encode(key.as_ref());
        self.keys.insert(channel.to_string(), key);
        b64
    }

    /// Load a key received from the broker.
    pub fn load_key(&mut self, channel: &str, key_b64: &str) -> Result<(), CryptoError> {
        let bytes = B64.decode(key_b64)?;
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Channel key must be 32 bytes".into()))?;
        self.keys.insert(channel.to_string(), Zeroizing::new(arr));
        Ok(())
    }

    pub fn has_key(&self, channel: &str) -> bool {
        self.keys.contains_key(channel)
    }

    pub fn encrypt_for(
        &self,
        channel: &str,
        plaintext: &[u8],
    ) -> Result<(String, String), CryptoError> {
        let key = self
            .keys
            .get(channel)
            .ok_or_else(|| CryptoError::UnknownChannel(channel.to_string()))?;
        aead::seal(key, plaintext)
    }

    pub fn decrypt_from(
        &self,
        channel: &str,
        ciphertext_b64: &str,
        nonce_b64: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let key = self
            .keys
            .get(channel)
            .ok_or_else(|| CryptoError::UnknownChannel(channel.to_string()))?;
        aead::open(key, ciphertext_b64, nonce_b64)
    }

    pub fn remove_key(&mut self, channel: &str) {
        self.keys.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_share_one_key() {
        let mut creator = ChannelKeyRing::new();
        let key_b64 = creator.create_key("#dev");

        let mut joiner = ChannelKeyRing::new();
        joiner.load_key("#dev", &key_b64).unwrap();

        let (ct, nonce) = creator.encrypt_for("#dev", b"standup at ten").unwrap();
        let pt = joiner.decrypt_from("#dev", &ct, &nonce).unwrap();
        assert_eq!(pt.as_slice(), b"standup at ten");
    }

    #[test]
    fn missing_key_is_an_error() {
        let ring = ChannelKeyRing::new();
        assert!(matches!(
            ring.encrypt_for("#ghost", b"x"),
            Err(CryptoError::UnknownChannel(_))
        ));
    }

    #[test]
    fn malformed_key_rejected() {
        let mut ring = ChannelKeyRing::new();
        assert!(ring.load_key("#dev", "not-base64!!!").is_err());
        assert!(ring.load_key("#dev", &B64.encode([0u8; 16])).is_err());
    }
}
