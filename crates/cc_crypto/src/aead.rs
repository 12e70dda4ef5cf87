//! Authenticated encryption.
//!
//! ChaCha20-Poly1305 (IETF, 96-bit nonce). Key: 32 bytes. Nonce: 12 random
//! bytes per message, transmitted alongside the ciphertext. Both travel
//! base64-encoded.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::{KEY_LEN, NONCE_LEN};

/// Encrypt `plaintext` with a fresh random nonce.
/// Returns `(ciphertext_b64, nonce_b64)` — the wire tuple.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<(String, String), CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    Ok((B64.encode(ciphertext), B64.encode(nonce_bytes)))
}

/// Decrypt a wire tuple produced by [`seal`].
pub fn open(
    key: &[u8; KEY_LEN],
    ciphertext_b64: &str,
    nonce_b64: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let ciphertext = B64.decode(ciphertext_b64)?;
    let nonce_bytes = B64.decode(nonce_b64)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }

    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Generate a fresh random 32-byte AEAD key.
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(key.as_mut());
    key
}
