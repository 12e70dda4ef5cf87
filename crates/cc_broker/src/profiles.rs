//! Registered-nickname profiles.
//!
//! A nickname may be registered with a password; the profile then carries
//! bio, status message, avatar, and last-seen. Stored in
//! `user_profiles.json`. Passwords use PBKDF2-HMAC-SHA256.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::persist::{load_json, write_json_atomic};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 digest, hex-encoded, with the given hex salt.
pub fn derive_password_hash(password: &str, salt_hex: &str) -> String {
    let salt = hex::decode(salt_hex).unwrap_or_default();
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut out);
    hex::encode(out)
}

pub fn generate_salt_hex() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub registration_date: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
}

pub struct ProfileStore {
    path: PathBuf,
    profiles: BTreeMap<String, Profile>,
}

impl ProfileStore {
    pub fn load(path: PathBuf) -> Self {
        let profiles = load_json(&path).unwrap_or_default();
        Self { path, profiles }
    }

    /// Register a nickname with a password. Fails if already registered.
    pub fn register_nickname(&mut self, nickname: &str, password: &str) -> Result<String, String> {
        if password.len() < 4 {
            return Err("Password must be at least 4 characters".to_string());
        }
        let profile = self.profiles.entry(nickname.to_string()).or_default();
        if profile.registered {
            return Err(format!("Nickname {nickname} is already registered"));
        }
        let salt = generate_salt_hex();
        profile.password_hash = Some(derive_password_hash(password, &salt));
        profile.salt = Some(salt);
        profile.registered = true;
        profile.registration_date = Some(Utc::now().to_rfc3339());
        self.save();
        Ok(format!("Nickname {nickname} registered"))
    }

    pub fn is_registered(&self, nickname: &str) -> bool {
        self.profiles
            .get(nickname)
            .map(|p| p.registered)
            .unwrap_or(false)
    }

    pub fn verify_password(&self, nickname: &str, password: &str) -> bool {
        let Some(profile) = self.profiles.get(nickname) else {
            return false;
        };
        match (&profile.password_hash, &profile.salt) {
            (Some(hash), Some(salt)) => derive_password_hash(password, salt) == *hash,
            _ => false,
        }
    }

    pub fn update_profile(
        &mut self,
        nickname: &str,
        bio: Option<String>,
        status_message: Option<String>,
        avatar: Option<String>,
    ) -> Result<String, String> {
        let profile = self.profiles.entry(nickname.to_string()).or_default();
        if let Some(bio) = bio {
            profile.bio = Some(bio);
        }
        if let Some(status_message) = status_message {
            profile.status_message = Some(status_message);
        }
        if let Some(avatar) = avatar {
            profile.avatar = Some(avatar);
        }
        self.save();
        Ok("Profile updated".to_string())
    }

    pub fn get(&self, nickname: &str) -> Option<&Profile> {
        self.profiles.get(nickname)
    }

    pub fn update_last_seen(&mut self, nickname: &str) {
        if let Some(profile) = self.profiles.get_mut(nickname) {
            profile.last_seen = Some(Utc::now().to_rfc3339());
            self.save();
        }
    }

    fn save(&self) {
        if let Err(e) = write_json_atomic(&self.path, &self.profiles) {
            warn!(error = %e, "failed to save user profiles");
        }
    }
}
