//! Optional account authentication.
//!
//! When enabled in config, clients may create accounts and authenticate to
//! receive a session token; when `require_authentication` is set,
//! registration demands a valid password or token. Failed attempts lock an
//! account for a cooldown window. Stored in `accounts.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::persist::{load_json, write_json_atomic};
use crate::profiles::{derive_password_hash, generate_salt_hex};

const MAX_FAILED_ATTEMPTS: usize = 5;
const LOCKOUT_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub password_hash: String,
    pub salt: String,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub disabled: bool,
}

pub struct AccountStore {
    path: PathBuf,
    pub enable_accounts: bool,
    pub require_authentication: bool,
    accounts: HashMap<String, Account>,
    /// session token → username; tokens live for the broker process.
    sessions: HashMap<String, String>,
    failed_attempts: HashMap<String, Vec<Instant>>,
}

impl AccountStore {
    pub fn load(path: PathBuf, enable_accounts: bool, require_authentication: bool) -> Self {
        let accounts: HashMap<String, Account> = load_json(&path).unwrap_or_default();
        if !accounts.is_empty() {
            info!(accounts = accounts.len(), "loaded account store");
        }
        Self {
            path,
            enable_accounts,
            require_authentication,
            accounts,
            sessions: HashMap::new(),
            failed_attempts: HashMap::new(),
        }
    }

    pub fn account_exists(&self, username: &str) -> bool {
        self.accounts.contains_key(username)
    }

    pub fn is_disabled(&self, username: &str) -> bool {
        self.accounts
            .get(username)
            .map(|a| a.disabled)
            .unwrap_or(false)
    }

    pub fn create_account(
        &mut self,
        username: &str,
        password: &str,
        email: Option<String>,
    ) -> bool {
        if self.accounts.contains_key(username) {
            return false;
        }
        let salt = generate_salt_hex();
        let account = Account {
            password_hash: derive_password_hash(password, &salt),
            salt,
            email,
            created_at: Utc::now().to_rfc3339(),
            disabled: false,
        };
        self.accounts.insert(username.to_string(), account);
        self.save();
        true
    }

    /// Verify credentials; on success mint a session token.
    pub fn authenticate(&mut self, username: &str, password: &str) -> Option<String> {
        if self.is_locked(username) {
            return None;
        }
        let account = self.accounts.get(username)?;
        if account.disabled {
            return None;
        }
        if derive_password_hash(password, &account.salt) != account.password_hash {
            self.record_failed_attempt(username);
            warn!(username, "failed authentication attempt");
            return None;
        }
        self.failed_attempts.remove(username);
        let token = generate_token();
        self.sessions.insert(token.clone(), username.to_string());
        Some(token)
    }

    pub fn verify_session(&self, token: &str) -> Option<&str> {
        self.sessions.get(token).map(String::as_str)
    }

    pub fn logout(&mut self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn is_locked(&self, username: &str) -> bool {
        let Some(attempts) = self.failed_attempts.get(username) else {
            return false;
        };
        let now = Instant::now();
        attempts
            .iter()
            .filter(|t| now.duration_since(**t) < LOCKOUT_WINDOW)
            .count()
            >= MAX_FAILED_ATTEMPTS
    }

    pub fn change_password(&mut self, username: &str, old: &str, new: &str) -> bool {
        let Some(account) = self.accounts.get_mut(username) else {
            return false;
        };
        if derive_password_hash(old, &account.salt) != account.password_hash {
            return false;
        }
        let salt = generate_salt_hex();
        account.password_hash = derive_password_hash(new, &salt);
        account.salt = salt;
        self.save();
        true
    }

    pub fn set_disabled(&mut self, username: &str, disabled: bool) -> bool {
        match self.accounts.get_mut(username) {
            Some(account) => {
                account.disabled = disabled;
                self.save();
                true
            }
            None => false,
        }
    }

    fn record_failed_attempt(&mut self, username: &str) {
        let now = Instant::now();
        let attempts = self.failed_attempts.entry(username.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < LOCKOUT_WINDOW);
        attempts.push(now);
    }

    fn save(&self) {
        if let Err(e) = write_json_atomic(&self.path, &self.accounts) {
            warn!(error = %e, "failed to save account store");
        }
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
