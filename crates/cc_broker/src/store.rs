//! Durable channel records.
//!
//! One JSON file (`channels.json`) maps channel name → record. Records
//! outlive broker restarts and member disconnects; live membership is
//! rebuilt in [`crate::state`] as sessions join.
//!
//! Legacy formats are accepted on load and normalized on the next write:
//! role credentials stored as a bare hash string become
//! `{password, role: "operator"}`, and ban lists stored as plain user-id
//! arrays become records with a legacy reason and no expiry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use cc_proto::unix_now;

use crate::persist::{load_json, write_json_atomic};

/// SHA-256 hex digest, the storage format for channel and role passwords.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Fresh 32-byte channel AEAD key, base64. The broker stores and
/// redistributes it; it never encrypts with it.
pub fn generate_channel_key() -> String {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    B64.encode(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Operator,
    Mod,
}

/// A stored `(password_hash, role)` pair proving continued privilege for a
/// returning user.
#[derive(Debug, Clone, Serialize)]
pub struct RoleCredential {
    pub password: String,
    pub role: Role,
}

impl<'de> Deserialize<'de> for RoleCredential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            // Legacy: bare hash string, operator implied.
            Legacy(String),
            Full {
                password: String,
                #[serde(default)]
                role: Role,
            },
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Legacy(password) => RoleCredential {
                password,
                role: Role::Operator,
            },
            Repr::Full { password, role } => RoleCredential { password, role },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub banned_by: String,
    #[serde(default)]
    pub banned_by_nickname: String,
    pub reason: String,
    pub timestamp: f64,
    pub expires_at: Option<f64>,
}

impl BanRecord {
    pub fn is_expired(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(expiry) if now >= expiry)
    }
}

fn deserialize_ban_list<'de, D>(deserializer: D) -> Result<HashMap<String, BanRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Records(HashMap<String, BanRecord>),
        // Legacy: bare list of banned user ids.
        Legacy(Vec<String>),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::Records(map) => map,
        Repr::Legacy(ids) => ids
            .into_iter()
            .map(|uid| {
                (
                    uid,
                    BanRecord {
                        banned_by: "SYSTEM".to_string(),
                        banned_by_nickname: "SYSTEM".to_string(),
                        reason: "Legacy ban".to_string(),
                        timestamp: unix_now(),
                        expires_at: None,
                    },
                )
            })
            .collect(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_password_hash: Option<String>,
    /// Absent only on legacy records; owner recovery is disabled for those.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_password_hash: Option<String>,
    #[serde(default)]
    pub operator_passwords: HashMap<String, RoleCredential>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "deserialize_ban_list")]
    pub banned: HashMap<String, BanRecord>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub modes: BTreeSet<char>,
    #[serde(default)]
    pub channel_key: String,
}

impl ChannelRecord {
    /// Record for a freshly created channel.
    pub fn create(owner: &str, creator_password: &str, join_password: Option<&str>) -> Self {
        Self {
            join_password_hash: join_password.map(hash_password),
            creator_password_hash: Some(hash_password(creator_password)),
            operator_passwords: HashMap::new(),
            owner: Some(owner.to_string()),
            banned: HashMap::new(),
            topic: String::new(),
            modes: BTreeSet::new(),
            channel_key: generate_channel_key(),
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner.as_deref() == Some(user_id)
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(&mode)
    }
}

/// The full durable channel map plus its file location.
pub struct ChannelStore {
    path: PathBuf,
    pub records: BTreeMap<String, ChannelRecord>,
}

impl ChannelStore {
    pub fn load(path: PathBuf) -> Self {
        let records: BTreeMap<String, ChannelRecord> =
            load_json(&path).unwrap_or_default();
        if !records.is_empty() {
            info!(channels = records.len(), "loaded persistent channels");
        }
        Self { path, records }
    }

    /// Serializable snapshot for an out-of-lock disk write.
    pub fn snapshot(&self) -> BTreeMap<String, ChannelRecord> {
        self.records.clone()
    }

    pub fn save_snapshot(
        path: &Path,
        snapshot: &BTreeMap<String, ChannelRecord>,
    ) -> std::io::Result<()> {
        write_json_atomic(path, snapshot)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_sha256_hex() {
        let h = hash_password("opensesame");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_password("opensesame"));
        assert_ne!(h, hash_password("opensesame2"));
    }

    #[test]
    fn channel_keys_are_32_bytes() {
        let key = generate_channel_key();
        assert_eq!(B64.decode(key).unwrap().len(), 32);
    }

    #[test]
    fn legacy_role_credential_migrates_to_operator() {
        let json = r#"{
            "creator_password_hash": "aa",
            "operator_passwords": {
                "user_old": "deadbeef",
                "user_new": {"password": "cafe", "role": "mod"}
            },
            "owner": "user_old",
            "channel_key": "k"
        }"#;
        let record: ChannelRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.operator_passwords["user_old"].role, Role::Operator);
        assert_eq!(record.operator_passwords["user_old"].password, "deadbeef");
        assert_eq!(record.operator_passwords["user_new"].role, Role::Mod);
    }

    #[test]
    fn legacy_ban_list_migrates_to_records() {
        let json = r#"{
            "creator_password_hash": "aa",
            "banned": ["user_eve", "user_mallory"],
            "channel_key": "k"
        }"#;
        let record: ChannelRecord = serde_json::from_str(json).unwrap();
        let ban = &record.banned["user_eve"];
        assert_eq!(ban.reason, "Legacy ban");
        assert!(ban.expires_at.is_none());
        assert!(!ban.is_expired(unix_now()));
    }

    #[test]
    fn legacy_record_without_creator_password_loads() {
        let json = r#"{"owner": "user_x", "channel_key": "k"}"#;
        let record: ChannelRecord = serde_json::from_str(json).unwrap();
        assert!(record.creator_password_hash.is_none());
    }

    #[test]
    fn normalized_on_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(
            &path,
            r##"{"#dev": {
                "creator_password_hash": "aa",
                "operator_passwords": {"user_a": "hash1"},
                "banned": ["user_b"],
                "channel_key": "k"
            }}"##,
        )
        .unwrap();

        let store = ChannelStore::load(path.clone());
        ChannelStore::save_snapshot(&path, &store.snapshot()).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let creds = &value["#dev"]["operator_passwords"]["user_a"];
        // Bare-hash credential rewritten in the normalized shape.
        assert_eq!(creds["password"], "hash1");
        assert_eq!(creds["role"], "operator");
        assert!(value["#dev"]["banned"]["user_b"].is_object());
    }

    #[test]
    fn ban_expiry() {
        let ban = BanRecord {
            banned_by: "user_op".into(),
            banned_by_nickname: "op".into(),
            reason: "spam".into(),
            timestamp: 100.0,
            expires_at: Some(200.0),
        };
        assert!(!ban.is_expired(150.0));
        assert!(ban.is_expired(200.0));
        assert!(ban.is_expired(250.0));
    }
}
