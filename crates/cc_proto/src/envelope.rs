//! Typed wire envelopes.
//!
//! A [`Frame`] is the outer object every peer sends: protocol version,
//! sender wall-clock timestamp, and an internally tagged [`Payload`]. Several
//! tags are used in both directions with different key sets (a `join_channel`
//! request carries passwords, the fan-out carries the joiner's identity), so
//! direction-dependent keys are `Option`s that serialize only when present.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::{unix_now, PROTOCOL_VERSION};

/// One member entry in a join `ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMember {
    pub user_id: String,
    pub nickname: String,
    pub public_key: String,
    pub is_operator: bool,
    pub is_mod: bool,
    pub is_owner: bool,
}

/// One entry in a `user_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub user_id: String,
    pub nickname: String,
    pub public_key: String,
    pub status: UserStatus,
    pub status_message: String,
}

/// One entry in a `channel_list_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub name: String,
    pub users: usize,
    pub protected: bool,
    pub topic: String,
}

/// User presence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Online,
    Away,
    Busy,
    Dnd,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Busy => "busy",
            UserStatus::Dnd => "dnd",
        }
    }
}

/// Whether an `op_password_request` asks the client to set a new password
/// or verify a stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptAction {
    Set,
    Verify,
}

fn default_true() -> bool {
    true
}

/// The tagged payload of a frame. Tag values are the wire `type` strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    // ── Connection management ────────────────────────────────────────────
    Register {
        nickname: String,
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    /// Empty on request; the broadcast form carries the departing identity.
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },

    // ── Accounts (optional, config-gated) ────────────────────────────────
    AuthRequest {
        username: String,
        password: String,
    },
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        message: String,
    },
    CreateAccount {
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    ChangePassword {
        old_password: String,
        new_password: String,
    },

    // ── Broker responses ─────────────────────────────────────────────────
    Ack {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        members: Option<Vec<ChannelMember>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_protected: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_operator: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_owner: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_key: Option<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_seconds: Option<f64>,
    },
    UserList {
        users: Vec<UserEntry>,
    },

    // ── Key distribution ─────────────────────────────────────────────────
    PublicKeyRequest {
        target_nickname: String,
    },
    PublicKeyResponse {
        user_id: String,
        nickname: String,
        public_key: String,
    },
    RekeyRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_id: Option<String>,
        new_public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_nickname: Option<String>,
    },
    RekeyResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_id: Option<String>,
        new_public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_nickname: Option<String>,
    },

    // ── Encrypted traffic (broker routes, never reads) ───────────────────
    PrivateMessage {
        from_id: String,
        to_id: String,
        encrypted_data: String,
        nonce: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_nickname: Option<String>,
    },
    /// Either an encrypted member message (`from_id`/`to_id`/ciphertext) or
    /// a broker announcement (`channel`/`sender:"SERVER"`/plaintext `text`).
    ChannelMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    // ── Channel membership ───────────────────────────────────────────────
    JoinChannel {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        creator_password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_operator: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_mod: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_owner: Option<bool>,
    },
    LeaveChannel {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },

    // ── Roles ────────────────────────────────────────────────────────────
    OpUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        granted_by: Option<String>,
    },
    UnopUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        removed_by: Option<String>,
    },
    ModUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        granted_by: Option<String>,
    },
    UnmodUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        removed_by: Option<String>,
    },
    OpPasswordRequest {
        channel: String,
        action: PromptAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        granted_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_mod: Option<bool>,
    },
    OpPasswordResponse {
        channel: String,
        password: String,
    },

    // ── Discipline ───────────────────────────────────────────────────────
    KickUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kicked_by: Option<String>,
    },
    BanUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Seconds; absent means permanent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        banned_by: Option<String>,
    },
    UnbanUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unbanned_by: Option<String>,
    },
    KickbanUser {
        channel: String,
        target_nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    InviteUser {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inviter_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inviter_id: Option<String>,
    },
    InviteResponse {
        channel: String,
        inviter_nickname: String,
        accepted: bool,
    },
    TransferOwnership {
        channel: String,
        target_nickname: String,
    },

    // ── Channel settings ─────────────────────────────────────────────────
    SetTopic {
        channel: String,
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        set_by: Option<String>,
    },
    SetMode {
        channel: String,
        mode: String,
        #[serde(default = "default_true")]
        enable: bool,
    },
    ModeChange {
        channel: String,
        mode: String,
        enable: bool,
        set_by: String,
    },

    // ── Presence & information ───────────────────────────────────────────
    SetStatus {
        status: UserStatus,
        #[serde(default)]
        custom_message: String,
    },
    StatusUpdate {
        user_id: String,
        nickname: String,
        status: UserStatus,
        custom_message: String,
    },
    Whois {
        target_nickname: String,
    },
    WhoisResponse {
        nickname: String,
        user_id: String,
        channels: Vec<String>,
        online: bool,
    },
    ListChannels,
    ChannelListResponse {
        channels: Vec<ChannelSummary>,
    },

    // ── Profiles ─────────────────────────────────────────────────────────
    RegisterNickname {
        nickname: String,
        password: String,
    },
    UpdateProfile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bio: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },
    GetProfile {
        target_nickname: String,
    },
    ProfileResponse {
        nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bio: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
        registered: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registration_date: Option<String>,
    },

    // ── File transfer ────────────────────────────────────────────────────
    ImageStart {
        from_id: String,
        to_id: String,
        transfer_id: String,
        total_chunks: u32,
        encrypted_metadata: String,
        nonce: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_nickname: Option<String>,
    },
    ImageChunk {
        from_id: String,
        to_id: String,
        transfer_id: String,
        chunk_index: u32,
        encrypted_data: String,
        nonce: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_nickname: Option<String>,
    },
    ImageEnd {
        from_id: String,
        to_id: String,
        transfer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_nickname: Option<String>,
    },
}

impl Payload {
    /// Wire tag for this payload.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::Register { .. } => "register",
            Payload::Disconnect { .. } => "disconnect",
            Payload::AuthRequest { .. } => "auth_request",
            Payload::AuthResponse { .. } => "auth_response",
            Payload::CreateAccount { .. } => "create_account",
            Payload::ChangePassword { .. } => "change_password",
            Payload::Ack { .. } => "ack",
            Payload::Error { .. } => "error",
            Payload::UserList { .. } => "user_list",
            Payload::PublicKeyRequest { .. } => "public_key_request",
            Payload::PublicKeyResponse { .. } => "public_key_response",
            Payload::RekeyRequest { .. } => "rekey_request",
            Payload::RekeyResponse { .. } => "rekey_response",
            Payload::PrivateMessage { .. } => "private_message",
            Payload::ChannelMessage { .. } => "channel_message",
            Payload::JoinChannel { .. } => "join_channel",
            Payload::LeaveChannel { .. } => "leave_channel",
            Payload::OpUser { .. } => "op_user",
            Payload::UnopUser { .. } => "unop_user",
            Payload::ModUser { .. } => "mod_user",
            Payload::UnmodUser { .. } => "unmod_user",
            Payload::OpPasswordRequest { .. } => "op_password_request",
            Payload::OpPasswordResponse { .. } => "op_password_response",
            Payload::KickUser { .. } => "kick_user",
            Payload::BanUser { .. } => "ban_user",
            Payload::UnbanUser { .. } => "unban_user",
            Payload::KickbanUser { .. } => "kickban_user",
            Payload::InviteUser { .. } => "invite_user",
            Payload::InviteResponse { .. } => "invite_response",
            Payload::TransferOwnership { .. } => "transfer_ownership",
            Payload::SetTopic { .. } => "set_topic",
            Payload::SetMode { .. } => "set_mode",
            Payload::ModeChange { .. } => "mode_change",
            Payload::SetStatus { .. } => "set_status",
            Payload::StatusUpdate { .. } => "status_update",
            Payload::Whois { .. } => "whois",
            Payload::WhoisResponse { .. } => "whois_response",
            Payload::ListChannels => "list_channels",
            Payload::ChannelListResponse { .. } => "channel_list_response",
            Payload::RegisterNickname { .. } => "register_nickname",
            Payload::UpdateProfile { .. } => "update_profile",
            Payload::GetProfile { .. } => "get_profile",
            Payload::ProfileResponse { .. } => "profile_response",
            Payload::ImageStart { .. } => "image_start",
            Payload::ImageChunk { .. } => "image_chunk",
            Payload::ImageEnd { .. } => "image_end",
        }
    }

    /// Whether `tag` names a recognized payload type.
    pub fn is_known_tag(tag: &str) -> bool {
        KNOWN_TAGS.contains(&tag)
    }
}

const KNOWN_TAGS: &[&str] = &[
    "register",
    "disconnect",
    "auth_request",
    "auth_response",
    "create_account",
    "change_password",
    "ack",
    "error",
    "user_list",
    "public_key_request",
    "public_key_response",
    "rekey_request",
    "rekey_response",
    "private_message",
    "channel_message",
    "join_channel",
    "leave_channel",
    "op_user",
    "unop_user",
    "mod_user",
    "unmod_user",
    "op_password_request",
    "op_password_response",
    "kick_user",
    "ban_user",
    "unban_user",
    "kickban_user",
    "invite_user",
    "invite_response",
    "transfer_ownership",
    "set_topic",
    "set_mode",
    "mode_change",
    "set_status",
    "status_update",
    "whois",
    "whois_response",
    "list_channels",
    "channel_list_response",
    "register_nickname",
    "update_profile",
    "get_profile",
    "profile_response",
    "image_start",
    "image_chunk",
    "image_end",
];

/// The outer wire object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub version: String,
    pub timestamp: f64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Frame {
    /// Wrap a payload with the current version and timestamp.
    pub fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            timestamp: unix_now(),
            payload,
        }
    }

    /// Serialize to a single-line JSON string (no trailing newline).
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one frame from a line. Distinguishes malformed JSON, a missing
    /// `type` key, and unknown tags so the broker can answer each correctly.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| ProtoError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtoError::MissingType)?
            .to_string();
        if !Payload::is_known_tag(&tag) {
            return Err(ProtoError::UnknownType(tag));
        }
        serde_json::from_value(value).map_err(|e| ProtoError::InvalidFrame {
            tag,
            detail: e.to_string(),
        })
    }

    /// Convenience constructors for the two broker staples.
    pub fn ack(message: impl Into<String>) -> Self {
        Frame::new(Payload::Ack {
            success: true,
            message: Some(message.into()),
            user_id: None,
            description: None,
            session_token: None,
            channel: None,
            members: None,
            is_protected: None,
            is_operator: None,
            is_owner: None,
            topic: None,
            channel_key: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::new(Payload::Error {
            error: message.into(),
            retry_after_seconds: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_request_roundtrip() {
        let frame = Frame::new(Payload::JoinChannel {
            channel: "#dev".into(),
            password: None,
            creator_password: Some("opensesame".into()),
            user_id: None,
            nickname: None,
            public_key: None,
            is_operator: None,
            is_mod: None,
            is_owner: None,
        });
        let line = frame.to_json().unwrap();
        assert!(line.contains("\"type\":\"join_channel\""));
        assert!(!line.contains("password\":null"));
        let parsed = Frame::parse(&line).unwrap();
        match parsed.payload {
            Payload::JoinChannel {
                channel,
                creator_password,
                ..
            } => {
                assert_eq!(channel, "#dev");
                assert_eq!(creator_password.as_deref(), Some("opensesame"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let line = r#"{"version":"1.0","timestamp":1.0,"type":"teleport"}"#;
        match Frame::parse(line) {
            Err(ProtoError::UnknownType(tag)) => assert_eq!(tag, "teleport"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn missing_type_rejected() {
        let line = r#"{"version":"1.0","timestamp":1.0}"#;
        assert!(matches!(Frame::parse(line), Err(ProtoError::MissingType)));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            Frame::parse("{nope"),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn set_mode_enable_defaults_on() {
        let line = r##"{"version":"1.0","timestamp":1.0,"type":"set_mode","channel":"#dev","mode":"m"}"##;
        let parsed = Frame::parse(line).unwrap();
        match parsed.payload {
            Payload::SetMode { enable, .. } => assert!(enable),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn server_announcement_shape() {
        let frame = Frame::new(Payload::ChannelMessage {
            from_id: None,
            to_id: None,
            encrypted_data: None,
            nonce: None,
            from_nickname: None,
            channel: Some("#dev".into()),
            sender: Some("SERVER".into()),
            text: Some("eve was kicked".into()),
        });
        let line = frame.to_json().unwrap();
        assert!(line.contains("\"sender\":\"SERVER\""));
        assert!(!line.contains("encrypted_data"));
    }

    #[test]
    fn tags_match_serialized_type() {
        let frame = Frame::new(Payload::ListChannels);
        let line = frame.to_json().unwrap();
        assert!(line.contains("\"type\":\"list_channels\""));
        assert!(Payload::is_known_tag(frame.payload.tag()));
    }

    #[test]
    fn status_parses_lowercase() {
        let line = r#"{"version":"1.0","timestamp":1.0,"type":"set_status","status":"dnd","custom_message":"heads down"}"#;
        let parsed = Frame::parse(line).unwrap();
        match parsed.payload {
            Payload::SetStatus { status, .. } => assert_eq!(status, UserStatus::Dnd),
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
