//! Events surfaced to the host application.
//!
//! The GUI, notifier, and history collaborators consume these; the
//! endpoint core never renders anything itself.

use cc_proto::envelope::{ChannelMember, ChannelSummary, UserEntry};
use cc_proto::{PromptAction, UserStatus};

use crate::transfer::FileMetadata;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Registration acknowledged; the broker assigned our user id.
    Registered {
        user_id: String,
        message: String,
        description: String,
    },
    Ack {
        message: String,
    },
    BrokerError {
        error: String,
        retry_after_seconds: Option<f64>,
    },
    AuthResult {
        success: bool,
        session_token: Option<String>,
        message: String,
    },
    UserList {
        users: Vec<UserEntry>,
    },
    PrivateMessage {
        from_id: String,
        from_nickname: String,
        text: String,
    },
    ChannelMessage {
        channel: String,
        from_id: String,
        from_nickname: String,
        text: String,
    },
    /// Broker-originated plaintext announcement (`sender: "SERVER"`).
    Announcement {
        channel: String,
        text: String,
    },
    ChannelJoined {
        channel: String,
        members: Vec<ChannelMember>,
        is_operator: bool,
        is_owner: bool,
        topic: String,
    },
    MemberJoined {
        channel: String,
        user_id: String,
        nickname: String,
        is_operator: bool,
        is_mod: bool,
        is_owner: bool,
    },
    MemberLeft {
        channel: String,
        user_id: String,
        nickname: String,
    },
    /// The broker wants a role password before completing a join or grant.
    OpPasswordRequested {
        channel: String,
        action: PromptAction,
        granted_by: Option<String>,
        is_mod: bool,
    },
    RoleChanged {
        channel: String,
        user_id: String,
        nickname: String,
        role: String,
        granted: bool,
        by: String,
    },
    KeysRotated {
        peer_id: String,
        peer_nickname: String,
    },
    StatusUpdate {
        user_id: String,
        nickname: String,
        status: UserStatus,
        status_message: String,
    },
    TopicChanged {
        channel: String,
        topic: String,
        set_by: Option<String>,
    },
    ModeChanged {
        channel: String,
        mode: String,
        enable: bool,
        set_by: String,
    },
    Kicked {
        channel: String,
        kicked_by: String,
        reason: String,
    },
    Banned {
        channel: String,
        banned_by: String,
        reason: String,
    },
    Unbanned {
        channel: String,
        unbanned_by: String,
    },
    Invited {
        channel: String,
        inviter_nickname: String,
    },
    WhoisResult {
        nickname: String,
        user_id: String,
        channels: Vec<String>,
        online: bool,
    },
    ChannelList {
        channels: Vec<ChannelSummary>,
    },
    ProfileResult {
        nickname: String,
        bio: Option<String>,
        status_message: Option<String>,
        avatar: Option<String>,
        registered: bool,
    },
    /// An inbound file transfer awaits an accept/decline decision.
    TransferOffered {
        transfer_id: String,
        from_id: String,
        from_nickname: String,
        metadata: FileMetadata,
    },
    TransferProgress {
        transfer_id: String,
        received: u32,
        total: u32,
    },
    TransferComplete {
        transfer_id: String,
        data: Vec<u8>,
        metadata: FileMetadata,
    },
    TransferFailed {
        transfer_id: String,
        reason: String,
    },
    /// AEAD verification failed; the message was discarded locally.
    DecryptionFailed {
        from: String,
    },
    PeerDisconnected {
        user_id: String,
        nickname: String,
    },
}
