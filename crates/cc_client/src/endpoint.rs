//! Protocol state machine for a client endpoint.
//!
//! [`EndpointCore`] is transport-free: incoming wire lines go through
//! [`EndpointCore::handle_line`], producing [`ClientEvent`]s for the host,
//! and command methods push ready-to-send lines into an outbound buffer.
//! [`crate::session::ClientSession`] attaches it to a TCP stream. Keeping
//! the core synchronous makes every protocol path testable without sockets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use cc_crypto::{ChannelKeyRing, PeerCrypto, RotationPolicy};
use cc_proto::{Frame, Payload, UserStatus};

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::transfer::{FileMetadata, TransferManager};

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub nickname: String,
    pub public_key: String,
}

pub struct EndpointCore {
    nickname: String,
    user_id: Option<String>,
    crypto: PeerCrypto,
    channel_keys: ChannelKeyRing,
    transfers: TransferManager,
    users: HashMap<String, PeerInfo>,
    /// Transfers whose `image_end` arrived before the accept decision.
    ended_transfers: HashSet<String>,
    outbound: VecDeque<String>,
}

impl EndpointCore {
    pub fn new(nickname: impl Into<String>, state_dir: PathBuf) -> Self {
        Self::with_policy(nickname, state_dir, RotationPolicy::default())
    }

    pub fn with_policy(
        nickname: impl Into<String>,
        state_dir: PathBuf,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            user_id: None,
            crypto: PeerCrypto::new(policy),
            channel_keys: ChannelKeyRing::new(),
            transfers: TransferManager::new(state_dir),
            users: HashMap::new(),
            ended_transfers: HashSet::new(),
            outbound: VecDeque::new(),
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn public_key_b64(&self) -> String {
        self.crypto.public_key_b64()
    }

    pub fn peer(&self, user_id: &str) -> Option<&PeerInfo> {
        self.users.get(user_id)
    }

    /// Resolve a nickname to the peer's user id.
    pub fn peer_id_by_nickname(&self, nickname: &str) -> Option<String> {
        self.users
            .iter()
            .find(|(_, info)| info.nickname == nickname)
            .map(|(id, _)| id.clone())
    }

    /// Drain the lines queued for the wire.
    pub fn take_outbound(&mut self) -> Vec<String> {
        self.outbound.drain(..).collect()
    }

    fn push_frame(&mut self, payload: Payload) {
        match Frame::new(payload).to_json() {
            Ok(line) => self.outbound.push_back(line),
            Err(e) => warn!(error = %e, "failed to serialize outbound frame"),
        }
    }

    fn require_user_id(&self) -> Result<String, ClientError> {
        self.user_id.clone().ok_or(ClientError::NotRegistered)
    }

    fn remember_peer(&mut self, user_id: &str, nickname: &str, public_key: &str) {
        if let Err(e) = self.crypto.load_peer_key(user_id, public_key) {
            warn!(peer = %user_id, error = %e, "rejecting bad peer key");
            return;
        }
        self.users.insert(
            user_id.to_string(),
            PeerInfo {
                nickname: nickname.to_string(),
                public_key: public_key.to_string(),
            },
        );
    }

    fn peer_nickname(&self, user_id: &str) -> String {
        self.users
            .get(user_id)
            .map(|p| p.nickname.clone())
            .unwrap_or_else(|| user_id.to_string())
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// The registration frame; sent once right after connecting.
    pub fn register(&mut self) {
        let payload = Payload::Register {
            nickname: self.nickname.clone(),
            public_key: self.public_key_b64(),
            password: None,
            session_token: None,
        };
        self.push_frame(payload);
    }

    pub fn join_channel(
        &mut self,
        channel: &str,
        password: Option<String>,
        creator_password: Option<String>,
    ) {
        self.push_frame(Payload::JoinChannel {
            channel: channel.to_string(),
            password,
            creator_password,
            user_id: None,
            nickname: None,
            public_key: None,
            is_operator: None,
            is_mod: None,
            is_owner: None,
        });
    }

    pub fn leave_channel(&mut self, channel: &str) {
        self.push_frame(Payload::LeaveChannel {
            channel: channel.to_string(),
            user_id: None,
            nickname: None,
        });
    }

    pub fn respond_op_password(&mut self, channel: &str, password: &str) {
        self.push_frame(Payload::OpPasswordResponse {
            channel: channel.to_string(),
            password: password.to_string(),
        });
    }

    /// Encrypt and queue a private message. Rotates the pairwise key first
    /// when it is due.
    pub fn send_private_message(&mut self, to_id: &str, text: &str) -> Result<(), ClientError> {
        let from_id = self.require_user_id()?;
        if self.crypto.rotation_due(to_id).is_some() {
            self.initiate_rekey(to_id)?;
        }
        let (encrypted_data, nonce) = self.crypto.encrypt(to_id, text.as_bytes())?;
        self.push_frame(Payload::PrivateMessage {
            from_id,
            to_id: to_id.to_string(),
            encrypted_data,
            nonce,
            from_nickname: None,
        });
        Ok(())
    }

    pub fn send_channel_message(&mut self, channel: &str, text: &str) -> Result<(), ClientError> {
        let from_id = self.require_user_id()?;
        let (encrypted_data, nonce) = self.channel_keys.encrypt_for(channel, text.as_bytes())?;
        self.push_frame(Payload::ChannelMessage {
            from_id: Some(from_id),
            to_id: Some(channel.to_string()),
            encrypted_data: Some(encrypted_data),
            nonce: Some(nonce),
            from_nickname: None,
            channel: None,
            sender: None,
            text: None,
        });
        Ok(())
    }

    /// Wholesale key rotation: fresh identity keypair, then a
    /// `rekey_request` carrying the new public key to the given peer.
    pub fn initiate_rekey(&mut self, peer_id: &str) -> Result<(), ClientError> {
        let from_id = self.require_user_id()?;
        let new_public_key = self.crypto.rotate()?;
        self.push_frame(Payload::RekeyRequest {
            from_id: Some(from_id),
            to_id: Some(peer_id.to_string()),
            new_public_key,
            from_nickname: None,
        });
        Ok(())
    }

    pub fn request_public_key(&mut self, target_nickname: &str) {
        self.push_frame(Payload::PublicKeyRequest {
            target_nickname: target_nickname.to_string(),
        });
    }

    pub fn login(&mut self, username: &str, password: &str) {
        self.push_frame(Payload::AuthRequest {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    pub fn create_account(&mut self, username: &str, password: &str, email: Option<String>) {
        self.push_frame(Payload::CreateAccount {
            username: username.to_string(),
            password: password.to_string(),
            email,
        });
    }

    pub fn change_password(&mut self, old_password: &str, new_password: &str) {
        self.push_frame(Payload::ChangePassword {
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
        });
    }

    pub fn set_status(&mut self, status: UserStatus, custom_message: &str) {
        self.push_frame(Payload::SetStatus {
            status,
            custom_message: custom_message.to_string(),
        });
    }

    pub fn whois(&mut self, target_nickname: &str) {
        self.push_frame(Payload::Whois {
            target_nickname: target_nickname.to_string(),
        });
    }

    pub fn list_channels(&mut self) {
        self.push_frame(Payload::ListChannels);
    }

    pub fn set_topic(&mut self, channel: &str, topic: &str) {
        self.push_frame(Payload::SetTopic {
            channel: channel.to_string(),
            topic: topic.to_string(),
            set_by: None,
        });
    }

    pub fn set_mode(&mut self, channel: &str, mode: char, enable: bool) {
        self.push_frame(Payload::SetMode {
            channel: channel.to_string(),
            mode: mode.to_string(),
            enable,
        });
    }

    pub fn op_user(&mut self, channel: &str, target_nickname: &str) {
        self.push_frame(Payload::OpUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            user_id: None,
            nickname: None,
            granted_by: None,
        });
    }

    pub fn mod_user(&mut self, channel: &str, target_nickname: &str) {
        self.push_frame(Payload::ModUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            user_id: None,
            nickname: None,
            granted_by: None,
        });
    }

    pub fn unop_user(&mut self, channel: &str, target_nickname: &str) {
        self.push_frame(Payload::UnopUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            user_id: None,
            nickname: None,
            removed_by: None,
        });
    }

    pub fn unmod_user(&mut self, channel: &str, target_nickname: &str) {
        self.push_frame(Payload::UnmodUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            user_id: None,
            nickname: None,
            removed_by: None,
        });
    }

    pub fn kick_user(&mut self, channel: &str, target_nickname: &str, reason: &str) {
        self.push_frame(Payload::KickUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            reason: Some(reason.to_string()),
            kicked_by: None,
        });
    }

    pub fn ban_user(
        &mut self,
        channel: &str,
        target_nickname: &str,
        reason: &str,
        duration: Option<u64>,
    ) {
        self.push_frame(Payload::BanUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            reason: Some(reason.to_string()),
            duration,
            banned_by: None,
        });
    }

    pub fn unban_user(&mut self, channel: &str, target_nickname: &str) {
        self.push_frame(Payload::UnbanUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            unbanned_by: None,
        });
    }

    pub fn invite_user(&mut self, channel: &str, target_nickname: &str) {
        self.push_frame(Payload::InviteUser {
            channel: channel.to_string(),
            target_nickname: Some(target_nickname.to_string()),
            inviter_nickname: None,
            inviter_id: None,
        });
    }

    pub fn respond_invite(&mut self, channel: &str, inviter_nickname: &str, accepted: bool) {
        self.push_frame(Payload::InviteResponse {
            channel: channel.to_string(),
            inviter_nickname: inviter_nickname.to_string(),
            accepted,
        });
    }

    pub fn transfer_ownership(&mut self, channel: &str, target_nickname: &str) {
        self.push_frame(Payload::TransferOwnership {
            channel: channel.to_string(),
            target_nickname: target_nickname.to_string(),
        });
    }

    pub fn register_nickname(&mut self, password: &str) {
        let nickname = self.nickname.clone();
        self.push_frame(Payload::RegisterNickname {
            nickname,
            password: password.to_string(),
        });
    }

    pub fn update_profile(
        &mut self,
        bio: Option<String>,
        status_message: Option<String>,
        avatar: Option<String>,
    ) {
        self.push_frame(Payload::UpdateProfile {
            bio,
            status_message,
            avatar,
        });
    }

    pub fn get_profile(&mut self, target_nickname: &str) {
        self.push_frame(Payload::GetProfile {
            target_nickname: target_nickname.to_string(),
        });
    }

    pub fn disconnect(&mut self) {
        self.push_frame(Payload::Disconnect {
            user_id: None,
            nickname: None,
        });
    }

    // ── File transfer ────────────────────────────────────────────────────

    /// Chunk, encrypt, and queue a whole file for `to_id`. Returns the
    /// transfer id.
    pub fn send_file(&mut self, to_id: &str, path: &Path) -> Result<String, ClientError> {
        let from_id = self.require_user_id()?;
        let (chunks, metadata) = TransferManager::prepare_file(path)?;
        let transfer_id = Uuid::new_v4().to_string();

        let metadata_json =
            serde_json::to_vec(&metadata).map_err(|e| ClientError::Transfer(e.to_string()))?;
        let (encrypted_metadata, metadata_nonce) = self.crypto.encrypt(to_id, &metadata_json)?;

        self.push_frame(Payload::ImageStart {
            from_id: from_id.clone(),
            to_id: to_id.to_string(),
            transfer_id: transfer_id.clone(),
            total_chunks: chunks.len() as u32,
            encrypted_metadata,
            nonce: metadata_nonce,
            from_nickname: None,
        });

        for (index, chunk) in chunks.iter().enumerate() {
            let (encrypted_data, nonce) = self.crypto.encrypt(to_id, chunk)?;
            self.push_frame(Payload::ImageChunk {
                from_id: from_id.clone(),
                to_id: to_id.to_string(),
                transfer_id: transfer_id.clone(),
                chunk_index: index as u32,
                encrypted_data,
                nonce,
                from_nickname: None,
            });
        }

        self.push_frame(Payload::ImageEnd {
            from_id,
            to_id: to_id.to_string(),
            transfer_id: transfer_id.clone(),
            from_nickname: None,
        });
        Ok(transfer_id)
    }

    /// Accept a pending transfer: decrypt the held backlog, and if the
    /// sender already finished, assemble immediately.
    pub fn accept_transfer(&mut self, transfer_id: &str) -> Result<Vec<ClientEvent>, ClientError> {
        let from_id = self
            .transfers
            .get(transfer_id)
            .map(|t| t.from_id.clone())
            .ok_or_else(|| ClientError::Transfer(format!("Unknown transfer {transfer_id}")))?;
        let backlog = self
            .transfers
            .accept(transfer_id)
            .ok_or_else(|| ClientError::Transfer(format!("Unknown transfer {transfer_id}")))?;

        let mut events = Vec::new();
        for (index, data_b64, nonce_b64) in backlog {
            match self.crypto.decrypt(&from_id, &data_b64, &nonce_b64) {
                Ok(plain) => {
                    self.transfers
                        .add_plain_chunk(transfer_id, index, plain.to_vec());
                }
                Err(_) => {
                    events.push(ClientEvent::DecryptionFailed {
                        from: from_id.clone(),
                    });
                }
            }
        }
        if let Some(transfer) = self.transfers.get(transfer_id) {
            events.push(ClientEvent::TransferProgress {
                transfer_id: transfer_id.to_string(),
                received: transfer.received(),
                total: transfer.total_chunks,
            });
        }
        if self.ended_transfers.remove(transfer_id) {
            events.push(self.finish_transfer(transfer_id));
        }
        Ok(events)
    }

    pub fn decline_transfer(&mut self, transfer_id: &str) {
        self.ended_transfers.remove(transfer_id);
        self.transfers.decline(transfer_id);
    }

    fn finish_transfer(&mut self, transfer_id: &str) -> ClientEvent {
        match self.transfers.finish(transfer_id) {
            Ok((data, metadata)) => ClientEvent::TransferComplete {
                transfer_id: transfer_id.to_string(),
                data,
                metadata,
            },
            Err(e) => ClientEvent::TransferFailed {
                transfer_id: transfer_id.to_string(),
                reason: e.to_string(),
            },
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Handle one wire line, producing events for the host.
    pub fn handle_line(&mut self, line: &str) -> Vec<ClientEvent> {
        match Frame::parse(line) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => {
                warn!(error = %e, "unparseable frame from broker");
                Vec::new()
            }
        }
    }

    pub fn handle_frame(&mut self, frame: Frame) -> Vec<ClientEvent> {
        match frame.payload {
            Payload::Ack {
                success,
                message,
                user_id,
                description,
                channel,
                members,
                is_operator,
                is_owner,
                topic,
                channel_key,
                ..
            } => self.handle_ack(
                success,
                message,
                user_id,
                description,
                channel,
                members,
                is_operator,
                is_owner,
                topic,
                channel_key,
            ),
            Payload::Error {
                error,
                retry_after_seconds,
            } => vec![ClientEvent::BrokerError {
                error,
                retry_after_seconds,
            }],
            Payload::AuthResponse {
                success,
                session_token,
                message,
            } => vec![ClientEvent::AuthResult {
                success,
                session_token,
                message,
            }],
            Payload::UserList { users } => {
                for user in &users {
                    if Some(user.user_id.as_str()) != self.user_id.as_deref() {
                        self.remember_peer(&user.user_id, &user.nickname, &user.public_key);
                    }
                }
                vec![ClientEvent::UserList { users }]
            }
            Payload::PublicKeyResponse {
                user_id,
                nickname,
                public_key,
            } => {
                self.remember_peer(&user_id, &nickname, &public_key);
                Vec::new()
            }
            Payload::RekeyRequest {
                from_id,
                from_nickname,
                new_public_key,
                ..
            } => self.handle_rekey_request(from_id, from_nickname, new_public_key),
            Payload::RekeyResponse {
                from_id,
                from_nickname,
                new_public_key,
                ..
            } => {
                let Some(from_id) = from_id else {
                    return Vec::new();
                };
                if let Err(e) = self.crypto.load_peer_key(&from_id, &new_public_key) {
                    warn!(peer = %from_id, error = %e, "bad rekey response key");
                    return Vec::new();
                }
                if let Some(info) = self.users.get_mut(&from_id) {
                    info.public_key = new_public_key;
                }
                vec![ClientEvent::KeysRotated {
                    peer_nickname: from_nickname.unwrap_or_else(|| self.peer_nickname(&from_id)),
                    peer_id: from_id,
                }]
            }
            Payload::PrivateMessage {
                from_id,
                from_nickname,
                encrypted_data,
                nonce,
                ..
            } => match self.crypto.decrypt(&from_id, &encrypted_data, &nonce) {
                Ok(plain) => vec![ClientEvent::PrivateMessage {
                    from_nickname: from_nickname.unwrap_or_else(|| self.peer_nickname(&from_id)),
                    from_id,
                    text: String::from_utf8_lossy(&plain).into_owned(),
                }],
                Err(_) => vec![ClientEvent::DecryptionFailed { from: from_id }],
            },
            Payload::ChannelMessage {
                from_id,
                to_id,
                encrypted_data,
                nonce,
                from_nickname,
                channel,
                sender,
                text,
            } => {
                if sender.as_deref() == Some("SERVER") {
                    return vec![ClientEvent::Announcement {
                        channel: channel.unwrap_or_default(),
                        text: text.unwrap_or_default(),
                    }];
                }
                let (Some(channel), Some(from_id), Some(encrypted_data), Some(nonce)) =
                    (to_id, from_id, encrypted_data, nonce)
                else {
                    return Vec::new();
                };
                match self
                    .channel_keys
                    .decrypt_from(&channel, &encrypted_data, &nonce)
                {
                    Ok(plain) => vec![ClientEvent::ChannelMessage {
                        channel,
                        from_nickname: from_nickname
                            .unwrap_or_else(|| self.peer_nickname(&from_id)),
                        from_id,
                        text: String::from_utf8_lossy(&plain).into_owned(),
                    }],
                    Err(_) => vec![ClientEvent::DecryptionFailed { from: from_id }],
                }
            }
            Payload::JoinChannel {
                channel,
                user_id,
                nickname,
                public_key,
                is_operator,
                is_mod,
                is_owner,
                ..
            } => {
                let (Some(user_id), Some(nickname)) = (user_id, nickname) else {
                    return Vec::new();
                };
                if let Some(public_key) = &public_key {
                    self.remember_peer(&user_id, &nickname, public_key);
                }
                vec![ClientEvent::MemberJoined {
                    channel,
                    user_id,
                    nickname,
                    is_operator: is_operator.unwrap_or(false),
                    is_mod: is_mod.unwrap_or(false),
                    is_owner: is_owner.unwrap_or(false),
                }]
            }
            Payload::LeaveChannel {
                channel,
                user_id,
                nickname,
            } => {
                let (Some(user_id), Some(nickname)) = (user_id, nickname) else {
                    return Vec::new();
                };
                vec![ClientEvent::MemberLeft {
                    channel,
                    user_id,
                    nickname,
                }]
            }
            Payload::OpPasswordRequest {
                channel,
                action,
                granted_by,
                is_mod,
            } => vec![ClientEvent::OpPasswordRequested {
                channel,
                action,
                granted_by,
                is_mod: is_mod.unwrap_or(false),
            }],
            Payload::OpUser {
                channel,
                user_id,
                nickname,
                granted_by,
                ..
            } => role_event(channel, user_id, nickname, "operator", true, granted_by),
            Payload::ModUser {
                channel,
                user_id,
                nickname,
                granted_by,
                ..
            } => role_event(channel, user_id, nickname, "mod", true, granted_by),
            Payload::UnopUser {
                channel,
                user_id,
                nickname,
                removed_by,
                ..
            } => role_event(channel, user_id, nickname, "operator", false, removed_by),
            Payload::UnmodUser {
                channel,
                user_id,
                nickname,
                removed_by,
                ..
            } => role_event(channel, user_id, nickname, "mod", false, removed_by),
            Payload::KickUser {
                channel,
                kicked_by,
                reason,
                ..
            } => vec![ClientEvent::Kicked {
                channel,
                kicked_by: kicked_by.unwrap_or_default(),
                reason: reason.unwrap_or_default(),
            }],
            Payload::BanUser {
                channel,
                banned_by,
                reason,
                ..
            } => vec![ClientEvent::Banned {
                channel,
                banned_by: banned_by.unwrap_or_default(),
                reason: reason.unwrap_or_default(),
            }],
            Payload::UnbanUser {
                channel, unbanned_by, ..
            } => vec![ClientEvent::Unbanned {
                channel,
                unbanned_by: unbanned_by.unwrap_or_default(),
            }],
            Payload::InviteUser {
                channel,
                inviter_nickname,
                ..
            } => vec![ClientEvent::Invited {
                channel,
                inviter_nickname: inviter_nickname.unwrap_or_default(),
            }],
            Payload::SetTopic {
                channel,
                topic,
                set_by,
            } => vec![ClientEvent::TopicChanged {
                channel,
                topic,
                set_by,
            }],
            Payload::ModeChange {
                channel,
                mode,
                enable,
                set_by,
            } => vec![ClientEvent::ModeChanged {
                channel,
                mode,
                enable,
                set_by,
            }],
            Payload::StatusUpdate {
                user_id,
                nickname,
                status,
                custom_message,
            } => vec![ClientEvent::StatusUpdate {
                user_id,
                nickname,
                status,
                status_message: custom_message,
            }],
            Payload::WhoisResponse {
                nickname,
                user_id,
                channels,
                online,
            } => vec![ClientEvent::WhoisResult {
                nickname,
                user_id,
                channels,
                online,
            }],
            Payload::ChannelListResponse { channels } => {
                vec![ClientEvent::ChannelList { channels }]
            }
            Payload::ProfileResponse {
                nickname,
                bio,
                status_message,
                avatar,
                registered,
                ..
            } => vec![ClientEvent::ProfileResult {
                nickname,
                bio,
                status_message,
                avatar,
                registered,
            }],
            Payload::ImageStart {
                from_id,
                from_nickname,
                transfer_id,
                total_chunks,
                encrypted_metadata,
                nonce,
                ..
            } => self.handle_image_start(
                from_id,
                from_nickname,
                transfer_id,
                total_chunks,
                encrypted_metadata,
                nonce,
            ),
            Payload::ImageChunk {
                from_id,
                transfer_id,
                chunk_index,
                encrypted_data,
                nonce,
                ..
            } => self.handle_image_chunk(from_id, transfer_id, chunk_index, encrypted_data, nonce),
            Payload::ImageEnd { transfer_id, .. } => match self.transfers.decision(&transfer_id) {
                Some(true) => vec![self.finish_transfer(&transfer_id)],
                Some(false) => Vec::new(),
                None => {
                    if self.transfers.get(&transfer_id).is_some() {
                        self.ended_transfers.insert(transfer_id);
                    }
                    Vec::new()
                }
            },
            Payload::Disconnect { user_id, nickname } => {
                let (Some(user_id), Some(nickname)) = (user_id, nickname) else {
                    return Vec::new();
                };
                self.crypto.remove_peer(&user_id);
                self.users.remove(&user_id);
                vec![ClientEvent::PeerDisconnected { user_id, nickname }]
            }
            other => {
                debug!(tag = other.tag(), "ignoring frame");
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ack(
        &mut self,
        success: bool,
        message: Option<String>,
        user_id: Option<String>,
        description: Option<String>,
        channel: Option<String>,
        members: Option<Vec<cc_proto::envelope::ChannelMember>>,
        is_operator: Option<bool>,
        is_owner: Option<bool>,
        topic: Option<String>,
        channel_key: Option<String>,
    ) -> Vec<ClientEvent> {
        if !success {
            return vec![ClientEvent::BrokerError {
                error: message.unwrap_or_default(),
                retry_after_seconds: None,
            }];
        }
        // First successful ack with a user id completes registration.
        if self.user_id.is_none() {
            if let Some(user_id) = user_id {
                self.user_id = Some(user_id.clone());
                return vec![ClientEvent::Registered {
                    user_id,
                    message: message.unwrap_or_default(),
                    description: description.unwrap_or_default(),
                }];
            }
        }
        // A join ack carries the member list and the channel key.
        if let (Some(channel), Some(members)) = (channel, members) {
            if let Some(key) = &channel_key {
                if !key.is_empty() {
                    if let Err(e) = self.channel_keys.load_key(&channel, key) {
                        warn!(%channel, error = %e, "bad channel key in join ack");
                    }
                }
            }
            for member in &members {
                if Some(member.user_id.as_str()) != self.user_id.as_deref() {
                    self.remember_peer(&member.user_id, &member.nickname, &member.public_key);
                }
            }
            return vec![ClientEvent::ChannelJoined {
                channel,
                members,
                is_operator: is_operator.unwrap_or(false),
                is_owner: is_owner.unwrap_or(false),
                topic: topic.unwrap_or_default(),
            }];
        }
        vec![ClientEvent::Ack {
            message: message.unwrap_or_default(),
        }]
    }

    fn handle_rekey_request(
        &mut self,
        from_id: Option<String>,
        from_nickname: Option<String>,
        new_public_key: String,
    ) -> Vec<ClientEvent> {
        let Some(from_id) = from_id else {
            return Vec::new();
        };
        if let Err(e) = self.crypto.load_peer_key(&from_id, &new_public_key) {
            warn!(peer = %from_id, error = %e, "bad rekey request key");
            return Vec::new();
        }
        if let Some(info) = self.users.get_mut(&from_id) {
            info.public_key = new_public_key;
        }

        // Rotate our side too and answer with the fresh public key.
        let response_key = match self.crypto.rotate() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "rotation failed");
                return Vec::new();
            }
        };
        let our_id = self.user_id.clone().unwrap_or_default();
        self.push_frame(Payload::RekeyResponse {
            from_id: Some(our_id),
            to_id: Some(from_id.clone()),
            new_public_key: response_key,
            from_nickname: None,
        });
        vec![ClientEvent::KeysRotated {
            peer_nickname: from_nickname.unwrap_or_else(|| self.peer_nickname(&from_id)),
            peer_id: from_id,
        }]
    }

    fn handle_image_start(
        &mut self,
        from_id: String,
        from_nickname: Option<String>,
        transfer_id: String,
        total_chunks: u32,
        encrypted_metadata: String,
        nonce: String,
    ) -> Vec<ClientEvent> {
        let metadata = match self.crypto.decrypt(&from_id, &encrypted_metadata, &nonce) {
            Ok(plain) => match serde_json::from_slice::<FileMetadata>(&plain) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(transfer = %transfer_id, error = %e, "bad transfer metadata");
                    return Vec::new();
                }
            },
            Err(_) => return vec![ClientEvent::DecryptionFailed { from: from_id }],
        };
        let from_nickname = from_nickname.unwrap_or_else(|| self.peer_nickname(&from_id));
        self.transfers.begin_incoming(
            &transfer_id,
            &from_id,
            &from_nickname,
            total_chunks,
            metadata.clone(),
        );
        vec![ClientEvent::TransferOffered {
            transfer_id,
            from_id,
            from_nickname,
            metadata,
        }]
    }

    fn handle_image_chunk(
        &mut self,
        from_id: String,
        transfer_id: String,
        chunk_index: u32,
        encrypted_data: String,
        nonce: String,
    ) -> Vec<ClientEvent> {
        match self.transfers.decision(&transfer_id) {
            // Undecided: hold the ciphertext until the host chooses.
            None => {
                self.transfers
                    .queue_encrypted_chunk(&transfer_id, chunk_index, encrypted_data, nonce);
                Vec::new()
            }
            Some(false) => Vec::new(),
            Some(true) => match self.crypto.decrypt(&from_id, &encrypted_data, &nonce) {
                Ok(plain) => {
                    self.transfers
                        .add_plain_chunk(&transfer_id, chunk_index, plain.to_vec());
                    let Some(transfer) = self.transfers.get(&transfer_id) else {
                        return Vec::new();
                    };
                    vec![ClientEvent::TransferProgress {
                        transfer_id,
                        received: transfer.received(),
                        total: transfer.total_chunks,
                    }]
                }
                Err(_) => vec![ClientEvent::DecryptionFailed { from: from_id }],
            },
        }
    }
}

fn role_event(
    channel: String,
    user_id: Option<String>,
    nickname: Option<String>,
    role: &str,
    granted: bool,
    by: Option<String>,
) -> Vec<ClientEvent> {
    let (Some(user_id), Some(nickname)) = (user_id, nickname) else {
        return Vec::new();
    };
    vec![ClientEvent::RoleChanged {
        channel,
        user_id,
        nickname,
        role: role.to_string(),
        granted,
        by: by.unwrap_or_default(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_crypto::aead::generate_key;
    use base64::{engine::general_purpose::STANDARD as B64, Engine};

    /// Re-serialize a client line the way the broker forwards it: parsed,
    /// `from_nickname` stamped, re-encoded.
    fn forward(line: &str, from_nickname: &str) -> String {
        let mut frame = Frame::parse(line).unwrap();
        match &mut frame.payload {
            Payload::PrivateMessage { from_nickname: f, .. }
            | Payload::ChannelMessage { from_nickname: f, .. } => {
                *f = Some(from_nickname.to_string());
            }
            Payload::RekeyRequest { from_nickname: f, to_id, .. }
            | Payload::RekeyResponse { from_nickname: f, to_id, .. } => {
                *f = Some(from_nickname.to_string());
                *to_id = None;
            }
            _ => {}
        }
        frame.to_json().unwrap()
    }

    fn registered_pair(dir: &tempfile::TempDir) -> (EndpointCore, EndpointCore) {
        let mut alice = EndpointCore::new("alice", dir.path().join("a"));
        let mut bob = EndpointCore::new("bob", dir.path().join("b"));
        register(&mut alice, "user_alice");
        register(&mut bob, "user_bob");
        let a_pub = alice.public_key_b64();
        let b_pub = bob.public_key_b64();
        alice.handle_frame(Frame::new(Payload::PublicKeyResponse {
            user_id: "user_bob".into(),
            nickname: "bob".into(),
            public_key: b_pub,
        }));
        bob.handle_frame(Frame::new(Payload::PublicKeyResponse {
            user_id: "user_alice".into(),
            nickname: "alice".into(),
            public_key: a_pub,
        }));
        (alice, bob)
    }

    fn register(endpoint: &mut EndpointCore, user_id: &str) {
        endpoint.register();
        endpoint.take_outbound();
        let events = endpoint.handle_frame(registration_ack(user_id));
        assert!(matches!(events[0], ClientEvent::Registered { .. }));
    }

    fn registration_ack(user_id: &str) -> Frame {
        Frame::new(Payload::Ack {
            success: true,
            message: Some("Welcome!".to_string()),
            user_id: Some(user_id.to_string()),
            description: Some("test broker".into()),
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

    #[test]
    fn private_message_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, mut bob) = registered_pair(&dir);

        alice.send_private_message("user_bob", "hello bob").unwrap();
        let lines = alice.take_outbound();
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains("hello bob"));

        let events = bob.handle_line(&forward(&lines[0], "alice"));
        match &events[0] {
            ClientEvent::PrivateMessage {
                from_id,
                from_nickname,
                text,
            } => {
                assert_eq!(from_id, "user_alice");
                assert_eq!(from_nickname, "alice");
                assert_eq!(text, "hello bob");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn channel_message_roundtrip_via_join_ack() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, mut bob) = registered_pair(&dir);

        let channel_key = B64.encode(generate_key().as_ref());
        let join_ack = |_uid: &str| {
            Frame::new(Payload::Ack {
                success: true,
                message: None,
                user_id: None,
                description: None,
                session_token: None,
                channel: Some("#dev".into()),
                members: Some(Vec::new()),
                is_protected: Some(false),
                is_operator: Some(false),
                is_owner: Some(false),
                topic: Some(String::new()),
                channel_key: Some(channel_key.clone()),
            })
        };
        alice.handle_frame(join_ack("user_alice"));
        bob.handle_frame(join_ack("user_bob"));

        alice.send_channel_message("#dev", "standup at ten").unwrap();
        let lines = alice.take_outbound();
        let events = bob.handle_line(&forward(&lines[0], "alice"));
        match &events[0] {
            ClientEvent::ChannelMessage { channel, text, .. } => {
                assert_eq!(channel, "#dev");
                assert_eq!(text, "standup at ten");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn rekey_handshake_renews_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, mut bob) = registered_pair(&dir);

        alice.send_private_message("user_bob", "before").unwrap();
        let old_line = forward(&alice.take_outbound().pop().unwrap(), "alice");

        alice.initiate_rekey("user_bob").unwrap();
        let request = forward(&alice.take_outbound().pop().unwrap(), "alice");
        let events = bob.handle_line(&request);
        assert!(matches!(events[0], ClientEvent::KeysRotated { .. }));

        let response = forward(&bob.take_outbound().pop().unwrap(), "bob");
        let events = alice.handle_line(&response);
        assert!(matches!(events[0], ClientEvent::KeysRotated { .. }));

        // Traffic under the old key no longer decrypts.
        let events = bob.handle_line(&old_line);
        assert!(matches!(events[0], ClientEvent::DecryptionFailed { .. }));

        // Fresh traffic flows both ways under the new keys.
        alice.send_private_message("user_bob", "after").unwrap();
        let line = forward(&alice.take_outbound().pop().unwrap(), "alice");
        let events = bob.handle_line(&line);
        assert!(matches!(
            &events[0],
            ClientEvent::PrivateMessage { text, .. } if text == "after"
        ));

        bob.send_private_message("user_alice", "ok").unwrap();
        let line = forward(&bob.take_outbound().pop().unwrap(), "bob");
        let events = alice.handle_line(&line);
        assert!(matches!(
            &events[0],
            ClientEvent::PrivateMessage { text, .. } if text == "ok"
        ));
    }

    #[test]
    fn server_announcements_pass_through_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, _bob) = registered_pair(&dir);
        let events = alice.handle_frame(Frame::new(Payload::ChannelMessage {
            from_id: None,
            to_id: None,
            encrypted_data: None,
            nonce: None,
            from_nickname: None,
            channel: Some("#dev".into()),
            sender: Some("SERVER".into()),
            text: Some("eve was kicked".into()),
        }));
        assert!(matches!(
            &events[0],
            ClientEvent::Announcement { channel, text }
                if channel == "#dev" && text == "eve was kicked"
        ));
    }

    #[test]
    fn file_transfer_accept_before_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, mut bob) = registered_pair(&dir);

        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"the quick brown fox").unwrap();
        let transfer_id = alice.send_file("user_bob", &path).unwrap();
        let lines = alice.take_outbound();
        assert_eq!(lines.len(), 3); // start, one chunk, end

        let events = bob.handle_line(&lines[0]);
        match &events[0] {
            ClientEvent::TransferOffered {
                transfer_id: id,
                metadata,
                ..
            } => {
                assert_eq!(id, &transfer_id);
                assert_eq!(metadata.filename, "notes.txt");
                assert_eq!(metadata.size, 19);
            }
            other => panic!("wrong event: {other:?}"),
        }

        bob.accept_transfer(&transfer_id).unwrap();
        bob.handle_line(&lines[1]);
        let events = bob.handle_line(&lines[2]);
        match &events[0] {
            ClientEvent::TransferComplete { data, .. } => {
                assert_eq!(data, b"the quick brown fox");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn file_transfer_accept_after_all_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, mut bob) = registered_pair(&dir);

        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![9u8; 100]).unwrap();
        let transfer_id = alice.send_file("user_bob", &path).unwrap();

        // Everything arrives before the host decides; chunks are held
        // encrypted until accept.
        for line in alice.take_outbound() {
            bob.handle_line(&line);
        }
        let events = bob.accept_transfer(&transfer_id).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::TransferComplete { data, .. } if data.len() == 100)));
    }

    #[test]
    fn declined_transfer_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (mut alice, mut bob) = registered_pair(&dir);

        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![1u8; 10]).unwrap();
        let transfer_id = alice.send_file("user_bob", &path).unwrap();
        for line in alice.take_outbound() {
            bob.handle_line(&line);
        }
        bob.decline_transfer(&transfer_id);
        assert!(bob.accept_transfer(&transfer_id).is_err());
    }

    #[test]
    fn unregistered_endpoint_cannot_send() {
        let dir = tempfile::tempdir().unwrap();
        let mut endpoint = EndpointCore::new("carol", dir.path().to_path_buf());
        assert!(matches!(
            endpoint.send_private_message("user_bob", "hi"),
            Err(ClientError::NotRegistered)
        ));
    }
}
