//! Per-connection session handling.
//!
//! Each accepted socket gets two tasks: this read loop, and a writer task
//! that drains the session's outbound channel. All state mutation happens
//! synchronously inside dispatch, so a session's frames are handled strictly
//! in arrival order and no lock is ever held across socket I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use cc_proto::codec::write_line;
use cc_proto::{Frame, FrameReader, Payload, ReadOutcome};

use crate::broker::Broker;
use crate::monitor::Direction;
use crate::{join, presence, roles, routing};

/// Whether the read loop should keep going after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Close,
}

/// The session's view of itself. `user_id` is set by a successful
/// `register`; the authoritative handle lives in the broker state.
pub struct SessionCtx {
    pub user_id: Option<String>,
    pub addr: String,
    pub tx: mpsc::UnboundedSender<String>,
}

impl SessionCtx {
    pub fn send_frame(&self, frame: &Frame) {
        if let Ok(line) = frame.to_json() {
            let _ = self.tx.send(line);
        }
    }

    pub fn send_error(&self, message: impl Into<String>) {
        self.send_frame(&Frame::error(message));
    }

    pub fn send_ack(&self, message: impl Into<String>) {
        self.send_frame(&Frame::ack(message));
    }

    /// Name for logging before registration completes.
    pub fn display_name(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.addr)
    }
}

pub async fn handle_connection(broker: Arc<Broker>, stream: TcpStream, addr: SocketAddr) {
    let (read_half, write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(line) = rx.recv().await {
            if write_line(&mut writer, &line).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut session = SessionCtx {
        user_id: None,
        addr: addr.to_string(),
        tx,
    };
    let mut reader = FrameReader::new(read_half, broker.config.max_message_size);
    let read_timeout = Duration::from_secs(broker.config.read_timeout);

    loop {
        let outcome = match timeout(read_timeout, reader.next()).await {
            Err(_) => {
                warn!(peer = %session.display_name(), "read timeout");
                session.send_error("Read timeout");
                Outcome::Close
            }
            Ok(Err(e)) => {
                debug!(peer = %session.display_name(), error = %e, "read error");
                Outcome::Close
            }
            Ok(Ok(ReadOutcome::Eof)) => Outcome::Close,
            Ok(Ok(ReadOutcome::Oversized)) => {
                warn!(peer = %session.display_name(), "oversized frame dropped");
                session.send_error("Message too large");
                Outcome::Continue
            }
            Ok(Ok(ReadOutcome::Line(line))) => {
                if line.is_empty() {
                    Outcome::Continue
                } else {
                    if let Some(user_id) = &session.user_id {
                        broker.conns.lock().touch(user_id);
                        broker
                            .monitor
                            .lock()
                            .record_message(user_id, line.len(), Direction::Received);
                    }
                    match Frame::parse(&line) {
                        Ok(frame) => dispatch(&broker, &mut session, frame),
                        Err(e) => {
                            debug!(peer = %session.display_name(), error = %e, "bad frame");
                            session.send_error(e.to_string());
                            Outcome::Continue
                        }
                    }
                }
            }
        };
        if outcome == Outcome::Close {
            break;
        }
    }

    if let Some(user_id) = session.user_id.clone() {
        broker.disconnect_user(&user_id);
    }
    drop(session);
    let _ = writer_task.await;
}

/// Route one parsed frame to its handler.
pub fn dispatch(broker: &Broker, session: &mut SessionCtx, frame: Frame) -> Outcome {
    match frame.payload {
        Payload::Register {
            nickname,
            public_key,
            password,
            session_token,
        } => presence::handle_register(broker, session, nickname, public_key, password, session_token),
        Payload::Disconnect { .. } => Outcome::Close,
        Payload::AuthRequest { username, password } => {
            presence::handle_auth_request(broker, session, username, password)
        }
        Payload::CreateAccount {
            username,
            password,
            email,
        } => presence::handle_create_account(broker, session, username, password, email),
        Payload::ChangePassword {
            old_password,
            new_password,
        } => presence::handle_change_password(broker, session, old_password, new_password),

        Payload::PublicKeyRequest { target_nickname } => {
            routing::handle_public_key_request(broker, session, target_nickname)
        }
        Payload::RekeyRequest { .. } | Payload::RekeyResponse { .. } => {
            routing::handle_rekey(broker, session, frame)
        }
        Payload::PrivateMessage { .. } => routing::handle_private_message(broker, session, frame),
        Payload::ChannelMessage { .. } => routing::handle_channel_message(broker, session, frame),
        Payload::ImageStart { .. } | Payload::ImageChunk { .. } | Payload::ImageEnd { .. } => {
            routing::handle_image_message(broker, session, frame)
        }

        Payload::JoinChannel {
            channel,
            password,
            creator_password,
            ..
        } => join::handle_join(broker, session, channel, password, creator_password),
        Payload::LeaveChannel { channel, .. } => join::handle_leave(broker, session, channel),
        Payload::OpPasswordResponse { channel, password } => {
            join::handle_op_password_response(broker, session, channel, password)
        }

        Payload::OpUser {
            channel,
            target_nickname,
            ..
        } => roles::handle_op_user(broker, session, channel, target_nickname),
        Payload::UnopUser {
            channel,
            target_nickname,
            ..
        } => roles::handle_unop_user(broker, session, channel, target_nickname),
        Payload::ModUser {
            channel,
            target_nickname,
            ..
        } => roles::handle_mod_user(broker, session, channel, target_nickname),
        Payload::UnmodUser {
            channel,
            target_nickname,
            ..
        } => roles::handle_unmod_user(broker, session, channel, target_nickname),
        Payload::KickUser {
            channel,
            target_nickname,
            reason,
            ..
        } => roles::handle_kick_user(broker, session, channel, target_nickname, reason),
        Payload::BanUser {
            channel,
            target_nickname,
            reason,
            duration,
            ..
        } => roles::handle_ban_user(broker, session, channel, target_nickname, reason, duration),
        Payload::KickbanUser {
            channel,
            target_nickname,
            reason,
            duration,
        } => roles::handle_ban_user(broker, session, channel, Some(target_nickname), reason, duration),
        Payload::UnbanUser {
            channel,
            target_nickname,
            ..
        } => roles::handle_unban_user(broker, session, channel, target_nickname),
        Payload::InviteUser {
            channel,
            target_nickname,
            ..
        } => roles::handle_invite_user(broker, session, channel, target_nickname),
        Payload::InviteResponse {
            channel,
            inviter_nickname,
            accepted,
        } => roles::handle_invite_response(broker, session, channel, inviter_nickname, accepted),
        Payload::TransferOwnership {
            channel,
            target_nickname,
        } => roles::handle_transfer_ownership(broker, session, channel, target_nickname),
        Payload::SetTopic { channel, topic, .. } => {
            roles::handle_set_topic(broker, session, channel, topic)
        }
        Payload::SetMode {
            channel,
            mode,
            enable,
        } => roles::handle_set_mode(broker, session, channel, mode, enable),

        Payload::SetStatus {
            status,
            custom_message,
        } => presence::handle_set_status(broker, session, status, custom_message),
        Payload::Whois { target_nickname } => presence::handle_whois(broker, session, target_nickname),
        Payload::ListChannels => presence::handle_list_channels(broker, session),
        Payload::RegisterNickname { nickname, password } => {
            presence::handle_register_nickname(broker, session, nickname, password)
        }
        Payload::UpdateProfile {
            bio,
            status_message,
            avatar,
        } => presence::handle_update_profile(broker, session, bio, status_message, avatar),
        Payload::GetProfile { target_nickname } => {
            presence::handle_get_profile(broker, session, target_nickname)
        }

        // Broker-to-client types have no business arriving here.
        other => {
            session.send_error(format!("Unexpected message type: {}", other.tag()));
            Outcome::Continue
        }
    }
}

/// Clone out the registered user id, or answer with an error.
pub(crate) fn require_registered(session: &SessionCtx) -> Option<String> {
    match &session.user_id {
        Some(user_id) => Some(user_id.clone()),
        None => {
            session.send_error("You must register first");
            None
        }
    }
}
