//! Registration, presence, and information requests.

use tracing::{info, warn};

use cc_proto::envelope::{ChannelSummary, UserEntry};
use cc_proto::validate::{clamp_status_message, validate_nickname};
use cc_proto::{Frame, Payload, UserStatus};

use crate::broker::Broker;
use crate::monitor::Direction;
use crate::session::{require_registered, Outcome, SessionCtx};
use crate::state::{BrokerState, ClientHandle};

pub fn handle_register(
    broker: &Broker,
    session: &mut SessionCtx,
    nickname: String,
    public_key: String,
    password: Option<String>,
    session_token: Option<String>,
) -> Outcome {
    if session.user_id.is_some() {
        session.send_error("Already registered");
        return Outcome::Continue;
    }
    if nickname.is_empty() || public_key.is_empty() {
        session.send_error("Missing nickname or public_key");
        return Outcome::Continue;
    }
    if let Err(e) = validate_nickname(&nickname) {
        session.send_error(e.to_string());
        return Outcome::Continue;
    }

    let mut authenticated_as: Option<String> = None;
    {
        let mut accounts = broker.accounts.lock();
        if accounts.require_authentication {
            let authenticated = if let Some(token) = &session_token {
                accounts.verify_session(token).map(str::to_string)
            } else if let Some(pw) = &password {
                if accounts.account_exists(&nickname)
                    && accounts.authenticate(&nickname, pw).is_some()
                {
                    Some(nickname.clone())
                } else {
                    None
                }
            } else {
                None
            };
            match authenticated {
                None => {
                    warn!(%nickname, "registration without valid credentials");
                    session.send_error(
                        "Authentication required. Please login or create an account.",
                    );
                    return Outcome::Continue;
                }
                Some(username) if accounts.is_disabled(&username) => {
                    session.send_error("Account is disabled");
                    return Outcome::Continue;
                }
                Some(username) => authenticated_as = Some(username),
            }
        } else if accounts.enable_accounts {
            if let Some(token) = &session_token {
                authenticated_as = accounts.verify_session(token).map(str::to_string);
            }
        }
    }

    let user_id = BrokerState::user_id_for(&nickname);
    {
        let mut st = broker.state.lock();

        if st.nicknames.contains_key(&nickname) {
            drop(st);
            session.send_error(format!("Nickname {nickname} already taken"));
            return Outcome::Continue;
        }
        if !broker.conns.lock().register(&user_id) {
            drop(st);
            session.send_error("Server at maximum capacity");
            return Outcome::Continue;
        }

        let mut client = ClientHandle::new(
            user_id.clone(),
            nickname.clone(),
            public_key.clone(),
            session.tx.clone(),
        );
        client.account_username = authenticated_as;
        st.clients.insert(user_id.clone(), client);
        st.nicknames.insert(nickname.clone(), user_id.clone());
        session.user_id = Some(user_id.clone());
        broker.monitor.lock().register_connection(&user_id);
        info!(%nickname, %user_id, "registered session");

        session.send_frame(&Frame::new(Payload::Ack {
            success: true,
            message: Some(format!("Welcome {nickname}!")),
            user_id: Some(user_id.clone()),
            description: Some(broker.config.description.clone()),
            session_token: None,
            channel: None,
            members: None,
            is_protected: None,
            is_operator: None,
            is_owner: None,
            topic: None,
            channel_key: None,
        }));

        // Queued envelopes replay while the state lock is still held, so
        // no live traffic can interleave ahead of them.
        let queued = broker.queue.lock().dequeue_all(&user_id);
        if !queued.is_empty() {
            let count = queued.len();
            let mut monitor = broker.monitor.lock();
            for message in queued {
                monitor.record_message(
                    &user_id,
                    message.encrypted_content.len(),
                    Direction::Sent,
                );
                let _ = session.tx.send(message.encrypted_content);
            }
            drop(monitor);
            session.send_ack(format!("Delivered {count} queued message(s)"));
        }
        drop(st);
    }

    send_user_list(broker, session);
    broadcast_new_user(broker, &user_id);
    broker.profiles.lock().update_last_seen(&nickname);
    Outcome::Continue
}

fn send_user_list(broker: &Broker, session: &SessionCtx) {
    let st = broker.state.lock();
    let users: Vec<UserEntry> = st
        .clients
        .values()
        .map(|c| UserEntry {
            user_id: c.user_id.clone(),
            nickname: c.nickname.clone(),
            public_key: c.public_key.clone(),
            status: c.status,
            status_message: c.status_message.clone(),
        })
        .collect();
    session.send_frame(&Frame::new(Payload::UserList { users }));
}

fn broadcast_new_user(broker: &Broker, user_id: &str) {
    let st = broker.state.lock();
    let Some(newcomer) = st.clients.get(user_id) else {
        return;
    };
    let frame = Frame::new(Payload::UserList {
        users: vec![UserEntry {
            user_id: newcomer.user_id.clone(),
            nickname: newcomer.nickname.clone(),
            public_key: newcomer.public_key.clone(),
            status: newcomer.status,
            status_message: newcomer.status_message.clone(),
        }],
    });
    let Ok(line) = frame.to_json() else { return };
    for (other_id, other) in &st.clients {
        if other_id != user_id {
            other.send_line(line.clone());
        }
    }
}

pub fn handle_set_status(
    broker: &Broker,
    session: &mut SessionCtx,
    status: UserStatus,
    custom_message: String,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let custom_message = clamp_status_message(&custom_message);

    let mut st = broker.state.lock();
    let Some(client) = st.clients.get_mut(&user_id) else {
        return Outcome::Continue;
    };
    client.status = status;
    client.status_message = custom_message.clone();
    let nickname = client.nickname.clone();
    let channels: Vec<String> = client.channels.iter().cloned().collect();
    info!(%nickname, status = status.as_str(), "status change");

    session.send_ack(format!("Status set to {}", status.as_str()));

    // One update per distinct channel-mate, however many channels are
    // shared.
    let update = Frame::new(Payload::StatusUpdate {
        user_id: user_id.clone(),
        nickname,
        status,
        custom_message,
    });
    let Ok(line) = update.to_json() else {
        return Outcome::Continue;
    };
    let mut notified = std::collections::HashSet::new();
    for channel in channels {
        let Some(live) = st.channels.get(&channel) else {
            continue;
        };
        for member_id in &live.members {
            if member_id != &user_id && notified.insert(member_id.clone()) {
                if let Some(target) = st.clients.get(member_id) {
                    target.send_line(line.clone());
                }
            }
        }
    }
    Outcome::Continue
}

pub fn handle_whois(
    broker: &Broker,
    session: &mut SessionCtx,
    target_nickname: String,
) -> Outcome {
    if require_registered(session).is_none() {
        return Outcome::Continue;
    }
    let st = broker.state.lock();
    match st.resolve_nickname(&target_nickname) {
        Some(target) => {
            session.send_frame(&Frame::new(Payload::WhoisResponse {
                nickname: target.nickname.clone(),
                user_id: target.user_id.clone(),
                channels: target.channels.iter().cloned().collect(),
                online: true,
            }));
        }
        None => {
            drop(st);
            session.send_error(format!("User {target_nickname} not found"));
        }
    }
    Outcome::Continue
}

pub fn handle_list_channels(broker: &Broker, session: &mut SessionCtx) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let st = broker.state.lock();
    let mut channels: Vec<ChannelSummary> = st
        .channels
        .iter()
        .filter(|(name, live)| {
            // Secret channels stay off the listing for non-members.
            let secret = st
                .store
                .records
                .get(*name)
                .map(|r| r.has_mode('s'))
                .unwrap_or(false);
            !secret || live.members.contains(&user_id)
        })
        .map(|(name, live)| ChannelSummary {
            name: name.clone(),
            users: live.members.len(),
            protected: st
                .store
                .records
                .get(name)
                .map(|r| r.join_password_hash.is_some())
                .unwrap_or(false),
            topic: st
                .store
                .records
                .get(name)
                .map(|r| r.topic.clone())
                .unwrap_or_default(),
        })
        .collect();
    channels.sort_by(|a, b| a.name.cmp(&b.name));
    session.send_frame(&Frame::new(Payload::ChannelListResponse { channels }));
    Outcome::Continue
}

pub fn handle_register_nickname(
    broker: &Broker,
    session: &mut SessionCtx,
    nickname: String,
    password: String,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let current_nickname = {
        let st = broker.state.lock();
        st.clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default()
    };
    if nickname != current_nickname {
        session.send_error("You can only register your current nickname");
        return Outcome::Continue;
    }
    match broker.profiles.lock().register_nickname(&nickname, &password) {
        Ok(message) => {
            info!(%nickname, "nickname registered");
            session.send_ack(message);
        }
        Err(message) => session.send_error(message),
    }
    Outcome::Continue
}

pub fn handle_update_profile(
    broker: &Broker,
    session: &mut SessionCtx,
    bio: Option<String>,
    status_message: Option<String>,
    avatar: Option<String>,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let nickname = {
        let st = broker.state.lock();
        st.clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default()
    };
    match broker
        .profiles
        .lock()
        .update_profile(&nickname, bio, status_message, avatar)
    {
        Ok(message) => session.send_ack(message),
        Err(message) => session.send_error(message),
    }
    Outcome::Continue
}

pub fn handle_auth_request(
    broker: &Broker,
    session: &mut SessionCtx,
    username: String,
    password: String,
) -> Outcome {
    let mut accounts = broker.accounts.lock();
    match accounts.authenticate(&username, &password) {
        Some(token) => {
            info!(%username, "authenticated");
            session.send_frame(&Frame::new(Payload::AuthResponse {
                success: true,
                session_token: Some(token),
                message: format!("Authenticated as {username}"),
            }));
        }
        None => {
            let message = if accounts.is_locked(&username) {
                "Account temporarily locked due to failed login attempts"
            } else {
                "Invalid username or password"
            };
            session.send_frame(&Frame::new(Payload::AuthResponse {
                success: false,
                session_token: None,
                message: message.to_string(),
            }));
        }
    }
    Outcome::Continue
}

pub fn handle_create_account(
    broker: &Broker,
    session: &mut SessionCtx,
    username: String,
    password: String,
    email: Option<String>,
) -> Outcome {
    let mut accounts = broker.accounts.lock();
    if !accounts.enable_accounts {
        drop(accounts);
        session.send_error("Account creation is disabled");
        return Outcome::Continue;
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric())
        || username.len() < 3
        || username.len() > 20
    {
        drop(accounts);
        session.send_error("Username must be 3-20 alphanumeric characters");
        return Outcome::Continue;
    }
    if password.len() < 8 {
        drop(accounts);
        session.send_error("Password must be at least 8 characters");
        return Outcome::Continue;
    }
    if !accounts.create_account(&username, &password, email) {
        drop(accounts);
        session.send_error(format!("Username {username} is already taken"));
        return Outcome::Continue;
    }
    // New accounts come back already authenticated.
    let token = accounts.authenticate(&username, &password);
    info!(%username, "account created");
    session.send_frame(&Frame::new(Payload::Ack {
        success: true,
        message: Some(format!("Account created for {username}")),
        user_id: None,
        description: None,
        session_token: token,
        channel: None,
        members: None,
        is_protected: None,
        is_operator: None,
        is_owner: None,
        topic: None,
        channel_key: None,
    }));
    Outcome::Continue
}

pub fn handle_change_password(
    broker: &Broker,
    session: &mut SessionCtx,
    old_password: String,
    new_password: String,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    if !broker.accounts.lock().enable_accounts {
        session.send_error("Authentication is disabled");
        return Outcome::Continue;
    }
    let username = {
        let st = broker.state.lock();
        st.clients
            .get(&user_id)
            .and_then(|c| c.account_username.clone())
    };
    let Some(username) = username else {
        session.send_error("You must be authenticated");
        return Outcome::Continue;
    };
    if new_password.len() < 8 {
        session.send_error("New password must be at least 8 characters");
        return Outcome::Continue;
    }
    if broker
        .accounts
        .lock()
        .change_password(&username, &old_password, &new_password)
    {
        info!(%username, "password changed");
        session.send_ack("Password changed successfully");
    } else {
        session.send_error("Invalid old password");
    }
    Outcome::Continue
}

pub fn handle_get_profile(
    broker: &Broker,
    session: &mut SessionCtx,
    target_nickname: String,
) -> Outcome {
    if require_registered(session).is_none() {
        return Outcome::Continue;
    }
    let profiles = broker.profiles.lock();
    match profiles.get(&target_nickname) {
        Some(profile) => {
            session.send_frame(&Frame::new(Payload::ProfileResponse {
                nickname: target_nickname,
                bio: profile.bio.clone(),
                status_message: profile.status_message.clone(),
                avatar: profile.avatar.clone(),
                registered: profile.registered,
                registration_date: profile.registration_date.clone(),
            }));
        }
        None => {
            drop(profiles);
            session.send_error(format!("Profile not found for {target_nickname}"));
        }
    }
    Outcome::Continue
}
