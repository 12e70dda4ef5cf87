//! The join state machine.
//!
//! A join resolves through: ban gate → channel classification (new /
//! rehydrated / live) → password gate → role-credential gate. A requester
//! holding stored role credentials, or claiming operator via a creator
//! password that was not pre-existing, must answer an
//! `op_password_request` before membership is granted; until then they are
//! not in the channel. Membership insertion happens only in
//! [`complete_join`], always before the `join_channel` fan-out.

use tracing::info;

use cc_proto::validate::{normalize_channel_name, validate_channel_name, MIN_ROLE_PASSWORD_LEN};
use cc_proto::{envelope::ChannelMember, unix_now, Frame, Payload, PromptAction};

use crate::broker::Broker;
use crate::session::{require_registered, Outcome, SessionCtx};
use crate::state::{BrokerState, LiveChannel, PendingAuth};
use crate::store::{hash_password, generate_channel_key, ChannelRecord, Role, RoleCredential};

enum Resolution {
    Rejected(String),
    Prompted,
    Completed,
}

pub fn handle_join(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    password: Option<String>,
    creator_password: Option<String>,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let channel = normalize_channel_name(&channel);
    if let Err(e) = validate_channel_name(&channel) {
        session.send_error(e.to_string());
        return Outcome::Continue;
    }

    let (resolution, persist) = {
        let mut guard = broker.state.lock();
        resolve_join(
            broker,
            &mut guard,
            session,
            &user_id,
            &channel,
            password.as_deref(),
            creator_password.as_deref(),
        )
    };
    if persist {
        broker.persist_channels();
    }
    if let Resolution::Rejected(message) = resolution {
        session.send_error(message);
    }
    Outcome::Continue
}

fn resolve_join(
    broker: &Broker,
    st: &mut BrokerState,
    session: &SessionCtx,
    user_id: &str,
    channel: &str,
    password: Option<&str>,
    creator_password: Option<&str>,
) -> (Resolution, bool) {
    let now = unix_now();
    let mut persist = false;

    // Ban gate; expired bans are removed lazily here (the background
    // sweeper catches the rest).
    if let Some(record) = st.store.records.get_mut(channel) {
        if let Some(ban) = record.banned.get(user_id).cloned() {
            if ban.is_expired(now) {
                record.banned.remove(user_id);
                persist = true;
                info!(user = %user_id, %channel, "ban expired on join");
            } else {
                return (
                    Resolution::Rejected(format!(
                        "You are banned from {channel}: {}",
                        ban.reason
                    )),
                    persist,
                );
            }
        }
    }

    let channel_exists = st.store.records.contains_key(channel);

    let mut should_be_op = false;
    let mut is_owner = false;
    let mut authenticated_via_creator = false;

    if !channel_exists {
        // Brand-new channel: the creator password is mandatory, becomes the
        // owner-recovery secret, and the broker mints the channel AEAD key.
        match creator_password {
            Some(cp) if cp.len() >= MIN_ROLE_PASSWORD_LEN => {
                let record = ChannelRecord::create(user_id, cp, password);
                st.store.records.insert(channel.to_string(), record);
                st.channels.insert(channel.to_string(), LiveChannel::default());
                should_be_op = true;
                is_owner = true;
                persist = true;
                info!(%channel, owner = %user_id, "created persistent channel");
            }
            _ => {
                return (
                    Resolution::Rejected(
                        "Creating a new channel requires a creator password (4+ characters) \
                         to regain operator status later"
                            .to_string(),
                    ),
                    persist,
                );
            }
        }
    } else {
        // Existing channel, currently empty or live: rehydrate if needed,
        // then run the password gate.
        st.channels.entry(channel.to_string()).or_default();
        let record = st
            .store
            .records
            .get_mut(channel)
            .expect("record checked above");
        if record.channel_key.is_empty() {
            record.channel_key = generate_channel_key();
            persist = true;
        }

        // A legacy record without a stored creator hash ignores the
        // supplied creator password: owner recovery is disabled for it.
        if let (Some(cp), Some(stored)) = (creator_password, &record.creator_password_hash) {
            if hash_password(cp) == *stored {
                should_be_op = true;
                is_owner = record.is_owner(user_id);
                authenticated_via_creator = true;
                info!(user = %user_id, %channel, "creator password accepted");
            } else {
                return (
                    Resolution::Rejected("Incorrect creator password".to_string()),
                    persist,
                );
            }
        }

        let has_creds = record.operator_passwords.contains_key(user_id);
        if let Some(stored_join) = &record.join_password_hash {
            // Role-credential holders skip the join password; they are
            // gated by role re-authentication instead.
            if !should_be_op && !has_creds {
                match password {
                    Some(p) if hash_password(p) == *stored_join => {}
                    _ => {
                        return (
                            Resolution::Rejected("Incorrect channel password".to_string()),
                            persist,
                        );
                    }
                }
            }
        }
    }

    let stored_role = st.stored_role(channel, user_id);
    let has_creds = stored_role.is_some();
    let stored_is_mod = stored_role == Some(Role::Mod);

    // Returning privilege holder: re-authenticate before admission.
    if has_creds && !should_be_op && !authenticated_via_creator {
        let owner = st.is_owner(channel, user_id);
        st.pending_auth.insert(
            user_id.to_string(),
            PendingAuth {
                channel: channel.to_string(),
                should_be_op: !stored_is_mod,
                is_owner: owner,
                is_mod: stored_is_mod,
            },
        );
        session.send_frame(&op_password_request(channel, PromptAction::Verify));
        info!(user = %user_id, %channel, "requesting role password (stored credentials)");
        return (Resolution::Prompted, persist);
    }

    // Claimed operator without a pre-existing creator match: verify the
    // stored credential or set a first one.
    if should_be_op && !authenticated_via_creator {
        let action = if has_creds {
            PromptAction::Verify
        } else {
            PromptAction::Set
        };
        st.pending_auth.insert(
            user_id.to_string(),
            PendingAuth {
                channel: channel.to_string(),
                should_be_op: true,
                is_owner,
                is_mod: false,
            },
        );
        session.send_frame(&op_password_request(channel, action));
        info!(user = %user_id, %channel, ?action, "requesting operator password");
        return (Resolution::Prompted, persist);
    }

    complete_join(broker, st, user_id, channel, should_be_op, is_owner, false);
    (Resolution::Completed, persist)
}

fn op_password_request(channel: &str, action: PromptAction) -> Frame {
    Frame::new(Payload::OpPasswordRequest {
        channel: channel.to_string(),
        action,
        granted_by: None,
        is_mod: None,
    })
}

/// Admit a user: membership first, then the member-list `ack` to the
/// joiner, then the `join_channel` fan-out. Idempotent on membership.
pub(crate) fn complete_join(
    broker: &Broker,
    st: &mut BrokerState,
    user_id: &str,
    channel: &str,
    is_operator: bool,
    is_owner: bool,
    is_mod: bool,
) {
    {
        let live = st.channels.entry(channel.to_string()).or_default();
        live.members.insert(user_id.to_string());
        if is_mod {
            live.mods.insert(user_id.to_string());
        } else if is_operator {
            live.operators.insert(user_id.to_string());
        }
    }
    if let Some(client) = st.clients.get_mut(user_id) {
        client.channels.insert(channel.to_string());
    }
    broker.routing.lock().invalidate(channel);

    let record = st.store.records.get(channel);
    let live = st.channels.get(channel).expect("inserted above");
    let members: Vec<ChannelMember> = live
        .members
        .iter()
        .filter_map(|uid| {
            let client = st.clients.get(uid)?;
            Some(ChannelMember {
                user_id: uid.clone(),
                nickname: client.nickname.clone(),
                public_key: client.public_key.clone(),
                is_operator: live.operators.contains(uid),
                is_mod: live.mods.contains(uid),
                is_owner: record.map(|r| r.is_owner(uid)).unwrap_or(false),
            })
        })
        .collect();

    let (nickname, public_key) = match st.clients.get(user_id) {
        Some(client) => (client.nickname.clone(), client.public_key.clone()),
        None => return,
    };

    let ack = Frame::new(Payload::Ack {
        success: true,
        message: None,
        user_id: None,
        description: None,
        session_token: None,
        channel: Some(channel.to_string()),
        members: Some(members),
        is_protected: Some(record.map(|r| r.join_password_hash.is_some()).unwrap_or(false)),
        is_operator: Some(is_operator),
        is_owner: Some(is_owner),
        topic: Some(record.map(|r| r.topic.clone()).unwrap_or_default()),
        channel_key: Some(record.map(|r| r.channel_key.clone()).unwrap_or_default()),
    });
    if let Some(client) = st.clients.get(user_id) {
        client.send_frame(&ack);
    }

    let fan_out = Frame::new(Payload::JoinChannel {
        channel: channel.to_string(),
        password: None,
        creator_password: None,
        user_id: Some(user_id.to_string()),
        nickname: Some(nickname.clone()),
        public_key: Some(public_key),
        is_operator: Some(is_operator),
        is_mod: Some(is_mod),
        is_owner: Some(is_owner),
    });
    st.broadcast_to_channel(channel, &fan_out, Some(user_id));

    let role = if is_mod {
        "mod"
    } else if is_operator {
        "operator"
    } else {
        "member"
    };
    info!(user = %user_id, nickname = %nickname, %channel, role, "joined channel");
}

pub fn handle_op_password_response(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    password: String,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    let mut persist = false;
    let mut error: Option<String> = None;
    let mut outcome = Outcome::Continue;
    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        if password.is_empty() {
            error = Some("Password required".to_string());
            // A pending auth was guarding previously held privileges.
            if st.pending_auth.remove(&user_id).is_some() {
                outcome = Outcome::Close;
            }
            st.pending_grant.remove(&user_id);
        } else if let Some(grant) = st.pending_grant.get(&user_id).cloned() {
            st.pending_grant.remove(&user_id);
            if channel != grant.channel {
                error = Some("Channel mismatch".to_string());
            } else if password.len() < MIN_ROLE_PASSWORD_LEN {
                error = Some(format!(
                    "Password must be at least {MIN_ROLE_PASSWORD_LEN} characters"
                ));
            } else if let Some(record) = st.store.records.get_mut(&channel) {
                let role = if grant.is_mod { Role::Mod } else { Role::Operator };
                record.operator_passwords.insert(
                    user_id.clone(),
                    RoleCredential {
                        password: hash_password(&password),
                        role,
                    },
                );
                persist = true;

                let live = st.channels.entry(channel.clone()).or_default();
                if grant.is_mod {
                    live.mods.insert(user_id.clone());
                } else {
                    live.operators.insert(user_id.clone());
                }

                let nickname = st
                    .clients
                    .get(&user_id)
                    .map(|c| c.nickname.clone())
                    .unwrap_or_default();
                let notification = if grant.is_mod {
                    Frame::new(Payload::ModUser {
                        channel: channel.clone(),
                        target_nickname: None,
                        user_id: Some(user_id.clone()),
                        nickname: Some(nickname.clone()),
                        granted_by: Some(grant.granted_by.clone()),
                    })
                } else {
                    Frame::new(Payload::OpUser {
                        channel: channel.clone(),
                        target_nickname: None,
                        user_id: Some(user_id.clone()),
                        nickname: Some(nickname.clone()),
                        granted_by: Some(grant.granted_by.clone()),
                    })
                };
                st.broadcast_to_channel(&channel, &notification, None);
                info!(
                    granted_by = %grant.granted_by,
                    target = %nickname,
                    %channel,
                    is_mod = grant.is_mod,
                    "role grant completed"
                );
            } else {
                error = Some(format!("Channel {channel} does not exist"));
            }
        } else if let Some(pending) = st.pending_auth.get(&user_id).cloned() {
            if channel != pending.channel {
                st.pending_auth.remove(&user_id);
                error = Some("Channel mismatch".to_string());
                outcome = Outcome::Close;
            } else if let Some(record) = st.store.records.get_mut(&channel) {
                let stored_hash = record
                    .operator_passwords
                    .get(&user_id)
                    .map(|c| c.password.clone());
                let verified = match stored_hash {
                    Some(stored_hash) => {
                        if hash_password(&password) == stored_hash {
                            true
                        } else {
                            error = Some("Incorrect operator password".to_string());
                            outcome = Outcome::Close;
                            false
                        }
                    }
                    None => {
                        if password.len() < MIN_ROLE_PASSWORD_LEN {
                            error = Some(format!(
                                "Operator password must be at least {MIN_ROLE_PASSWORD_LEN} characters"
                            ));
                            outcome = Outcome::Close;
                            false
                        } else {
                            let role = if pending.is_mod { Role::Mod } else { Role::Operator };
                            record.operator_passwords.insert(
                                user_id.clone(),
                                RoleCredential {
                                    password: hash_password(&password),
                                    role,
                                },
                            );
                            persist = true;
                            info!(user = %user_id, %channel, ?role, "stored role credential");
                            true
                        }
                    }
                };
                st.pending_auth.remove(&user_id);
                if verified {
                    complete_join(
                        broker,
                        st,
                        &user_id,
                        &pending.channel,
                        pending.should_be_op,
                        pending.is_owner,
                        pending.is_mod,
                    );
                }
            } else {
                st.pending_auth.remove(&user_id);
                error = Some(format!("Channel {channel} does not exist"));
            }
        } else {
            error = Some("Unexpected password response".to_string());
        }
    }

    if persist {
        broker.persist_channels();
    }
    if let Some(message) = error {
        session.send_error(message);
    }
    outcome
}

pub fn handle_leave(broker: &Broker, session: &mut SessionCtx, channel: String) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;
        let in_channel = st
            .channels
            .get(&channel)
            .map(|c| c.members.contains(&user_id))
            .unwrap_or(false);
        if !in_channel {
            drop(guard);
            session.send_error(format!("You are not in channel {channel}"));
            return Outcome::Continue;
        }

        if let Some(live) = st.channels.get_mut(&channel) {
            live.members.remove(&user_id);
            live.operators.remove(&user_id);
            live.mods.remove(&user_id);
        }
        if let Some(client) = st.clients.get_mut(&user_id) {
            client.channels.remove(&channel);
        }
        broker.routing.lock().invalidate(&channel);

        session.send_ack(format!("Left channel {channel}"));

        let nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        let leave = Frame::new(Payload::LeaveChannel {
            channel: channel.clone(),
            user_id: Some(user_id.clone()),
            nickname: Some(nickname.clone()),
        });
        st.broadcast_to_channel(&channel, &leave, Some(&user_id));
        info!(user = %user_id, %channel, "left channel");
    }
    Outcome::Continue
}
