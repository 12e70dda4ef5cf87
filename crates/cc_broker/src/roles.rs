//! Channel administration: role grants and revocations, kicks, bans,
//! invites, ownership transfer, topic, and modes.
//!
//! Authorization matrix (enforced here, re-checked on every request):
//! only the owner grants or revokes operator; operators and the owner
//! grant or revoke mod, ban, unban, invite, and change topic or modes;
//! mods may kick ordinary members but not operators; nobody kicks or bans
//! the owner. A kick removes live role membership but keeps the stored
//! role credential; a revoke deletes the credential too.

use tracing::info;

use cc_proto::validate::validate_reason;
use cc_proto::validate::validate_topic;
use cc_proto::{unix_now, Frame, Payload, PromptAction};

use crate::broker::Broker;
use crate::join;
use crate::session::{require_registered, Outcome, SessionCtx};
use crate::state::{BrokerState, PendingGrant};
use crate::store::BanRecord;

const VALID_MODES: &[char] = &['m', 's', 'i', 'n', 'p'];

fn mode_description(mode: char) -> &'static str {
    match mode {
        'm' => "moderated (only ops/mods can speak)",
        's' => "secret (hidden from channel list)",
        'i' => "invite-only",
        'n' => "no external messages",
        'p' => "private (hide user list from non-members)",
        _ => "unknown",
    }
}

/// Resolve a target nickname to a connected user id, answering the error
/// frames for the two not-found cases.
fn resolve_online_target(
    st: &BrokerState,
    session: &SessionCtx,
    target_nickname: &str,
) -> Option<String> {
    match st.nicknames.get(target_nickname) {
        Some(user_id) if st.clients.contains_key(user_id) => Some(user_id.clone()),
        _ => {
            session.send_error(format!("User {target_nickname} not found"));
            None
        }
    }
}

pub fn handle_op_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
) -> Outcome {
    grant_role(broker, session, channel, target_nickname, false)
}

pub fn handle_mod_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
) -> Outcome {
    grant_role(broker, session, channel, target_nickname, true)
}

fn grant_role(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
    is_mod: bool,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let Some(target_nickname) = target_nickname else {
        session.send_error("Missing channel or target_nickname");
        return Outcome::Continue;
    };

    let mut guard = broker.state.lock();
    let st = &mut *guard;

    if !st.channels.contains_key(&channel) {
        session.send_error(format!("Channel {channel} does not exist"));
        return Outcome::Continue;
    }
    if !st.is_member(&channel, &user_id) {
        session.send_error(format!("You are not in channel {channel}"));
        return Outcome::Continue;
    }
    let permitted = if is_mod {
        st.is_operator_or_owner(&channel, &user_id)
    } else {
        st.is_owner(&channel, &user_id)
    };
    if !permitted {
        let message = if is_mod {
            "Only operators can grant mod status"
        } else {
            "Only the channel owner can grant operator status"
        };
        session.send_error(message);
        return Outcome::Continue;
    }

    let Some(target_id) = resolve_online_target(st, session, &target_nickname) else {
        return Outcome::Continue;
    };
    if !st.is_member(&channel, &target_id) {
        session.send_error(format!("{target_nickname} is not in channel {channel}"));
        return Outcome::Continue;
    }

    let granter_nickname = st
        .clients
        .get(&user_id)
        .map(|c| c.nickname.clone())
        .unwrap_or_default();
    st.pending_grant.insert(
        target_id.clone(),
        PendingGrant {
            channel: channel.clone(),
            granted_by: granter_nickname.clone(),
            granted_by_id: user_id.clone(),
            is_mod,
        },
    );

    let request = Frame::new(Payload::OpPasswordRequest {
        channel: channel.clone(),
        action: PromptAction::Set,
        granted_by: Some(granter_nickname.clone()),
        is_mod: is_mod.then_some(true),
    });
    if let Some(target) = st.clients.get(&target_id) {
        target.send_frame(&request);
    }
    session.send_ack(format!("Password request sent to {target_nickname}"));
    info!(
        granter = %granter_nickname,
        target = %target_nickname,
        %channel,
        is_mod,
        "initiated role grant"
    );
    Outcome::Continue
}

pub fn handle_unop_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
) -> Outcome {
    revoke_role(broker, session, channel, target_nickname, false)
}

pub fn handle_unmod_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
) -> Outcome {
    revoke_role(broker, session, channel, target_nickname, true)
}

fn revoke_role(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
    is_mod: bool,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let Some(target_nickname) = target_nickname else {
        session.send_error("Missing channel or target_nickname");
        return Outcome::Continue;
    };

    let mut persist = false;
    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        let permitted = if is_mod {
            st.is_operator_or_owner(&channel, &user_id)
        } else {
            st.is_owner(&channel, &user_id)
        };
        if !permitted {
            let message = if is_mod {
                "Only operators can remove mod status"
            } else {
                "Only the channel owner can remove operator status"
            };
            session.send_error(message);
            return Outcome::Continue;
        }

        let Some(target_id) = resolve_online_target(st, session, &target_nickname) else {
            return Outcome::Continue;
        };

        let held = if is_mod {
            st.is_mod(&channel, &target_id)
        } else {
            st.is_operator(&channel, &target_id)
        };
        if !held {
            let role = if is_mod { "a mod" } else { "an operator" };
            session.send_error(format!("{target_nickname} is not {role}"));
            return Outcome::Continue;
        }

        if let Some(live) = st.channels.get_mut(&channel) {
            if is_mod {
                live.mods.remove(&target_id);
            } else {
                live.operators.remove(&target_id);
            }
        }
        // A revoke deletes the stored credential; the user cannot reclaim
        // the role on rejoin.
        if let Some(record) = st.store.records.get_mut(&channel) {
            if record.operator_passwords.remove(&target_id).is_some() {
                persist = true;
            }
        }

        let remover_nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        let role_word = if is_mod { "mod" } else { "operator" };
        session.send_ack(format!("{target_nickname} is no longer a {role_word}"));
        if let Some(target) = st.clients.get(&target_id) {
            target.send_frame(&Frame::ack(format!(
                "You are no longer a {role_word} in {channel}"
            )));
        }

        let notification = if is_mod {
            Frame::new(Payload::UnmodUser {
                channel: channel.clone(),
                target_nickname: None,
                user_id: Some(target_id.clone()),
                nickname: Some(target_nickname.clone()),
                removed_by: Some(remover_nickname.clone()),
            })
        } else {
            Frame::new(Payload::UnopUser {
                channel: channel.clone(),
                target_nickname: None,
                user_id: Some(target_id.clone()),
                nickname: Some(target_nickname.clone()),
                removed_by: Some(remover_nickname.clone()),
            })
        };
        st.broadcast_to_channel(&channel, &notification, None);
        info!(
            remover = %remover_nickname,
            target = %target_nickname,
            %channel,
            is_mod,
            "revoked role"
        );
    }
    if persist {
        broker.persist_channels();
    }
    Outcome::Continue
}

pub fn handle_kick_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
    reason: Option<String>,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let Some(target_nickname) = target_nickname else {
        session.send_error("Missing channel or target_nickname");
        return Outcome::Continue;
    };
    let reason = reason.unwrap_or_else(|| "No reason given".to_string());
    if let Err(e) = validate_reason(&reason) {
        session.send_error(e.to_string());
        return Outcome::Continue;
    }

    let mut guard = broker.state.lock();
    let st = &mut *guard;

    if !st.channels.contains_key(&channel) {
        session.send_error(format!("Channel {channel} does not exist"));
        return Outcome::Continue;
    }
    if !st.is_member(&channel, &user_id) {
        session.send_error(format!("You are not in channel {channel}"));
        return Outcome::Continue;
    }
    if !st.is_privileged(&channel, &user_id) {
        session.send_error("You must be a mod or operator to kick users");
        return Outcome::Continue;
    }

    let Some(target_id) = resolve_online_target(st, session, &target_nickname) else {
        return Outcome::Continue;
    };
    if !st.is_member(&channel, &target_id) {
        session.send_error(format!("{target_nickname} is not in channel {channel}"));
        return Outcome::Continue;
    }
    if target_id == user_id {
        session.send_error("You cannot kick yourself");
        return Outcome::Continue;
    }
    if st.is_owner(&channel, &target_id) {
        session.send_error("Cannot kick the channel owner");
        return Outcome::Continue;
    }
    let requester_only_mod =
        st.is_mod(&channel, &user_id) && !st.is_operator_or_owner(&channel, &user_id);
    if requester_only_mod && st.is_operator(&channel, &target_id) {
        session.send_error("Mods cannot kick operators");
        return Outcome::Continue;
    }

    // Membership and live role out; the stored credential survives — a
    // kick is not a revoke.
    if let Some(live) = st.channels.get_mut(&channel) {
        live.members.remove(&target_id);
        live.operators.remove(&target_id);
        live.mods.remove(&target_id);
    }
    if let Some(target) = st.clients.get_mut(&target_id) {
        target.channels.remove(&channel);
    }
    broker.routing.lock().invalidate(&channel);

    let kicker_nickname = st
        .clients
        .get(&user_id)
        .map(|c| c.nickname.clone())
        .unwrap_or_default();
    session.send_ack(format!("{target_nickname} has been kicked from {channel}"));
    if let Some(target) = st.clients.get(&target_id) {
        target.send_frame(&Frame::new(Payload::KickUser {
            channel: channel.clone(),
            target_nickname: None,
            reason: Some(reason.clone()),
            kicked_by: Some(kicker_nickname.clone()),
        }));
    }
    st.server_announcement(
        &channel,
        &format!("{target_nickname} was kicked by {kicker_nickname}: {reason}"),
        Some(&user_id),
    );
    info!(
        kicker = %kicker_nickname,
        target = %target_nickname,
        %channel,
        %reason,
        "kicked user"
    );
    Outcome::Continue
}

pub fn handle_ban_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
    reason: Option<String>,
    duration: Option<u64>,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let Some(target_nickname) = target_nickname else {
        session.send_error("Missing channel or target_nickname");
        return Outcome::Continue;
    };
    let reason = reason.unwrap_or_else(|| "No reason given".to_string());
    if let Err(e) = validate_reason(&reason) {
        session.send_error(e.to_string());
        return Outcome::Continue;
    }

    let mut persist = false;
    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        if !st.is_operator_or_owner(&channel, &user_id) {
            session.send_error("Only operators can ban users");
            return Outcome::Continue;
        }
        let Some(target_id) = resolve_online_target(st, session, &target_nickname) else {
            return Outcome::Continue;
        };
        if st.is_owner(&channel, &target_id) {
            session.send_error("Cannot ban the channel owner");
            return Outcome::Continue;
        }
        if target_id == user_id {
            session.send_error("Cannot ban yourself");
            return Outcome::Continue;
        }

        let now = unix_now();
        let expires_at = duration.filter(|d| *d > 0).map(|d| now + d as f64);
        let banner_nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();

        if let Some(record) = st.store.records.get_mut(&channel) {
            record.banned.insert(
                target_id.clone(),
                BanRecord {
                    banned_by: user_id.clone(),
                    banned_by_nickname: banner_nickname.clone(),
                    reason: reason.clone(),
                    timestamp: now,
                    expires_at,
                },
            );
            persist = true;
        } else {
            session.send_error(format!("Channel {channel} does not exist"));
            return Outcome::Continue;
        }

        let mut ban_message = format!("{target_nickname} has been banned from {channel}");
        if let Some(d) = duration.filter(|d| *d > 0) {
            let hours = d / 3600;
            let minutes = (d % 3600) / 60;
            if hours > 0 {
                ban_message.push_str(&format!(" for {hours}h {minutes}m"));
            } else {
                ban_message.push_str(&format!(" for {minutes}m"));
            }
        }
        session.send_ack(ban_message);

        // An active member is implicitly kicked.
        let was_member = st.is_member(&channel, &target_id);
        if was_member {
            if let Some(live) = st.channels.get_mut(&channel) {
                live.members.remove(&target_id);
                live.operators.remove(&target_id);
                live.mods.remove(&target_id);
            }
            if let Some(target) = st.clients.get_mut(&target_id) {
                target.channels.remove(&channel);
            }
            broker.routing.lock().invalidate(&channel);
            if let Some(target) = st.clients.get(&target_id) {
                target.send_frame(&Frame::new(Payload::BanUser {
                    channel: channel.clone(),
                    target_nickname: None,
                    reason: Some(reason.clone()),
                    duration,
                    banned_by: Some(banner_nickname.clone()),
                }));
            }
        }

        st.server_announcement(
            &channel,
            &format!("{target_nickname} was banned by {banner_nickname}: {reason}"),
            None,
        );
        info!(
            banner = %banner_nickname,
            target = %target_nickname,
            %channel,
            %reason,
            ?duration,
            "banned user"
        );
    }
    if persist {
        broker.persist_channels();
    }
    Outcome::Continue
}

pub fn handle_unban_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let Some(target_nickname) = target_nickname else {
        session.send_error("Missing channel or target_nickname");
        return Outcome::Continue;
    };

    let mut persist = false;
    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        if !st.is_operator_or_owner(&channel, &user_id) {
            session.send_error("Only operators can unban users");
            return Outcome::Continue;
        }

        // Banned users are usually offline, so resolve through the
        // deterministic id rather than the live nickname map.
        let target_id = st
            .nicknames
            .get(&target_nickname)
            .cloned()
            .unwrap_or_else(|| BrokerState::user_id_for(&target_nickname));

        let Some(record) = st.store.records.get_mut(&channel) else {
            session.send_error(format!("Channel {channel} does not exist"));
            return Outcome::Continue;
        };
        if record.banned.remove(&target_id).is_none() {
            session.send_error(format!("{target_nickname} is not banned from {channel}"));
            return Outcome::Continue;
        }
        persist = true;

        let unbanner_nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        session.send_ack(format!("{target_nickname} has been unbanned from {channel}"));
        if let Some(target) = st.clients.get(&target_id) {
            target.send_frame(&Frame::new(Payload::UnbanUser {
                channel: channel.clone(),
                target_nickname: None,
                unbanned_by: Some(unbanner_nickname.clone()),
            }));
        }
        st.server_announcement(
            &channel,
            &format!("{target_nickname} was unbanned by {unbanner_nickname}"),
            None,
        );
        info!(
            unbanner = %unbanner_nickname,
            target = %target_nickname,
            %channel,
            "unbanned user"
        );
    }
    if persist {
        broker.persist_channels();
    }
    Outcome::Continue
}

pub fn handle_invite_user(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: Option<String>,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    let Some(target_nickname) = target_nickname else {
        session.send_error("Missing channel or target_nickname");
        return Outcome::Continue;
    };

    let guard = broker.state.lock();
    let st = &*guard;

    if !st.is_member(&channel, &user_id) {
        session.send_error("You must be in the channel to invite users");
        return Outcome::Continue;
    }
    if !st.is_operator_or_owner(&channel, &user_id) {
        session.send_error("Only operators can invite users");
        return Outcome::Continue;
    }
    let Some(target_id) = resolve_online_target(st, session, &target_nickname) else {
        return Outcome::Continue;
    };
    if st.is_member(&channel, &target_id) {
        session.send_error(format!("{target_nickname} is already in {channel}"));
        return Outcome::Continue;
    }

    let inviter_nickname = st
        .clients
        .get(&user_id)
        .map(|c| c.nickname.clone())
        .unwrap_or_default();
    if let Some(target) = st.clients.get(&target_id) {
        target.send_frame(&Frame::new(Payload::InviteUser {
            channel: channel.clone(),
            target_nickname: None,
            inviter_nickname: Some(inviter_nickname.clone()),
            inviter_id: Some(user_id.clone()),
        }));
        session.send_ack(format!("Invited {target_nickname} to {channel}"));
        info!(
            inviter = %inviter_nickname,
            target = %target_nickname,
            %channel,
            "sent invite"
        );
    } else {
        session.send_error(format!("{target_nickname} is not online"));
    }
    Outcome::Continue
}

pub fn handle_invite_response(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    inviter_nickname: String,
    accepted: bool,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    if accepted {
        // Join on the target's behalf through the normal state machine.
        let outcome = join::handle_join(broker, session, channel.clone(), None, None);
        let st = broker.state.lock();
        let responder = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        if let Some(inviter) = st.resolve_nickname(&inviter_nickname) {
            inviter.send_frame(&server_channel_message(
                &channel,
                &format!("{responder} accepted your invite"),
            ));
        }
        outcome
    } else {
        let st = broker.state.lock();
        let responder = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        info!(%responder, %channel, inviter = %inviter_nickname, "invite declined");
        if let Some(inviter_id) = st.nicknames.get(&inviter_nickname) {
            if st.is_member(&channel, inviter_id) {
                if let Some(inviter) = st.clients.get(inviter_id) {
                    inviter.send_frame(&server_channel_message(
                        &channel,
                        &format!("{responder} declined your invite"),
                    ));
                }
            }
        }
        Outcome::Continue
    }
}

fn server_channel_message(channel: &str, text: &str) -> Frame {
    Frame::new(Payload::ChannelMessage {
        from_id: None,
        to_id: None,
        encrypted_data: None,
        nonce: None,
        from_nickname: None,
        channel: Some(channel.to_string()),
        sender: Some("SERVER".to_string()),
        text: Some(text.to_string()),
    })
}

pub fn handle_transfer_ownership(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    target_nickname: String,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    let mut persist = false;
    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        if !st.is_owner(&channel, &user_id) {
            session.send_error("Only the channel owner can transfer ownership");
            return Outcome::Continue;
        }
        let Some(target_id) = resolve_online_target(st, session, &target_nickname) else {
            return Outcome::Continue;
        };
        if !st.is_member(&channel, &target_id) {
            session.send_error(format!("{target_nickname} is not in channel {channel}"));
            return Outcome::Continue;
        }
        if !st.is_operator(&channel, &target_id) {
            session.send_error("Can only transfer ownership to an operator");
            return Outcome::Continue;
        }

        if let Some(record) = st.store.records.get_mut(&channel) {
            record.owner = Some(target_id.clone());
            persist = true;
        }

        let old_owner_nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        session.send_ack(format!(
            "Transferred ownership of {channel} to {target_nickname}"
        ));
        if let Some(target) = st.clients.get(&target_id) {
            target.send_frame(&Frame::ack(format!("You are now the owner of {channel}")));
        }
        st.server_announcement(
            &channel,
            &format!("{old_owner_nickname} transferred channel ownership to {target_nickname}"),
            Some(&user_id),
        );
        info!(
            from = %old_owner_nickname,
            to = %target_nickname,
            %channel,
            "transferred ownership"
        );
    }
    if persist {
        broker.persist_channels();
    }
    Outcome::Continue
}

pub fn handle_set_topic(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    topic: String,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };
    if let Err(e) = validate_topic(&topic) {
        session.send_error(e.to_string());
        return Outcome::Continue;
    }

    let mut persist = false;
    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        if !st.channels.contains_key(&channel) {
            session.send_error(format!("Channel {channel} does not exist"));
            return Outcome::Continue;
        }
        if !st.is_member(&channel, &user_id) {
            session.send_error(format!("You are not in channel {channel}"));
            return Outcome::Continue;
        }
        if !st.is_operator_or_owner(&channel, &user_id) {
            session.send_error("You are not an operator in this channel");
            return Outcome::Continue;
        }

        if let Some(record) = st.store.records.get_mut(&channel) {
            record.topic = topic.clone();
            persist = true;
        }

        let setter_nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        session.send_ack(format!("Topic set for {channel}"));
        let notification = Frame::new(Payload::SetTopic {
            channel: channel.clone(),
            topic: topic.clone(),
            set_by: Some(setter_nickname.clone()),
        });
        st.broadcast_to_channel(&channel, &notification, Some(&user_id));
        info!(setter = %setter_nickname, %channel, %topic, "topic changed");
    }
    if persist {
        broker.persist_channels();
    }
    Outcome::Continue
}

pub fn handle_set_mode(
    broker: &Broker,
    session: &mut SessionCtx,
    channel: String,
    mode: String,
    enable: bool,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    let mut mode_chars = mode.chars();
    let (Some(mode_char), None) = (mode_chars.next(), mode_chars.next()) else {
        session.send_error(format!(
            "Unknown mode: {mode}. Valid modes: {}",
            VALID_MODES.iter().collect::<String>()
        ));
        return Outcome::Continue;
    };
    if !VALID_MODES.contains(&mode_char) {
        session.send_error(format!(
            "Unknown mode: {mode}. Valid modes: {}",
            VALID_MODES.iter().collect::<String>()
        ));
        return Outcome::Continue;
    }

    let mut persist = false;
    {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        if !st.is_operator_or_owner(&channel, &user_id) {
            session.send_error("Only operators can set channel modes");
            return Outcome::Continue;
        }
        let Some(record) = st.store.records.get_mut(&channel) else {
            session.send_error(format!("Channel {channel} does not exist"));
            return Outcome::Continue;
        };

        let changed = if enable {
            record.modes.insert(mode_char)
        } else {
            record.modes.remove(&mode_char)
        };
        let action = if enable { "enabled" } else { "disabled" };
        if !changed {
            session.send_ack(format!("Mode {mode_char} is already {action}"));
            return Outcome::Continue;
        }
        persist = true;

        let setter_nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        session.send_ack(format!(
            "Mode +{mode_char} ({}) {action}",
            mode_description(mode_char)
        ));
        let notification = Frame::new(Payload::ModeChange {
            channel: channel.clone(),
            mode: mode_char.to_string(),
            enable,
            set_by: setter_nickname.clone(),
        });
        st.broadcast_to_channel(&channel, &notification, Some(&user_id));
        info!(setter = %setter_nickname, %channel, mode = %mode_char, enable, "mode changed");
    }
    if persist {
        broker.persist_channels();
    }
    Outcome::Continue
}
