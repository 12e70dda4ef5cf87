//! Ciphertext routing.
//!
//! The broker forwards encrypted payloads untouched apart from stamping the
//! sender's nickname. Private traffic to an offline recipient is queued
//! verbatim; channel traffic fans out to the live membership (via the
//! routing cache); image frames relay point-to-point with their own rate
//! bucket.

use tracing::{debug, info};

use cc_proto::{Frame, Payload};

use crate::broker::Broker;
use crate::monitor::Direction;
use crate::session::{require_registered, Outcome, SessionCtx};

/// Answer a rate-limited frame with the standard retry hint and drop it.
fn send_rate_limited(session: &SessionCtx, kind: &str, retry_after_secs: f64) {
    session.send_frame(&Frame::new(Payload::Error {
        error: format!("{kind} rate limit exceeded. Retry after {retry_after_secs:.1} seconds"),
        retry_after_seconds: Some(retry_after_secs),
    }));
}

pub fn handle_private_message(
    broker: &Broker,
    session: &mut SessionCtx,
    mut frame: Frame,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    {
        let mut limiter = broker.message_limiter.lock();
        if !limiter.is_allowed(&user_id) {
            let retry = limiter.retry_after(&user_id).as_secs_f64();
            drop(limiter);
            debug!(user = %user_id, "rate limited private message");
            send_rate_limited(session, "Message", retry);
            return Outcome::Continue;
        }
    }

    let Payload::PrivateMessage { to_id, .. } = &frame.payload else {
        return Outcome::Continue;
    };
    let to_id = to_id.clone();

    let (nickname, delivered_line) = {
        let st = broker.state.lock();
        let nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        if let Payload::PrivateMessage { from_nickname, .. } = &mut frame.payload {
            *from_nickname = Some(nickname.clone());
        }
        let Ok(line) = frame.to_json() else {
            return Outcome::Continue;
        };
        match st.clients.get(&to_id) {
            Some(target) => {
                target.send_line(line.clone());
                (nickname, Some(line))
            }
            None => (nickname, None),
        }
    };

    match delivered_line {
        Some(line) => {
            broker
                .monitor
                .lock()
                .record_message(&to_id, line.len(), Direction::Sent);
            debug!(from = %nickname, to = %to_id, "routed private message");
        }
        None => {
            // Recipient offline: queue the envelope exactly as it would
            // have been delivered.
            let line = frame.to_json().unwrap_or_default();
            broker.queue.lock().enqueue(
                &to_id,
                &user_id,
                &nickname,
                "private_message",
                line,
                None,
                Some(serde_json::json!({ "queued_at": cc_proto::unix_now() })),
            );
            info!(from = %nickname, to = %to_id, "queued message for offline user");
            session.send_ack(format!(
                "User {to_id} is offline. Message queued for delivery."
            ));
        }
    }
    Outcome::Continue
}

pub fn handle_channel_message(
    broker: &Broker,
    session: &mut SessionCtx,
    mut frame: Frame,
) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    {
        let mut limiter = broker.message_limiter.lock();
        if !limiter.is_allowed(&user_id) {
            let retry = limiter.retry_after(&user_id).as_secs_f64();
            drop(limiter);
            debug!(user = %user_id, "rate limited channel message");
            send_rate_limited(session, "Message", retry);
            return Outcome::Continue;
        }
    }

    let Payload::ChannelMessage { to_id, .. } = &frame.payload else {
        return Outcome::Continue;
    };
    let Some(channel) = to_id.clone() else {
        session.send_error("Missing to_id");
        return Outcome::Continue;
    };

    let recipients = {
        let mut guard = broker.state.lock();
        let st = &mut *guard;

        if !st.channels.contains_key(&channel) {
            session.send_error(format!("Channel {channel} not found"));
            return Outcome::Continue;
        }
        if !st.is_member(&channel, &user_id) {
            session.send_error(format!("You are not in channel {channel}"));
            return Outcome::Continue;
        }
        // Moderated mode: only owner, operators, and mods may speak.
        let moderated = st
            .store
            .records
            .get(&channel)
            .map(|r| r.has_mode('m'))
            .unwrap_or(false);
        if moderated && !st.is_privileged(&channel, &user_id) {
            session.send_error("Channel is moderated - only operators and mods can speak");
            return Outcome::Continue;
        }

        let members = {
            let mut routing = broker.routing.lock();
            match routing.get(&channel) {
                Some(cached) => cached,
                None => {
                    let members = st
                        .channels
                        .get(&channel)
                        .map(|c| c.members.clone())
                        .unwrap_or_default();
                    routing.put(&channel, members.clone());
                    members
                }
            }
        };

        let nickname = st
            .clients
            .get(&user_id)
            .map(|c| c.nickname.clone())
            .unwrap_or_default();
        if let Payload::ChannelMessage { from_nickname, .. } = &mut frame.payload {
            *from_nickname = Some(nickname.clone());
        }
        let Ok(line) = frame.to_json() else {
            return Outcome::Continue;
        };

        let mut recipients = Vec::new();
        for member_id in &members {
            if member_id == &user_id {
                continue;
            }
            if let Some(target) = st.clients.get(member_id) {
                target.send_line(line.clone());
                recipients.push((member_id.clone(), line.len()));
            }
        }
        debug!(
            from = %nickname,
            %channel,
            recipients = recipients.len(),
            "routed channel message"
        );
        recipients
    };

    let mut monitor = broker.monitor.lock();
    for (member_id, bytes) in &recipients {
        monitor.record_message(member_id, *bytes, Direction::Sent);
    }
    monitor.record_channel_message(&channel);
    Outcome::Continue
}

pub fn handle_image_message(broker: &Broker, session: &mut SessionCtx, frame: Frame) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    if matches!(frame.payload, Payload::ImageChunk { .. }) {
        let mut limiter = broker.image_limiter.lock();
        if !limiter.is_allowed(&user_id) {
            let retry = limiter.retry_after(&user_id).as_secs_f64();
            drop(limiter);
            debug!(user = %user_id, "rate limited image chunk");
            send_rate_limited(session, "Image transfer", retry);
            return Outcome::Continue;
        }
    }

    let to_id = match &frame.payload {
        Payload::ImageStart { to_id, .. }
        | Payload::ImageChunk { to_id, .. }
        | Payload::ImageEnd { to_id, .. } => to_id.clone(),
        _ => return Outcome::Continue,
    };

    let st = broker.state.lock();
    match st.clients.get(&to_id) {
        Some(target) => {
            if let Ok(line) = frame.to_json() {
                target.send_line(line);
            }
            debug!(from = %user_id, to = %to_id, "routed image frame");
        }
        None => {
            drop(st);
            session.send_error(format!("User {to_id} not found"));
        }
    }
    Outcome::Continue
}

/// Forward a `rekey_request` / `rekey_response` to its target, stamping the
/// sender's identity. The broker never interprets the keys inside.
pub fn handle_rekey(broker: &Broker, session: &mut SessionCtx, frame: Frame) -> Outcome {
    let Some(user_id) = require_registered(session) else {
        return Outcome::Continue;
    };

    let (to_id, new_public_key, is_request) = match &frame.payload {
        Payload::RekeyRequest {
            to_id,
            new_public_key,
            ..
        } => (to_id.clone(), new_public_key.clone(), true),
        Payload::RekeyResponse {
            to_id,
            new_public_key,
            ..
        } => (to_id.clone(), new_public_key.clone(), false),
        _ => return Outcome::Continue,
    };
    let Some(to_id) = to_id else {
        session.send_error("Missing to_id or new_public_key");
        return Outcome::Continue;
    };

    let st = broker.state.lock();
    let Some(target) = st.clients.get(&to_id) else {
        drop(st);
        session.send_error(format!("User {to_id} not found"));
        return Outcome::Continue;
    };
    let nickname = st
        .clients
        .get(&user_id)
        .map(|c| c.nickname.clone())
        .unwrap_or_default();

    let forwarded = if is_request {
        Payload::RekeyRequest {
            from_id: Some(user_id.clone()),
            to_id: None,
            new_public_key,
            from_nickname: Some(nickname.clone()),
        }
    } else {
        Payload::RekeyResponse {
            from_id: Some(user_id.clone()),
            to_id: None,
            new_public_key,
            from_nickname: Some(nickname.clone()),
        }
    };
    target.send_frame(&Frame::new(forwarded));
    info!(
        from = %nickname,
        to = %to_id,
        kind = if is_request { "request" } else { "response" },
        "forwarded rekey"
    );
    Outcome::Continue
}

pub fn handle_public_key_request(
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
            session.send_frame(&Frame::new(Payload::PublicKeyResponse {
                user_id: target.user_id.clone(),
                nickname: target.nickname.clone(),
                public_key: target.public_key.clone(),
            }));
        }
        None => {
            drop(st);
            session.send_error(format!("User {target_nickname} not found"));
        }
    }
    Outcome::Continue
}
