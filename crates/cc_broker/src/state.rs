//! Live broker state.
//!
//! Everything here is transient: it is rebuilt from scratch as sessions
//! connect and join. Durable channel data lives in [`crate::store`], which
//! is embedded here so membership checks and record mutations happen under
//! one lock.
//!
//! The lock discipline: the `BrokerState` mutex is acquired first and never
//! held across an await point. Deliveries are pushes onto per-session
//! unbounded channels, so fan-out inside a critical section cannot block.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::debug;

use cc_proto::{Frame, Payload};

use crate::store::{ChannelStore, Role};

/// A connected, registered session.
pub struct ClientHandle {
    pub user_id: String,
    pub nickname: String,
    pub public_key: String,
    pub status: cc_proto::UserStatus,
    pub status_message: String,
    pub channels: HashSet<String>,
    /// Account username this session authenticated as, when accounts are on.
    pub account_username: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(
        user_id: String,
        nickname: String,
        public_key: String,
        tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            user_id,
            nickname,
            public_key,
            status: cc_proto::UserStatus::Online,
            status_message: String::new(),
            channels: HashSet::new(),
            account_username: None,
            tx,
        }
    }

    /// Queue a frame for delivery. A send to a session that vanished mid-
    /// dispatch silently drops, which is the required cancellation behavior.
    pub fn send_frame(&self, frame: &Frame) {
        match frame.to_json() {
            Ok(line) => self.send_line(line),
            Err(e) => debug!(user = %self.user_id, error = %e, "frame serialisation failed"),
        }
    }

    pub fn send_line(&self, line: String) {
        if self.tx.send(line).is_err() {
            debug!(user = %self.user_id, "dropped delivery to closed session");
        }
    }
}

/// Live per-channel structures: who is present right now, and which of them
/// currently hold active roles. Role *credentials* persist in the store;
/// these sets are re-earned on each join.
#[derive(Default)]
pub struct LiveChannel {
    pub members: HashSet<String>,
    pub operators: HashSet<String>,
    pub mods: HashSet<String>,
}

/// Awaiting an `op_password_response` before a join may complete.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub channel: String,
    pub should_be_op: bool,
    pub is_owner: bool,
    pub is_mod: bool,
}

/// Awaiting an `op_password_response` to finish a role grant.
#[derive(Debug, Clone)]
pub struct PendingGrant {
    pub channel: String,
    pub granted_by: String,
    pub granted_by_id: String,
    pub is_mod: bool,
}

pub struct BrokerState {
    pub clients: HashMap<String, ClientHandle>,
    /// nickname → user id; injective while sessions are live.
    pub nicknames: HashMap<String, String>,
    pub channels: HashMap<String, LiveChannel>,
    pub store: ChannelStore,
    /// At most one pending slot per user (auth and grant are exclusive).
    pub pending_auth: HashMap<String, PendingAuth>,
    pub pending_grant: HashMap<String, PendingGrant>,
}

impl BrokerState {
    pub fn new(store: ChannelStore) -> Self {
        Self {
            clients: HashMap::new(),
            nicknames: HashMap::new(),
            channels: HashMap::new(),
            store,
            pending_auth: HashMap::new(),
            pending_grant: HashMap::new(),
        }
    }

    /// Deterministic, reconnect-stable user id for a nickname.
    pub fn user_id_for(nickname: &str) -> String {
        format!("user_{nickname}")
    }

    pub fn resolve_nickname(&self, nickname: &str) -> Option<&ClientHandle> {
        let user_id = self.nicknames.get(nickname)?;
        self.clients.get(user_id)
    }

    pub fn is_owner(&self, channel: &str, user_id: &str) -> bool {
        self.store
            .records
            .get(channel)
            .map(|r| r.is_owner(user_id))
            .unwrap_or(false)
    }

    pub fn is_operator(&self, channel: &str, user_id: &str) -> bool {
        self.channels
            .get(channel)
            .map(|c| c.operators.contains(user_id))
            .unwrap_or(false)
    }

    pub fn is_mod(&self, channel: &str, user_id: &str) -> bool {
        self.channels
            .get(channel)
            .map(|c| c.mods.contains(user_id))
            .unwrap_or(false)
    }

    /// Owner or live operator: the bar for most channel administration.
    pub fn is_operator_or_owner(&self, channel: &str, user_id: &str) -> bool {
        self.is_operator(channel, user_id) || self.is_owner(channel, user_id)
    }

    /// Anyone allowed to speak in a moderated channel.
    pub fn is_privileged(&self, channel: &str, user_id: &str) -> bool {
        self.is_operator_or_owner(channel, user_id) || self.is_mod(channel, user_id)
    }

    pub fn is_member(&self, channel: &str, user_id: &str) -> bool {
        self.channels
            .get(channel)
            .map(|c| c.members.contains(user_id))
            .unwrap_or(false)
    }

    /// Stored role for a user in a channel, if they hold a credential.
    pub fn stored_role(&self, channel: &str, user_id: &str) -> Option<Role> {
        self.store
            .records
            .get(channel)?
            .operator_passwords
            .get(user_id)
            .map(|c| c.role)
    }

    /// Fan a frame out to every live member of a channel, optionally
    /// excluding one user id.
    pub fn broadcast_to_channel(&self, channel: &str, frame: &Frame, exclude: Option<&str>) {
        let Some(live) = self.channels.get(channel) else {
            return;
        };
        let Ok(line) = frame.to_json() else { return };
        for user_id in &live.members {
            if Some(user_id.as_str()) == exclude {
                continue;
            }
            if let Some(client) = self.clients.get(user_id) {
                client.send_line(line.clone());
            }
        }
    }

    /// Broker-originated plaintext channel announcement.
    pub fn server_announcement(&self, channel: &str, text: &str, exclude: Option<&str>) {
        let frame = Frame::new(Payload::ChannelMessage {
            from_id: None,
            to_id: None,
            encrypted_data: None,
            nonce: None,
            from_nickname: None,
            channel: Some(channel.to_string()),
            sender: Some("SERVER".to_string()),
            text: Some(text.to_string()),
        });
        self.broadcast_to_channel(channel, &frame, exclude);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> BrokerState {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::load(dir.path().join("channels.json"));
        BrokerState::new(store)
    }

    fn handle(user: &str) -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientHandle::new(
                BrokerState::user_id_for(user),
                user.to_string(),
                "PK".to_string(),
                tx,
            ),
            rx,
        )
    }

    #[test]
    fn user_ids_are_deterministic() {
        assert_eq!(BrokerState::user_id_for("alice"), "user_alice");
        assert_eq!(
            BrokerState::user_id_for("alice"),
            BrokerState::user_id_for("alice")
        );
    }

    #[test]
    fn send_to_dropped_session_is_silent() {
        let (client, rx) = handle("ghost");
        drop(rx);
        client.send_frame(&Frame::ack("hello"));
    }

    #[test]
    fn broadcast_respects_exclusion() {
        let mut state = test_state();
        let (alice, mut alice_rx) = handle("alice");
        let (bob, mut bob_rx) = handle("bob");
        state.nicknames.insert("alice".into(), alice.user_id.clone());
        state.nicknames.insert("bob".into(), bob.user_id.clone());

        let mut live = LiveChannel::default();
        live.members.insert(alice.user_id.clone());
        live.members.insert(bob.user_id.clone());
        state.channels.insert("#dev".into(), live);
        let alice_id = alice.user_id.clone();
        state.clients.insert(alice.user_id.clone(), alice);
        state.clients.insert(bob.user_id.clone(), bob);

        state.server_announcement("#dev", "hello", Some(&alice_id));
        assert!(alice_rx.try_recv().is_err());
        let line = bob_rx.try_recv().unwrap();
        assert!(line.contains("\"sender\":\"SERVER\""));
    }
}
