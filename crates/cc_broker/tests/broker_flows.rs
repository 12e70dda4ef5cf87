//! Routing, queueing, discipline, and rate-limit flows.

mod util;

use cc_proto::{Frame, Payload};
use util::TestBroker;

fn private_message(from: &str, to: &str, marker: &str) -> Payload {
    Payload::PrivateMessage {
        from_id: from.to_string(),
        to_id: to.to_string(),
        encrypted_data: format!("CT_{marker}"),
        nonce: "Tm9uY2U=".to_string(),
        from_nickname: None,
    }
}

fn channel_message(from: &str, channel: &str, marker: &str) -> Payload {
    Payload::ChannelMessage {
        from_id: Some(from.to_string()),
        to_id: Some(channel.to_string()),
        encrypted_data: Some(format!("CT_{marker}")),
        nonce: Some("Tm9uY2U=".to_string()),
        from_nickname: None,
        channel: None,
        sender: None,
        text: None,
    }
}

#[tokio::test]
async fn offline_messages_queue_and_replay_in_order() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");

    for i in 0..3 {
        alice.send(private_message("user_alice", "user_carol", &format!("{i}")));
        match alice.recv_payload() {
            Payload::Ack { message, .. } => {
                assert!(message.unwrap().contains("offline"));
            }
            other => panic!("expected queue ack, got {other:?}"),
        }
    }

    // Carol connects: queued envelopes replay, stamped and in order,
    // before the delivery notice and user list.
    let mut carol = broker.client();
    carol.send(Payload::Register {
        nickname: "carol".into(),
        public_key: "PK_carol".into(),
        password: None,
        session_token: None,
    });
    assert!(matches!(carol.recv_payload(), Payload::Ack { .. }));
    for i in 0..3 {
        match carol.recv_payload() {
            Payload::PrivateMessage {
                encrypted_data,
                from_nickname,
                ..
            } => {
                assert_eq!(encrypted_data, format!("CT_{i}"));
                assert_eq!(from_nickname.as_deref(), Some("alice"));
            }
            other => panic!("expected queued message, got {other:?}"),
        }
    }
    match carol.recv_payload() {
        Payload::Ack { message, .. } => {
            assert_eq!(message.as_deref(), Some("Delivered 3 queued message(s)"));
        }
        other => panic!("expected delivery notice, got {other:?}"),
    }
    assert!(matches!(carol.recv_payload(), Payload::UserList { .. }));
}

#[tokio::test]
async fn timed_ban_blocks_until_expiry() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut eve = broker.client();
    alice.register("alice");
    eve.register("eve");
    alice.create_channel("#dev", "opensesame");
    eve.join("#dev", None, None);
    alice.drain();
    eve.drain();

    alice.send(Payload::BanUser {
        channel: "#dev".into(),
        target_nickname: Some("eve".into()),
        reason: Some("spam".into()),
        duration: Some(1),
        banned_by: None,
    });
    match alice.recv_payload() {
        Payload::Ack { message, .. } => {
            let message = message.unwrap();
            assert!(message.contains("banned"), "{message}");
        }
        other => panic!("expected ban ack, got {other:?}"),
    }
    // Eve was a member, so she is kicked and told why.
    match eve.recv_payload() {
        Payload::BanUser {
            banned_by, reason, ..
        } => {
            assert_eq!(banned_by.as_deref(), Some("alice"));
            assert_eq!(reason.as_deref(), Some("spam"));
        }
        other => panic!("expected ban notice, got {other:?}"),
    }
    eve.drain();

    eve.join("#dev", None, None);
    match eve.recv_payload() {
        Payload::Error { error, .. } => {
            assert!(error.contains("banned"));
            assert!(error.contains("spam"));
        }
        other => panic!("expected ban rejection, got {other:?}"),
    }

    // Past expiry the lazy check clears the record and the join succeeds.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    eve.join("#dev", None, None);
    match eve.recv_payload() {
        Payload::Ack { success: true, .. } => {}
        other => panic!("expected join ack after expiry, got {other:?}"),
    }
}

#[tokio::test]
async fn permanent_ban_and_unban() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut eve = broker.client();
    alice.register("alice");
    eve.register("eve");
    alice.create_channel("#dev", "opensesame");
    eve.join("#dev", None, None);
    alice.drain();
    eve.drain();

    alice.send(Payload::BanUser {
        channel: "#dev".into(),
        target_nickname: Some("eve".into()),
        reason: None,
        duration: None,
        banned_by: None,
    });
    alice.drain();
    eve.drain();

    eve.join("#dev", None, None);
    assert!(matches!(eve.recv_payload(), Payload::Error { .. }));

    alice.send(Payload::UnbanUser {
        channel: "#dev".into(),
        target_nickname: Some("eve".into()),
        unbanned_by: None,
    });
    alice.drain();
    eve.drain();

    eve.join("#dev", None, None);
    assert!(matches!(eve.recv_payload(), Payload::Ack { success: true, .. }));
}

#[tokio::test]
async fn moderated_channel_gates_unprivileged_senders() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    alice.register("alice");
    bob.register("bob");
    alice.create_channel("#dev", "opensesame");
    bob.join("#dev", None, None);
    alice.drain();
    bob.drain();

    alice.send(Payload::SetMode {
        channel: "#dev".into(),
        mode: "m".into(),
        enable: true,
    });
    alice.drain();
    bob.drain();

    bob.send(channel_message("user_bob", "#dev", "blocked"));
    match bob.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("moderated")),
        other => panic!("expected moderation error, got {other:?}"),
    }
    assert!(alice.try_recv_payload().is_none());

    // The owner is unaffected by +m.
    alice.send(channel_message("user_alice", "#dev", "allowed"));
    match bob.recv_payload() {
        Payload::ChannelMessage {
            encrypted_data,
            from_nickname,
            ..
        } => {
            assert_eq!(encrypted_data.as_deref(), Some("CT_allowed"));
            assert_eq!(from_nickname.as_deref(), Some("alice"));
        }
        other => panic!("expected routed message, got {other:?}"),
    }
}

#[tokio::test]
async fn message_rate_limit_drops_thirty_first() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    alice.register("alice");
    bob.register("bob");
    alice.create_channel("#dev", "opensesame");
    bob.join("#dev", None, None);
    alice.drain();
    bob.drain();

    for i in 0..30 {
        alice.send(channel_message("user_alice", "#dev", &format!("{i}")));
    }
    assert_eq!(bob.drain().len(), 30);
    assert!(alice.try_recv_payload().is_none());

    alice.send(channel_message("user_alice", "#dev", "over"));
    match alice.recv_payload() {
        Payload::Error {
            error,
            retry_after_seconds,
        } => {
            assert!(error.contains("rate limit"));
            let retry = retry_after_seconds.unwrap();
            assert!(retry > 0.0 && retry <= 10.0);
        }
        other => panic!("expected rate-limit error, got {other:?}"),
    }
    assert!(bob.try_recv_payload().is_none());
}

#[tokio::test]
async fn kick_hierarchy_is_enforced() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    let mut mallory = broker.client();
    alice.register("alice");
    bob.register("bob");
    mallory.register("mallory");
    alice.create_channel("#dev", "opensesame");
    bob.join("#dev", None, None);
    mallory.join("#dev", None, None);
    alice.drain();
    bob.drain();
    mallory.drain();

    // Plain members cannot kick.
    mallory.send(Payload::KickUser {
        channel: "#dev".into(),
        target_nickname: Some("bob".into()),
        reason: None,
        kicked_by: None,
    });
    assert!(matches!(mallory.recv_payload(), Payload::Error { .. }));

    // Nobody kicks the owner.
    mallory.drain();
    bob.drain();

    // Promote bob to mod so he can kick mallory.
    alice.send(Payload::ModUser {
        channel: "#dev".into(),
        target_nickname: Some("bob".into()),
        user_id: None,
        nickname: None,
        granted_by: None,
    });
    assert!(matches!(bob.recv_payload(), Payload::OpPasswordRequest { .. }));
    bob.send(Payload::OpPasswordResponse {
        channel: "#dev".into(),
        password: "bobpass".into(),
    });
    alice.drain();
    bob.drain();
    mallory.drain();

    bob.send(Payload::KickUser {
        channel: "#dev".into(),
        target_nickname: Some("alice".into()),
        reason: None,
        kicked_by: None,
    });
    match bob.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("owner")),
        other => panic!("expected error, got {other:?}"),
    }

    bob.send(Payload::KickUser {
        channel: "#dev".into(),
        target_nickname: Some("mallory".into()),
        reason: Some("being mallory".into()),
        kicked_by: None,
    });
    assert!(matches!(bob.recv_payload(), Payload::Ack { .. }));
    match mallory.recv_payload() {
        Payload::KickUser {
            kicked_by, reason, ..
        } => {
            assert_eq!(kicked_by.as_deref(), Some("bob"));
            assert_eq!(reason.as_deref(), Some("being mallory"));
        }
        other => panic!("expected kick notice, got {other:?}"),
    }
    // The owner sees the server announcement.
    match alice.recv_payload() {
        Payload::ChannelMessage { sender, text, .. } => {
            assert_eq!(sender.as_deref(), Some("SERVER"));
            assert!(text.unwrap().contains("kicked"));
        }
        other => panic!("expected announcement, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_fans_out_and_frees_slots() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    alice.register("alice");
    bob.register("bob");
    alice.create_channel("#dev", "opensesame");
    bob.join("#dev", None, None);
    alice.drain();
    bob.drain();

    bob.disconnect(&broker);
    match alice.recv_payload() {
        Payload::LeaveChannel {
            user_id, channel, ..
        } => {
            assert_eq!(user_id.as_deref(), Some("user_bob"));
            assert_eq!(channel, "#dev");
        }
        other => panic!("expected leave fan-out, got {other:?}"),
    }
    match alice.recv_payload() {
        Payload::Disconnect { user_id, .. } => {
            assert_eq!(user_id.as_deref(), Some("user_bob"));
        }
        other => panic!("expected disconnect broadcast, got {other:?}"),
    }

    // Cleanup ran exactly once; a second disconnect is a no-op.
    assert!(!broker.broker.disconnect_user("user_bob"));
}

#[tokio::test]
async fn ownership_transfer_requires_operator_target() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    alice.register("alice");
    bob.register("bob");
    alice.create_channel("#dev", "opensesame");
    bob.join("#dev", None, None);
    alice.drain();
    bob.drain();

    alice.send(Payload::TransferOwnership {
        channel: "#dev".into(),
        target_nickname: "bob".into(),
    });
    match alice.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("operator")),
        other => panic!("expected error, got {other:?}"),
    }

    // Promote bob, then transfer.
    alice.send(Payload::OpUser {
        channel: "#dev".into(),
        target_nickname: Some("bob".into()),
        user_id: None,
        nickname: None,
        granted_by: None,
    });
    bob.recv_payload(); // prompt
    bob.send(Payload::OpPasswordResponse {
        channel: "#dev".into(),
        password: "bobpass".into(),
    });
    alice.drain();
    bob.drain();

    alice.send(Payload::TransferOwnership {
        channel: "#dev".into(),
        target_nickname: "bob".into(),
    });
    assert!(matches!(alice.recv_payload(), Payload::Ack { .. }));
    match bob.recv_payload() {
        Payload::Ack { message, .. } => {
            assert!(message.unwrap().contains("owner"));
        }
        other => panic!("expected owner notice, got {other:?}"),
    }
}

#[tokio::test]
async fn status_updates_reach_channel_mates_once() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    alice.register("alice");
    bob.register("bob");
    alice.create_channel("#dev", "opensesame");
    alice.create_channel("#ops", "opensesame");
    bob.join("#dev", None, None);
    bob.join("#ops", None, None);
    alice.drain();
    bob.drain();

    alice.send(Payload::SetStatus {
        status: cc_proto::UserStatus::Away,
        custom_message: "lunch".into(),
    });
    assert!(matches!(alice.recv_payload(), Payload::Ack { .. }));

    // Two shared channels, one status update.
    let updates: Vec<_> = bob
        .drain()
        .into_iter()
        .filter(|p| matches!(p, Payload::StatusUpdate { .. }))
        .collect();
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn unknown_and_unexpected_frames_get_errors() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");

    // A server-to-client tag from a client is answered, not crashed on.
    alice.send(Payload::WhoisResponse {
        nickname: "x".into(),
        user_id: "y".into(),
        channels: vec![],
        online: true,
    });
    match alice.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("Unexpected")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn connection_capacity_rejects_registration() {
    let mut config = cc_broker::BrokerConfig::default();
    config.max_connections = 1;
    let broker = util::TestBroker::with_config(config);

    let mut alice = broker.client();
    alice.register("alice");

    let mut bob = broker.client();
    bob.send(Payload::Register {
        nickname: "bob".into(),
        public_key: "PK_bob".into(),
        password: None,
        session_token: None,
    });
    match bob.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("capacity")),
        other => panic!("expected capacity error, got {other:?}"),
    }
}

#[tokio::test]
async fn required_authentication_gates_registration() {
    let mut config = cc_broker::BrokerConfig::default();
    config.enable_authentication = true;
    config.require_authentication = true;
    let broker = util::TestBroker::with_config(config);

    let mut alice = broker.client();
    alice.send(Payload::Register {
        nickname: "alice".into(),
        public_key: "PK".into(),
        password: None,
        session_token: None,
    });
    match alice.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("Authentication required")),
        other => panic!("expected auth error, got {other:?}"),
    }

    alice.send(Payload::CreateAccount {
        username: "alice".into(),
        password: "password8".into(),
        email: None,
    });
    let token = match alice.recv_payload() {
        Payload::Ack {
            success: true,
            session_token,
            ..
        } => session_token.expect("token expected"),
        other => panic!("expected account ack, got {other:?}"),
    };

    alice.send(Payload::Register {
        nickname: "alice".into(),
        public_key: "PK".into(),
        password: None,
        session_token: Some(token),
    });
    match alice.recv_payload() {
        Payload::Ack {
            success, user_id, ..
        } => {
            assert!(success);
            assert_eq!(user_id.as_deref(), Some("user_alice"));
        }
        other => panic!("expected welcome ack, got {other:?}"),
    }
}

#[tokio::test]
async fn auth_request_mints_session_token() {
    let mut config = cc_broker::BrokerConfig::default();
    config.enable_authentication = true;
    let broker = util::TestBroker::with_config(config);

    let mut alice = broker.client();
    alice.send(Payload::CreateAccount {
        username: "alice".into(),
        password: "password8".into(),
        email: None,
    });
    alice.drain();

    alice.send(Payload::AuthRequest {
        username: "alice".into(),
        password: "wrong".into(),
    });
    match alice.recv_payload() {
        Payload::AuthResponse { success, .. } => assert!(!success),
        other => panic!("expected auth response, got {other:?}"),
    }

    alice.send(Payload::AuthRequest {
        username: "alice".into(),
        password: "password8".into(),
    });
    match alice.recv_payload() {
        Payload::AuthResponse {
            success,
            session_token,
            ..
        } => {
            assert!(success);
            assert!(session_token.is_some());
        }
        other => panic!("expected auth response, got {other:?}"),
    }
}

#[tokio::test]
async fn frames_parse_errors_are_non_fatal() {
    // Parse-level behavior: bad JSON and unknown tags produce errors the
    // session layer answers without closing.
    assert!(Frame::parse("{oops").is_err());
    assert!(Frame::parse(r#"{"version":"1.0","timestamp":0,"type":"warp"}"#).is_err());
}
