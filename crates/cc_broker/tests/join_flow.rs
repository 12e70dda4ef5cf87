//! Join state-machine flows: channel creation, rejoin with stored
//! credentials, creator-password bypass, and the password gates.

mod util;

use cc_broker::session::Outcome;
use cc_proto::{Payload, PromptAction};
use util::TestBroker;

#[tokio::test]
async fn channel_creation_prompts_then_admits_owner() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");

    // Creating a channel demands a creator password.
    alice.send(Payload::JoinChannel {
        channel: "#dev".into(),
        password: None,
        creator_password: None,
        user_id: None,
        nickname: None,
        public_key: None,
        is_operator: None,
        is_mod: None,
        is_owner: None,
    });
    match alice.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("creator password")),
        other => panic!("expected error, got {other:?}"),
    }

    alice.join("#dev", None, Some("opensesame".to_string()));
    match alice.recv_payload() {
        Payload::OpPasswordRequest {
            channel, action, ..
        } => {
            assert_eq!(channel, "#dev");
            assert_eq!(action, PromptAction::Set);
        }
        other => panic!("expected op_password_request, got {other:?}"),
    }

    alice.send(Payload::OpPasswordResponse {
        channel: "#dev".into(),
        password: "opensesame".into(),
    });
    match alice.recv_payload() {
        Payload::Ack {
            success,
            channel,
            members,
            is_operator,
            is_owner,
            channel_key,
            ..
        } => {
            assert!(success);
            assert_eq!(channel.as_deref(), Some("#dev"));
            let members = members.unwrap();
            assert_eq!(members.len(), 1);
            assert_eq!(members[0].user_id, "user_alice");
            assert!(members[0].is_operator);
            assert!(members[0].is_owner);
            assert_eq!(is_operator, Some(true));
            assert_eq!(is_owner, Some(true));
            assert!(!channel_key.unwrap().is_empty());
        }
        other => panic!("expected join ack, got {other:?}"),
    }
}

#[tokio::test]
async fn second_join_skips_prompt_and_fans_out() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    alice.register("alice");
    bob.register("bob");
    alice.create_channel("#dev", "opensesame");
    alice.drain();
    bob.drain();

    bob.join("#dev", None, None);

    // Bob gets the full member list before anyone else hears about him.
    match bob.recv_payload() {
        Payload::Ack {
            members,
            is_operator,
            ..
        } => {
            let members = members.unwrap();
            assert_eq!(members.len(), 2);
            assert_eq!(is_operator, Some(false));
        }
        other => panic!("expected join ack, got {other:?}"),
    }
    match alice.recv_payload() {
        Payload::JoinChannel {
            user_id, nickname, ..
        } => {
            assert_eq!(user_id.as_deref(), Some("user_bob"));
            assert_eq!(nickname.as_deref(), Some("bob"));
        }
        other => panic!("expected join fan-out, got {other:?}"),
    }
}

#[tokio::test]
async fn grant_then_rejoin_requires_stored_password() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    let mut bob = broker.client();
    alice.register("alice");
    bob.register("bob");
    alice.create_channel("#dev", "opensesame");
    bob.join("#dev", None, None);
    alice.drain();
    bob.drain();

    // Owner grants operator; Bob must set a role password.
    alice.send(Payload::OpUser {
        channel: "#dev".into(),
        target_nickname: Some("bob".into()),
        user_id: None,
        nickname: None,
        granted_by: None,
    });
    match bob.recv_payload() {
        Payload::OpPasswordRequest {
            action, granted_by, ..
        } => {
            assert_eq!(action, PromptAction::Set);
            assert_eq!(granted_by.as_deref(), Some("alice"));
        }
        other => panic!("expected grant prompt, got {other:?}"),
    }
    alice.drain(); // "Password request sent" ack

    bob.send(Payload::OpPasswordResponse {
        channel: "#dev".into(),
        password: "bobpass".into(),
    });
    // Both members see the op_user broadcast.
    match bob.recv_payload() {
        Payload::OpUser {
            user_id, granted_by, ..
        } => {
            assert_eq!(user_id.as_deref(), Some("user_bob"));
            assert_eq!(granted_by.as_deref(), Some("alice"));
        }
        other => panic!("expected op_user broadcast, got {other:?}"),
    }
    assert!(matches!(alice.recv_payload(), Payload::OpUser { .. }));

    // Bob drops; role persistence survives the disconnect.
    bob.disconnect(&broker);
    alice.drain();

    let mut bob = broker.client();
    bob.register("bob");
    bob.drain();
    bob.join("#dev", None, None);
    match bob.recv_payload() {
        Payload::OpPasswordRequest { action, .. } => assert_eq!(action, PromptAction::Verify),
        other => panic!("expected verify prompt, got {other:?}"),
    }

    bob.send(Payload::OpPasswordResponse {
        channel: "#dev".into(),
        password: "bobpass".into(),
    });
    match bob.recv_payload() {
        Payload::Ack { is_operator, .. } => assert_eq!(is_operator, Some(true)),
        other => panic!("expected join ack, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_rejoin_password_terminates_session() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");
    alice.create_channel("#dev", "opensesame");
    alice.disconnect(&broker);

    let mut alice = broker.client();
    alice.register("alice");
    alice.drain();
    alice.join("#dev", None, None);
    assert!(matches!(
        alice.recv_payload(),
        Payload::OpPasswordRequest { .. }
    ));

    let outcome = alice.send(Payload::OpPasswordResponse {
        channel: "#dev".into(),
        password: "wrong".into(),
    });
    assert_eq!(outcome, Outcome::Close);
    match alice.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("Incorrect operator password")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn creator_password_bypasses_role_prompt() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");
    alice.create_channel("#dev", "opensesame");
    alice.disconnect(&broker);

    let mut alice = broker.client();
    alice.register("alice");
    alice.drain();
    alice.join("#dev", None, Some("opensesame".to_string()));
    // Straight to the ack: no prompt when the creator password matches.
    match alice.recv_payload() {
        Payload::Ack {
            is_operator,
            is_owner,
            ..
        } => {
            assert_eq!(is_operator, Some(true));
            assert_eq!(is_owner, Some(true));
        }
        other => panic!("expected join ack, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_creator_password_rejected() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");
    alice.create_channel("#dev", "opensesame");

    let mut bob = broker.client();
    bob.register("bob");
    bob.drain();
    bob.join("#dev", None, Some("guessing".to_string()));
    match bob.recv_payload() {
        Payload::Error { error, .. } => assert_eq!(error, "Incorrect creator password"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn join_password_gate() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");
    alice.join("#sekrit", Some("hunter2".into()), Some("opensesame".into()));
    alice.send(Payload::OpPasswordResponse {
        channel: "#sekrit".into(),
        password: "opensesame".into(),
    });
    alice.drain();

    let mut bob = broker.client();
    bob.register("bob");
    bob.drain();

    bob.join("#sekrit", None, None);
    match bob.recv_payload() {
        Payload::Error { error, .. } => assert_eq!(error, "Incorrect channel password"),
        other => panic!("expected error, got {other:?}"),
    }
    bob.join("#sekrit", Some("wrong".into()), None);
    assert!(matches!(bob.recv_payload(), Payload::Error { .. }));

    bob.join("#sekrit", Some("hunter2".into()), None);
    match bob.recv_payload() {
        Payload::Ack {
            is_protected,
            is_operator,
            ..
        } => {
            assert_eq!(is_protected, Some(true));
            assert_eq!(is_operator, Some(false));
        }
        other => panic!("expected join ack, got {other:?}"),
    }
}

#[tokio::test]
async fn nickname_uniqueness_while_session_live() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");

    let mut imposter = broker.client();
    imposter.send(Payload::Register {
        nickname: "alice".into(),
        public_key: "PK2".into(),
        password: None,
        session_token: None,
    });
    match imposter.recv_payload() {
        Payload::Error { error, .. } => assert!(error.contains("already taken")),
        other => panic!("expected error, got {other:?}"),
    }

    // After disconnect the nickname frees up, and the user id is stable.
    alice.disconnect(&broker);
    let mut alice2 = broker.client();
    alice2.register("alice");
    assert_eq!(alice2.user_id.as_deref(), Some("user_alice"));
}

#[tokio::test]
async fn channel_names_normalize() {
    let broker = TestBroker::new();
    let mut alice = broker.client();
    alice.register("alice");
    alice.join("#Dev Chat", None, Some("opensesame".to_string()));
    match alice.recv_payload() {
        Payload::OpPasswordRequest { channel, .. } => assert_eq!(channel, "#dev-chat"),
        other => panic!("expected prompt, got {other:?}"),
    }
}
