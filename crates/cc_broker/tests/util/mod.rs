//! In-process harness: drives the broker's dispatch layer with synthetic
//! sessions, no sockets involved.

use std::sync::Arc;

use tokio::sync::mpsc;

use cc_broker::session::{dispatch, Outcome, SessionCtx};
use cc_broker::{Broker, BrokerConfig};
use cc_proto::{Frame, Payload};

pub struct TestBroker {
    pub broker: Arc<Broker>,
    _dir: tempfile::TempDir,
}

impl TestBroker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(config, dir.path().join("server_data")).unwrap();
        Self { broker, _dir: dir }
    }

    pub fn client(&self) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        TestClient {
            broker: self.broker.clone(),
            session: SessionCtx {
                user_id: None,
                addr: "127.0.0.1:9".to_string(),
                tx,
            },
            rx,
            user_id: None,
        }
    }
}

pub struct TestClient {
    broker: Arc<Broker>,
    pub session: SessionCtx,
    rx: mpsc::UnboundedReceiver<String>,
    pub user_id: Option<String>,
}

impl TestClient {
    pub fn send(&mut self, payload: Payload) -> Outcome {
        dispatch(&self.broker, &mut self.session, Frame::new(payload))
    }

    /// Register and swallow the welcome ack + user list.
    pub fn register(&mut self, nickname: &str) {
        self.send(Payload::Register {
            nickname: nickname.to_string(),
            public_key: format!("PK_{nickname}"),
            password: None,
            session_token: None,
        });
        match self.recv_payload() {
            Payload::Ack {
                success, user_id, ..
            } => {
                assert!(success, "registration refused");
                self.user_id = user_id;
            }
            other => panic!("expected registration ack, got {other:?}"),
        }
        self.drain();
    }

    pub fn join(&mut self, channel: &str, password: Option<String>, creator: Option<String>) {
        self.send(Payload::JoinChannel {
            channel: channel.to_string(),
            password,
            creator_password: creator,
            user_id: None,
            nickname: None,
            public_key: None,
            is_operator: None,
            is_mod: None,
            is_owner: None,
        });
    }

    /// Create a channel and complete the operator-password prompt with the
    /// same secret, leaving this client as admitted owner.
    pub fn create_channel(&mut self, channel: &str, creator_password: &str) {
        self.join(channel, None, Some(creator_password.to_string()));
        match self.recv_payload() {
            Payload::OpPasswordRequest { .. } => {}
            other => panic!("expected op_password_request, got {other:?}"),
        }
        self.send(Payload::OpPasswordResponse {
            channel: channel.to_string(),
            password: creator_password.to_string(),
        });
        match self.recv_payload() {
            Payload::Ack { success: true, .. } => {}
            other => panic!("expected join ack, got {other:?}"),
        }
    }

    pub fn recv_line(&mut self) -> String {
        self.rx
            .try_recv()
            .expect("expected a frame, outbox was empty")
    }

    pub fn recv_payload(&mut self) -> Payload {
        Frame::parse(&self.recv_line()).expect("unparseable frame").payload
    }

    pub fn try_recv_payload(&mut self) -> Option<Payload> {
        self.rx
            .try_recv()
            .ok()
            .map(|line| Frame::parse(&line).expect("unparseable frame").payload)
    }

    pub fn drain(&mut self) -> Vec<Payload> {
        let mut drained = Vec::new();
        while let Some(payload) = self.try_recv_payload() {
            drained.push(payload);
        }
        drained
    }

    /// Simulate the socket dropping: the broker runs disconnect cleanup.
    pub fn disconnect(&mut self, harness: &TestBroker) {
        if let Some(user_id) = self.session.user_id.clone() {
            harness.broker.disconnect_user(&user_id);
        }
    }
}
