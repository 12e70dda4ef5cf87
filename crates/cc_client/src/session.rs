//! TCP transport around [`EndpointCore`].
//!
//! The session owns the read half and a writer task draining an outbound
//! channel, mirroring the broker's session shape. Hosts poll
//! [`ClientSession::next_event`] and issue commands through the delegating
//! methods (or [`ClientSession::with_core`] for anything else); every
//! command flushes the core's outbound buffer to the socket.

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use cc_proto::codec::write_line;
use cc_proto::{FrameReader, ReadOutcome, UserStatus, MAX_FRAME_BYTES};

use crate::endpoint::EndpointCore;
use crate::error::ClientError;
use crate::events::ClientEvent;

pub struct ClientSession {
    core: EndpointCore,
    reader: FrameReader<OwnedReadHalf>,
    writer_tx: mpsc::UnboundedSender<String>,
    writer_task: JoinHandle<()>,
    pending: VecDeque<ClientEvent>,
}

impl ClientSession {
    /// Connect and send the registration frame. The registration ack
    /// arrives as the first [`ClientEvent::Registered`] event.
    pub async fn connect(
        addr: &str,
        nickname: &str,
        state_dir: PathBuf,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(line) = writer_rx.recv().await {
                if write_line(&mut writer, &line).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut core = EndpointCore::new(nickname, state_dir);
        core.register();
        let mut session = Self {
            core,
            reader: FrameReader::new(read_half, MAX_FRAME_BYTES),
            writer_tx,
            writer_task,
            pending: VecDeque::new(),
        };
        session.flush_outbound();
        Ok(session)
    }

    /// Next event from the broker, or `None` when the connection closes.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            match self.reader.next().await? {
                ReadOutcome::Eof => return Ok(None),
                ReadOutcome::Oversized => {
                    debug!("dropped oversized frame from broker");
                }
                ReadOutcome::Line(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    let events = self.core.handle_line(&line);
                    // Handling may queue protocol replies (rekey responses).
                    self.flush_outbound();
                    self.pending.extend(events);
                }
            }
        }
    }

    /// Run a command against the protocol core and flush whatever it
    /// queued for the wire.
    pub fn with_core<R>(&mut self, f: impl FnOnce(&mut EndpointCore) -> R) -> R {
        let result = f(&mut self.core);
        self.flush_outbound();
        result
    }

    fn flush_outbound(&mut self) {
        for line in self.core.take_outbound() {
            let _ = self.writer_tx.send(line);
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.core.user_id()
    }

    pub fn nickname(&self) -> &str {
        self.core.nickname()
    }

    // ── Common command delegates ─────────────────────────────────────────

    pub fn join_channel(
        &mut self,
        channel: &str,
        password: Option<String>,
        creator_password: Option<String>,
    ) {
        self.with_core(|core| core.join_channel(channel, password, creator_password));
    }

    pub fn leave_channel(&mut self, channel: &str) {
        self.with_core(|core| core.leave_channel(channel));
    }

    pub fn respond_op_password(&mut self, channel: &str, password: &str) {
        self.with_core(|core| core.respond_op_password(channel, password));
    }

    pub fn send_private_message(&mut self, to_id: &str, text: &str) -> Result<(), ClientError> {
        self.with_core(|core| core.send_private_message(to_id, text))
    }

    pub fn send_channel_message(&mut self, channel: &str, text: &str) -> Result<(), ClientError> {
        self.with_core(|core| core.send_channel_message(channel, text))
    }

    pub fn set_status(&mut self, status: UserStatus, message: &str) {
        self.with_core(|core| core.set_status(status, message));
    }

    pub fn initiate_rekey(&mut self, peer_id: &str) -> Result<(), ClientError> {
        self.with_core(|core| core.initiate_rekey(peer_id))
    }

    pub fn send_file(&mut self, to_id: &str, path: &std::path::Path) -> Result<String, ClientError> {
        self.with_core(|core| core.send_file(to_id, path))
    }

    pub fn accept_transfer(&mut self, transfer_id: &str) -> Result<(), ClientError> {
        let events = self.with_core(|core| core.accept_transfer(transfer_id))?;
        self.pending.extend(events);
        Ok(())
    }

    pub fn decline_transfer(&mut self, transfer_id: &str) {
        self.with_core(|core| core.decline_transfer(transfer_id));
    }

    /// Announce departure and stop the writer. The broker runs its
    /// disconnect cleanup when the socket drops.
    pub async fn close(mut self) {
        self.with_core(|core| core.disconnect());
        drop(self.writer_tx);
        let _ = self.writer_task.await;
    }
}
