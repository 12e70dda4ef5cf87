//! Chunked encrypted file transfer.
//!
//! Sender side: validate (must exist, non-empty, at most 100 MiB), split
//! into 32 KiB plaintext chunks, encrypt the metadata blob and every chunk
//! with the pairwise key, emit `image_start` / `image_chunk` / `image_end`.
//!
//! Receiver side: on `image_start` the host is asked to accept or decline.
//! Chunks that arrive before the decision are held encrypted; accepting
//! decrypts the backlog and everything after, declining drops all state.
//! Progress is checkpointed to one JSON file per transfer so an interrupted
//! receive can be re-entered by a later process.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ClientError;

pub const CHUNK_SIZE: usize = 32 * 1024;
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Durable resume checkpoint, one file per transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    pub transfer_id: String,
    pub direction: String,
    pub total_chunks: u32,
    pub received_indices: Vec<u32>,
    pub metadata: FileMetadata,
}

pub struct IncomingTransfer {
    pub from_id: String,
    pub from_nickname: String,
    pub total_chunks: u32,
    pub metadata: FileMetadata,
    /// Encrypted chunks held until the host decides.
    pending: Vec<(u32, String, String)>,
    chunks: BTreeMap<u32, Vec<u8>>,
    accepted: Option<bool>,
}

impl IncomingTransfer {
    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total_chunks
    }
}

pub struct TransferManager {
    state_dir: PathBuf,
    incoming: HashMap<String, IncomingTransfer>,
}

impl TransferManager {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            incoming: HashMap::new(),
        }
    }

    // ── Sender side ──────────────────────────────────────────────────────

    /// Read and chunk a file for sending. Returns the plaintext chunks and
    /// the metadata blob to encrypt.
    pub fn prepare_file(path: &Path) -> Result<(Vec<Vec<u8>>, FileMetadata), ClientError> {
        let meta = std::fs::metadata(path)
            .map_err(|_| ClientError::Transfer("File does not exist".into()))?;
        if !meta.is_file() {
            return Err(ClientError::Transfer("Path is not a file".into()));
        }
        if meta.len() == 0 {
            return Err(ClientError::Transfer("File is empty".into()));
        }
        if meta.len() > MAX_FILE_SIZE {
            return Err(ClientError::Transfer(format!(
                "File too large (max {}MB)",
                MAX_FILE_SIZE / (1024 * 1024)
            )));
        }

        let data = std::fs::read(path)?;
        let chunks: Vec<Vec<u8>> = data.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let metadata = FileMetadata {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: meta.len(),
            mime_type: Some(guess_mime_type(path).to_string()),
        };
        Ok((chunks, metadata))
    }

    // ── Receiver side ────────────────────────────────────────────────────

    pub fn begin_incoming(
        &mut self,
        transfer_id: &str,
        from_id: &str,
        from_nickname: &str,
        total_chunks: u32,
        metadata: FileMetadata,
    ) {
        self.incoming.insert(
            transfer_id.to_string(),
            IncomingTransfer {
                from_id: from_id.to_string(),
                from_nickname: from_nickname.to_string(),
                total_chunks,
                metadata,
                pending: Vec::new(),
                chunks: BTreeMap::new(),
                accepted: None,
            },
        );
        self.checkpoint(transfer_id);
    }

    pub fn get(&self, transfer_id: &str) -> Option<&IncomingTransfer> {
        self.incoming.get(transfer_id)
    }

    /// Whether the host has accepted this transfer yet.
    pub fn decision(&self, transfer_id: &str) -> Option<bool> {
        self.incoming.get(transfer_id).and_then(|t| t.accepted)
    }

    /// Hold an encrypted chunk while the decision is pending. Returns false
    /// for unknown transfers.
    pub fn queue_encrypted_chunk(
        &mut self,
        transfer_id: &str,
        index: u32,
        data_b64: String,
        nonce_b64: String,
    ) -> bool {
        match self.incoming.get_mut(transfer_id) {
            Some(transfer) => {
                transfer.pending.push((index, data_b64, nonce_b64));
                true
            }
            None => false,
        }
    }

    /// Accept: hand back the encrypted backlog for decryption.
    pub fn accept(&mut self, transfer_id: &str) -> Option<Vec<(u32, String, String)>> {
        let transfer = self.incoming.get_mut(transfer_id)?;
        transfer.accepted = Some(true);
        Some(std::mem::take(&mut transfer.pending))
    }

    /// Decline: drop every trace of the transfer.
    pub fn decline(&mut self, transfer_id: &str) {
        self.incoming.remove(transfer_id);
        self.clear_checkpoint(transfer_id);
    }

    pub fn add_plain_chunk(&mut self, transfer_id: &str, index: u32, data: Vec<u8>) {
        // Checkpoint every 32 chunks (1 MiB) rather than per chunk.
        let should_checkpoint = match self.incoming.get_mut(transfer_id) {
            Some(transfer) => {
                transfer.chunks.insert(index, data);
                transfer.chunks.len() % 32 == 0
            }
            None => false,
        };
        if should_checkpoint {
            self.checkpoint(transfer_id);
        }
    }

    /// Finish an accepted, complete transfer: reassemble in chunk order.
    pub fn finish(&mut self, transfer_id: &str) -> Result<(Vec<u8>, FileMetadata), ClientError> {
        let transfer = self
            .incoming
            .get(transfer_id)
            .ok_or_else(|| ClientError::Transfer(format!("Unknown transfer {transfer_id}")))?;
        if transfer.accepted != Some(true) {
            return Err(ClientError::Transfer("Transfer was not accepted".into()));
        }
        if !transfer.is_complete() {
            return Err(ClientError::Transfer(format!(
                "Transfer incomplete: {}/{} chunks",
                transfer.received(),
                transfer.total_chunks
            )));
        }
        let transfer = self.incoming.remove(transfer_id).expect("checked above");
        let mut data = Vec::with_capacity(transfer.metadata.size as usize);
        for chunk in transfer.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }
        self.clear_checkpoint(transfer_id);
        Ok((data, transfer.metadata))
    }

    // ── Resume state ─────────────────────────────────────────────────────

    fn checkpoint(&self, transfer_id: &str) {
        let Some(transfer) = self.incoming.get(transfer_id) else {
            return;
        };
        if std::fs::create_dir_all(&self.state_dir).is_err() {
            return;
        }
        let state = TransferState {
            transfer_id: transfer_id.to_string(),
            direction: "receiving".to_string(),
            total_chunks: transfer.total_chunks,
            received_indices: transfer.chunks.keys().copied().collect(),
            metadata: transfer.metadata.clone(),
        };
        let path = self.state_path(transfer_id);
        match serde_json::to_vec_pretty(&state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(error = %e, "failed to checkpoint transfer state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize transfer state"),
        }
    }

    fn clear_checkpoint(&self, transfer_id: &str) {
        let _ = std::fs::remove_file(self.state_path(transfer_id));
    }

    /// Re-enter a previously checkpointed receive. The already-received
    /// chunk indices tell the sender what to re-request.
    pub fn load_resumable(&self, transfer_id: &str) -> Option<TransferState> {
        let data = std::fs::read_to_string(self.state_path(transfer_id)).ok()?;
        serde_json::from_str(&data).ok()
    }

    pub fn list_resumable(&self) -> Vec<TransferState> {
        let Ok(entries) = std::fs::read_dir(&self.state_dir) else {
            return Vec::new();
        };
        let mut states = Vec::new();
        for entry in entries.flatten() {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(data) = std::fs::read_to_string(entry.path()) {
                if let Ok(state) = serde_json::from_str::<TransferState>(&data) {
                    states.push(state);
                }
            }
        }
        states
    }

    /// Rebuild in-memory state from a checkpoint; chunks must be
    /// re-requested from the sender (the payload bytes are not persisted).
    pub fn resume_incoming(&mut self, state: TransferState, from_id: &str, from_nickname: &str) {
        debug!(transfer = %state.transfer_id, "resuming incoming transfer");
        self.incoming.insert(
            state.transfer_id.clone(),
            IncomingTransfer {
                from_id: from_id.to_string(),
                from_nickname: from_nickname.to_string(),
                total_chunks: state.total_chunks,
                metadata: state.metadata,
                pending: Vec::new(),
                chunks: BTreeMap::new(),
                accepted: Some(true),
            },
        );
    }

    fn state_path(&self, transfer_id: &str) -> PathBuf {
        self.state_dir.join(format!("{transfer_id}.json"))
    }
}

pub fn guess_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
