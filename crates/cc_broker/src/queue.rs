//! Offline message queue.
//!
//! One FIFO per recipient, holding ready-to-deliver wire lines exactly as
//! they would have gone out live; the broker performs no transformation on
//! replay. Capacity is bounded per user with drop-oldest semantics; entries
//! expire at `timestamp + ttl`. Persistence is one file per recipient under
//! the queue directory plus a `_stats.json` counter file, flushed on a
//! timer and at shutdown.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cc_proto::unix_now;

use crate::persist::{load_json, write_json_atomic};

/// Seven days, the default envelope TTL.
pub const DEFAULT_TTL_SECS: u64 = 604_800;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub recipient_id: String,
    pub sender_id: String,
    pub sender_nickname: String,
    pub message_type: String,
    /// The full JSON envelope line, stored verbatim.
    pub encrypted_content: String,
    pub timestamp: f64,
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl QueuedMessage {
    pub fn is_expired(&self, now: f64) -> bool {
        now > self.timestamp + self.ttl as f64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_queued: u64,
    pub total_delivered: u64,
    pub total_expired: u64,
    pub total_dropped: u64,
}

pub struct OfflineQueue {
    dir: PathBuf,
    max_per_user: usize,
    default_ttl: u64,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    stats: QueueStats,
}

impl OfflineQueue {
    pub fn load(dir: PathBuf, max_per_user: usize, default_ttl: u64) -> Self {
        let mut queue = Self {
            dir,
            max_per_user,
            default_ttl,
            queues: HashMap::new(),
            stats: QueueStats::default(),
        };
        queue.load_from_disk();
        queue
    }

    /// Queue an envelope for an offline recipient. Always succeeds; when the
    /// queue is at capacity the oldest entry is evicted and counted.
    pub fn enqueue(
        &mut self,
        recipient_id: &str,
        sender_id: &str,
        sender_nickname: &str,
        message_type: &str,
        encrypted_content: String,
        ttl: Option<u64>,
        metadata: Option<serde_json::Value>,
    ) {
        let now = unix_now();
        let message = QueuedMessage {
            message_id: format!("{recipient_id}_{}", (now * 1_000_000.0) as i64),
            recipient_id: recipient_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_nickname: sender_nickname.to_string(),
            message_type: message_type.to_string(),
            encrypted_content,
            timestamp: now,
            ttl: ttl.unwrap_or(self.default_ttl),
            metadata,
        };

        let queue = self.queues.entry(recipient_id.to_string()).or_default();
        if queue.len() >= self.max_per_user {
            queue.pop_front();
            self.stats.total_dropped += 1;
            warn!(recipient = recipient_id, "message queue full, dropping oldest");
        }
        queue.push_back(message);
        self.stats.total_queued += 1;
    }

    /// Drain all non-expired envelopes for a recipient, oldest first.
    pub fn dequeue_all(&mut self, recipient_id: &str) -> Vec<QueuedMessage> {
        let Some(mut queue) = self.queues.remove(recipient_id) else {
            return Vec::new();
        };
        let now = unix_now();
        let mut delivered = Vec::new();
        while let Some(message) = queue.pop_front() {
            if message.is_expired(now) {
                self.stats.total_expired += 1;
                continue;
            }
            delivered.push(message);
        }
        self.stats.total_delivered += delivered.len() as u64;
        if !delivered.is_empty() {
            info!(
                recipient = recipient_id,
                count = delivered.len(),
                "delivering queued messages"
            );
        }
        delivered
    }

    pub fn queue_len(&self, recipient_id: &str) -> usize {
        self.queues.get(recipient_id).map_or(0, VecDeque::len)
    }

    /// Eager expiry pass. Returns the number of envelopes removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = unix_now();
        let mut removed = 0;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| !m.is_expired(now));
            removed += before - queue.len();
            !queue.is_empty()
        });
        self.stats.total_expired += removed as u64;
        if removed > 0 {
            info!(removed, "queue cleanup removed expired messages");
        }
        removed
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }

    pub fn waiting_total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }

    /// Flush every queue to disk and remove files for queues that have
    /// drained since the last flush (so a restart cannot redeliver them).
    pub fn save_to_disk(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(error = %e, "cannot create queue directory");
            return;
        }
        for (recipient_id, queue) in &self.queues {
            if queue.is_empty() {
                continue;
            }
            let path = self.dir.join(format!("{recipient_id}.json"));
            let messages: Vec<&QueuedMessage> = queue.iter().collect();
            if let Err(e) = write_json_atomic(&path, &messages) {
                warn!(recipient = %recipient_id, error = %e, "failed to save queue");
            }
        }
        self.remove_stale_files();
        if let Err(e) = write_json_atomic(&self.dir.join("_stats.json"), &self.stats) {
            warn!(error = %e, "failed to save queue stats");
        }
    }

    fn remove_stale_files(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(recipient) = name.strip_suffix(".json") else {
                continue;
            };
            if recipient == "_stats" || recipient.ends_with(".tmp") {
                continue;
            }
            if !self.queues.contains_key(recipient) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    fn load_from_disk(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let now = unix_now();
        let mut loaded_messages = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(recipient) = name.strip_suffix(".json") else {
                continue;
            };
            if recipient == "_stats" {
                continue;
            }
            let Some(messages) = load_json::<Vec<QueuedMessage>>(&entry.path()) else {
                continue;
            };
            let live: VecDeque<QueuedMessage> = messages
                .into_iter()
                .filter(|m| !m.is_expired(now))
                .collect();
            if live.is_empty() {
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            loaded_messages += live.len();
            self.queues.insert(recipient.to_string(), live);
        }
        if let Some(stats) = load_json::<QueueStats>(&self.dir.join("_stats.json")) {
            self.stats = stats;
        }
        if loaded_messages > 0 {
            info!(
                messages = loaded_messages,
                queues = self.queues.len(),
                "loaded persisted message queues"
            );
        }
        debug!(queues = self.queues.len(), "message queue initialised");
    }
}
