//! Connection accounting and routing cache.
//!
//! Three cooperating pieces: `PerformanceMonitor` (per-connection byte and
//! message counters plus a sliding message-rate window), `ConnectionManager`
//! (capacity gate and idle detection), and `RoutingCache` (channel →
//! member-set cache, invalidated on membership mutation). The cache is an
//! optimization only; the channel state store stays authoritative.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ConnectionMetrics {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            connected_at: now,
            last_activity: now,
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSummary {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_messages: u64,
    pub messages_per_minute: f64,
    pub active_channels: usize,
}

pub struct PerformanceMonitor {
    connections: HashMap<String, ConnectionMetrics>,
    message_times: VecDeque<Instant>,
    channel_messages: HashMap<String, u64>,
    peak_connections: usize,
    total_messages: u64,
    rate_window: Duration,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            message_times: VecDeque::new(),
            channel_messages: HashMap::new(),
            peak_connections: 0,
            total_messages: 0,
            rate_window: Duration::from_secs(60),
        }
    }

    pub fn register_connection(&mut self, user_id: &str) {
        self.connections
            .insert(user_id.to_string(), ConnectionMetrics::new());
        self.peak_connections = self.peak_connections.max(self.connections.len());
    }

    pub fn unregister_connection(&mut self, user_id: &str) {
        self.connections.remove(user_id);
    }

    pub fn record_message(&mut self, user_id: &str, bytes: usize, direction: Direction) {
        let now = Instant::now();
        if let Some(metrics) = self.connections.get_mut(user_id) {
            metrics.last_activity = now;
            match direction {
                Direction::Sent => {
                    metrics.messages_sent += 1;
                    metrics.bytes_sent += bytes as u64;
                }
                Direction::Received => {
                    metrics.messages_received += 1;
                    metrics.bytes_received += bytes as u64;
                }
            }
        }
        self.total_messages += 1;
        self.message_times.push_back(now);
        while let Some(front) = self.message_times.front() {
            if now.duration_since(*front) > self.rate_window {
                self.message_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_channel_message(&mut self, channel: &str) {
        *self.channel_messages.entry(channel.to_string()).or_insert(0) += 1;
    }

    pub fn message_rate_per_minute(&self) -> f64 {
        self.message_times.len() as f64 * 60.0 / self.rate_window.as_secs_f64()
    }

    pub fn metrics(&self, user_id: &str) -> Option<&ConnectionMetrics> {
        self.connections.get(user_id)
    }

    pub fn summary(&self) -> MonitorSummary {
        MonitorSummary {
            active_connections: self.connections.len(),
            peak_connections: self.peak_connections,
            total_messages: self.total_messages,
            messages_per_minute: self.message_rate_per_minute(),
            active_channels: self.channel_messages.len(),
        }
    }

    pub fn log_summary(&self) {
        let s = self.summary();
        info!(
            connections = s.active_connections,
            peak = s.peak_connections,
            total_messages = s.total_messages,
            per_minute = s.messages_per_minute,
            channels = s.active_channels,
            "performance summary"
        );
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub total_idle_timeouts: u64,
}

pub struct ConnectionManager {
    active: HashMap<String, Instant>,
    max_connections: usize,
    idle_timeout: Duration,
    total_accepted: u64,
    total_rejected: u64,
    total_idle_timeouts: u64,
}

impl ConnectionManager {
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            active: HashMap::new(),
            max_connections,
            idle_timeout,
            total_accepted: 0,
            total_rejected: 0,
            total_idle_timeouts: 0,
        }
    }

    pub fn can_accept(&self) -> bool {
        self.active.len() < self.max_connections
    }

    pub fn register(&mut self, user_id: &str) -> bool {
        if !self.can_accept() {
            self.total_rejected += 1;
            return false;
        }
        self.active.insert(user_id.to_string(), Instant::now());
        self.total_accepted += 1;
        true
    }

    pub fn unregister(&mut self, user_id: &str) {
        self.active.remove(user_id);
    }

    pub fn touch(&mut self, user_id: &str) {
        if let Some(last) = self.active.get_mut(user_id) {
            *last = Instant::now();
        }
    }

    /// Users whose last activity is older than the idle threshold.
    pub fn idle_users(&self) -> Vec<String> {
        let now = Instant::now();
        self.active
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.idle_timeout)
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub fn note_idle_timeout(&mut self) {
        self.total_idle_timeouts += 1;
    }

    pub fn note_rejected(&mut self) {
        self.total_rejected += 1;
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.active.len(),
            max_connections: self.max_connections,
            total_accepted: self.total_accepted,
            total_rejected: self.total_rejected,
            total_idle_timeouts: self.total_idle_timeouts,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_channels: usize,
}

#[derive(Default)]
pub struct RoutingCache {
    members: HashMap<String, HashSet<String>>,
    hits: u64,
    misses: u64,
}

impl RoutingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, channel: &str) -> Option<HashSet<String>> {
        match self.members.get(channel) {
            Some(set) => {
                self.hits += 1;
                Some(set.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, channel: &str, members: HashSet<String>) {
        self.members.insert(channel.to_string(), members);
    }

    pub fn invalidate(&mut self, channel: &str) {
        self.members.remove(channel);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            cached_channels: self.members.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_high_water_mark() {
        let mut monitor = PerformanceMonitor::new();
        monitor.register_connection("a");
        monitor.register_connection("b");
        monitor.unregister_connection("a");
        monitor.register_connection("c");
        assert_eq!(monitor.summary().peak_connections, 2);
        assert_eq!(monitor.summary().active_connections, 2);
    }

    #[test]
    fn byte_counters_accumulate_per_direction() {
        let mut monitor = PerformanceMonitor::new();
        monitor.register_connection("a");
        monitor.record_message("a", 100, Direction::Received);
        monitor.record_message("a", 40, Direction::Sent);
        monitor.record_message("a", 60, Direction::Sent);
        let m = monitor.metrics("a").unwrap();
        assert_eq!(m.messages_received, 1);
        assert_eq!(m.bytes_received, 100);
        assert_eq!(m.messages_sent, 2);
        assert_eq!(m.bytes_sent, 100);
    }

    #[test]
    fn capacity_gate_rejects_at_limit() {
        let mut conns = ConnectionManager::new(2, Duration::from_secs(300));
        assert!(conns.register("a"));
        assert!(conns.register("b"));
        assert!(!conns.register("c"));
        conns.unregister("a");
        assert!(conns.register("c"));
        assert_eq!(conns.stats().total_rejected, 1);
    }

    #[test]
    fn idle_detection_uses_last_activity() {
        let mut conns = ConnectionManager::new(10, Duration::ZERO);
        conns.register("a");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(conns.idle_users(), vec!["a".to_string()]);
    }

    #[test]
    fn routing_cache_counts_hits_and_misses() {
        let mut cache = RoutingCache::new();
        assert!(cache.get("#dev").is_none());
        cache.put("#dev", HashSet::from(["user_a".to_string()]));
        assert!(cache.get("#dev").is_some());
        cache.invalidate("#dev");
        assert!(cache.get("#dev").is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }
}
