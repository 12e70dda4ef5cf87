//! Sliding-window rate limiting.
//!
//! Two limiter shapes: a per-identity request limiter (messages, image
//! chunks) and a per-IP connection limiter that escalates repeat offenders
//! to a temporary ban. Both keep a deque of event instants per key and
//! evict entries that fall out of the window; a periodic cleanup pass drops
//! keys that have gone quiet so the maps stay bounded.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Verdict for a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnVerdict {
    Allow,
    /// Over the window cap; retry later.
    RateLimited,
    /// Banned after repeated violations; seconds remaining.
    TempBanned { remaining_secs: u64 },
}

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: HashMap::new(),
        }
    }

    /// Record an attempt; `true` when still inside the window cap.
    pub fn is_allowed(&mut self, client_id: &str) -> bool {
        let now = Instant::now();
        let history = self.requests.entry(client_id.to_string()).or_default();
        Self::evict(history, now, self.window);
        if history.len() < self.max_requests {
            history.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest tracked request leaves the window.
    pub fn retry_after(&mut self, client_id: &str) -> Duration {
        let now = Instant::now();
        let Some(history) = self.requests.get_mut(client_id) else {
            return Duration::ZERO;
        };
        Self::evict(history, now, self.window);
        if history.len() < self.max_requests {
            return Duration::ZERO;
        }
        match history.front() {
            Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    /// Drop identities with no activity for `max_age`.
    pub fn cleanup(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.requests.retain(|_, history| {
            matches!(history.back(), Some(last) if now.duration_since(*last) < max_age)
        });
    }

    pub fn tracked(&self) -> usize {
        self.requests.len()
    }

    fn evict(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = history.front() {
            if now.duration_since(*front) > window {
                history.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct ConnectionRateLimiter {
    max_connections: usize,
    window: Duration,
    ban_threshold: usize,
    ban_duration: Duration,
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    violations: HashMap<IpAddr, usize>,
    banned: HashMap<IpAddr, Instant>,
}

impl ConnectionRateLimiter {
    pub fn new(
        max_connections: usize,
        window: Duration,
        ban_threshold: usize,
        ban_duration: Duration,
    ) -> Self {
        Self {
            max_connections,
            window,
            ban_threshold,
            ban_duration,
            connections: HashMap::new(),
            violations: HashMap::new(),
            banned: HashMap::new(),
        }
    }

    pub fn check(&mut self, ip: IpAddr) -> ConnVerdict {
        let now = Instant::now();

        if let Some(expiry) = self.banned.get(&ip) {
            if now < *expiry {
                return ConnVerdict::TempBanned {
                    remaining_secs: expiry.duration_since(now).as_secs(),
                };
            }
            self.banned.remove(&ip);
            self.violations.remove(&ip);
        }

        let history = self.connections.entry(ip).or_default();
        RateLimiter::evict(history, now, self.window);
        if history.len() < self.max_connections {
            history.push_back(now);
            return ConnVerdict::Allow;
        }

        let violations = self.violations.entry(ip).or_insert(0);
        *violations += 1;
        if *violations >= self.ban_threshold {
            self.banned.insert(ip, now + self.ban_duration);
            return ConnVerdict::TempBanned {
                remaining_secs: self.ban_duration.as_secs(),
            };
        }
        ConnVerdict::RateLimited
    }

    pub fn cleanup(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.connections.retain(|_, history| {
            matches!(history.back(), Some(last) if now.duration_since(*last) < max_age)
        });
        let expired: Vec<IpAddr> = self
            .banned
            .iter()
            .filter(|(_, expiry)| now >= **expiry)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in expired {
            self.banned.remove(&ip);
            self.violations.remove(&ip);
        }
    }
}
