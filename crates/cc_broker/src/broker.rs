//! Broker runtime: construction, the accept loop, background tasks, and
//! the disconnect path.
//!
//! The broker routes ciphertext envelopes between sessions without ever
//! decrypting them. Shared state lives behind `parking_lot` mutexes; no
//! critical section spans an await point, because delivery is a push onto a
//! per-session channel drained by that session's writer task.
//!
//! Lock order, where more than one is held: `state` first, then any of the
//! peripheral locks (`routing`, `monitor`, `conns`, `queue`). Never the
//! reverse.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cc_proto::{Frame, Payload};

use crate::accounts::AccountStore;
use crate::config::BrokerConfig;
use crate::ipfilter::IpFilter;
use crate::limiter::{ConnVerdict, ConnectionRateLimiter, RateLimiter};
use crate::monitor::{ConnectionManager, PerformanceMonitor, RoutingCache};
use crate::profiles::ProfileStore;
use crate::queue::{OfflineQueue, DEFAULT_TTL_SECS};
use crate::session;
use crate::state::BrokerState;
use crate::store::ChannelStore as Store;

pub struct Broker {
    pub config: BrokerConfig,
    pub data_dir: PathBuf,
    channels_path: PathBuf,
    pub state: Mutex<BrokerState>,
    pub queue: Mutex<OfflineQueue>,
    pub message_limiter: Mutex<RateLimiter>,
    pub image_limiter: Mutex<RateLimiter>,
    pub connection_limiter: Mutex<ConnectionRateLimiter>,
    pub ip_filter: Mutex<IpFilter>,
    pub monitor: Mutex<PerformanceMonitor>,
    pub conns: Mutex<ConnectionManager>,
    pub routing: Mutex<RoutingCache>,
    pub profiles: Mutex<ProfileStore>,
    pub accounts: Mutex<AccountStore>,
    persist_lock: Mutex<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig, data_dir: PathBuf) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

        let channels_path = data_dir.join("channels.json");
        // An unreadable state file is a startup failure; a parseable-but-
        // legacy one is migrated by the store loader.
        if channels_path.exists() {
            std::fs::read_to_string(&channels_path)
                .with_context(|| format!("cannot read {}", channels_path.display()))?;
        }
        let store = Store::load(channels_path.clone());
        let queue = OfflineQueue::load(
            data_dir.join("message_queue"),
            config.max_queued_messages_per_user,
            DEFAULT_TTL_SECS,
        );
        let ip_filter = IpFilter::load(
            data_dir.join("ip_blacklist.json"),
            data_dir.join("ip_whitelist.json"),
            config.enable_ip_whitelist,
        );
        let profiles = ProfileStore::load(data_dir.join("user_profiles.json"));
        let accounts = AccountStore::load(
            data_dir.join("accounts.json"),
            config.enable_authentication,
            config.require_authentication,
        );
        let conns = ConnectionManager::new(
            config.max_connections,
            Duration::from_secs(config.connection_timeout),
        );

        Ok(Arc::new(Self {
            state: Mutex::new(BrokerState::new(store)),
            queue: Mutex::new(queue),
            message_limiter: Mutex::new(RateLimiter::new(30, Duration::from_secs(10))),
            image_limiter: Mutex::new(RateLimiter::new(100, Duration::from_secs(10))),
            connection_limiter: Mutex::new(ConnectionRateLimiter::new(
                5,
                Duration::from_secs(60),
                10,
                Duration::from_secs(300),
            )),
            ip_filter: Mutex::new(ip_filter),
            monitor: Mutex::new(PerformanceMonitor::new()),
            conns: Mutex::new(conns),
            routing: Mutex::new(RoutingCache::new()),
            profiles: Mutex::new(profiles),
            accounts: Mutex::new(accounts),
            persist_lock: Mutex::new(()),
            channels_path,
            data_dir,
            config,
        }))
    }

    /// Bind, serve, and run background tasks until interrupted.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!("failed to bind {}:{}", self.config.host, self.config.port)
            })?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            name = %self.config.server_name,
            "broker listening (routing-only: payloads stay encrypted)"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self.spawn_background_tasks(shutdown_rx);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.clone().gate_and_spawn(stream, addr),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        self.shutdown_flush();
        Ok(())
    }

    /// Accept-time gates: IP filter → connection rate limiter → capacity.
    /// Rejections answer with an `error` frame before the socket closes.
    fn gate_and_spawn(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ip = addr.ip();

        if !self.ip_filter.lock().is_allowed(ip) {
            warn!(%addr, "connection blocked by IP filter");
            tokio::spawn(reject(stream, "Access denied".to_string()));
            return;
        }

        match self.connection_limiter.lock().check(ip) {
            ConnVerdict::Allow => {}
            ConnVerdict::RateLimited => {
                warn!(%addr, "connection rate limited");
                tokio::spawn(reject(stream, "Connection rate limit exceeded".to_string()));
                return;
            }
            ConnVerdict::TempBanned { remaining_secs } => {
                warn!(%addr, remaining_secs, "connection from temp-banned address");
                tokio::spawn(reject(
                    stream,
                    format!("IP temporarily banned. Try again in {remaining_secs} seconds"),
                ));
                return;
            }
        }

        if !self.conns.lock().can_accept() {
            self.conns.lock().note_rejected();
            warn!(%addr, "connection rejected: at capacity");
            tokio::spawn(reject(
                stream,
                "Server at maximum capacity, please try again later".to_string(),
            ));
            return;
        }

        info!(%addr, "new connection");
        tokio::spawn(session::handle_connection(self, stream, addr));
    }

    fn spawn_background_tasks(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        tasks.push(spawn_periodic(
            Duration::from_secs(60),
            shutdown.clone(),
            {
                let broker = self.clone();
                move || broker.sweep_expired_bans()
            },
        ));

        tasks.push(spawn_periodic(
            Duration::from_secs(60),
            shutdown.clone(),
            {
                let broker = self.clone();
                move || {
                    broker.queue.lock().cleanup_expired();
                    broker.queue.lock().save_to_disk();
                }
            },
        ));

        tasks.push(spawn_periodic(
            Duration::from_secs(60),
            shutdown.clone(),
            {
                let broker = self.clone();
                move || broker.idle_cleanup()
            },
        ));

        tasks.push(spawn_periodic(Duration::from_secs(300), shutdown, {
            let broker = self.clone();
            move || broker.log_periodic_summary()
        }));

        tasks
    }

    /// Remove bans whose expiry has passed. Lazy checks at join time catch
    /// the same records; this pass keeps the store tidy for idle channels.
    pub fn sweep_expired_bans(&self) {
        let now = cc_proto::unix_now();
        let mut removed = 0usize;
        {
            let mut st = self.state.lock();
            for record in st.store.records.values_mut() {
                let before = record.banned.len();
                record.banned.retain(|_, ban| !ban.is_expired(now));
                removed += before - record.banned.len();
            }
        }
        if removed > 0 {
            info!(removed, "removed expired channel bans");
            self.persist_channels();
        }
    }

    /// Disconnect sessions idle past the configured threshold, and age out
    /// limiter buckets.
    pub fn idle_cleanup(&self) {
        let idle = self.conns.lock().idle_users();
        for user_id in idle {
            info!(user = %user_id, "disconnecting idle session");
            if self.disconnect_user(&user_id) {
                self.conns.lock().note_idle_timeout();
            }
        }
        let max_age = Duration::from_secs(3600);
        self.message_limiter.lock().cleanup(max_age);
        self.image_limiter.lock().cleanup(max_age);
        self.connection_limiter.lock().cleanup(max_age);
    }

    fn log_periodic_summary(&self) {
        self.monitor.lock().log_summary();
        let queue = self.queue.lock();
        if queue.waiting_total() > 0 {
            info!(
                queues = queue.active_queues(),
                waiting = queue.waiting_total(),
                "message queue status"
            );
        }
        drop(queue);
        let conn_stats = self.conns.lock().stats();
        info!(
            active = conn_stats.active_connections,
            max = conn_stats.max_connections,
            accepted = conn_stats.total_accepted,
            rejected = conn_stats.total_rejected,
            "connection status"
        );
        let cache = self.routing.lock().stats();
        if cache.hits + cache.misses > 0 {
            info!(
                hits = cache.hits,
                misses = cache.misses,
                cached = cache.cached_channels,
                "routing cache status"
            );
        }
    }

    /// Serialize the channel store and atomically replace `channels.json`.
    /// The snapshot is taken under the state lock, the write under a
    /// dedicated persistence mutex, so writers serialize without stalling
    /// dispatch.
    pub fn persist_channels(&self) {
        let snapshot = self.state.lock().store.snapshot();
        let _guard = self.persist_lock.lock();
        if let Err(e) = Store::save_snapshot(&self.channels_path, &snapshot) {
            warn!(error = %e, "failed to persist channel store");
        }
    }

    /// Full disconnect cleanup. Safe to call from any path (read loop end,
    /// idle sweep, explicit `disconnect`, failed auth); the removal from the
    /// client map guarantees it runs at most once per registration.
    pub fn disconnect_user(&self, user_id: &str) -> bool {
        let mut touched_channels = Vec::new();
        {
            let mut st = self.state.lock();
            let Some(client) = st.clients.remove(user_id) else {
                return false;
            };
            info!(user = %user_id, nickname = %client.nickname, "session disconnected");
            st.nicknames.remove(&client.nickname);
            st.pending_auth.remove(user_id);
            st.pending_grant.remove(user_id);

            for channel in &client.channels {
                if let Some(live) = st.channels.get_mut(channel) {
                    live.members.remove(user_id);
                    live.operators.remove(user_id);
                    live.mods.remove(user_id);
                }
                touched_channels.push(channel.clone());
                let leave = Frame::new(Payload::LeaveChannel {
                    channel: channel.clone(),
                    user_id: Some(user_id.to_string()),
                    nickname: Some(client.nickname.clone()),
                });
                st.broadcast_to_channel(channel, &leave, Some(user_id));
            }

            let gone = Frame::new(Payload::Disconnect {
                user_id: Some(user_id.to_string()),
                nickname: Some(client.nickname.clone()),
            });
            if let Ok(line) = gone.to_json() {
                for other in st.clients.values() {
                    other.send_line(line.clone());
                }
            }
        }

        {
            let mut routing = self.routing.lock();
            for channel in &touched_channels {
                routing.invalidate(channel);
            }
        }
        self.conns.lock().unregister(user_id);
        self.monitor.lock().unregister_connection(user_id);
        debug!(user = %user_id, "disconnect cleanup complete");
        true
    }

    fn shutdown_flush(&self) {
        self.queue.lock().cleanup_expired();
        self.queue.lock().save_to_disk();
        self.persist_channels();
        info!("=== final broker statistics ===");
        self.monitor.lock().log_summary();
        let stats = self.queue.lock().stats();
        info!(
            queued = stats.total_queued,
            delivered = stats.total_delivered,
            expired = stats.total_expired,
            dropped = stats.total_dropped,
            "queue totals"
        );
        let conn_stats = self.conns.lock().stats();
        info!(
            accepted = conn_stats.total_accepted,
            rejected = conn_stats.total_rejected,
            idle_timeouts = conn_stats.total_idle_timeouts,
            "connection totals"
        );
        info!("broker shutdown complete");
    }
}

async fn reject(mut stream: TcpStream, message: String) {
    let frame = Frame::error(message);
    if let Ok(line) = frame.to_json() {
        let _ = stream.write_all(line.as_bytes()).await;
        let _ = stream.write_all(b"\n").await;
        let _ = stream.flush().await;
    }
    let _ = stream.shutdown().await;
}

fn spawn_periodic<F>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut work: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so work runs after one
        // full period.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => work(),
                _ = shutdown.changed() => break,
            }
        }
    })
}
