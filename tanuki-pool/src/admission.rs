//! Accept-side admission control.
//!
//! Three gates, in order, on every accepted socket: a token bucket on
//! the global accept rate (with a looser reconnection-window rate right
//! after boot, when a whole fleet storms back in), a per-host reconnect
//! churn tracker with time-bounded host bans, and the capacity/freshness
//! gate that refuses connections when the pool is full or the template
//! feed has gone stale.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::AdmissionConfig;
use crate::registry::ConnectionRegistry;
use crate::template::FeedStatus;

/// Why an accept was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    RateLimited,
    HostBanned,
    AtCapacity,
    FeedStale,
}

/// Classic token bucket. Time is passed in so tests are deterministic.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    updated: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            rate,
            updated: now,
        }
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate;
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.updated = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct HostEntry {
    accepts: std::collections::VecDeque<Instant>,
    banned_until: Option<Instant>,
}

/// Sliding-window accept counter per remote host.
pub struct ReconnectTracker {
    window: Duration,
    threshold: u32,
    ban: Duration,
    hosts: HashMap<IpAddr, HostEntry>,
}

impl ReconnectTracker {
    pub fn new(window: Duration, threshold: u32, ban: Duration) -> Self {
        Self {
            window,
            threshold,
            ban,
            hosts: HashMap::new(),
        }
    }

    /// Record an accept attempt. Returns false while the host is banned.
    pub fn note_accept(&mut self, host: IpAddr, now: Instant) -> bool {
        // Opportunistic cleanup of hosts that have gone quiet.
        if self.hosts.len() > 10_000 {
            let window = self.window;
            self.hosts.retain(|_, entry| {
                entry.banned_until.map(|until| now < until).unwrap_or(false)
                    || entry
                        .accepts
                        .back()
                        .map(|&last| now.duration_since(last) <= window)
                        .unwrap_or(false)
            });
        }

        let entry = self.hosts.entry(host).or_insert_with(|| HostEntry {
            accepts: std::collections::VecDeque::new(),
            banned_until: None,
        });

        if let Some(until) = entry.banned_until {
            if now < until {
                return false;
            }
            entry.banned_until = None;
            entry.accepts.clear();
        }

        entry.accepts.push_back(now);
        while let Some(&front) = entry.accepts.front() {
            if now.duration_since(front) > self.window {
                entry.accepts.pop_front();
            } else {
                break;
            }
        }

        if entry.accepts.len() as u32 > self.threshold {
            entry.banned_until = Some(now + self.ban);
            return false;
        }
        true
    }

    pub fn is_banned(&self, host: IpAddr, now: Instant) -> bool {
        self.hosts
            .get(&host)
            .and_then(|entry| entry.banned_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }
}

pub struct AdmissionController {
    cfg: AdmissionConfig,
    max_connections: usize,
    bucket: Mutex<TokenBucket>,
    tracker: Mutex<ReconnectTracker>,
    registry: Arc<ConnectionRegistry>,
    feed: watch::Receiver<FeedStatus>,
    boot: Instant,
}

impl AdmissionController {
    pub fn new(
        cfg: AdmissionConfig,
        max_connections: usize,
        registry: Arc<ConnectionRegistry>,
        feed: watch::Receiver<FeedStatus>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket::new(
                cfg.reconnect_rate,
                cfg.accept_burst,
                now,
            )),
            tracker: Mutex::new(ReconnectTracker::new(
                cfg.host_window,
                cfg.host_max_accepts,
                cfg.host_ban,
            )),
            cfg,
            max_connections,
            registry,
            feed,
            boot: now,
        })
    }

    /// Apply all three gates. Called on the accept path with the remote
    /// host; a refusal closes the socket without serving it.
    pub fn check(&self, host: IpAddr) -> Result<(), Refusal> {
        let now = Instant::now();

        {
            let mut bucket = self.bucket.lock();
            // The reconnection window ends; fall to steady state.
            if now.duration_since(self.boot) > self.cfg.reconnect_window {
                bucket.set_rate(self.cfg.accept_rate);
            }
            if !bucket.try_acquire(now) {
                return Err(Refusal::RateLimited);
            }
        }

        if !self.tracker.lock().note_accept(host, now) {
            return Err(Refusal::HostBanned);
        }

        if self.registry.count() >= self.max_connections {
            return Err(Refusal::AtCapacity);
        }

        if !self.feed_healthy(now) {
            return Err(Refusal::FeedStale);
        }

        Ok(())
    }

    /// Feed freshness, with the boot grace applied so a pool that starts
    /// before its node does not refuse everyone.
    pub fn feed_healthy(&self, now: Instant) -> bool {
        if now.duration_since(self.boot) < self.cfg.boot_grace {
            return true;
        }
        self.feed
            .borrow()
            .healthy_within(self.cfg.stale_grace, now)
    }
}
