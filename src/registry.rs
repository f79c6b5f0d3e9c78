//! Per-client admission state.
//!
//! One mutex guards both the lazy insert on lookup and the periodic
//! eviction sweep, so a sweep never observes a half-initialized entry and
//! never removes an entry while a check is mutating its bucket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::shutdown::ShutdownState;
use crate::token_bucket::TokenBucket;

/// Rate and burst applied to every client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            burst: 4,
        }
    }
}

struct ClientEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

pub struct ClientRegistry {
    enabled: bool,
    limit: RateLimit,
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            enabled: true,
            limit,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// A registry that admits everything and never stores a client.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(RateLimit::default())
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let limit = RateLimit {
            requests_per_second: config.requests_per_second,
            burst: config.burst,
        };

        if config.rate_limit_enabled {
            Self::new(limit)
        } else {
            Self {
                enabled: false,
                ..Self::new(limit)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Check admission using the registry's configured rate.
    pub fn check(&self, identity: &str) -> ThrottlerResult<bool> {
        self.check_with_params(identity, self.limit)
    }

    /// Check admission with explicit parameters. Parameters only take effect
    /// when the entry is created; an existing bucket keeps its own.
    pub fn check_with_params(&self, identity: &str, limit: RateLimit) -> ThrottlerResult<bool> {
        self.check_at(identity, limit, Instant::now())
    }

    fn check_at(&self, identity: &str, limit: RateLimit, now: Instant) -> ThrottlerResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let mut clients = self.lock()?;

        let entry = clients
            .entry(identity.to_string())
            .or_insert_with(|| ClientEntry {
                bucket: TokenBucket::new_at(limit.burst, limit.requests_per_second, now),
                last_seen: now,
            });

        entry.last_seen = entry.last_seen.max(now);
        Ok(entry.bucket.try_acquire_at(now))
    }

    /// How long a client has to wait for its next token, if at all.
    pub fn retry_after(&self, identity: &str) -> ThrottlerResult<Option<Duration>> {
        if !self.enabled {
            return Ok(None);
        }

        let mut clients = self.lock()?;
        Ok(clients
            .get_mut(identity)
            .and_then(|entry| entry.bucket.time_until_available()))
    }

    /// Evict every client idle for longer than `idle_threshold`. Returns the
    /// number of evicted entries.
    pub fn sweep(&self, idle_threshold: Duration) -> ThrottlerResult<usize> {
        self.sweep_at(idle_threshold, Instant::now())
    }

    fn sweep_at(&self, idle_threshold: Duration, now: Instant) -> ThrottlerResult<usize> {
        let mut clients = self.lock()?;
        let initial_count = clients.len();

        clients.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= idle_threshold);

        Ok(initial_count - clients.len())
    }

    /// Number of tracked clients. A poisoned lock is logged and reported as
    /// an empty registry.
    pub fn len(&self) -> usize {
        match self.lock() {
            Ok(clients) => clients.len(),
            Err(e) => {
                tracing::error!(error = %e, "client registry unavailable");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &str) -> bool {
        match self.lock() {
            Ok(clients) => clients.contains_key(identity),
            Err(e) => {
                tracing::error!(error = %e, "client registry unavailable");
                false
            }
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown reaches
    /// [`ShutdownState::Stopped`].
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        idle_threshold: Duration,
        mut shutdown: watch::Receiver<ShutdownState>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => match registry.sweep(idle_threshold) {
                        Ok(0) => {}
                        Ok(evicted) => tracing::debug!(
                            evicted,
                            remaining = registry.len(),
                            "evicted idle clients"
                        ),
                        Err(e) => tracing::warn!(error = %e, "client sweep failed"),
                    },
                    _ = async {
                        let _ = shutdown.wait_for(|state| *state == ShutdownState::Stopped).await;
                    } => break,
                }
            }

            tracing::debug!("client sweeper stopped");
        })
    }

    fn lock(&self) -> ThrottlerResult<MutexGuard<'_, HashMap<String, ClientEntry>>> {
        self.clients.lock().map_err(|_| {
            ThrottlerError::InternalError("Failed to acquire lock on client registry".to_string())
        })
    }
}
