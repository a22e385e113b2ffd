use crate::{
    envelope::Delivery,
    pool::{PoolEntry, SourcePool},
    zone::throttle::{Throttle, ThrottleSpec},
};
use chrono::Duration;
use rand::Rng;
use serde::Deserialize;
use std::{collections::HashMap, net::IpAddr};
use tracing::warn;

pub mod delivery;
pub mod dns;
pub mod supervisor;
pub mod throttle;

/// How the pool hash key for a delivery is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHashMode {
    /// Hash on `id.seq`, spreading deliveries across the pool.
    #[default]
    Default,
    /// Hash on the sender so one sender sticks to one source address.
    From,
}

/// Retry ladder for transient failures: exponential from `base`, capped at
/// `max`, released as a permanent failure after `max_attempts`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::minutes(15),
            max: Duration::hours(8),
            max_attempts: 30,
        }
    }
}

impl RetryConfig {
    /// Defer TTL for the given attempt count, with a ±10% jitter so retry
    /// storms spread out.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let scaled = self
            .base
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        let millis = scaled.num_milliseconds();
        let jitter = rand::rng().random_range(-(millis / 10)..=millis / 10);
        Duration::milliseconds(millis + jitter)
    }
}

const DEFAULT_BLACKLIST_TTL_SECONDS: u64 = 6 * 3600;

fn default_processes() -> usize {
    1
}

fn default_connections() -> usize {
    5
}

fn default_blacklist_ttl() -> u64 {
    DEFAULT_BLACKLIST_TTL_SECONDS
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneAuth {
    pub username: String,
    pub password: String,
}

/// Static configuration of one named outbound class.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    pub name: String,
    /// Target worker count.
    #[serde(default = "default_processes")]
    pub processes: usize,
    /// Parallel remote sessions per worker.
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default)]
    pub pool: Vec<PoolEntry>,
    /// Rate limit, e.g. "100 messages/hour".
    #[serde(default)]
    pub throttling: Option<String>,
    #[serde(default)]
    pub pool_hash: PoolHashMode,
    /// Force the IPv4 pool regardless of what the MX resolves to.
    #[serde(default)]
    pub ignore_ipv6: bool,
    /// Try the IPv6 pool first, falling back to IPv4.
    #[serde(default)]
    pub prefer_ipv6: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub sender_domains: Vec<String>,
    #[serde(default)]
    pub recipient_domains: Vec<String>,
    /// header name -> header value that routes into this zone
    #[serde(default)]
    pub routing_headers: HashMap<String, String>,
    #[serde(default)]
    pub origin_addresses: Vec<IpAddr>,
    /// Catch-all zone for envelopes nothing else matched.
    #[serde(default)]
    pub default: bool,
    /// EHLO hostname used when a pool entry carries no name of its own.
    #[serde(default)]
    pub host: Option<String>,
    /// Credentials for smarthost-style zones that relay through an
    /// authenticated upstream.
    #[serde(default)]
    pub auth: Option<ZoneAuth>,
    #[serde(default = "default_blacklist_ttl")]
    pub blacklist_ttl_seconds: u64,
    #[serde(skip, default)]
    pub retry: RetryConfig,
}

impl ZoneConfig {
    pub fn named(name: impl Into<String>) -> Self {
        let name: String = name.into();
        serde_json::from_value(serde_json::json!({ "name": name }))
            .expect("minimal zone config must deserialize")
    }

    pub fn blacklist_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.blacklist_ttl_seconds)
    }
}

/// Immutable per-zone runtime state: the expanded source pools and the
/// throttler. A config reload builds a fresh runtime and swaps it; workers
/// pick it up from their watch channel.
pub struct ZoneRuntime {
    config: ZoneConfig,
    pool: SourcePool,
    throttle: Option<Throttle>,
}

impl ZoneRuntime {
    pub fn new(config: ZoneConfig) -> Self {
        let pool = SourcePool::new(&config.pool);
        let throttle = config.throttling.as_deref().and_then(|input| {
            let spec = ThrottleSpec::parse(input);
            if spec.is_none() {
                warn!(zone = config.name, throttling = input, "unparseable throttle spec ignored");
            }
            spec.map(Throttle::new)
        });

        Self {
            config,
            pool,
            throttle,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn pool(&self) -> &SourcePool {
        &self.pool
    }

    /// Select the source endpoint for a delivery. Stable for identical
    /// `(id, seq)` / pool-hash inputs over an identical effective pool.
    pub fn get_address(
        &self,
        delivery: &mut Delivery,
        use_ipv6: bool,
        disabled: &[IpAddr],
    ) -> PoolEntry {
        let use_ipv6 = if self.config.ignore_ipv6 {
            false
        } else {
            use_ipv6 || (self.config.prefer_ipv6 && self.pool.has_ipv6())
        };

        let key = match (&delivery.pool_hash, self.config.pool_hash) {
            (Some(key), _) => key.clone(),
            (None, PoolHashMode::From) => delivery.sender_hash_key(),
            (None, PoolHashMode::Default) => delivery.default_hash_key(),
        };

        let (entry, bypassed) = self.pool.select(&key, use_ipv6, disabled);
        if bypassed {
            delivery.pool_disabled = true;
        }
        entry
    }

    /// Block until the identity key is admitted by the zone throttle.
    pub async fn throttle_wait(&self, key: &str) {
        let Some(throttle) = &self.throttle else {
            return;
        };
        loop {
            let wait = throttle.check(key);
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }
}
