//! Per-API-key token bucket admission control.
//!
//! Buckets refill continuously. Token counts are kept in integer
//! micro-tokens so long uptimes do not accumulate floating-point drift.

use crate::errors::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

pub const MICROS_PER_TOKEN: u64 = 1_000_000;
const MICROS_PER_MINUTE: u128 = 60_000_000;
const SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Premium, Tier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn allows(&self, scope: Scope) -> bool {
        match scope {
            Scope::Read => true,
            Scope::Write => !matches!(self, Tier::Free),
            Scope::Analytics => matches!(self, Tier::Premium | Tier::Enterprise),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Config(format!("unknown rate limit tier '{}'", s)))
    }
}

/// What an API key may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Read,
    Write,
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl TierLimits {
    pub fn default_for(tier: Tier) -> Self {
        let (requests_per_minute, burst) = match tier {
            Tier::Free => (60, 10),
            Tier::Basic => (300, 50),
            Tier::Premium => (1000, 100),
            Tier::Enterprise => (5000, 500),
        };
        Self {
            requests_per_minute,
            burst,
        }
    }

    fn capacity(&self) -> u64 {
        self.burst as u64 * MICROS_PER_TOKEN
    }

    /// Micro-tokens accrued over `elapsed_us` microseconds.
    fn accrued(&self, elapsed_us: u64) -> u64 {
        let micro = elapsed_us as u128 * self.requests_per_minute as u128 * MICROS_PER_TOKEN as u128
            / MICROS_PER_MINUTE;
        micro.min(u64::MAX as u128) as u64
    }

    /// Microseconds until `deficit` micro-tokens have accrued.
    fn micros_until(&self, deficit: u64) -> u64 {
        if deficit == 0 {
            return 0;
        }
        let per_minute = self.requests_per_minute as u128 * MICROS_PER_TOKEN as u128;
        let us = (deficit as u128 * MICROS_PER_MINUTE).div_ceil(per_minute);
        us.min(u64::MAX as u128) as u64
    }
}

pub type TierTable = HashMap<Tier, TierLimits>;

pub fn default_tier_table() -> TierTable {
    Tier::ALL
        .into_iter()
        .map(|t| (t, TierLimits::default_for(t)))
        .collect()
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the bucket will be full again.
    pub reset_at: DateTime<Utc>,
    /// Time until the next whole token, set only on rejection.
    pub retry_after: Option<std::time::Duration>,
}

impl Admission {
    /// `Retry-After` in whole seconds, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
            .unwrap_or(0)
            .max(1)
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    micro_tokens: u64,
    last_refill: DateTime<Utc>,
}

impl Bucket {
    fn refill(&mut self, now: DateTime<Utc>, limits: &TierLimits) {
        let capacity = limits.capacity();
        // A clock step backwards accrues nothing.
        let elapsed_us = (now - self.last_refill)
            .num_microseconds()
            .unwrap_or(i64::MAX)
            .max(0) as u64;
        if elapsed_us > 0 {
            self.micro_tokens = self.micro_tokens.saturating_add(limits.accrued(elapsed_us));
            self.last_refill = now;
        }
        self.micro_tokens = self.micro_tokens.min(capacity);
    }
}

pub struct RateLimiter {
    tiers: TierTable,
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new(tiers: TierTable) -> Self {
        Self {
            tiers,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn limits(&self, tier: Tier) -> Result<TierLimits> {
        self.tiers
            .get(&tier)
            .copied()
            .ok_or_else(|| Error::Config(format!("no rate limits configured for tier '{}'", tier)))
    }

    fn shard(&self, api_key: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hasher = DefaultHasher::new();
        api_key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    pub fn admit(&self, api_key: &str, tier: Tier) -> Result<Admission> {
        self.admit_at(api_key, tier, Utc::now())
    }

    /// Accrue tokens since the last refill, then try to take one.
    pub fn admit_at(&self, api_key: &str, tier: Tier, now: DateTime<Utc>) -> Result<Admission> {
        let limits = self.limits(tier)?;
        let capacity = limits.capacity();

        let mut shard = self.shard(api_key).lock();
        let bucket = shard.entry(api_key.to_string()).or_insert_with(|| Bucket {
            micro_tokens: capacity,
            last_refill: now,
        });
        bucket.refill(now, &limits);

        let allowed = bucket.micro_tokens >= MICROS_PER_TOKEN;
        if allowed {
            bucket.micro_tokens -= MICROS_PER_TOKEN;
        }
        let micro_tokens = bucket.micro_tokens;
        drop(shard);

        let until_full = limits.micros_until(capacity.saturating_sub(micro_tokens));
        let retry_after = (!allowed).then(|| {
            std::time::Duration::from_micros(
                limits.micros_until(MICROS_PER_TOKEN - micro_tokens),
            )
        });

        Ok(Admission {
            allowed,
            limit: limits.requests_per_minute,
            remaining: (micro_tokens / MICROS_PER_TOKEN) as u32,
            reset_at: now + Duration::microseconds(until_full.min(i64::MAX as u64) as i64),
            retry_after,
        })
    }

    /// Tokens currently held by a key, without consuming any.
    pub fn peek(&self, api_key: &str) -> Option<u64> {
        self.shard(api_key)
            .lock()
            .get(api_key)
            .map(|b| b.micro_tokens / MICROS_PER_TOKEN)
    }
}
