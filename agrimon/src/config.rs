use crate::errors::{Error, Result};
use crate::external::CallPolicy;
use crate::query::PagingLimits;
use crate::ratelimit::{default_tier_table, Tier, TierLimits, TierTable};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    pub database_url: Option<String>,
    pub mqtt_broker: Option<String>,
    pub mqtt_port: u16,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub channel_capacity: usize,
    pub api_keys: HashMap<String, Tier>,
    pub tiers: TierTable,
    pub zones: Vec<String>,
    pub schedule_tick: Duration,
    pub paging: PagingLimits,
    pub weather_url: Option<String>,
    pub crop_health_url: Option<String>,
    pub collaborator_policy: CallPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` uses the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_keys = parse_api_keys(&get("API_KEYS").ok_or_else(|| {
            Error::Config("API_KEYS must list at least one key:tier pair".to_string())
        })?)?;

        let mut tiers = default_tier_table();
        for tier in Tier::ALL {
            let var = format!("RATE_LIMIT_{}", tier.as_str().to_uppercase());
            if let Some(raw) = get(&var) {
                tiers.insert(tier, parse_tier_limits(&var, &raw)?);
            }
        }

        let zones: Vec<String> = get("IRRIGATION_ZONES")
            .unwrap_or_else(|| "field-a,field-b".to_string())
            .split(',')
            .map(|z| z.trim().to_string())
            .filter(|z| !z.is_empty())
            .collect();

        let paging = PagingLimits {
            default_per_page: parse_or(&get, "DEFAULT_PER_PAGE", 20)?,
            max_per_page: parse_or(&get, "MAX_PER_PAGE", 100)?,
        };
        if paging.max_per_page == 0 || paging.default_per_page == 0 {
            return Err(Error::Config("page sizes must be at least 1".to_string()));
        }

        let schedule_tick_secs: u64 = parse_or(&get, "SCHEDULE_TICK_SECS", 30)?;
        if schedule_tick_secs == 0 {
            return Err(Error::Config("SCHEDULE_TICK_SECS must be at least 1".to_string()));
        }

        Ok(Self {
            http_addr: get("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: get("DATABASE_URL"),
            mqtt_broker: get("MQTT_BROKER"),
            mqtt_port: parse_or(&get, "MQTT_PORT", 1883)?,
            batch_size: parse_or(&get, "BATCH_SIZE", 500)?,
            batch_timeout_ms: parse_or(&get, "BATCH_TIMEOUT_MS", 200)?,
            channel_capacity: parse_or(&get, "CHANNEL_CAPACITY", 10_000)?,
            api_keys,
            tiers,
            zones,
            schedule_tick: Duration::from_secs(schedule_tick_secs),
            paging,
            weather_url: get("WEATHER_URL"),
            crop_health_url: get("CROP_HEALTH_URL"),
            collaborator_policy: CallPolicy {
                timeout: Duration::from_millis(parse_or(&get, "COLLABORATOR_TIMEOUT_MS", 3000)?),
                backoff: Duration::from_millis(parse_or(&get, "COLLABORATOR_BACKOFF_MS", 200)?),
            },
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

/// `key:tier,key:tier`
pub fn parse_api_keys(raw: &str) -> Result<HashMap<String, Tier>> {
    let mut keys = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, tier) = entry
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("API key entry '{}' is not key:tier", entry)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config("API key must not be empty".to_string()));
        }
        keys.insert(key.to_string(), tier.parse::<Tier>()?);
    }
    if keys.is_empty() {
        return Err(Error::Config("API_KEYS is empty".to_string()));
    }
    Ok(keys)
}

/// `rpm:burst`
fn parse_tier_limits(var: &str, raw: &str) -> Result<TierLimits> {
    let bad = || Error::Config(format!("{} must be rpm:burst, got '{}'", var, raw));
    let (rpm, burst) = raw.split_once(':').ok_or_else(bad)?;
    let limits = TierLimits {
        requests_per_minute: rpm.trim().parse().map_err(|_| bad())?,
        burst: burst.trim().parse().map_err(|_| bad())?,
    };
    if limits.requests_per_minute == 0 || limits.burst == 0 {
        return Err(bad());
    }
    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("API_KEYS", "k1:free, k2:premium")])).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.api_keys["k2"], Tier::Premium);
        assert_eq!(config.zones, vec!["field-a", "field-b"]);
        assert_eq!(config.tiers[&Tier::Free].burst, 10);
        assert!(config.database_url.is_none());
        assert!(config.mqtt_broker.is_none());
    }

    #[test]
    fn test_unknown_tier_fails() {
        let err = Config::from_lookup(lookup(&[("API_KEYS", "k1:gold")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_keys_fails() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_tier_override() {
        let config = Config::from_lookup(lookup(&[
            ("API_KEYS", "k1:basic"),
            ("RATE_LIMIT_BASIC", "120:20"),
        ]))
        .unwrap();
        assert_eq!(
            config.tiers[&Tier::Basic],
            TierLimits {
                requests_per_minute: 120,
                burst: 20
            }
        );

        assert!(Config::from_lookup(lookup(&[
            ("API_KEYS", "k1:basic"),
            ("RATE_LIMIT_BASIC", "fast"),
        ]))
        .is_err());
    }

    #[test]
    fn test_malformed_number_is_not_defaulted() {
        let err = Config::from_lookup(lookup(&[("API_KEYS", "k1:free"), ("MQTT_PORT", "abc")]))
            .unwrap_err();
        assert!(err.to_string().contains("MQTT_PORT"));
    }
}
