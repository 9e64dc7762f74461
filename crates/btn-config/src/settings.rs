//! Process settings read from `BTN_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use btn_schemas::STATE_UPDATED_TOPIC;

pub const ENV_DATABASE_URL: &str = "BTN_DATABASE_URL";

/// Which loops a process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Reducer,
    Watcher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::All => "all",
            Role::Reducer => "reducer",
            Role::Watcher => "watcher",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Role::All),
            "reducer" => Ok(Role::Reducer),
            "watcher" => Ok(Role::Watcher),
            other => Err(anyhow!(
                "invalid role '{}'. expected one of: all | reducer | watcher",
                other
            )),
        }
    }

    pub fn runs_reducer(&self) -> bool {
        matches!(self, Role::All | Role::Reducer)
    }

    pub fn runs_watcher(&self) -> bool {
        matches!(self, Role::All | Role::Watcher)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub database_url: String,
    pub daemon_addr: SocketAddr,
    pub role: Role,

    pub consumer_group: String,
    pub notify_channel: String,
    pub batch_size: usize,
    pub idle_poll: Duration,
    pub publish_timeout: Duration,

    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_max_attempts: u32,

    pub watcher_interval: Duration,
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup(ENV_DATABASE_URL).with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?;

        let role = match lookup("BTN_ROLE") {
            Some(v) => Role::parse(&v)?,
            None => Role::All,
        };

        let batch_size: usize = parse_or(&lookup, "BTN_BATCH_SIZE", 100)?;
        if batch_size == 0 {
            return Err(anyhow!("BTN_BATCH_SIZE must be > 0"));
        }

        let backoff_max_attempts: u32 = parse_or(&lookup, "BTN_BACKOFF_MAX_ATTEMPTS", 3)?;

        Ok(Self {
            database_url,
            daemon_addr: parse_or(
                &lookup,
                "BTN_DAEMON_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 8898)),
            )?,
            role,
            consumer_group: lookup("BTN_CONSUMER_GROUP").unwrap_or_else(|| "reducer".to_string()),
            notify_channel: lookup("BTN_NOTIFY_CHANNEL")
                .unwrap_or_else(|| STATE_UPDATED_TOPIC.to_string()),
            batch_size,
            idle_poll: millis_or(&lookup, "BTN_IDLE_POLL_MS", 250)?,
            publish_timeout: millis_or(&lookup, "BTN_PUBLISH_TIMEOUT_MS", 2_000)?,
            backoff_base: millis_or(&lookup, "BTN_BACKOFF_BASE_MS", 1_000)?,
            backoff_max: millis_or(&lookup, "BTN_BACKOFF_MAX_MS", 30_000)?,
            backoff_max_attempts,
            watcher_interval: millis_or(&lookup, "BTN_WATCHER_INTERVAL_MS", 30_000)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid value for {key}='{raw}': {e}")),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default_ms: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_millis(parse_or(lookup, key, default_ms)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_only_db_url_set() {
        let s = ServiceSettings::from_lookup(lookup_from(&[(ENV_DATABASE_URL, "postgres://x")]))
            .unwrap();
        assert_eq!(s.role, Role::All);
        assert_eq!(s.batch_size, 100);
        assert_eq!(s.backoff_max_attempts, 3);
        assert_eq!(s.backoff_base, Duration::from_secs(1));
        assert_eq!(s.backoff_max, Duration::from_secs(30));
        assert_eq!(s.watcher_interval, Duration::from_secs(30));
        assert_eq!(s.consumer_group, "reducer");
        assert_eq!(s.notify_channel, "state_updated");
    }

    #[test]
    fn missing_db_url_is_error() {
        let err = ServiceSettings::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains(ENV_DATABASE_URL));
    }

    #[test]
    fn malformed_number_is_error() {
        let err = ServiceSettings::from_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://x"),
            ("BTN_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("BTN_BATCH_SIZE"));
    }

    #[test]
    fn zero_batch_size_is_error() {
        assert!(ServiceSettings::from_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://x"),
            ("BTN_BATCH_SIZE", "0"),
        ]))
        .is_err());
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!(Role::parse("Watcher").unwrap(), Role::Watcher);
        assert!(Role::parse("both").is_err());
        assert!(Role::All.runs_reducer() && Role::All.runs_watcher());
        assert!(!Role::Watcher.runs_reducer());
    }
}
