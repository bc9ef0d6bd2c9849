//! Gate configuration from the environment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};

use accessgate_auth::{IdentityProvider, SessionStore};
use accessgate_billing::CacheConfig;

pub const ENV_SUBSCRIPTION_TTL_SECS: &str = "ACCESSGATE_SUBSCRIPTION_TTL_SECS";
pub const ENV_FETCH_TIMEOUT_SECS: &str = "ACCESSGATE_FETCH_TIMEOUT_SECS";
pub const ENV_BYPASS_ADMIN: &str = "ACCESSGATE_BYPASS_ADMIN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateConfig {
    pub cache: CacheConfig,
    /// Whether requests that do not say otherwise let tenant admins through.
    pub bypass_admin_default: bool,
}

impl GateConfig {
    /// Load from process environment variables; unset variables keep defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests, embedded config maps).
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_SUBSCRIPTION_TTL_SECS) {
            config.cache.ttl = parse_secs(ENV_SUBSCRIPTION_TTL_SECS, &raw)?;
        }

        if let Some(raw) = lookup(ENV_FETCH_TIMEOUT_SECS) {
            let timeout = parse_secs(ENV_FETCH_TIMEOUT_SECS, &raw)?;
            if timeout.is_zero() {
                bail!("{ENV_FETCH_TIMEOUT_SECS} must be greater than zero");
            }
            config.cache.fetch_timeout = timeout;
        }

        if let Some(raw) = lookup(ENV_BYPASS_ADMIN) {
            config.bypass_admin_default = parse_flag(&raw)
                .with_context(|| format!("invalid {ENV_BYPASS_ADMIN} value '{raw}'"))?;
        }

        Ok(config)
    }

    /// Start a session store whose lookups share the fetch bound.
    pub fn start_sessions(&self, provider: Arc<dyn IdentityProvider>) -> Arc<SessionStore> {
        SessionStore::start_with_timeout(provider, self.cache.fetch_timeout)
    }
}

fn parse_secs(key: &str, raw: &str) -> anyhow::Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid {key} value '{raw}' (expected whole seconds)"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected true/false, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = GateConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.cache.fetch_timeout, Duration::from_secs(10));
        assert!(!config.bypass_admin_default);
    }

    #[test]
    fn overrides_are_applied() {
        let config = GateConfig::from_lookup(lookup(&[
            (ENV_SUBSCRIPTION_TTL_SECS, "60"),
            (ENV_FETCH_TIMEOUT_SECS, " 3 "),
            (ENV_BYPASS_ADMIN, "TRUE"),
        ]))
        .unwrap();

        assert_eq!(config.cache.ttl, Duration::from_secs(60));
        assert_eq!(config.cache.fetch_timeout, Duration::from_secs(3));
        assert!(config.bypass_admin_default);
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = GateConfig::from_lookup(lookup(&[(ENV_SUBSCRIPTION_TTL_SECS, "five minutes")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains(ENV_SUBSCRIPTION_TTL_SECS));
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(GateConfig::from_lookup(lookup(&[(ENV_FETCH_TIMEOUT_SECS, "0")])).is_err());
    }

    #[test]
    fn bad_flag_rejected() {
        let err = GateConfig::from_lookup(lookup(&[(ENV_BYPASS_ADMIN, "sometimes")])).unwrap_err();
        assert!(format!("{err:#}").contains("sometimes"));
    }

    #[tokio::test(start_paused = true)]
    async fn session_lookups_use_the_fetch_timeout() {
        use accessgate_auth::{IdentityError, InMemoryIdentityProvider};

        let config = GateConfig::from_lookup(lookup(&[(ENV_FETCH_TIMEOUT_SECS, "3")])).unwrap();
        let provider = Arc::new(InMemoryIdentityProvider::new());
        provider.set_lookup_delay(Duration::from_secs(3600));

        let store = config.start_sessions(provider);
        assert_eq!(store.lookup_timeout(), Duration::from_secs(3));
        let state = store.settled().await;
        assert_eq!(state.error, Some(IdentityError::Timeout(Duration::from_secs(3))));
    }
}
