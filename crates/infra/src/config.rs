//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Floor for deferred pledge notifications.
pub const MIN_NOTIFICATION_DELAY_SECS: u64 = 60;

pub const ENV_NOTIFICATION_DELAY: &str = "PLEDGEBANK_NOTIFICATION_DELAY_SECS";
pub const ENV_REFUND_NOTIFICATION_DELAY: &str = "PLEDGEBANK_REFUND_NOTIFICATION_DELAY_SECS";
pub const ENV_REEVALUATE_STALLED: &str = "PLEDGEBANK_REEVALUATE_STALLED";
pub const ENV_EXECUTOR_POLL_MS: &str = "PLEDGEBANK_EXECUTOR_POLL_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before completion notifications and activity entries run.
    /// Values under a minute are raised to a minute.
    pub notification_delay_secs: u64,
    /// Delay before the refund notification runs.
    pub refund_notification_delay_secs: u64,
    /// Re-attempt a user's stalled pledges when their balance goes up.
    pub reevaluate_stalled_pledges: bool,
    pub executor_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notification_delay_secs: MIN_NOTIFICATION_DELAY_SECS,
            refund_notification_delay_secs: 0,
            reevaluate_stalled_pledges: true,
            executor_poll_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; missing keys keep their defaults,
    /// malformed values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        override_from(&lookup, ENV_NOTIFICATION_DELAY, &mut config.notification_delay_secs);
        override_from(
            &lookup,
            ENV_REFUND_NOTIFICATION_DELAY,
            &mut config.refund_notification_delay_secs,
        );
        override_from(&lookup, ENV_REEVALUATE_STALLED, &mut config.reevaluate_stalled_pledges);
        override_from(&lookup, ENV_EXECUTOR_POLL_MS, &mut config.executor_poll_interval_ms);
        config
    }

    pub fn notification_delay(&self) -> Duration {
        Duration::from_secs(self.notification_delay_secs.max(MIN_NOTIFICATION_DELAY_SECS))
    }

    pub fn refund_notification_delay(&self) -> Duration {
        Duration::from_secs(self.refund_notification_delay_secs)
    }

    pub fn executor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.executor_poll_interval_ms)
    }
}

fn override_from<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring malformed configuration value"),
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
    fn defaults_apply_without_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.notification_delay(), Duration::from_secs(60));
        assert_eq!(config.refund_notification_delay(), Duration::ZERO);
        assert!(config.reevaluate_stalled_pledges);
    }

    #[test]
    fn notification_delay_never_drops_below_a_minute() {
        let config = EngineConfig::from_lookup(lookup(&[(ENV_NOTIFICATION_DELAY, "5")]));
        assert_eq!(config.notification_delay_secs, 5);
        assert_eq!(config.notification_delay(), Duration::from_secs(60));

        let config = EngineConfig::from_lookup(lookup(&[(ENV_NOTIFICATION_DELAY, "300")]));
        assert_eq!(config.notification_delay(), Duration::from_secs(300));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_REEVALUATE_STALLED, "maybe"),
            (ENV_EXECUTOR_POLL_MS, "-4"),
            (ENV_REFUND_NOTIFICATION_DELAY, " 30 "),
        ]));
        assert!(config.reevaluate_stalled_pledges);
        assert_eq!(config.executor_poll_interval_ms, 100);
        assert_eq!(config.refund_notification_delay_secs, 30);
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"reevaluate_stalled_pledges": false}"#).unwrap();
        assert!(!config.reevaluate_stalled_pledges);
        assert_eq!(config.notification_delay_secs, 60);
    }
}
