use std::env;
use std::time::Duration;

use super::{Error, Result};

/// Controller settings, read once at startup from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    /// etcdadm release the provisioning scripts install
    pub etcdadm_version: String,
    /// How often to re-probe a cluster that is ready and healthy
    pub probe_interval_healthy: Duration,
    /// How often to re-probe a cluster that is not
    pub probe_interval_degraded: Duration,
    /// Per-request timeout for health probes
    pub probe_timeout: Duration,
    /// How many failed leave-cluster attempts to tolerate before abandoning
    /// the member on finalization
    pub leave_retry_budget: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            etcdadm_version: "0.1.10".into(),
            probe_interval_healthy: Duration::from_secs(180),
            probe_interval_degraded: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            leave_retry_budget: 5,
        }
    }
}

fn env_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::InvalidConfig {
                var: var.into(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let mut config = Config::default();
        if let Ok(v) = env::var("ETCDCAT_ETCDADM_VERSION") {
            config.etcdadm_version = v;
        }
        if let Some(secs) = env_u64("ETCDCAT_PROBE_INTERVAL_HEALTHY")? {
            config.probe_interval_healthy = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("ETCDCAT_PROBE_INTERVAL_DEGRADED")? {
            config.probe_interval_degraded = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("ETCDCAT_PROBE_TIMEOUT")? {
            config.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(budget) = env_u64("ETCDCAT_LEAVE_RETRY_BUDGET")? {
            config.leave_retry_budget = budget as u32;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_probe_cadence() {
        let config = Config::default();
        assert_eq!(config.probe_interval_degraded, Duration::from_secs(5));
        assert_eq!(config.probe_interval_healthy, Duration::from_secs(180));
        assert_eq!(config.leave_retry_budget, 5);
    }
}
