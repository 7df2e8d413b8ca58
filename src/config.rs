//! Broker and enforcement-cache configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Broker configuration.
///
/// Defaults follow the queue daemon this core was extracted from: 250ms
/// receive polls, 100 KiB snapshot batches, uncompressed fan-out.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Queue producers push record messages to.
    pub producer_queue: String,
    /// Well-known queue carrying subscribe/unsubscribe messages.
    pub registration_queue: String,
    /// Lease window in seconds; a subscriber silent for longer is
    /// dropped and its queue torn down. 0 disables the lease sweep.
    pub lease_secs: u64,
    /// Interval of the expired-entry sweep in seconds; 0 disables it.
    pub expiry_sweep_secs: u64,
    /// Maximum number of distinct banned targets held; 0 = unbounded.
    pub max_entries: usize,
    /// Maximum aggregate record bytes per snapshot message.
    pub max_batch_bytes: usize,
    /// Gzip snapshot batches.
    pub compress_batches: bool,
    /// Receive poll timeout in milliseconds; bounds shutdown latency.
    pub poll_timeout_ms: u64,
    /// Checkpoint file written on stop and loaded on start.
    pub checkpoint_file: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            producer_queue: "fail2ban_producer".to_string(),
            registration_queue: "fail2ban_registration".to_string(),
            lease_secs: 300,
            expiry_sweep_secs: 30,
            max_entries: 0,
            max_batch_bytes: 100 * 1024,
            compress_batches: false,
            poll_timeout_ms: 250,
            checkpoint_file: None,
        }
    }
}

impl BrokerConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<BrokerConfig> {
        let text = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.producer_queue.is_empty() || self.registration_queue.is_empty() {
            return Err(Error::Config(
                "producer and registration queue must be specified".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(Error::Config("poll timeout must be non-zero".to_string()));
        }
        if self.max_batch_bytes == 0 {
            return Err(Error::Config(
                "max batch size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// TTL given to fan-out messages: a subscriber that outlives its
    /// lease has no use for them.
    pub fn message_ttl(&self) -> Option<Duration> {
        (self.lease_secs > 0).then(|| Duration::from_secs(self.lease_secs))
    }
}

/// Enforcement-cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnforcerConfig {
    /// Interval of the expired-rule sweep in seconds; 0 disables it.
    pub expiry_sweep_secs: u64,
    /// Maximum number of distinct active rules; 0 = unbounded.
    pub max_entries: usize,
    /// Renewal dampening: a renewal extending the expiration by less
    /// than this percentage of the new time-to-expiry is not worth an
    /// external rule replacement. 0 disables dampening.
    pub renewal_damping_pct: u32,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        EnforcerConfig {
            expiry_sweep_secs: 10,
            max_entries: 0,
            renewal_damping_pct: 10,
        }
    }
}

impl EnforcerConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<EnforcerConfig> {
        let text = std::fs::read_to_string(path)?;
        let config: EnforcerConfig = serde_yaml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        BrokerConfig::default().validate().unwrap();
        assert_eq!(EnforcerConfig::default().renewal_damping_pct, 10);
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = "producer_queue: bans\nlease_secs: 60\ncompress_batches: true\n";
        let config: BrokerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.producer_queue, "bans");
        assert_eq!(config.lease_secs, 60);
        assert!(config.compress_batches);
        // untouched fields keep their defaults
        assert_eq!(config.poll_timeout_ms, 250);
    }

    #[test]
    fn test_empty_queue_rejected() {
        let config = BrokerConfig {
            producer_queue: String::new(),
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_message_ttl_follows_lease() {
        let config = BrokerConfig::default();
        assert_eq!(config.message_ttl(), Some(Duration::from_secs(300)));
        let config = BrokerConfig {
            lease_secs: 0,
            ..BrokerConfig::default()
        };
        assert_eq!(config.message_ttl(), None);
    }
}
