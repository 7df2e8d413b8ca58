//! Packet-filter engine seam.
//!
//! The enforcement cache drives an external packet filter that keeps a
//! named, enumerable table of active rules. Concrete backends (WFP,
//! nftables, pf, cloud security groups) implement [`PacketFilter`];
//! [`MemoryFirewall`] is the table-backed implementation used by tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::record::BanRecord;

/// External packet-filter failure. Never fatal to the cache: the
/// in-memory index stays authoritative and the next renewal or sweep
/// retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirewallError {
    #[error("no such rule: {0}")]
    RuleNotFound(String),

    #[error("packet filter unavailable: {0}")]
    Unavailable(String),
}

/// A named, enumerable table of active filter rules.
pub trait PacketFilter: Send + Sync {
    /// Install a block rule for the record's match fields under `name`.
    fn add_rule(&self, name: &str, record: &BanRecord) -> Result<(), FirewallError>;

    /// Remove the rule installed under `name`.
    fn remove_rule(&self, name: &str) -> Result<(), FirewallError>;

    /// Names of all currently installed rules.
    fn list_rules(&self) -> Result<Vec<String>, FirewallError>;
}

/// In-process [`PacketFilter`] keeping rules in a map.
#[derive(Clone, Default)]
pub struct MemoryFirewall {
    rules: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_mutations: Arc<Mutex<bool>>,
}

impl MemoryFirewall {
    pub fn new() -> MemoryFirewall {
        MemoryFirewall::default()
    }

    /// Make every add/remove fail until re-enabled (test helper).
    pub fn set_fail_mutations(&self, fail: bool) {
        *self.fail_mutations.lock() = fail;
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.lock().contains_key(name)
    }

    /// Install a rule by name only, as left behind by an earlier run
    /// (test helper for reconcile).
    pub fn preload_rule(&self, name: &str) {
        self.rules.lock().insert(name.to_string(), Vec::new());
    }
}

impl PacketFilter for MemoryFirewall {
    fn add_rule(&self, name: &str, record: &BanRecord) -> Result<(), FirewallError> {
        if *self.fail_mutations.lock() {
            return Err(FirewallError::Unavailable("mutations disabled".to_string()));
        }
        self.rules
            .lock()
            .insert(name.to_string(), record.as_bytes().to_vec());
        Ok(())
    }

    fn remove_rule(&self, name: &str) -> Result<(), FirewallError> {
        if *self.fail_mutations.lock() {
            return Err(FirewallError::Unavailable("mutations disabled".to_string()));
        }
        match self.rules.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(FirewallError::RuleNotFound(name.to_string())),
        }
    }

    fn list_rules(&self) -> Result<Vec<String>, FirewallError> {
        Ok(self.rules.lock().keys().cloned().collect())
    }
}
