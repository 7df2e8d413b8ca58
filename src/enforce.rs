//! Enforcement cache.
//!
//! Mirrors the external packet-filter table in a [`DedupIndex`] so that
//! duplicate and marginal-renewal records never touch the filter, which
//! is orders of magnitude more expensive than a map lookup. The cache
//! reconciles against rules left behind by an earlier run, applies
//! incoming records with new-before-old replacement, and periodically
//! sweeps expired rules out of the filter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::EnforcerConfig;
use crate::error::{Error, Result};
use crate::firewall::{FirewallError, PacketFilter};
use crate::index::{DedupIndex, IndexEntry, Insert};
use crate::record::{decode_name, ticks_now, BanRecord};
use crate::shutdown::Shutdown;
use crate::throttle::LimitedLog;

struct Shared {
    config: EnforcerConfig,
    filter: Arc<dyn PacketFilter>,
    index: Mutex<DedupIndex>,
    shutdown: Shutdown,
    /// Re-checked by the sweep loop immediately before it mutates the
    /// filter, closing the shutdown race with an already-due tick.
    sweep_enabled: AtomicBool,
    /// Capacity overflows repeat at attack rates; keep them out of the log.
    capacity_log: Mutex<LimitedLog>,
}

/// Dedup cache in front of a [`PacketFilter`].
///
/// The index is authoritative: an external add or remove that fails is
/// logged and retried naturally by the next renewal or sweep, never by
/// rolling the index back.
pub struct EnforcementCache {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl EnforcementCache {
    pub fn new(config: EnforcerConfig, filter: Arc<dyn PacketFilter>) -> EnforcementCache {
        let index = DedupIndex::with_damping(config.max_entries, config.renewal_damping_pct);
        EnforcementCache {
            shared: Arc::new(Shared {
                config,
                filter,
                index: Mutex::new(index),
                shutdown: Shutdown::new(),
                sweep_enabled: AtomicBool::new(false),
                capacity_log: Mutex::new(LimitedLog::default()),
            }),
            threads: Vec::new(),
        }
    }

    /// Rebuild the index from the rules already installed in the filter.
    ///
    /// Rules whose names do not decode are left untouched; they belong
    /// to someone else. Expired rules and rules shadowed by a
    /// later-expiring rule for the same target are removed externally.
    pub fn reconcile(&self) -> Result<()> {
        let names = self.shared.filter.list_rules().map_err(Error::Firewall)?;
        let now = ticks_now();
        log::info!("reconciling against {} installed rules", names.len());

        let mut kept = 0usize;
        let mut dropped = Vec::new();

        {
            let mut index = self.shared.index.lock();
            for name in names {
                let (expiration, hash) = match decode_name(&name) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        log::debug!("leaving unrecognized rule alone: {}", e);
                        continue;
                    }
                };

                match index.restore(expiration, hash, Some(name.clone()), now) {
                    Insert::Applied => kept += 1,
                    Insert::ReplacedOlder { evicted } => {
                        if let Some(old) = evicted.rule_name {
                            dropped.push(old);
                        }
                    }
                    // this rule is the shorter-lived duplicate
                    Insert::RejectedOlder | Insert::ExpiredOnArrival => dropped.push(name),
                    Insert::RejectedCapacity => unreachable!("restore is unbounded"),
                }
            }
        }

        for name in &dropped {
            remove_external(&self.shared, name);
        }

        log::info!(
            "reconcile finished: {} rules adopted, {} removed",
            kept,
            dropped.len()
        );
        Ok(())
    }

    /// Apply one ban record, touching the filter only when the index
    /// accepts it.
    ///
    /// A renewal installs the new rule before removing the superseded
    /// one, so the target stays blocked throughout.
    pub fn apply(&self, record: &BanRecord) {
        let now = ticks_now();
        let name = record.rule_name();

        let outcome = {
            let mut index = self.shared.index.lock();
            let outcome = index.insert(record, now);
            if matches!(outcome, Insert::Applied | Insert::ReplacedOlder { .. }) {
                index.set_rule_name(&record.content_hash(), name.clone());
            }
            outcome
        };

        match outcome {
            Insert::Applied => {
                self.shared.capacity_log.lock().reset();
                add_external(&self.shared, &name, record);
            }
            Insert::ReplacedOlder { evicted } => {
                self.shared.capacity_log.lock().reset();
                add_external(&self.shared, &name, record);
                if let Some(old) = evicted.rule_name {
                    remove_external(&self.shared, &old);
                }
            }
            Insert::RejectedOlder => log::debug!("duplicate not newer: {}", record),
            Insert::ExpiredOnArrival => {
                log::info!("skipping record that expired on arrival: {}", record)
            }
            Insert::RejectedCapacity => self
                .shared
                .capacity_log
                .lock()
                .warn("distinct-rule cap reached, dropping ban record"),
        }
    }

    /// Drop expired entries and their external rules now.
    pub fn sweep_now(&self) {
        sweep_once(&self.shared);
    }

    /// Start the periodic expired-rule sweep.
    pub fn start(&mut self) -> Result<()> {
        if !self.threads.is_empty() {
            return Err(Error::Lifecycle("enforcement cache already running".to_string()));
        }
        if self.shared.shutdown.is_triggered() {
            return Err(Error::Lifecycle("enforcement cache already stopped".to_string()));
        }

        self.shared.sweep_enabled.store(true, Ordering::SeqCst);
        if self.shared.config.expiry_sweep_secs > 0 {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name("enforce-sweep".to_string())
                .spawn(move || sweep_loop(&shared))?;
            self.threads.push(handle);
        }
        Ok(())
    }

    /// Stop the sweep. Installed rules stay in the filter; the next run
    /// adopts them through [`reconcile`](Self::reconcile).
    pub fn stop(&mut self) {
        self.shared.sweep_enabled.store(false, Ordering::SeqCst);
        self.shared.shutdown.trigger();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("sweep thread panicked");
            }
        }
    }

    /// Number of live index entries.
    pub fn entry_count(&self) -> usize {
        self.shared.index.lock().len()
    }

    /// Expirations currently tracked, oldest first (diagnostics).
    pub fn expirations(&self) -> Vec<i64> {
        self.shared.index.lock().entries().map(|e| e.expiration).collect()
    }
}

impl Drop for EnforcementCache {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

fn add_external(shared: &Shared, name: &str, record: &BanRecord) {
    if let Err(e) = shared.filter.add_rule(name, record) {
        log::warn!("unable to install rule {}: {}", name, e);
    }
}

fn remove_external(shared: &Shared, name: &str) {
    match shared.filter.remove_rule(name) {
        Ok(()) | Err(FirewallError::RuleNotFound(_)) => {}
        Err(e) => log::warn!("unable to remove rule {}: {}", name, e),
    }
}

fn sweep_loop(shared: &Arc<Shared>) {
    let interval = Duration::from_secs(shared.config.expiry_sweep_secs);
    let mut trouble = LimitedLog::default();

    loop {
        if shared.shutdown.wait(interval) {
            break;
        }
        if !shared.sweep_enabled.load(Ordering::SeqCst) {
            continue;
        }
        let failures = sweep_once(shared);
        if failures > 0 {
            trouble.warn(&format!("{} expired rules could not be removed", failures));
        } else {
            trouble.reset();
        }
    }
}

fn sweep_once(shared: &Shared) -> usize {
    let removed: Vec<IndexEntry> = shared.index.lock().sweep(ticks_now());
    if removed.is_empty() {
        return 0;
    }

    log::info!("sweeping {} expired rules", removed.len());
    let mut failures = 0usize;
    for entry in removed {
        if let Some(name) = entry.rule_name {
            match shared.filter.remove_rule(&name) {
                Ok(()) | Err(FirewallError::RuleNotFound(_)) => {}
                Err(e) => {
                    log::warn!("unable to remove expired rule {}: {}", name, e);
                    failures += 1;
                }
            }
        }
    }
    failures
}
