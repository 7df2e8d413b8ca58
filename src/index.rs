//! Hash+expiration dedup index.
//!
//! Two views over one entry set: a table sorted by expiration (the sweep
//! order) and a content-hash back-index used to detect renewals of an
//! already-held target. The broker keeps one of these in memory; the
//! enforcement cache keeps one mirroring the external packet-filter
//! table. Both apply the identical insert/replace/evict discipline.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::record::{hex_colon, BanRecord, ContentHash};

/// One held record.
///
/// `expiration` is the de-collided sort key, which may sit a few ticks
/// after the expiration encoded in `bytes`. `bytes` is empty for entries
/// rebuilt from an external rule name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub expiration: i64,
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
    /// External rule identifier, set by the enforcement cache.
    pub rule_name: Option<String>,
}

/// Outcome of an insert.
#[derive(Debug, PartialEq, Eq)]
pub enum Insert {
    /// Brand-new target accepted.
    Applied,
    /// Renewal of a held target; the older entry was evicted.
    ReplacedOlder { evicted: IndexEntry },
    /// An equal-or-later-expiring duplicate is already held.
    RejectedOlder,
    /// Distinct-target cap reached; existing entries untouched.
    RejectedCapacity,
    /// Expiration not in the future.
    ExpiredOnArrival,
}

/// Sorted-by-expiration table plus hash back-index.
pub struct DedupIndex {
    by_expiration: BTreeMap<i64, IndexEntry>,
    by_hash: AHashMap<ContentHash, i64>,
    /// Maximum number of distinct targets; 0 means unbounded. Renewals
    /// of a held target always pass regardless of the cap.
    capacity: usize,
    /// Renewal dampening percent; 0 disables it. A renewal extending the
    /// expiration by less than this share of the new time-to-expiry is
    /// treated as a duplicate.
    damping_pct: u32,
}

impl DedupIndex {
    /// Create an index bounding the number of distinct targets
    /// (0 = unbounded).
    pub fn new(capacity: usize) -> DedupIndex {
        DedupIndex {
            by_expiration: BTreeMap::new(),
            by_hash: AHashMap::new(),
            capacity,
            damping_pct: 0,
        }
    }

    /// Create an index that also dampens marginal renewals.
    pub fn with_damping(capacity: usize, damping_pct: u32) -> DedupIndex {
        DedupIndex {
            damping_pct,
            ..DedupIndex::new(capacity)
        }
    }

    pub fn len(&self) -> usize {
        self.by_expiration.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_expiration.is_empty()
    }

    /// Expiration currently held for a hash, if any.
    pub fn expiration_of(&self, hash: &ContentHash) -> Option<i64> {
        self.by_hash.get(hash).copied()
    }

    /// Insert a record, applying the replacement policy.
    pub fn insert(&mut self, record: &BanRecord, now: i64) -> Insert {
        let hash = record.content_hash();
        self.insert_raw(
            record.expiration(),
            hash,
            record.as_bytes().to_vec(),
            None,
            now,
            true,
        )
    }

    /// Rebuild an entry from `(expiration, hash)` alone, as decoded from
    /// an external rule name. Skips the capacity bound and dampening:
    /// the rule already exists externally.
    pub fn restore(
        &mut self,
        expiration: i64,
        hash: ContentHash,
        rule_name: Option<String>,
        now: i64,
    ) -> Insert {
        self.insert_raw(expiration, hash, Vec::new(), rule_name, now, false)
    }

    fn insert_raw(
        &mut self,
        expiration: i64,
        hash: ContentHash,
        bytes: Vec<u8>,
        rule_name: Option<String>,
        now: i64,
        bounded: bool,
    ) -> Insert {
        if expiration <= now {
            return Insert::ExpiredOnArrival;
        }

        if let Some(&held) = self.by_hash.get(&hash) {
            if expiration <= held {
                return Insert::RejectedOlder;
            }
            if bounded && self.damping_pct > 0 {
                let gain = (expiration - held) as i128;
                let ttl = (expiration - now) as i128;
                if gain * 100 < ttl * self.damping_pct as i128 {
                    log::debug!(
                        "dampening renewal of {} (gain {} ticks within {}% of ttl)",
                        hex_colon(&hash),
                        gain,
                        self.damping_pct
                    );
                    return Insert::RejectedOlder;
                }
            }

            let key = self.free_slot(expiration);
            self.by_hash.insert(hash, key);
            let entry = IndexEntry {
                expiration: key,
                hash,
                bytes,
                rule_name,
            };
            self.by_expiration.insert(key, entry);
            return match self.by_expiration.remove(&held) {
                Some(evicted) => Insert::ReplacedOlder { evicted },
                // back-reference pointed at nothing; treat as fresh
                None => Insert::Applied,
            };
        }

        if bounded && self.capacity != 0 && self.by_expiration.len() >= self.capacity {
            return Insert::RejectedCapacity;
        }

        let key = self.free_slot(expiration);
        self.by_hash.insert(hash, key);
        self.by_expiration.insert(
            key,
            IndexEntry {
                expiration: key,
                hash,
                bytes,
                rule_name,
            },
        );
        Insert::Applied
    }

    // The sort key must be unique; bump colliding expirations by single
    // ticks, far below any real TTL.
    fn free_slot(&self, mut expiration: i64) -> i64 {
        while self.by_expiration.contains_key(&expiration) {
            expiration += 1;
        }
        expiration
    }

    /// Attach the external rule name to the entry holding `hash`.
    pub fn set_rule_name(&mut self, hash: &ContentHash, name: String) {
        if let Some(key) = self.by_hash.get(hash) {
            if let Some(entry) = self.by_expiration.get_mut(key) {
                entry.rule_name = Some(name);
            }
        }
    }

    /// Remove and return every entry with `expiration <= now`.
    pub fn sweep(&mut self, now: i64) -> Vec<IndexEntry> {
        let expired: Vec<i64> = self
            .by_expiration
            .range(..=now)
            .map(|(key, _)| *key)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(entry) = self.by_expiration.remove(&key) {
                self.by_hash.remove(&entry.hash);
                removed.push(entry);
            }
        }
        removed
    }

    /// Non-expired record bytes, oldest-expiring first. Entries restored
    /// from rule names carry no bytes and are skipped.
    pub fn snapshot(&self, now: i64) -> Vec<Vec<u8>> {
        self.by_expiration
            .range(now + 1..)
            .filter(|(_, e)| !e.bytes.is_empty())
            .map(|(_, e)| e.bytes.clone())
            .collect()
    }

    /// Like [`snapshot`](Self::snapshot) but newest-expiring first, the
    /// checkpoint order: a later run with a smaller capacity keeps the
    /// longest-lived entries.
    pub fn snapshot_newest_first(&self, now: i64) -> Vec<Vec<u8>> {
        self.by_expiration
            .range(now + 1..)
            .rev()
            .filter(|(_, e)| !e.bytes.is_empty())
            .map(|(_, e)| e.bytes.clone())
            .collect()
    }

    /// All live entries, oldest-expiring first.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.by_expiration.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;

    const NOW: i64 = 1_000_000;

    fn record(port: u16, expiration: i64) -> BanRecord {
        let mut b = RecordBuilder::new(expiration);
        b.add_addr("198.51.100.1".parse().unwrap());
        b.add_port(port);
        b.build()
    }

    #[test]
    fn test_apply_new_target() {
        let mut idx = DedupIndex::new(0);
        assert_eq!(idx.insert(&record(1, NOW + 100), NOW), Insert::Applied);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_expired_on_arrival() {
        let mut idx = DedupIndex::new(0);
        assert_eq!(
            idx.insert(&record(1, NOW - 1), NOW),
            Insert::ExpiredOnArrival
        );
        assert_eq!(idx.insert(&record(1, NOW), NOW), Insert::ExpiredOnArrival);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_monotonic_replacement() {
        let mut idx = DedupIndex::new(0);
        let short = record(1, NOW + 60);
        let long = record(1, NOW + 600);
        assert_eq!(short.content_hash(), long.content_hash());

        // shorter then longer: longer wins
        assert_eq!(idx.insert(&short, NOW), Insert::Applied);
        match idx.insert(&long, NOW) {
            Insert::ReplacedOlder { evicted } => assert_eq!(evicted.expiration, NOW + 60),
            other => panic!("expected replacement, got {:?}", other),
        }
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.expiration_of(&short.content_hash()), Some(NOW + 600));

        // longer already held: shorter rejected
        assert_eq!(idx.insert(&short, NOW), Insert::RejectedOlder);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.expiration_of(&short.content_hash()), Some(NOW + 600));
    }

    #[test]
    fn test_equal_expiration_is_duplicate() {
        let mut idx = DedupIndex::new(0);
        let rec = record(1, NOW + 100);
        assert_eq!(idx.insert(&rec, NOW), Insert::Applied);
        assert_eq!(idx.insert(&rec, NOW), Insert::RejectedOlder);
    }

    #[test]
    fn test_capacity_blocks_new_not_renewal() {
        let mut idx = DedupIndex::new(1);
        assert_eq!(idx.insert(&record(1, NOW + 100), NOW), Insert::Applied);
        assert_eq!(
            idx.insert(&record(2, NOW + 100), NOW),
            Insert::RejectedCapacity
        );
        assert_eq!(idx.len(), 1);

        // renewing the held target always passes the cap
        match idx.insert(&record(1, NOW + 500), NOW) {
            Insert::ReplacedOlder { .. } => {}
            other => panic!("expected replacement, got {:?}", other),
        }
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_capacity_invariant() {
        let mut idx = DedupIndex::new(3);
        for port in 0..10u16 {
            idx.insert(&record(port, NOW + 100 + port as i64 * 1000), NOW);
        }
        assert_eq!(idx.len(), 3);
    }

    #[test]
    fn test_expiration_collision_keeps_both() {
        let mut idx = DedupIndex::new(0);
        assert_eq!(idx.insert(&record(1, NOW + 100), NOW), Insert::Applied);
        assert_eq!(idx.insert(&record(2, NOW + 100), NOW), Insert::Applied);
        assert_eq!(idx.len(), 2);

        let keys: Vec<i64> = idx.entries().map(|e| e.expiration).collect();
        assert_eq!(keys, vec![NOW + 100, NOW + 101]);
    }

    #[test]
    fn test_sweep_removes_expired_only() {
        let mut idx = DedupIndex::new(0);
        idx.insert(&record(1, NOW + 100), NOW);
        idx.insert(&record(2, NOW + 100_000), NOW);

        let removed = idx.sweep(NOW + 1000);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].expiration, NOW + 100);
        assert_eq!(idx.len(), 1);

        // hash index must follow: the swept target can be re-applied
        assert_eq!(idx.insert(&record(1, NOW + 2000), NOW + 1000), Insert::Applied);
    }

    #[test]
    fn test_sweep_idempotent() {
        let mut idx = DedupIndex::new(0);
        idx.insert(&record(1, NOW + 100), NOW);
        idx.insert(&record(2, NOW + 200), NOW);

        assert_eq!(idx.sweep(NOW + 150).len(), 1);
        assert_eq!(idx.sweep(NOW + 150).len(), 0);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_snapshot_orders_and_skips_expired() {
        let mut idx = DedupIndex::new(0);
        idx.insert(&record(1, NOW + 300), NOW);
        idx.insert(&record(2, NOW + 100), NOW);
        idx.insert(&record(3, NOW + 200), NOW);

        let asc = idx.snapshot(NOW + 150);
        assert_eq!(asc.len(), 2);
        let desc = idx.snapshot_newest_first(NOW + 150);
        assert_eq!(desc.len(), 2);
        assert_eq!(asc[0], desc[1]);
        assert_eq!(asc[1], desc[0]);
    }

    #[test]
    fn test_damping_rejects_marginal_renewal() {
        let mut idx = DedupIndex::with_damping(0, 10);
        let held = record(1, NOW + 1_000_000);
        assert_eq!(idx.insert(&held, NOW), Insert::Applied);

        // +1% of the new ttl: dampened
        let marginal = record(1, NOW + 1_010_000);
        assert_eq!(idx.insert(&marginal, NOW), Insert::RejectedOlder);

        // +100%: meaningful extension, replaces
        let worthwhile = record(1, NOW + 2_000_000);
        match idx.insert(&worthwhile, NOW) {
            Insert::ReplacedOlder { .. } => {}
            other => panic!("expected replacement, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_keeps_later_expiring() {
        let mut idx = DedupIndex::new(1);
        let hash: ContentHash = [9; 16];

        assert_eq!(
            idx.restore(NOW + 100, hash, Some("a".into()), NOW),
            Insert::Applied
        );
        // restore bypasses the capacity bound
        assert_eq!(
            idx.restore(NOW + 100, [8; 16], Some("b".into()), NOW),
            Insert::Applied
        );
        // same hash, later expiration: evicts the earlier rule
        match idx.restore(NOW + 500, hash, Some("c".into()), NOW) {
            Insert::ReplacedOlder { evicted } => {
                assert_eq!(evicted.rule_name.as_deref(), Some("a"))
            }
            other => panic!("expected replacement, got {:?}", other),
        }
        // same hash, earlier expiration: dropped
        assert_eq!(
            idx.restore(NOW + 200, hash, Some("d".into()), NOW),
            Insert::RejectedOlder
        );
        // expired rules never enter
        assert_eq!(
            idx.restore(NOW - 5, [7; 16], Some("e".into()), NOW),
            Insert::ExpiredOnArrival
        );
    }

    #[test]
    fn test_scenario_capacity_one() {
        let mut idx = DedupIndex::new(1);
        let h1 = record(1, NOW + 60 * 10_000_000);
        let h1_renewal = record(1, NOW + 600 * 10_000_000);
        let h2 = record(2, NOW + 60 * 10_000_000);

        assert_eq!(idx.insert(&h1, NOW), Insert::Applied);
        assert_eq!(idx.insert(&h2, NOW), Insert::RejectedCapacity);
        match idx.insert(&h1_renewal, NOW) {
            Insert::ReplacedOlder { .. } => {}
            other => panic!("expected replacement, got {:?}", other),
        }
        assert_eq!(idx.len(), 1);
    }
}
