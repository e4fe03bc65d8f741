//! Append-only suppression log
//!
//! Every invalid address and every permanent delivery failure appends one
//! entry. Suppression state is derived from the retained entries; the only
//! way history disappears is [`Blacklist::prune_before`].

use std::collections::BTreeSet;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistStatus {
    /// The address failed syntactic validation
    Invalid,
    /// A delivery attempt to the address failed permanently
    Failed,
}

/// One suppression event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "eml")]
    pub address: String,
    #[serde(rename = "st")]
    pub status: BlacklistStatus,
}

/// Deployment-wide suppression log.
///
/// Appends are safe from any number of concurrent writers; readers may see a
/// log that is a few appends behind.
#[derive(Debug, Default)]
pub struct Blacklist {
    /// Entries ordered by timestamp
    entries: RwLock<Vec<BlacklistEntry>>,
}

impl Blacklist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a blacklist from persisted entries
    #[must_use]
    pub fn from_entries(mut entries: Vec<BlacklistEntry>) -> Self {
        entries.sort_by_key(|entry| entry.timestamp);
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Replace the in-memory log with persisted entries
    pub fn restore(&self, mut entries: Vec<BlacklistEntry>) {
        entries.sort_by_key(|entry| entry.timestamp);
        *self.entries.write() = entries;
    }

    /// Record that `address` is not a valid e-mail address.
    pub fn add_invalid(&self, address: &str) -> BlacklistEntry {
        warn!(address, "Blacklisting address because it is invalid");
        self.record(address, BlacklistStatus::Invalid, Utc::now())
    }

    /// Record that a delivery to `address` failed.
    pub fn add_failed(&self, address: &str) -> BlacklistEntry {
        warn!(address, "Blacklisting address because a delivery failed");
        self.record(address, BlacklistStatus::Failed, Utc::now())
    }

    /// Append an entry with an explicit timestamp, keeping the log time-ordered.
    pub fn record(
        &self,
        address: &str,
        status: BlacklistStatus,
        timestamp: DateTime<Utc>,
    ) -> BlacklistEntry {
        let entry = BlacklistEntry {
            timestamp,
            address: address.to_string(),
            status,
        };

        let mut entries = self.entries.write();
        if entries.last().is_none_or(|last| last.timestamp <= timestamp) {
            entries.push(entry.clone());
        } else {
            let pos = entries.partition_point(|e| e.timestamp <= timestamp);
            entries.insert(pos, entry.clone());
        }

        entry
    }

    /// All addresses with at least one retained "invalid" entry.
    #[must_use]
    pub fn invalid_addresses(&self) -> BTreeSet<String> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.status == BlacklistStatus::Invalid)
            .map(|entry| entry.address.clone())
            .collect()
    }

    /// Addresses with strictly more than `threshold` retained "failed" entries.
    #[must_use]
    pub fn failed_addresses(&self, threshold: usize) -> BTreeSet<String> {
        let entries = self.entries.read();
        let mut counts: AHashMap<&str, usize> = AHashMap::new();

        for entry in entries.iter().filter(|e| e.status == BlacklistStatus::Failed) {
            *counts.entry(entry.address.as_str()).or_default() += 1;
        }

        counts
            .into_iter()
            .filter(|&(_, count)| count > threshold)
            .map(|(address, _)| address.to_string())
            .collect()
    }

    /// Invalid addresses plus addresses failing more than `threshold` times.
    #[must_use]
    pub fn suppressed(&self, threshold: usize) -> BTreeSet<String> {
        let mut suppressed = self.invalid_addresses();
        suppressed.extend(self.failed_addresses(threshold));
        suppressed
    }

    /// Remove every entry older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.timestamp >= cutoff);
        let removed = before - entries.len();

        debug!(removed, retained = entries.len(), %cutoff, "Pruned blacklist");
        removed
    }

    /// Snapshot of the retained log
    #[must_use]
    pub fn entries(&self) -> Vec<BlacklistEntry> {
        self.entries.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_invalid_addresses() {
        let blacklist = Blacklist::new();
        blacklist.add_invalid("broken");
        blacklist.add_invalid("broken");
        blacklist.add_failed("a@x.com");

        assert_eq!(blacklist.len(), 3);
        assert_eq!(blacklist.invalid_addresses(), BTreeSet::from(["broken".to_string()]));
    }

    #[test]
    fn test_failed_threshold_is_strict() {
        let blacklist = Blacklist::new();
        for _ in 0..3 {
            blacklist.add_failed("a@x.com");
        }
        blacklist.add_failed("b@x.com");
        blacklist.add_invalid("a@x.com");

        assert!(blacklist.failed_addresses(2).contains("a@x.com"));
        assert!(!blacklist.failed_addresses(3).contains("a@x.com"));
        assert_eq!(
            blacklist.failed_addresses(0),
            BTreeSet::from(["a@x.com".to_string(), "b@x.com".to_string()])
        );
        assert_eq!(blacklist.failed_addresses(1), BTreeSet::from(["a@x.com".to_string()]));
    }

    #[test]
    fn test_prune_before_cutoff() {
        let now = Utc::now();
        let blacklist = Blacklist::new();
        blacklist.record("old@x.com", BlacklistStatus::Failed, now - Duration::days(10));
        blacklist.record("new@x.com", BlacklistStatus::Failed, now - Duration::days(1));

        let removed = blacklist.prune_before(now - Duration::days(5));

        assert_eq!(removed, 1);
        let remaining = blacklist.entries();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address, "new@x.com");
    }

    #[test]
    fn test_out_of_order_records_stay_sorted() {
        let now = Utc::now();
        let blacklist = Blacklist::new();
        blacklist.record("c@x.com", BlacklistStatus::Failed, now);
        blacklist.record("a@x.com", BlacklistStatus::Failed, now - Duration::days(2));
        blacklist.record("b@x.com", BlacklistStatus::Invalid, now - Duration::days(1));

        let order: Vec<_> = blacklist.entries().into_iter().map(|e| e.address).collect();
        assert_eq!(order, vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn test_from_entries_sorts_and_suppressed_unions() {
        let now = Utc::now();
        let blacklist = Blacklist::from_entries(vec![
            BlacklistEntry {
                timestamp: now,
                address: "f@x.com".to_string(),
                status: BlacklistStatus::Failed,
            },
            BlacklistEntry {
                timestamp: now - Duration::hours(1),
                address: "i@x.com".to_string(),
                status: BlacklistStatus::Invalid,
            },
        ]);

        assert_eq!(blacklist.entries()[0].address, "i@x.com");
        assert_eq!(
            blacklist.suppressed(0),
            BTreeSet::from(["f@x.com".to_string(), "i@x.com".to_string()])
        );
        assert_eq!(blacklist.suppressed(1), BTreeSet::from(["i@x.com".to_string()]));
    }

    #[test]
    fn test_entry_wire_format() {
        let entry = BlacklistEntry {
            timestamp: DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
            address: "a@x.com".to_string(),
            status: BlacklistStatus::Invalid,
        };

        let encoded = ron::to_string(&entry).unwrap();
        assert!(encoded.contains(r#"ts:"2024-01-02T03:04:05Z""#), "{encoded}");
        assert!(encoded.contains(r#"eml:"a@x.com""#), "{encoded}");
        assert!(encoded.contains("st:invalid"), "{encoded}");

        let decoded: BlacklistEntry = ron::from_str(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_concurrent_appends() {
        let blacklist = Arc::new(Blacklist::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let blacklist = Arc::clone(&blacklist);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        blacklist.add_failed(&format!("user{i}@x.com"));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(blacklist.len(), 400);
        assert_eq!(blacklist.failed_addresses(49).len(), 8);
        assert!(blacklist.failed_addresses(50).is_empty());
    }
}
