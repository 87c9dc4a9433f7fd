//! Authorization + traffic table (C6).
//!
//! A UUID's presence as a key is the allow-set; absence means "not
//! allowed" (§3 I4). Grounded in the original's `sync.Map` used as both a
//! set and a counter (`userUsedTrafficKb`), reworked onto `DashMap` the way
//! `hub/traffic.rs` keeps a concurrent counter table.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// Per-UUID kilobyte counter, shared between session tasks, the push loop,
/// and the `/stat` route.
///
/// The root map itself sits behind a `RwLock` so `reset_with` can swap in a
/// freshly built map under a single write-lock acquisition: every `add`/
/// `allow` either sees the old map in full or the new one in full, never a
/// partially-rebuilt one. `add`/`allow`/`snapshot` only ever take the read
/// lock, which the `DashMap` beneath it lets multiple callers hold
/// concurrently.
#[derive(Default)]
pub struct TrafficTable {
    counters: RwLock<DashMap<String, Arc<AtomicI64>>>,
}

impl TrafficTable {
    pub fn new() -> Self {
        TrafficTable {
            counters: RwLock::new(DashMap::new()),
        }
    }

    /// Seed the table with an initial allow-set (used at startup from
    /// `ALLOW_USERS`), each starting at zero kilobytes.
    pub fn seed(uuids: impl IntoIterator<Item = String>) -> Self {
        let table = TrafficTable::new();
        let guard = table.counters.read();
        for uuid in uuids {
            guard.insert(uuid, Arc::new(AtomicI64::new(0)));
        }
        drop(guard);
        table
    }

    /// O(1) presence check; the allow-set *is* the key set.
    pub fn allow(&self, uuid: &str) -> bool {
        self.counters.read().contains_key(uuid)
    }

    /// Atomically add `bytes` (converted to kilobytes, `bytes >> 10`) to a
    /// UUID's counter. No-op if the UUID isn't in the allow-set — a session
    /// that was authorized at start but raced a `reset_with` mid-flight
    /// simply stops accumulating rather than resurrecting a removed key.
    pub fn add(&self, uuid: &str, bytes: u64) {
        if let Some(counter) = self.counters.read().get(uuid) {
            counter.fetch_add((bytes >> 10) as i64, Ordering::Relaxed);
        }
    }

    /// Snapshot of every UUID's accumulated kilobytes, for the push loop.
    pub fn snapshot(&self) -> std::collections::HashMap<String, i64> {
        self.counters
            .read()
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    /// Replace the tracked key set with `allowlist`, zeroing every counter.
    /// The fresh map is built off to the side, then installed under one
    /// write-lock acquisition — `add`/`allow` never observe a half-rebuilt
    /// table, since the write lock excludes every reader for the swap's
    /// duration and is held for nothing else.
    pub fn reset_with(&self, allowlist: impl IntoIterator<Item = String>) {
        let fresh: DashMap<String, Arc<AtomicI64>> = allowlist
            .into_iter()
            .map(|uuid| (uuid, Arc::new(AtomicI64::new(0))))
            .collect();
        *self.counters.write() = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_is_allow_set() {
        let table = TrafficTable::seed(["a".to_string(), "b".to_string()]);
        assert!(table.allow("a"));
        assert!(!table.allow("c"));
    }

    #[test]
    fn add_converts_bytes_to_kilobytes() {
        let table = TrafficTable::seed(["a".to_string()]);
        table.add("a", 2048);
        assert_eq!(table.snapshot().get("a"), Some(&2));
    }

    #[test]
    fn add_on_unknown_uuid_is_noop() {
        let table = TrafficTable::new();
        table.add("ghost", 4096);
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn reset_with_zeroes_and_replaces_key_set() {
        let table = TrafficTable::seed(["a".to_string()]);
        table.add("a", 2048);
        table.reset_with(["b".to_string()]);
        assert!(!table.allow("a"));
        assert!(table.allow("b"));
        assert_eq!(table.snapshot().get("b"), Some(&0));
    }
}
