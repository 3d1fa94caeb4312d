//! Content-addressed record cache (spec §3/§4.D).
//!
//! Keyed by lowercased name; each bucket holds the set of records observed
//! for that name. A single mutex guards the whole table, matching the
//! teacher's `hr-dns::DnsCache` (`RwLock<FxHashMap<..>>`) — short critical
//! sections, snapshot-then-release for iteration.

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::name;
use crate::records::{RData, Record, RecordType};

pub struct Cache {
    buckets: RwLock<FxHashMap<String, Vec<Record>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(FxHashMap::default()),
        }
    }

    /// Insert `record`, replacing any record with equal identity. If
    /// `record`'s cache-flush bit is set, also evicts prior records of the
    /// same (name, type, class) whose `created_at_ms` is more than 1s
    /// older than `now_ms` — tolerating duplicated probes without evicting
    /// records from a response that just arrived in the same burst.
    ///
    /// Adopts `record`'s own `created_at_ms`/`ttl` on replacement (the
    /// "newer observation wins" default); callers wanting to preserve an
    /// earlier `created_at_ms` should stamp `record` with the old value
    /// before calling.
    pub async fn add(&self, record: Record) {
        let key = name::key(&record.name);
        let identity = record.identity();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key).or_default();

        if record.class.flush_or_unicast {
            let cutoff = record.created_at_ms.saturating_sub(1_000);
            bucket.retain(|existing| {
                !(existing.rtype.to_u16() == record.rtype.to_u16()
                    && existing.class.identity_bits() == record.class.identity_bits()
                    && existing.created_at_ms < cutoff)
            });
        }

        if let Some(slot) = bucket.iter_mut().find(|existing| existing.identity() == identity) {
            *slot = record;
        } else {
            bucket.push(record);
        }
    }

    /// Delete a record by identity. Used on receipt of a goodbye (TTL=0).
    pub async fn remove(&self, record: &Record) {
        let key = name::key(&record.name);
        let identity = record.identity();
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get_mut(&key) {
            bucket.retain(|existing| existing.identity() != identity);
            if bucket.is_empty() {
                buckets.remove(&key);
            }
        }
    }

    /// Snapshot of every non-expired record for `name`.
    pub async fn get_by_name(&self, name_str: &str, now_ms: u64) -> Vec<Record> {
        let key = name::key(name_str);
        let buckets = self.buckets.read().await;
        buckets
            .get(&key)
            .map(|bucket| bucket.iter().filter(|r| !r.is_expired(now_ms)).cloned().collect())
            .unwrap_or_default()
    }

    /// First non-expired record matching (name, type, class), if any.
    pub async fn get_by_details(&self, name_str: &str, rtype: RecordType, class_code: u16, now_ms: u64) -> Option<Record> {
        let key = name::key(name_str);
        let buckets = self.buckets.read().await;
        buckets.get(&key)?.iter().find(|r| {
            r.rtype.to_u16() == rtype.to_u16() && r.class.identity_bits() == class_code && !r.is_expired(now_ms)
        }).cloned()
    }

    /// Probe conflict detection (§4.D): for a proposed record of `rtype`
    /// named `name_str`, return cache entries that would conflict with
    /// registering it — any PTR record whose alias (target) equals
    /// `name_str`, or any SRV/TXT record sharing `name_str`'s key (the
    /// "does somebody else already own this name" case). Any other
    /// `rtype` matches nothing, per the spec's literal two-arm contract.
    pub async fn entries_with_name_and_alias(&self, rtype: RecordType, name_str: &str, now_ms: u64) -> Vec<Record> {
        let key = name::key(name_str);
        let buckets = self.buckets.read().await;
        let mut out = Vec::new();
        for bucket in buckets.values() {
            for record in bucket {
                if record.is_expired(now_ms) {
                    continue;
                }
                match rtype {
                    RecordType::PTR => {
                        if let RData::Ptr(target) = &record.rdata {
                            if name::key(target) == key {
                                out.push(record.clone());
                            }
                        }
                    }
                    RecordType::SRV | RecordType::TXT => {
                        if name::key(&record.name) == key {
                            out.push(record.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        out
    }

    /// Evict every expired record; called on a reap cadence of at least
    /// once per 10s. Returns the number of records evicted.
    pub async fn reap(&self, now_ms: u64) -> usize {
        let mut buckets = self.buckets.write().await;
        let mut evicted = 0;
        buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|r| !r.is_expired(now_ms));
            evicted += before - bucket.len();
            !bucket.is_empty()
        });
        evicted
    }

    /// Total record count across all names (tests / diagnostics only).
    pub async fn len(&self) -> usize {
        self.buckets.read().await.values().map(Vec::len).sum()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn insert_and_lookup_by_name() {
        let cache = Cache::new();
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 1), 120, 0)).await;
        let found = cache.get_by_name("HOST.local.", 0).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn equal_identity_replaces_not_duplicates() {
        let cache = Cache::new();
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 1), 120, 0)).await;
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 1), 60, 5_000)).await;
        assert_eq!(cache.len().await, 1);
        let record = cache.get_by_details("host.local.", RecordType::A, 1, 5_000).await.unwrap();
        assert_eq!(record.ttl, 60);
    }

    #[tokio::test]
    async fn expiry_makes_get_by_details_return_none() {
        let cache = Cache::new();
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 1), 10, 0)).await;
        assert!(cache.get_by_details("host.local.", RecordType::A, 1, 9_000).await.is_some());
        assert!(cache.get_by_details("host.local.", RecordType::A, 1, 11_000).await.is_none());
    }

    #[tokio::test]
    async fn cache_flush_evicts_older_peers_of_same_name_type_class() {
        let cache = Cache::new();
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 1), 120, 0)).await;
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 2), 120, 5_000)).await;
        assert_eq!(cache.len().await, 1);
        let remaining = cache.get_by_name("host.local.", 5_000).await;
        assert_eq!(remaining[0].rdata, RData::A(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[tokio::test]
    async fn cache_flush_tolerates_duplicated_probes_within_one_second() {
        let cache = Cache::new();
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 1), 120, 0)).await;
        cache.add(Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 2), 120, 500)).await;
        // Both records are newer than "now - 1s", so both survive.
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn reap_evicts_only_expired() {
        let cache = Cache::new();
        cache.add(Record::a("alive.local.", Ipv4Addr::new(10, 0, 0, 1), 120, 0)).await;
        cache.add(Record::a("dead.local.", Ipv4Addr::new(10, 0, 0, 2), 5, 0)).await;
        let evicted = cache.reap(6_000).await;
        assert_eq!(evicted, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn entries_with_alias_finds_ptr_targeting_name() {
        let cache = Cache::new();
        cache.add(Record::ptr("_http._tcp.local.", "my-instance._http._tcp.local.", 120, 0)).await;
        let conflicts = cache
            .entries_with_name_and_alias(RecordType::PTR, "my-instance._http._tcp.local.", 0)
            .await;
        assert_eq!(conflicts.len(), 1);
    }

    #[tokio::test]
    async fn entries_with_alias_finds_txt_sharing_name_key() {
        let cache = Cache::new();
        cache
            .add(Record::txt("my-instance._http._tcp.local.", crate::records::Txt::from_entries([b"k=v".as_slice()]), 120, 0))
            .await;
        let conflicts = cache
            .entries_with_name_and_alias(RecordType::TXT, "my-instance._http._tcp.local.", 0)
            .await;
        assert_eq!(conflicts.len(), 1);
    }

    #[tokio::test]
    async fn entries_with_alias_ignores_unrelated_record_types() {
        let cache = Cache::new();
        cache.add(Record::a("my-instance._http._tcp.local.", Ipv4Addr::new(10, 0, 0, 1), 120, 0)).await;
        // An A record sharing the name key is not a PTR alias nor an
        // SRV/TXT name conflict, so a query for any other `rtype` (here,
        // A itself) must return nothing.
        let conflicts = cache
            .entries_with_name_and_alias(RecordType::A, "my-instance._http._tcp.local.", 0)
            .await;
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_by_identity() {
        let cache = Cache::new();
        let record = Record::a("host.local.", Ipv4Addr::new(10, 0, 0, 1), 120, 0);
        cache.add(record.clone()).await;
        cache.remove(&record).await;
        assert_eq!(cache.len().await, 0);
    }
}
