use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct CachedRecord {
    record: Record,
    // None means the record never expires (TTL 0).
    expiration: Option<Instant>,
}

/// Append-only, TTL-expiring record set for one domain name.
///
/// Entries are shared through the cache as `Arc<LookupResult>`; in-flight
/// lookups hold only a `Weak` back-reference, so the cache map stays the
/// sole owner. All state is interior-mutable: records behind a lock,
/// lifecycle flags as atomics.
#[derive(Debug)]
pub struct LookupResult {
    name: Name,
    valid: AtomicBool,
    request_done: AtomicBool,
    // Transaction ID of the network request populating this entry, if any.
    id: AtomicU16,
    records: RwLock<Vec<CachedRecord>>,
    desired_types: RwLock<HashSet<RecordType>>,
}

impl LookupResult {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            valid: AtomicBool::new(false),
            request_done: AtomicBool::new(false),
            id: AtomicU16::new(0),
            records: RwLock::new(Vec::new()),
            desired_types: RwLock::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Appends a record and marks the entry valid. A TTL of zero means the
    /// record never expires.
    pub fn add_record(&self, record: Record) {
        self.valid.store(true, Ordering::Release);
        let expiration =
            (record.ttl() > 0).then(|| Instant::now() + Duration::from_secs(record.ttl() as u64));
        self.records.write().push(CachedRecord { record, expiration });
    }

    /// Drops every record whose expiration lies before `now`. Once the
    /// record list is empty and the populating request has finished, the
    /// entry is invalidated and becomes eligible for eviction.
    pub fn check_expiration(&self, now: Instant) {
        if !self.valid.load(Ordering::Acquire) {
            return;
        }

        let mut records = self.records.write();
        records.retain(|cached| {
            let keep = cached.expiration.is_none_or(|expiration| expiration > now);
            if !keep {
                trace!(name = %self.name, record_type = ?cached.record.record_type(), "removing expired record");
            }
            keep
        });

        if records.is_empty() && self.request_done.load(Ordering::Acquire) {
            self.valid.store(false, Ordering::Release);
        }
    }

    /// Whether a non-expired record of `record_type` is present. With
    /// `consider_pending`, a type that an in-flight request has declared
    /// intent to populate also counts, which keeps the entry from being
    /// treated as a miss while an answer is still on its way.
    pub fn has_record_of_type(&self, record_type: RecordType, consider_pending: bool) -> bool {
        if consider_pending && self.desired_types.read().contains(&record_type) {
            return true;
        }

        let now = Instant::now();
        self.records.read().iter().any(|cached| {
            cached.record.record_type() == record_type
                && cached.expiration.is_none_or(|expiration| expiration > now)
        })
    }

    pub fn will_add_record_of_type(&self, record_type: RecordType) {
        self.desired_types.write().insert(record_type);
    }

    /// Marks the populating transaction complete. Called exactly once per
    /// transaction, on success and on failure alike.
    pub fn finished_request(&self) {
        self.request_done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.request_done.load(Ordering::Acquire)
    }

    pub fn can_be_removed(&self) -> bool {
        !self.valid.load(Ordering::Acquire) && self.request_done.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: u16) {
        self.id.store(id, Ordering::Release);
    }

    pub fn id(&self) -> u16 {
        self.id.load(Ordering::Acquire)
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.read().iter().map(|cached| cached.record.clone()).collect()
    }

    pub fn records_of_type(&self, record_type: RecordType) -> Vec<Record> {
        self.records
            .read()
            .iter()
            .filter(|cached| cached.record.record_type() == record_type)
            .map(|cached| cached.record.clone())
            .collect()
    }

    /// Every A/AAAA address currently cached, in insertion order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.records
            .read()
            .iter()
            .filter_map(|cached| match cached.record.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect()
    }
}

/// Cache map keyed by lowercased query name. The cache owns the entries.
pub type LookupCache = DashMap<String, Arc<LookupResult>, FxBuildHasher>;

#[inline]
pub fn new_cache() -> LookupCache {
    DashMap::with_hasher(FxBuildHasher::default())
}
