//! In-memory revisioned key-value store.
//!
//! Implements the full store client interface in one process:
//! - MVCC bookkeeping (create/mod revision, version) with a global revision
//! - Atomic compare-then-apply transactions
//! - Watches with history replay and compaction
//! - Leases with a background reaper that deletes attached keys on expiry
//! - Fault injection: the store can be made unavailable to model a partition,
//!   and watches can be made to report compaction
//!
//! Time is read from `tokio::time`, so paused-clock tests can fast-forward
//! lease expiry.

use crate::error::{Error, Result};
use crate::store::{
    Compare, GetOptions, Kv, Lease, Op, OpResponse, SortOrder, SortTarget, Txn, TxnResponse,
    WatchOptions, WatchStream, Watcher,
};
use crate::types::{
    DeleteResponse, Event, EventType, GetResponse, KeyValue, LeaseGrantResponse, LeaseId,
    LeaseKeepAliveResponse, PutResponse, ResponseHeader, Revision, WatchResponse, NO_LEASE,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Memory store configuration
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// How often the reaper looks for expired leases
    pub reap_interval: Duration,
    /// Granted TTLs are raised to at least this
    pub min_ttl: Duration,
    /// Revisions of event history kept before older ones are compacted
    /// automatically, 0 to keep everything
    pub history_limit: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(100),
            min_ttl: Duration::from_secs(1),
            history_limit: 0,
        }
    }
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatcherEntry {
    key: String,
    prefix: bool,
    tx: mpsc::UnboundedSender<Result<WatchResponse>>,
}

impl WatcherEntry {
    fn matches(&self, key: &str) -> bool {
        if self.prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

struct Inner {
    revision: Revision,
    compact_revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    /// Events per revision, only revisions above `compact_revision`
    history: BTreeMap<Revision, Vec<Event>>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: LeaseId,
    watchers: Vec<WatcherEntry>,
    available: bool,
    /// Upcoming watch calls that fail as compacted regardless of start
    forced_compactions: usize,
    history_limit: usize,
}

impl Inner {
    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.revision,
        }
    }

    fn range(&self, key: &str, options: &GetOptions) -> GetResponse {
        let mut kvs: Vec<KeyValue> = if options.prefix {
            self.kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            self.kvs.get(key).cloned().into_iter().collect()
        };

        if options.max_create_revision > 0 {
            kvs.retain(|kv| kv.create_revision <= options.max_create_revision);
        }

        match options.sort_target {
            SortTarget::Key => {}
            SortTarget::CreateRevision => kvs.sort_by_key(|kv| kv.create_revision),
            SortTarget::ModRevision => kvs.sort_by_key(|kv| kv.mod_revision),
        }
        if options.sort_order == SortOrder::Descend {
            kvs.reverse();
        }

        let count = kvs.len();
        if options.limit > 0 {
            kvs.truncate(options.limit);
        }

        GetResponse {
            header: self.header(),
            kvs,
            count,
        }
    }

    /// Reject a write branch that references an unknown lease before
    /// anything in it is applied
    fn validate(&self, ops: &[Op]) -> Result<()> {
        for op in ops {
            if let Op::Put {
                lease,
                ignore_lease: false,
                ..
            } = op
            {
                if *lease != NO_LEASE && !self.leases.contains_key(lease) {
                    return Err(Error::LeaseNotFound(*lease));
                }
            }
        }
        Ok(())
    }

    fn detach(&mut self, key: &str, lease: LeaseId) {
        if lease == NO_LEASE {
            return;
        }
        if let Some(entry) = self.leases.get_mut(&lease) {
            entry.keys.remove(key);
        }
    }

    fn put(
        &mut self,
        key: String,
        value: Vec<u8>,
        lease: LeaseId,
        ignore_lease: bool,
        rev: Revision,
        events: &mut Vec<Event>,
    ) -> PutResponse {
        let prev = self.kvs.get(&key).cloned();
        let lease = if ignore_lease {
            prev.as_ref().map_or(NO_LEASE, |p| p.lease)
        } else {
            lease
        };

        if let Some(p) = &prev {
            if p.lease != lease {
                self.detach(&key, p.lease);
            }
        }
        if let Some(entry) = self.leases.get_mut(&lease) {
            entry.keys.insert(key.clone());
        }

        let kv = KeyValue {
            key: key.clone(),
            value,
            create_revision: prev.as_ref().map_or(rev, |p| p.create_revision),
            mod_revision: rev,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease,
        };
        self.kvs.insert(key, kv.clone());
        events.push(Event {
            kind: EventType::Put,
            kv,
        });

        PutResponse {
            header: ResponseHeader::default(),
            prev_kv: prev,
        }
    }

    fn delete(&mut self, key: &str, prefix: bool, rev: Revision, events: &mut Vec<Event>) -> DeleteResponse {
        let keys: Vec<String> = if prefix {
            self.kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else if self.kvs.contains_key(key) {
            vec![key.to_string()]
        } else {
            Vec::new()
        };

        for k in &keys {
            if let Some(old) = self.kvs.remove(k) {
                self.detach(k, old.lease);
                events.push(tombstone(k, rev));
            }
        }

        DeleteResponse {
            header: ResponseHeader::default(),
            deleted: keys.len(),
        }
    }

    fn apply(&mut self, ops: Vec<Op>, rev: Revision, events: &mut Vec<Event>) -> Vec<OpResponse> {
        ops.into_iter()
            .map(|op| match op {
                Op::Put {
                    key,
                    value,
                    lease,
                    ignore_lease,
                } => OpResponse::Put(self.put(key, value, lease, ignore_lease, rev, events)),
                Op::Get { key, options } => {
                    let mut resp = self.range(&key, &options);
                    resp.header.revision = rev;
                    OpResponse::Get(resp)
                }
                Op::Delete { key, prefix } => OpResponse::Delete(self.delete(&key, prefix, rev, events)),
            })
            .collect()
    }

    fn write(&mut self, ops: Vec<Op>) -> Result<(ResponseHeader, Vec<OpResponse>)> {
        self.validate(&ops)?;
        let rev = self.revision + 1;
        let mut events = Vec::new();
        let mut responses = self.apply(ops, rev, &mut events);
        self.commit(rev, events);

        let header = self.header();
        for resp in &mut responses {
            match resp {
                OpResponse::Put(r) => r.header = header,
                OpResponse::Get(r) => r.header = header,
                OpResponse::Delete(r) => r.header = header,
            }
        }
        Ok((header, responses))
    }

    /// Make `events` visible at `rev` and fan them out to watchers
    fn commit(&mut self, rev: Revision, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.revision = rev;

        for watcher in &self.watchers {
            let matched: Vec<Event> = events
                .iter()
                .filter(|ev| watcher.matches(&ev.kv.key))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            let _ = watcher.tx.send(Ok(WatchResponse {
                header: ResponseHeader { revision: rev },
                events: matched,
            }));
        }
        self.watchers.retain(|w| !w.tx.is_closed());
        self.history.insert(rev, events);

        if self.history_limit > 0 {
            while self.history.len() > self.history_limit {
                let Some((oldest, _)) = self.history.pop_first() else {
                    break;
                };
                self.compact_revision = oldest;
            }
        }
    }

    fn revoke(&mut self, id: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&id) else {
            return false;
        };

        let rev = self.revision + 1;
        let mut events = Vec::new();
        for key in entry.keys {
            let attached = self.kvs.get(&key).is_some_and(|kv| kv.lease == id);
            if attached {
                self.kvs.remove(&key);
                events.push(tombstone(&key, rev));
            }
        }
        self.commit(rev, events);
        true
    }
}

fn tombstone(key: &str, rev: Revision) -> Event {
    Event {
        kind: EventType::Delete,
        kv: KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            create_revision: 0,
            mod_revision: rev,
            version: 0,
            lease: NO_LEASE,
        },
    }
}

/// Single-process store implementing `Kv`, `Watcher` and `Lease`
pub struct MemoryStore {
    inner: Mutex<Inner>,
    config: MemoryStoreConfig,
}

impl MemoryStore {
    /// Create a store with default config.
    ///
    /// Spawns the lease reaper, so this must run inside a tokio runtime.
    /// The reaper stops once the last `Arc` is dropped.
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Mutex::new(Inner {
                revision: 1,
                compact_revision: 0,
                kvs: BTreeMap::new(),
                history: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 1,
                watchers: Vec::new(),
                available: true,
                forced_compactions: 0,
                history_limit: config.history_limit,
            }),
            config,
        });

        let weak = Arc::downgrade(&store);
        let reap_interval = store.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = interval(reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => {
                        store.expire_leases();
                    }
                    None => break,
                }
            }
        });

        store
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.inner.lock().revision
    }

    pub fn compact_revision(&self) -> Revision {
        self.inner.lock().compact_revision
    }

    /// Discard history at and below `rev`
    pub fn compact(&self, rev: Revision) -> Result<()> {
        let mut inner = self.inner.lock();
        if rev <= inner.compact_revision {
            return Err(Error::Compacted(inner.compact_revision));
        }
        let rev = rev.min(inner.revision);
        inner.history = inner.history.split_off(&(rev + 1));
        inner.compact_revision = rev;
        info!("MemoryStore: Compacted history at revision {}", rev);
        Ok(())
    }

    /// Toggle availability; while unavailable every client call fails
    pub fn set_available(&self, available: bool) {
        let mut inner = self.inner.lock();
        if inner.available != available {
            warn!("MemoryStore: Availability set to {}", available);
        }
        inner.available = available;
    }

    /// Make the next `count` watch calls fail with `Error::Compacted`,
    /// as if their start revision had been compacted away
    pub fn inject_compaction(&self, count: usize) {
        self.inner.lock().forced_compactions = count;
    }

    /// Remaining TTL of a live lease
    pub fn lease_time_to_live(&self, id: LeaseId) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .leases
            .get(&id)
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Number of registered watchers
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Revoke every lease whose deadline has passed; returns how many
    pub fn expire_leases(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            info!("MemoryStore: Lease {:x} expired", id);
            inner.revoke(*id);
        }
        expired.len()
    }

    fn lock_available(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(Error::Unavailable("memory store is partitioned".to_string()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl Kv for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<PutResponse> {
        let mut inner = self.lock_available()?;
        let (_, mut responses) = inner.write(vec![Op::put(key, value, lease)])?;
        match responses.pop() {
            Some(OpResponse::Put(resp)) => Ok(resp),
            _ => unreachable!("put op yields a put response"),
        }
    }

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse> {
        let inner = self.lock_available()?;
        Ok(inner.range(key, &options))
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<DeleteResponse> {
        let mut inner = self.lock_available()?;
        let op = Op::Delete {
            key: key.to_string(),
            prefix,
        };
        let (_, mut responses) = inner.write(vec![op])?;
        match responses.pop() {
            Some(OpResponse::Delete(resp)) => Ok(resp),
            _ => unreachable!("delete op yields a delete response"),
        }
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut inner = self.lock_available()?;
        let succeeded = txn
            .compares
            .iter()
            .all(|cmp: &Compare| cmp.evaluate(inner.kvs.get(&cmp.key)));
        let ops = if succeeded { txn.success } else { txn.failure };

        let (header, responses) = inner.write(ops)?;
        Ok(TxnResponse {
            header,
            succeeded,
            responses,
        })
    }
}

#[async_trait]
impl Watcher for MemoryStore {
    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let mut inner = self.lock_available()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let start = if options.start_revision > 0 {
            options.start_revision
        } else {
            inner.revision + 1
        };

        let watcher = WatcherEntry {
            key: key.to_string(),
            prefix: options.prefix,
            tx,
        };

        let forced = inner.forced_compactions > 0;
        if forced {
            inner.forced_compactions -= 1;
        }

        if forced || start <= inner.compact_revision {
            debug!(
                "MemoryStore: Watch on {} from {} hit compaction at {}",
                key, start, inner.compact_revision
            );
            let compacted = inner.compact_revision.max(start - 1);
            let _ = watcher.tx.send(Err(Error::Compacted(compacted)));
        } else {
            for (rev, events) in inner.history.range(start..) {
                let matched: Vec<Event> = events
                    .iter()
                    .filter(|ev| watcher.matches(&ev.kv.key))
                    .cloned()
                    .collect();
                if !matched.is_empty() {
                    let _ = watcher.tx.send(Ok(WatchResponse {
                        header: ResponseHeader { revision: *rev },
                        events: matched,
                    }));
                }
            }
            inner.watchers.push(watcher);
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Lease for MemoryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseGrantResponse> {
        let mut inner = self.lock_available()?;
        let ttl = ttl.max(self.config.min_ttl);
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        debug!("MemoryStore: Granted lease {:x} (ttl={:?})", id, ttl);

        Ok(LeaseGrantResponse {
            header: inner.header(),
            id,
            ttl,
        })
    }

    async fn keep_alive_once(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse> {
        let mut inner = self.lock_available()?;
        let now = Instant::now();
        let ttl = match inner.leases.get_mut(&id) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                entry.ttl
            }
            Some(_) => {
                // Overdue but not reaped yet
                inner.revoke(id);
                return Err(Error::LeaseNotFound(id));
            }
            None => return Err(Error::LeaseNotFound(id)),
        };

        Ok(LeaseKeepAliveResponse {
            header: inner.header(),
            id,
            ttl,
        })
    }

    async fn revoke(&self, id: LeaseId) -> Result<ResponseHeader> {
        let mut inner = self.lock_available()?;
        if !inner.revoke(id) {
            return Err(Error::LeaseNotFound(id));
        }
        debug!("MemoryStore: Revoked lease {:x}", id);
        Ok(inner.header())
    }
}
