/// Global usage statistics
///
/// Request paths push `UrlOp` events into a bounded queue; a fixed pool of
/// worker threads applies each event to the counters and persists them in one
/// store transaction. Pushing blocks while the queue is full.
///
/// Lock order on the worker side is stats, then cache, then store.

use crate::cache::ArcCache;
use crate::config::TuningConfig;
use crate::error::Verdict;
use crate::lifecycle::evaluate;
use crate::maintenance::{MaintenanceOutcome, MaintenanceScheduler};
use crate::repository::Repository;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, Sender};
use distill_core::{encode_key, read_counter, write_counter, KeyCategory, ReadTxn, StoreExt, WriteTxn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub const STAT_URLS_KEY: &str = "distill_global_url_count";
pub const STAT_GETS_KEY: &str = "distill_global_get_count";
pub const STAT_GETS_EXPIRED_KEY: &str = "distill_global_get_expired_count";
pub const STAT_UPSERTS_KEY: &str = "distill_global_upd_count";
pub const STAT_DELETES_KEY: &str = "distill_global_del_count";

/// How long a delete or expired event suppresses repeats for the same id
pub const EVENT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// What happened to a url
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// A new record was stored
    Insert,
    /// An existing record was overwritten
    Update,
    /// A record resolved to its target
    Get,
    /// A record was deleted
    Delete,
    /// A record was read past its expiration
    Expired,
    /// A record was read past its resolve limit
    Exhausted,
    /// A record was read before its activation
    Inactive,
}

impl From<Verdict> for Opcode {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Inactive => Opcode::Inactive,
            Verdict::Expired => Opcode::Expired,
            Verdict::Exhausted => Opcode::Exhausted,
        }
    }
}

/// Event passed from request paths to the stats workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlOp {
    pub opcode: Opcode,
    pub id: String,
    pub at: DateTime<Utc>,
}

impl UrlOp {
    pub fn new(opcode: Opcode, id: impl Into<String>) -> Self {
        Self {
            opcode,
            id: id.into(),
            at: Utc::now(),
        }
    }
}

/// Snapshot of the global counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub urls: u64,
    pub gets: u64,
    /// Reads answered with a fallback: expired, exhausted or not yet active
    pub gets_expired: u64,
    pub upserts: u64,
    pub deletes: u64,
    pub last_request: Option<DateTime<Utc>>,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "URLs: {}, GETs: {}, Upserts: {}, Deletes: {}, GetsExpired: {}",
            self.urls, self.gets, self.upserts, self.deletes, self.gets_expired
        )
    }
}

impl Statistics {
    /// Apply one event. `purged` marks an expired read whose record was
    /// deleted as a consequence.
    pub fn record(&mut self, op: &UrlOp, purged: bool) {
        match op.opcode {
            Opcode::Insert => {
                self.urls += 1;
                self.upserts += 1;
            }
            Opcode::Update => self.upserts += 1,
            Opcode::Get => {
                self.gets += 1;
                self.last_request = Some(op.at);
            }
            Opcode::Delete => {
                self.urls = self.urls.saturating_sub(1);
                self.deletes += 1;
            }
            Opcode::Expired | Opcode::Exhausted | Opcode::Inactive => {
                self.gets_expired += 1;
                self.last_request = Some(op.at);
                if purged {
                    self.urls = self.urls.saturating_sub(1);
                    self.deletes += 1;
                }
            }
        }
    }

    fn keys() -> Result<[bytes::Bytes; 5]> {
        Ok([
            encode_key(KeyCategory::GlobalStat, STAT_URLS_KEY)?,
            encode_key(KeyCategory::GlobalStat, STAT_GETS_KEY)?,
            encode_key(KeyCategory::GlobalStat, STAT_GETS_EXPIRED_KEY)?,
            encode_key(KeyCategory::GlobalStat, STAT_UPSERTS_KEY)?,
            encode_key(KeyCategory::GlobalStat, STAT_DELETES_KEY)?,
        ])
    }

    /// Read the persisted counters; missing counters are zero
    pub fn load(txn: &dyn ReadTxn) -> Result<Self> {
        let [urls, gets, gets_expired, upserts, deletes] = Self::keys()?;
        Ok(Self {
            urls: read_counter(txn, &urls)?,
            gets: read_counter(txn, &gets)?,
            gets_expired: read_counter(txn, &gets_expired)?,
            upserts: read_counter(txn, &upserts)?,
            deletes: read_counter(txn, &deletes)?,
            last_request: None,
        })
    }

    pub fn persist(&self, txn: &mut dyn WriteTxn) -> Result<()> {
        let [urls, gets, gets_expired, upserts, deletes] = Self::keys()?;
        write_counter(txn, &urls, self.urls)?;
        write_counter(txn, &gets, self.gets)?;
        write_counter(txn, &gets_expired, self.gets_expired)?;
        write_counter(txn, &upserts, self.upserts)?;
        write_counter(txn, &deletes, self.deletes)?;
        Ok(())
    }
}

struct Shared {
    repo: Arc<Repository>,
    stats: Mutex<Statistics>,
    maintenance: MaintenanceScheduler,
    delete_expired: bool,
}

impl Shared {
    fn process(&self, op: &UrlOp) {
        trace!(">>> Event {:?} {}", op.opcode, op.id);
        let result = if op.opcode == Opcode::Expired && self.delete_expired {
            self.apply_expired(op)
        } else {
            self.apply(op)
        };
        if let Err(e) = result {
            warn!("Failed to record {:?} event for {}: {}", op.opcode, op.id, e);
        }

        self.maintain();
        trace!("<<< Event {:?} {}", op.opcode, op.id);
    }

    fn maintain(&self) {
        match self.maintenance.run_if_needed(|| self.stats.lock().deletes) {
            Ok(MaintenanceOutcome::Compacted(report)) => {
                debug!("Maintenance compacted the store: {:?}", report)
            }
            Ok(_) => {}
            Err(e) => warn!("Maintenance failed: {}", e),
        }
    }

    fn apply(&self, op: &UrlOp) -> Result<()> {
        let mut stats = self.stats.lock();
        let mut next = *stats;
        next.record(op, false);
        self.repo.store().update(|txn| next.persist(txn))?;
        *stats = next;
        Ok(())
    }

    /// Delete the expired record and account for it in one transaction
    fn apply_expired(&self, op: &UrlOp) -> Result<()> {
        let mut stats = self.stats.lock();
        let mut next = *stats;
        next.record(op, true);
        let purged = self.repo.delete_where(
            &op.id,
            |record| evaluate(record, Utc::now()) == Some(Verdict::Expired),
            |txn| next.persist(txn),
        )?;

        if purged.is_none() {
            // already gone or replaced: only the read counts
            next = *stats;
            next.record(op, false);
            self.repo.store().update(|txn| next.persist(txn))?;
        } else {
            debug!("Purged expired record {}", op.id);
        }
        *stats = next;
        Ok(())
    }
}

pub struct StatsAggregator {
    enabled: bool,
    shared: Arc<Shared>,
    sender: RwLock<Option<Sender<UrlOp>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Delete and expired events queued recently, by opcode and id
    recent: Mutex<ArcCache<(Opcode, String), Instant>>,
}

impl StatsAggregator {
    /// Load the persisted counters and start the worker pool
    pub fn start(
        repo: Arc<Repository>,
        maintenance: MaintenanceScheduler,
        tuning: &TuningConfig,
    ) -> Result<Self> {
        let initial = repo.store().view(|txn| Statistics::load(txn))?;
        let shared = Arc::new(Shared {
            repo,
            stats: Mutex::new(initial),
            maintenance,
            delete_expired: tuning.delete_expired,
        });

        let aggregator = Self {
            enabled: tuning.stats_enabled,
            shared,
            sender: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
            recent: Mutex::new(ArcCache::new(tuning.stats_cache_size)),
        };
        if !aggregator.enabled {
            info!("Statistics collection disabled");
            return Ok(aggregator);
        }

        let (tx, rx) = bounded(tuning.stats_events_queue_size.max(1));
        let mut workers = Vec::with_capacity(tuning.stats_events_worker_num);
        for worker_id in 0..tuning.stats_events_worker_num.max(1) {
            let rx: Receiver<UrlOp> = rx.clone();
            let shared = Arc::clone(&aggregator.shared);
            let handle = thread::Builder::new()
                .name(format!("distill-stats-{}", worker_id))
                .spawn(move || {
                    debug!("Stats worker {} started", worker_id);
                    for op in rx.iter() {
                        shared.process(&op);
                    }
                    debug!("Stats worker {} stopped", worker_id);
                })
                .map_err(Error::from)?;
            workers.push(handle);
        }
        info!(
            "Started {} stats workers (queue size {})",
            workers.len(),
            tuning.stats_events_queue_size
        );

        *aggregator.sender.write() = Some(tx);
        *aggregator.workers.lock() = workers;
        Ok(aggregator)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue an event for the workers.
    ///
    /// No-op when statistics are disabled or the aggregator is shut down.
    /// A delete or expired event for an id already queued within
    /// [`EVENT_DEDUP_WINDOW`] is dropped. Blocks while the queue is full.
    pub fn push_event(&self, op: UrlOp) {
        if !self.enabled {
            return;
        }
        if !self.admit(&op) {
            trace!("Skipping repeated {:?} event for {}", op.opcode, op.id);
            return;
        }
        let sender = self.sender.read();
        match sender.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(op) {
                    warn!("Dropping {:?} event for {}: workers are gone", e.0.opcode, e.0.id);
                }
            }
            None => trace!("Dropping {:?} event for {} after shutdown", op.opcode, op.id),
        }
    }

    fn admit(&self, op: &UrlOp) -> bool {
        let mut recent = self.recent.lock();
        match op.opcode {
            Opcode::Delete | Opcode::Expired => {
                let key = (op.opcode, op.id.clone());
                let now = Instant::now();
                if let Some(seen) = recent.get(&key) {
                    if now.duration_since(*seen) < EVENT_DEDUP_WINDOW {
                        return false;
                    }
                }
                recent.insert(key, now);
                true
            }
            Opcode::Insert | Opcode::Update => {
                // the id holds a new record; its next delete or expiry counts
                recent.remove(&(Opcode::Delete, op.id.clone()));
                recent.remove(&(Opcode::Expired, op.id.clone()));
                true
            }
            _ => true,
        }
    }

    /// Current counters; never waits on the queue
    pub fn get_stats(&self) -> Statistics {
        *self.shared.stats.lock()
    }

    /// Replace the in-memory counters with the persisted ones
    pub fn load_stats(&self) -> Result<Statistics> {
        let mut stats = self.shared.stats.lock();
        let loaded = self.shared.repo.store().view(|txn| Statistics::load(txn))?;
        stats.urls = loaded.urls;
        stats.gets = loaded.gets;
        stats.gets_expired = loaded.gets_expired;
        stats.upserts = loaded.upserts;
        stats.deletes = loaded.deletes;
        Ok(*stats)
    }

    /// Persist the in-memory counters
    pub fn save_stats(&self) -> Result<()> {
        let stats = self.shared.stats.lock();
        self.shared.repo.store().update(|txn| stats.persist(txn))
    }

    /// Rebuild the counters from the stored records.
    ///
    /// urls and upserts become the record count, gets the sum of hits;
    /// deletes and expired gets start over.
    pub fn reset_stats(&self) -> Result<Statistics> {
        let mut stats = self.shared.stats.lock();
        let records = self.shared.repo.scan()?;
        let count = records.len() as u64;
        let next = Statistics {
            urls: count,
            gets: records.iter().map(|r| r.hits).sum(),
            gets_expired: 0,
            upserts: count,
            deletes: 0,
            last_request: stats.last_request,
        };
        self.shared.repo.store().update(|txn| next.persist(txn))?;
        *stats = next;
        info!("Statistics reset: {}", next);
        Ok(next)
    }

    pub fn maintenance(&self) -> &MaintenanceScheduler {
        &self.shared.maintenance
    }

    /// Close the queue and wait for the workers to drain it.
    ///
    /// Maintenance is considered once more against the final counters, since
    /// triggers that hit a running pass were dropped.
    pub fn shutdown(&self) {
        let sender = self.sender.write().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock());
        debug!("Waiting for {} stats workers", workers.len());
        for handle in workers {
            if let Err(e) = handle.join() {
                warn!("Error joining stats worker thread: {:?}", e);
            }
        }
        self.shared.maintain();
        info!("Stats workers stopped");
    }
}

impl Drop for StatsAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::repository::IdGenerator;
    use chrono::Duration;
    use distill_core::MemoryStore;

    fn setup(tuning: TuningConfig) -> (Arc<MemoryStore>, Arc<Repository>, StatsAggregator) {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(Repository::new(
            store.clone(),
            16,
            IdGenerator::new("abcdefgh", 4, 8),
        ));
        let maintenance = MaintenanceScheduler::new(
            store.clone(),
            tuning.db_gc_deletes_count,
            tuning.db_gc_discard_ratio,
        );
        let stats = StatsAggregator::start(repo.clone(), maintenance, &tuning).unwrap();
        (store, repo, stats)
    }

    #[test]
    fn test_record_deltas() {
        let mut stats = Statistics::default();
        stats.record(&UrlOp::new(Opcode::Insert, "a"), false);
        stats.record(&UrlOp::new(Opcode::Insert, "b"), false);
        stats.record(&UrlOp::new(Opcode::Update, "b"), false);
        stats.record(&UrlOp::new(Opcode::Get, "a"), false);
        stats.record(&UrlOp::new(Opcode::Delete, "a"), false);
        stats.record(&UrlOp::new(Opcode::Exhausted, "b"), false);
        assert_eq!(
            (stats.urls, stats.gets, stats.gets_expired, stats.upserts, stats.deletes),
            (1, 1, 1, 3, 1)
        );
        assert!(stats.last_request.is_some());

        stats.record(&UrlOp::new(Opcode::Expired, "b"), true);
        assert_eq!((stats.urls, stats.gets_expired, stats.deletes), (0, 2, 2));

        // never wraps below zero
        stats.record(&UrlOp::new(Opcode::Delete, "zz"), false);
        assert_eq!(stats.urls, 0);
    }

    #[test]
    fn test_workers_persist_counters() {
        let (store, _repo, stats) = setup(TuningConfig::default());
        for i in 0..10 {
            stats.push_event(UrlOp::new(Opcode::Insert, format!("id{}", i)));
        }
        stats.push_event(UrlOp::new(Opcode::Delete, "id0"));
        stats.shutdown();

        let snapshot = stats.get_stats();
        assert_eq!((snapshot.urls, snapshot.upserts, snapshot.deletes), (9, 10, 1));
        let persisted = store.view(|txn| Statistics::load(txn)).unwrap();
        assert_eq!(persisted.urls, 9);
        assert_eq!(persisted.deletes, 1);
    }

    #[test]
    fn test_disabled_stats_ignore_events() {
        let tuning = TuningConfig {
            stats_enabled: false,
            ..Default::default()
        };
        let (_store, _repo, stats) = setup(tuning);
        assert!(!stats.is_enabled());
        stats.push_event(UrlOp::new(Opcode::Insert, "a"));
        stats.shutdown();
        assert_eq!(stats.get_stats(), Statistics::default());
    }

    #[test]
    fn test_expired_event_purges_record() {
        let (_store, repo, stats) = setup(TuningConfig::default());
        let past = Utc::now() - Duration::seconds(60);
        let mut record = Record::new("old1", "https://example.com/", past);
        record.expires_on = Some(past + Duration::seconds(1));
        repo.upsert(&record).unwrap();
        stats.push_event(UrlOp::new(Opcode::Insert, "old1"));
        stats.push_event(UrlOp::new(Opcode::Expired, "old1"));
        stats.shutdown();

        assert!(matches!(repo.peek("old1"), Err(Error::NotFound)));
        let snapshot = stats.get_stats();
        assert_eq!(
            (snapshot.urls, snapshot.gets_expired, snapshot.deletes),
            (0, 1, 1)
        );
    }

    #[test]
    fn test_expired_event_keeps_live_replacement() {
        let (_store, repo, stats) = setup(TuningConfig::default());
        // the id was re-registered before the worker got to the event
        repo.upsert(&Record::new("id1", "https://example.com/", Utc::now()))
            .unwrap();
        stats.push_event(UrlOp::new(Opcode::Expired, "id1"));
        stats.shutdown();

        assert!(repo.peek("id1").is_ok());
        let snapshot = stats.get_stats();
        assert_eq!((snapshot.gets_expired, snapshot.deletes), (1, 0));
    }

    #[test]
    fn test_repeated_expired_events_purge_once() {
        let (_store, repo, stats) = setup(TuningConfig::default());
        let past = Utc::now() - Duration::seconds(60);
        let mut record = Record::new("old2", "https://example.com/", past);
        record.expires_on = Some(past + Duration::seconds(1));
        repo.upsert(&record).unwrap();
        stats.push_event(UrlOp::new(Opcode::Insert, "old2"));

        let stats = Arc::new(stats);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || stats.push_event(UrlOp::new(Opcode::Expired, "old2")))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        stats.shutdown();

        assert!(matches!(repo.peek("old2"), Err(Error::NotFound)));
        let snapshot = stats.get_stats();
        assert_eq!(
            (snapshot.urls, snapshot.gets_expired, snapshot.deletes),
            (0, 1, 1)
        );
    }

    #[test]
    fn test_insert_clears_recent_delete() {
        let (_store, _repo, stats) = setup(TuningConfig::default());
        stats.push_event(UrlOp::new(Opcode::Insert, "a1"));
        stats.push_event(UrlOp::new(Opcode::Delete, "a1"));
        stats.push_event(UrlOp::new(Opcode::Delete, "a1"));
        // the id is registered again, so its next delete counts
        stats.push_event(UrlOp::new(Opcode::Insert, "a1"));
        stats.push_event(UrlOp::new(Opcode::Delete, "a1"));
        stats.shutdown();

        let snapshot = stats.get_stats();
        assert_eq!((snapshot.urls, snapshot.upserts, snapshot.deletes), (0, 2, 2));
    }

    #[test]
    fn test_reset_rebuilds_from_records() {
        let (_store, repo, stats) = setup(TuningConfig::default());
        let now = Utc::now();
        for id in ["a1", "b2", "c3"] {
            repo.upsert(&Record::new(id, "https://example.com/", now)).unwrap();
        }
        repo.get("a1", now).unwrap();
        repo.get("a1", now).unwrap();
        stats.push_event(UrlOp::new(Opcode::Delete, "zz"));
        stats.shutdown();

        let reset = stats.reset_stats().unwrap();
        assert_eq!((reset.urls, reset.upserts, reset.gets, reset.deletes), (3, 3, 2, 0));
        assert_eq!(stats.load_stats().unwrap().urls, 3);
    }

    #[test]
    fn test_compaction_after_threshold() {
        let tuning = TuningConfig {
            db_gc_deletes_count: 5,
            stats_events_worker_num: 3,
            ..Default::default()
        };
        let (store, _repo, stats) = setup(tuning);
        for i in 0..6 {
            stats.push_event(UrlOp::new(Opcode::Delete, format!("id{}", i)));
        }
        stats.shutdown();
        assert_eq!(store.compactions(), 1);
        assert_eq!(stats.maintenance().gc_count().unwrap(), 1);
    }
}
