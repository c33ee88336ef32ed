/// Record persistence behind the write-back cache
///
/// Lock order is always cache, then store. The store side (`RecordTable`)
/// never touches the cache, which is what lets the cache use it as its
/// write-back sink.

use crate::cache::{WriteBack, WriteBackCache};
use crate::record::Record;
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use distill_core::{encode_key, KeyCategory, StoreExt, TransactionalStore, WriteTxn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

fn record_key(id: &str) -> Result<Bytes> {
    Ok(encode_key(KeyCategory::Record, id)?)
}

/// Direct record access to the store, bypassing the cache
#[derive(Clone)]
pub struct RecordTable {
    store: Arc<dyn TransactionalStore>,
}

impl RecordTable {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, id: &str) -> Result<Option<Record>> {
        let key = record_key(id)?;
        self.store.view(|txn| match txn.get(&key)? {
            Some(bytes) => Ok(Some(Record::unmarshal_binary(&bytes)?)),
            None => Ok(None),
        })
    }

    /// Write `record`, returning whether it replaced an existing one
    pub fn save(&self, record: &Record) -> Result<bool> {
        let key = record_key(&record.id)?;
        let value = record.marshal_binary()?;
        self.store.update(|txn| {
            let existed = txn.get(&key)?.is_some();
            txn.set(&key, &value)?;
            Ok(existed)
        })
    }

    /// Every stored record, in id order
    pub fn scan(&self) -> Result<Vec<Record>> {
        let prefix = KeyCategory::Record.prefix();
        let pairs = self.store.view(|txn| txn.scan_prefix(&prefix))?;
        pairs
            .iter()
            .map(|(_, value)| Record::unmarshal_binary(value))
            .collect()
    }
}

impl WriteBack for RecordTable {
    fn write_back(&self, record: &Record) -> Result<()> {
        self.save(record).map(|_| ())
    }
}

/// Id generation settings
#[derive(Debug, Clone)]
pub struct IdGenerator {
    alphabet: Vec<char>,
    length: usize,
    retries: u32,
}

impl IdGenerator {
    pub fn new(alphabet: &str, length: usize, retries: u32) -> Self {
        Self {
            alphabet: alphabet.chars().collect(),
            length,
            retries: retries.max(1),
        }
    }

    pub fn generate(&self) -> String {
        nanoid::format(nanoid::rngs::default, &self.alphabet, self.length)
    }
}

pub struct Repository {
    store: Arc<dyn TransactionalStore>,
    table: RecordTable,
    cache: WriteBackCache,
    ids: IdGenerator,
}

impl Repository {
    pub fn new(store: Arc<dyn TransactionalStore>, cache_size: usize, ids: IdGenerator) -> Self {
        let table = RecordTable::new(store.clone());
        let cache = WriteBackCache::new(cache_size, Box::new(table.clone()));
        Self {
            store,
            table,
            cache,
            ids,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.store
    }

    pub fn cache(&self) -> &WriteBackCache {
        &self.cache
    }

    /// Store a new record, drawing a fresh id when `record.id` is empty.
    ///
    /// Never overwrites: a caller-supplied id that exists fails with
    /// `DuplicateId`.
    pub fn insert(&self, record: &mut Record) -> Result<()> {
        self.store.update(|txn| {
            let key = if record.id.is_empty() {
                let (id, key) = self.draw_free_id(txn)?;
                record.id = id;
                key
            } else {
                let key = record_key(&record.id)?;
                if txn.get(&key)?.is_some() {
                    return Err(Error::DuplicateId);
                }
                key
            };
            txn.set(&key, &record.marshal_binary()?)?;
            Ok(())
        })?;
        debug!("Inserted record {}", record.id);
        Ok(())
    }

    fn draw_free_id(&self, txn: &mut dyn WriteTxn) -> Result<(String, Bytes)> {
        for attempt in 1..=self.ids.retries {
            let id = self.ids.generate();
            let key = record_key(&id)?;
            if txn.get(&key)?.is_none() {
                return Ok((id, key));
            }
            trace!("Id collision on {} (attempt {})", id, attempt);
        }
        Err(Error::IdSpaceExhausted(self.ids.retries))
    }

    /// Store `record`, replacing any record with the same id.
    ///
    /// Returns whether a record was replaced.
    pub fn upsert(&self, record: &Record) -> Result<bool> {
        self.cache
            .invalidate_with(&record.id, |_| Ok((self.table.save(record)?, true)))
    }

    /// Current record for `id` without counting a hit
    pub fn peek(&self, id: &str) -> Result<Record> {
        if let Some(record) = self.cache.get(id) {
            return Ok(record);
        }
        self.table.load(id)?.ok_or(Error::NotFound)
    }

    /// Record for `id` with one hit registered at `now`
    pub fn get(&self, id: &str, now: DateTime<Utc>) -> Result<Record> {
        self.cache
            .update_or_load(id, || self.table.load(id), |record| record.register_hit(now))?
            .ok_or(Error::NotFound)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.delete_where(id, |_| true, |_| Ok(()))?
            .ok_or(Error::NotFound)
    }

    /// Delete `id` if `condition` holds for its current state, running `then`
    /// in the same store transaction.
    ///
    /// Returns None, leaving everything untouched, when the record is absent
    /// or the condition is false.
    pub fn delete_where<T>(
        &self,
        id: &str,
        condition: impl FnOnce(&Record) -> bool,
        then: impl FnOnce(&mut dyn WriteTxn) -> Result<T>,
    ) -> Result<Option<T>> {
        let key = record_key(id)?;
        let outcome = self.cache.invalidate_with(id, |cached| {
            self.store.update(|txn| {
                let Some(stored) = txn.get(&key)? else {
                    return Ok((None, false));
                };
                let current = match cached {
                    Some(record) => record.clone(),
                    None => Record::unmarshal_binary(&stored)?,
                };
                if !condition(&current) {
                    return Ok((None, false));
                }
                txn.delete(&key)?;
                Ok((Some(then(txn)?), true))
            })
        })?;
        if outcome.is_some() {
            debug!("Deleted record {}", id);
        }
        Ok(outcome)
    }

    /// Every record, with cached copies taking precedence over stored ones
    pub fn scan(&self) -> Result<Vec<Record>> {
        let mut records: BTreeMap<String, Record> = self
            .table
            .scan()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        for record in records.values_mut() {
            if let Some(cached) = self.cache.peek(&record.id) {
                *record = cached;
            }
        }
        Ok(records.into_values().collect())
    }

    /// Persist every cached record and empty the cache
    pub fn purge_cache(&self) -> usize {
        self.cache.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distill_core::MemoryStore;
    use std::collections::HashSet;
    use std::thread;

    fn repo_with(cache_size: usize, ids: IdGenerator) -> Repository {
        Repository::new(Arc::new(MemoryStore::new()), cache_size, ids)
    }

    fn repo() -> Repository {
        repo_with(16, IdGenerator::new("abcdefghkmnpqrstuvwxyz23456789", 6, 32))
    }

    fn record(id: &str) -> Record {
        Record::new(id, "https://example.com/", Utc::now())
    }

    #[test]
    fn test_insert_generates_id() {
        let repo = repo();
        let mut r = record("");
        repo.insert(&mut r).unwrap();
        assert_eq!(r.id.chars().count(), 6);
        assert_eq!(repo.peek(&r.id).unwrap(), r);
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let repo = repo();
        repo.insert(&mut record("taken")).unwrap();
        assert!(matches!(
            repo.insert(&mut record("taken")),
            Err(Error::DuplicateId)
        ));
    }

    #[test]
    fn test_id_space_exhaustion() {
        // a one-letter alphabet has exactly one id of each length
        let repo = repo_with(4, IdGenerator::new("a", 3, 5));
        repo.insert(&mut record("")).unwrap();
        assert!(matches!(
            repo.insert(&mut record("")),
            Err(Error::IdSpaceExhausted(5))
        ));
    }

    #[test]
    fn test_upsert_overwrites_and_drops_stale_cache() {
        let repo = repo();
        let mut r = record("abc");
        assert!(!repo.upsert(&r).unwrap());

        // pull into the cache with a hit
        assert_eq!(repo.get("abc", Utc::now()).unwrap().hits, 1);

        r.redirect_url = "https://example.org/".to_string();
        assert!(repo.upsert(&r).unwrap());
        assert_eq!(repo.peek("abc").unwrap(), r);
    }

    #[test]
    fn test_get_counts_hits_and_peek_does_not() {
        let repo = repo();
        repo.upsert(&record("abc")).unwrap();
        let now = Utc::now();
        for expected in 1..=3 {
            assert_eq!(repo.get("abc", now).unwrap().hits, expected);
        }
        assert_eq!(repo.peek("abc").unwrap().hits, 3);
        assert_eq!(repo.peek("abc").unwrap().hits, 3);
        assert!(matches!(repo.get("missing", now), Err(Error::NotFound)));
    }

    #[test]
    fn test_delete_removes_cached_and_stored() {
        let repo = repo();
        repo.upsert(&record("abc")).unwrap();
        repo.get("abc", Utc::now()).unwrap();

        repo.delete("abc").unwrap();
        assert!(matches!(repo.peek("abc"), Err(Error::NotFound)));
        assert!(matches!(repo.delete("abc"), Err(Error::NotFound)));

        // nothing left to write back
        assert_eq!(repo.purge_cache(), 0);
        assert!(repo.scan().unwrap().is_empty());
    }

    #[test]
    fn test_delete_where_respects_condition() {
        let repo = repo();
        repo.upsert(&record("abc")).unwrap();
        repo.get("abc", Utc::now()).unwrap();

        let skipped = repo.delete_where("abc", |r| r.hits > 5, |_| Ok(())).unwrap();
        assert!(skipped.is_none());
        // the cached hit survives a skipped delete
        assert_eq!(repo.peek("abc").unwrap().hits, 1);

        let ran = repo
            .delete_where("abc", |r| r.hits == 1, |txn| {
                txn.set(b"\x00marker", b"1")?;
                Ok(42)
            })
            .unwrap();
        assert_eq!(ran, Some(42));
        assert!(repo.peek("abc").is_err());
        let marker = repo.store().view(|txn| txn.get(b"\x00marker")).unwrap();
        assert_eq!(marker, Some(b"1".to_vec()));
    }

    #[test]
    fn test_eviction_persists_counters() {
        let repo = repo_with(2, IdGenerator::new("abc", 3, 8));
        for id in ["r1", "r2", "r3"] {
            repo.upsert(&record(id)).unwrap();
        }
        let now = Utc::now();
        repo.get("r1", now).unwrap();
        repo.get("r2", now).unwrap();
        repo.get("r3", now).unwrap(); // evicts one of the others

        assert_eq!(repo.purge_cache(), 2);
        for r in repo.scan().unwrap() {
            assert_eq!(r.hits, 1, "lost hits on {}", r.id);
        }
    }

    #[test]
    fn test_scan_prefers_cached_copies() {
        let repo = repo();
        repo.upsert(&record("a")).unwrap();
        repo.upsert(&record("b")).unwrap();
        repo.get("b", Utc::now()).unwrap();

        let records = repo.scan().unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(records[1].hits, 1);
    }

    #[test]
    fn test_concurrent_inserts_get_distinct_ids() {
        let repo = Arc::new(repo());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| {
                            let mut r = record("");
                            repo.insert(&mut r).unwrap();
                            r.id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 400);
        assert_eq!(repo.scan().unwrap().len(), 400);
    }
}
