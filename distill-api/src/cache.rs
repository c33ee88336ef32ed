/// Adaptive replacement cache with write-back on eviction
///
/// `ArcCache` is the pure policy: four lists (T1 recency, T2 frequency, and
/// their ghosts B1/B2) and an adaptive target `p` for the size of T1.
/// Inserting may push one resident entry out; the caller receives it.
///
/// `WriteBackCache` wraps the policy in a mutex and hands every entry that
/// leaves by eviction or purge to a [`WriteBack`] sink. Explicit removal never
/// writes back.

use crate::record::Record;
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use tracing::{debug, trace, warn};

/// Keys in recency order, oldest first
#[derive(Debug)]
struct LruList<K> {
    order: BTreeMap<u64, K>,
    ticks: HashMap<K, u64>,
    next_tick: u64,
}

impl<K: Hash + Eq + Clone> LruList<K> {
    fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            ticks: HashMap::new(),
            next_tick: 0,
        }
    }

    fn len(&self) -> usize {
        self.ticks.len()
    }

    fn contains(&self, key: &K) -> bool {
        self.ticks.contains_key(key)
    }

    /// Insert at the MRU end, moving the key if already present
    fn push_back(&mut self, key: K) {
        self.remove(&key);
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, key.clone());
        self.ticks.insert(key, tick);
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.ticks.remove(key) {
            Some(tick) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }

    fn pop_front(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.ticks.remove(&key);
        Some(key)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ticks.clear();
    }
}

/// Adaptive replacement cache policy
#[derive(Debug)]
pub struct ArcCache<K, V> {
    capacity: usize,
    /// Target size of T1
    p: usize,
    t1: LruList<K>,
    t2: LruList<K>,
    b1: LruList<K>,
    b2: LruList<K>,
    values: HashMap<K, V>,
}

impl<K: Hash + Eq + Clone, V> ArcCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            p: 0,
            t1: LruList::new(),
            t2: LruList::new(),
            b1: LruList::new(),
            b2: LruList::new(),
            values: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resident entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current target size of the recency list
    pub fn p(&self) -> usize {
        self.p
    }

    pub fn contains(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    /// Look up a resident entry and record the access
    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        if self.t1.remove(key) {
            // second access: recency -> frequency
            self.t2.push_back(key.clone());
        } else if self.t2.contains(key) {
            self.t2.push_back(key.clone());
        } else {
            return None;
        }
        self.values.get_mut(key)
    }

    /// Look up a resident entry without touching the lists
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    /// Insert or replace `key`, returning the entry evicted to make room
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.values.contains_key(&key) {
            self.get(&key);
            self.values.insert(key, value);
            return None;
        }

        let mut evicted = None;

        if self.b1.contains(&key) {
            let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
            self.p = (self.p + delta).min(self.capacity);
            self.b1.remove(&key);
            if self.t1.len() + self.t2.len() >= self.capacity {
                evicted = self.replace(false);
            }
            self.t2.push_back(key.clone());
        } else if self.b2.contains(&key) {
            let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
            self.p = self.p.saturating_sub(delta);
            self.b2.remove(&key);
            if self.t1.len() + self.t2.len() >= self.capacity {
                evicted = self.replace(true);
            }
            self.t2.push_back(key.clone());
        } else {
            let l1 = self.t1.len() + self.b1.len();
            if l1 >= self.capacity {
                if self.t1.len() < self.capacity {
                    self.b1.pop_front();
                    if self.t1.len() + self.t2.len() >= self.capacity {
                        evicted = self.replace(false);
                    }
                } else {
                    // T1 alone fills the cache; drop its LRU without a ghost
                    evicted = self
                        .t1
                        .pop_front()
                        .and_then(|k| self.values.remove(&k).map(|v| (k, v)));
                }
            } else {
                let total = l1 + self.t2.len() + self.b2.len();
                if total >= self.capacity * 2 {
                    self.b2.pop_front();
                }
                if self.t1.len() + self.t2.len() >= self.capacity {
                    evicted = self.replace(false);
                }
            }
            self.t1.push_back(key.clone());
        }

        self.values.insert(key, value);
        evicted
    }

    /// Move one resident entry to its ghost list
    fn replace(&mut self, hit_in_b2: bool) -> Option<(K, V)> {
        let t1_len = self.t1.len();
        let from_t1 = t1_len > 0 && (t1_len > self.p || (hit_in_b2 && t1_len == self.p));
        let key = if from_t1 {
            let key = self.t1.pop_front()?;
            self.b1.push_back(key.clone());
            key
        } else {
            let key = self.t2.pop_front().or_else(|| self.t1.pop_front())?;
            self.b2.push_back(key.clone());
            key
        };
        self.values.remove(&key).map(|v| (key, v))
    }

    /// Drop `key` entirely, including any ghost
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.t1.remove(key);
        self.t2.remove(key);
        self.b1.remove(key);
        self.b2.remove(key);
        self.values.remove(key)
    }

    /// Empty the cache, returning every resident entry
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.t1.clear();
        self.t2.clear();
        self.b1.clear();
        self.b2.clear();
        self.p = 0;
        self.values.drain().collect()
    }
}

/// Destination for records leaving the cache
pub trait WriteBack: Send + Sync {
    fn write_back(&self, record: &Record) -> Result<()>;
}

/// Record cache that persists entries when they leave.
///
/// A write-back failure is logged and the record dropped: the store keeps the
/// copy from its last successful write, so only the counter updates made
/// while it was cached are lost.
pub struct WriteBackCache {
    inner: Mutex<ArcCache<String, Record>>,
    sink: Box<dyn WriteBack>,
}

impl WriteBackCache {
    pub fn new(capacity: usize, sink: Box<dyn WriteBack>) -> Self {
        Self {
            inner: Mutex::new(ArcCache::new(capacity)),
            sink,
        }
    }

    fn flush_evicted(&self, evicted: Option<(String, Record)>) {
        if let Some((id, record)) = evicted {
            trace!("Writing back evicted record {}", id);
            if let Err(e) = self.sink.write_back(&record) {
                warn!("Write-back of evicted record {} failed: {}", id, e);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.inner.lock().get(&id.to_string()).cloned()
    }

    pub fn set(&self, record: Record) {
        let mut inner = self.inner.lock();
        let evicted = inner.insert(record.id.clone(), record);
        self.flush_evicted(evicted);
    }

    /// Drop `id` without writing it back
    pub fn remove(&self, id: &str) -> Option<Record> {
        self.inner.lock().remove(&id.to_string())
    }

    /// Cached copy of `id` without counting it as an access
    pub fn peek(&self, id: &str) -> Option<Record> {
        self.inner.lock().peek(&id.to_string()).cloned()
    }

    /// Run `f` on the cached copy of `id` under the cache lock.
    ///
    /// When `f` returns `(_, true)` the cached copy is dropped without
    /// write-back before any other caller can observe or reload it.
    pub fn invalidate_with<T>(
        &self,
        id: &str,
        f: impl FnOnce(Option<&Record>) -> Result<(T, bool)>,
    ) -> Result<T> {
        let key = id.to_string();
        let mut inner = self.inner.lock();
        let (out, drop_cached) = f(inner.peek(&key))?;
        if drop_cached {
            inner.remove(&key);
        }
        Ok(out)
    }

    /// Apply `mutate` to the cached record, loading it with `load` on a miss.
    ///
    /// The whole sequence runs under the cache lock, so concurrent callers
    /// never lose each other's updates. Returns None when `load` finds
    /// nothing.
    pub fn update_or_load(
        &self,
        id: &str,
        load: impl FnOnce() -> Result<Option<Record>>,
        mutate: impl FnOnce(&mut Record),
    ) -> Result<Option<Record>> {
        let key = id.to_string();
        let mut inner = self.inner.lock();
        if let Some(record) = inner.get(&key) {
            mutate(record);
            return Ok(Some(record.clone()));
        }

        debug!("Cache miss for {}", id);
        let Some(mut record) = load()? else {
            return Ok(None);
        };
        mutate(&mut record);
        let snapshot = record.clone();
        let evicted = inner.insert(key, record);
        self.flush_evicted(evicted);
        Ok(Some(snapshot))
    }

    /// Write back and drop every cached record, returning how many were
    /// written successfully
    pub fn purge(&self) -> usize {
        let mut inner = self.inner.lock();
        let drained = inner.drain();
        let total = drained.len();
        let mut written = 0;
        for (id, record) in drained {
            match self.sink.write_back(&record) {
                Ok(()) => written += 1,
                Err(e) => warn!("Write-back of record {} during purge failed: {}", id, e),
            }
        }
        debug!("Purged {} cached records ({} written back)", total, written);
        written
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
