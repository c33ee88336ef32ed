/// In-memory transactional store for tests and temporary sessions
///
/// Provides the same contract as the log-backed store but keeps everything
/// in memory. All data is lost when the MemoryStore is dropped.

use crate::store::{scan_map, CompactionReport, Overlay, ReadTxn, TransactionalStore, WriteTxn};
use crate::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    compactions: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of compaction passes requested so far
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::SeqCst)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

struct MemoryReadTxn<'a> {
    data: RwLockReadGuard<'a, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl ReadTxn for MemoryReadTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_map(&self.data, prefix).collect())
    }
}

struct MemoryWriteTxn<'a> {
    data: RwLockWriteGuard<'a, BTreeMap<Vec<u8>, Vec<u8>>>,
    overlay: Overlay,
}

impl ReadTxn for MemoryWriteTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.overlay.get(&self.data, key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.overlay.scan_prefix(&self.data, prefix))
    }
}

impl WriteTxn for MemoryWriteTxn<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }
        self.overlay.set(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.overlay.delete(&self.data, key))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryWriteTxn { mut data, overlay } = *self;
        for (key, value) in overlay.into_ops() {
            match value {
                Some(v) => {
                    data.insert(key, v);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

impl TransactionalStore for MemoryStore {
    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        Ok(Box::new(MemoryReadTxn {
            data: self.data.read(),
        }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>> {
        Ok(Box::new(MemoryWriteTxn {
            data: self.data.write(),
            overlay: Overlay::default(),
        }))
    }

    fn compact(&self, discard_ratio: f64) -> Result<CompactionReport> {
        if !(discard_ratio > 0.0 && discard_ratio <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "discard ratio must be in (0, 1], got {}",
                discard_ratio
            )));
        }
        // Nothing to reclaim in memory; the pass is only counted.
        self.compactions.fetch_add(1, Ordering::SeqCst);
        Ok(CompactionReport::default())
    }
}
