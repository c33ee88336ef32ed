/// Durable single-file value log
///
/// Format: [magic(4) | version(4) | reserved(8)] [batch...]
/// Batch: [len(4) | count(4) | payload | crc(4)], one per committed transaction
/// Entry: [op(1) | key_len(4) | value_len(4) | key | value]
///
/// The whole live set is indexed in memory and rebuilt by replaying the log
/// on open. A torn batch at the tail (crash mid-append) is truncated away.

use crate::store::{scan_map, CompactionReport, Overlay, ReadTxn, TransactionalStore, WriteTxn};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOG_FILE_NAME: &str = "distill.vlog";
const COMPACT_FILE_NAME: &str = "distill.vlog.compact";

const LOG_MAGIC: u32 = 0x4456_4C47; // "DVLG"
const LOG_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;
const BATCH_HEADER_SIZE: usize = 8; // len(4) + count(4)
const ENTRY_HEADER_SIZE: u64 = 9; // op(1) + key_len(4) + value_len(4)

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Entries per batch when rewriting the live set
const COMPACTION_BATCH_ENTRIES: usize = 1024;

/// Options for opening a [`LogStore`]
#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    /// fsync every committed batch
    pub sync_writes: bool,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self { sync_writes: true }
    }
}

pub struct LogStore {
    dir: PathBuf,
    options: LogStoreOptions,
    inner: RwLock<LogInner>,
}

struct LogInner {
    file: File,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Bytes the live entries would take if rewritten
    live_bytes: u64,
    /// Bytes after the header
    log_bytes: u64,
    /// Set when the file could not be brought back in line with the index;
    /// every later write fails until the log is reopened
    failed: Option<String>,
}

type Op = (Vec<u8>, Option<Vec<u8>>);

fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    ENTRY_HEADER_SIZE + key.len() as u64 + value.len() as u64
}

fn encode_batch(ops: &[Op]) -> BytesMut {
    let mut payload = BytesMut::new();
    for (key, value) in ops {
        match value {
            Some(v) => {
                payload.put_u8(OP_PUT);
                payload.put_u32_le(key.len() as u32);
                payload.put_u32_le(v.len() as u32);
                payload.put_slice(key);
                payload.put_slice(v);
            }
            None => {
                payload.put_u8(OP_DELETE);
                payload.put_u32_le(key.len() as u32);
                payload.put_u32_le(0);
                payload.put_slice(key);
            }
        }
    }

    let mut frame = BytesMut::with_capacity(BATCH_HEADER_SIZE + payload.len() + 4);
    frame.put_u32_le(payload.len() as u32);
    frame.put_u32_le(ops.len() as u32);
    frame.put_slice(&payload);
    frame.put_u32_le(crc32fast::hash(&payload));
    frame
}

fn decode_batch(mut payload: &[u8], count: u32) -> Result<Vec<Op>> {
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if payload.remaining() < ENTRY_HEADER_SIZE as usize {
            return Err(Error::Corruption("Truncated batch entry header".to_string()));
        }
        let op = payload.get_u8();
        let key_len = payload.get_u32_le() as usize;
        let value_len = payload.get_u32_le() as usize;
        if payload.remaining() < key_len + value_len {
            return Err(Error::Corruption("Truncated batch entry".to_string()));
        }
        let key = payload[..key_len].to_vec();
        payload.advance(key_len);
        match op {
            OP_PUT => {
                let value = payload[..value_len].to_vec();
                payload.advance(value_len);
                ops.push((key, Some(value)));
            }
            OP_DELETE => ops.push((key, None)),
            other => {
                return Err(Error::Corruption(format!("Unknown log op {}", other)));
            }
        }
    }
    if payload.has_remaining() {
        return Err(Error::Corruption("Trailing bytes in batch".to_string()));
    }
    Ok(ops)
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE as usize);
    header.put_u32(LOG_MAGIC); // big-endian for magic
    header.put_u32_le(LOG_VERSION);
    header.put_u64_le(0); // reserved
    file.write_all(&header)?;
    Ok(())
}

impl LogInner {
    fn apply(&mut self, ops: Vec<Op>) {
        for (key, value) in ops {
            if let Some(old) = self.index.get(&key) {
                self.live_bytes -= entry_size(&key, old);
            }
            match value {
                Some(v) => {
                    self.live_bytes += entry_size(&key, &v);
                    self.index.insert(key, v);
                }
                None => {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.failed {
            Some(reason) => Err(Error::Internal(format!("value log unusable: {}", reason))),
            None => Ok(()),
        }
    }

    fn garbage_ratio(&self) -> f64 {
        if self.log_bytes == 0 {
            return 0.0;
        }
        self.log_bytes.saturating_sub(self.live_bytes) as f64 / self.log_bytes as f64
    }
}

impl LogStore {
    /// Open the log in `dir`, creating the directory and log when missing
    pub fn open(dir: impl AsRef<Path>, options: LogStoreOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let inner = if path.exists() {
            Self::replay(&path)?
        } else {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?;
            write_header(&mut file)?;
            file.sync_all()?;
            LogInner {
                file,
                index: BTreeMap::new(),
                live_bytes: 0,
                log_bytes: 0,
                failed: None,
            }
        };

        info!(
            "Opened value log {} ({} keys, {} bytes)",
            path.display(),
            inner.index.len(),
            inner.log_bytes
        );

        Ok(Self {
            dir,
            options,
            inner: RwLock::new(inner),
        })
    }

    fn replay(path: &Path) -> Result<LogInner> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let mut cursor = &header[..];
        if cursor.get_u32() != LOG_MAGIC {
            return Err(Error::Corruption("Invalid value log magic".to_string()));
        }
        let version = cursor.get_u32_le();
        if version != LOG_VERSION {
            return Err(Error::Corruption(format!("Unsupported value log version {}", version)));
        }

        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut inner = LogInner {
            file,
            index: BTreeMap::new(),
            live_bytes: 0,
            log_bytes: 0,
            failed: None,
        };
        let mut offset = HEADER_SIZE;

        loop {
            let mut batch_header = [0u8; BATCH_HEADER_SIZE];
            match reader.read_exact(&mut batch_header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut cursor = &batch_header[..];
            let len = cursor.get_u32_le() as u64;
            let count = cursor.get_u32_le();

            let frame_end = offset + BATCH_HEADER_SIZE as u64 + len + 4;
            if frame_end > file_len {
                break;
            }

            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            let mut crc = [0u8; 4];
            reader.read_exact(&mut crc)?;

            if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
                if frame_end == file_len {
                    break;
                }
                return Err(Error::ChecksumMismatch);
            }

            let ops = decode_batch(&payload, count)?;
            inner.apply(ops);
            offset = frame_end;
        }

        if offset < file_len {
            warn!(
                "Truncating torn value log tail at offset {} ({} bytes dropped)",
                offset,
                file_len - offset
            );
            inner.file.set_len(offset)?;
            inner.file.sync_all()?;
        }

        inner.log_bytes = offset - HEADER_SIZE;
        inner.file.seek(SeekFrom::End(0))?;
        Ok(inner)
    }

    /// Directory holding the log
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current log size in bytes, excluding the header
    pub fn log_bytes(&self) -> u64 {
        self.inner.read().log_bytes
    }

    /// Share of the log taken by overwritten or deleted entries
    pub fn garbage_ratio(&self) -> f64 {
        self.inner.read().garbage_ratio()
    }

    fn append(&self, inner: &mut LogInner, ops: &[Op]) -> Result<()> {
        inner.ensure_usable()?;
        let frame = encode_batch(ops);
        let start = HEADER_SIZE + inner.log_bytes;
        let sync_writes = self.options.sync_writes;
        let written = inner.file.write_all(&frame).and_then(|()| {
            if sync_writes {
                inner.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            // a failed batch must not replay: drop whatever reached the file
            let restored = inner
                .file
                .set_len(start)
                .and_then(|()| inner.file.seek(SeekFrom::End(0)).map(|_| ()));
            if let Err(truncate) = restored {
                warn!(
                    "Could not drop failed batch at offset {}: {}; value log is now read-only",
                    start, truncate
                );
                inner.failed = Some(format!("failed batch left at offset {}", start));
            }
            return Err(e.into());
        }
        inner.log_bytes += frame.len() as u64;
        Ok(())
    }

    fn rewrite(&self, inner: &mut LogInner) -> Result<()> {
        let tmp_path = self.dir.join(COMPACT_FILE_NAME);
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_header(&mut tmp)?;

        let mut written = 0u64;
        let live: Vec<Op> = inner
            .index
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        for chunk in live.chunks(COMPACTION_BATCH_ENTRIES) {
            let frame = encode_batch(chunk);
            tmp.write_all(&frame)?;
            written += frame.len() as u64;
        }
        tmp.sync_all()?;

        // the open handle follows the rename, so there is no reopen to fail
        fs::rename(&tmp_path, self.dir.join(LOG_FILE_NAME))?;
        inner.file = tmp;
        inner.log_bytes = written;
        if let Err(e) = inner.file.seek(SeekFrom::End(0)) {
            inner.failed = Some(format!("rewritten log not positioned: {}", e));
            return Err(e.into());
        }
        Ok(())
    }
}

struct LogReadTxn<'a> {
    inner: RwLockReadGuard<'a, LogInner>,
}

impl ReadTxn for LogReadTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.index.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_map(&self.inner.index, prefix).collect())
    }
}

struct LogWriteTxn<'a> {
    store: &'a LogStore,
    inner: RwLockWriteGuard<'a, LogInner>,
    overlay: Overlay,
}

impl ReadTxn for LogWriteTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.overlay.get(&self.inner.index, key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.overlay.scan_prefix(&self.inner.index, prefix))
    }
}

impl WriteTxn for LogWriteTxn<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }
        self.overlay.set(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.overlay.delete(&self.inner.index, key))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let LogWriteTxn {
            store,
            mut inner,
            overlay,
        } = *self;
        if overlay.is_empty() {
            return Ok(());
        }
        let ops = overlay.into_ops();
        store.append(&mut inner, &ops)?;
        debug!("Committed batch of {} ops", ops.len());
        inner.apply(ops);
        Ok(())
    }
}

impl TransactionalStore for LogStore {
    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        Ok(Box::new(LogReadTxn {
            inner: self.inner.read(),
        }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>> {
        Ok(Box::new(LogWriteTxn {
            store: self,
            inner: self.inner.write(),
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

        let mut inner = self.inner.write();
        inner.ensure_usable()?;
        let bytes_before = inner.log_bytes;
        let garbage = inner.garbage_ratio();
        if bytes_before == 0 || garbage < discard_ratio {
            debug!(
                "Skipping value log rewrite: garbage ratio {:.3} < {:.3}",
                garbage, discard_ratio
            );
            return Ok(CompactionReport {
                rewritten: false,
                bytes_before,
                bytes_after: bytes_before,
            });
        }

        self.rewrite(&mut inner)
            .map_err(|e| e.with_context("value log rewrite failed"))?;
        info!(
            "Rewrote value log: {} -> {} bytes (garbage ratio {:.3})",
            bytes_before, inner.log_bytes, garbage
        );

        Ok(CompactionReport {
            rewritten: true,
            bytes_before,
            bytes_after: inner.log_bytes,
        })
    }

    fn flush(&self) -> Result<()> {
        self.inner.write().file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreExt;
    use tempfile::TempDir;

    fn put(store: &LogStore, key: &[u8], value: &[u8]) {
        store
            .update(|txn| -> Result<()> { txn.set(key, value) })
            .unwrap();
    }

    #[test]
    fn test_log_reopen_replays_batches() {
        let tmp = TempDir::new().unwrap();
        {
            let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
            put(&store, b"k1", b"v1");
            put(&store, b"k2", b"v2");
            store.update(|txn| txn.delete(b"k1")).unwrap();
        }

        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        assert_eq!(store.view(|txn| txn.get(b"k1")).unwrap(), None);
        assert_eq!(store.view(|txn| txn.get(b"k2")).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let good_len;
        {
            let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
            put(&store, b"k1", b"v1");
            good_len = HEADER_SIZE + store.log_bytes();
            put(&store, b"k2", b"v2");
        }

        // chop the last batch in half
        let path = tmp.path().join(LOG_FILE_NAME);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let full_len = file.metadata().unwrap().len();
        file.set_len(good_len + (full_len - good_len) / 2).unwrap();
        drop(file);

        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        assert_eq!(store.view(|txn| txn.get(b"k1")).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.view(|txn| txn.get(b"k2")).unwrap(), None);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        // the log accepts new writes after truncation
        put(&store, b"k3", b"v3");
        drop(store);
        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        assert_eq!(store.view(|txn| txn.get(b"k3")).unwrap(), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_compaction_reclaims_garbage() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::open(
            tmp.path(),
            LogStoreOptions { sync_writes: false },
        )
        .unwrap();

        for round in 0..20 {
            for i in 0..10 {
                let value = format!("value-{}-{}", round, i);
                put(&store, format!("key{}", i).as_bytes(), value.as_bytes());
            }
        }
        assert!(store.garbage_ratio() > 0.5);

        let report = store.compact(0.5).unwrap();
        assert!(report.rewritten);
        assert!(report.bytes_after < report.bytes_before);
        assert!(store.garbage_ratio() < 0.5);

        drop(store);
        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        let value = store.view(|txn| txn.get(b"key3")).unwrap();
        assert_eq!(value, Some(b"value-19-3".to_vec()));
        assert_eq!(store.view(|txn| txn.scan_prefix(b"key")).unwrap().len(), 10);
    }

    #[test]
    fn test_failed_append_leaves_log_consistent() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        put(&store, b"k1", b"v1");
        let good_len = HEADER_SIZE + store.log_bytes();

        // a read-only handle fails both the append and the truncate
        let path = tmp.path().join(LOG_FILE_NAME);
        store.inner.write().file = OpenOptions::new().read(true).open(&path).unwrap();
        let err = store
            .update(|txn| -> Result<()> { txn.set(b"k2", b"v2") })
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(store.log_bytes() + HEADER_SIZE, good_len);
        assert_eq!(store.view(|txn| txn.get(b"k2")).unwrap(), None);

        // later writes and compactions refuse instead of writing past a stale offset
        let err = store
            .update(|txn| -> Result<()> { txn.set(b"k3", b"v3") })
            .unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(store.compact(0.1).is_err());
        drop(store);

        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        assert_eq!(store.view(|txn| txn.get(b"k1")).unwrap(), Some(b"v1".to_vec()));
        put(&store, b"k3", b"v3");
        assert_eq!(store.view(|txn| txn.get(b"k3")).unwrap(), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_compaction_keeps_log_writable() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::open(tmp.path(), LogStoreOptions { sync_writes: false }).unwrap();
        for round in 0..5 {
            put(&store, b"key", format!("value-{}", round).as_bytes());
        }
        assert!(store.compact(0.5).unwrap().rewritten);

        // appends after the swap land in the rewritten file
        put(&store, b"after", b"swap");
        drop(store);
        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        assert_eq!(store.view(|txn| txn.get(b"after")).unwrap(), Some(b"swap".to_vec()));
        assert_eq!(store.view(|txn| txn.get(b"key")).unwrap(), Some(b"value-4".to_vec()));
    }

    #[test]
    fn test_compaction_skips_clean_log() {
        let tmp = TempDir::new().unwrap();
        let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
        put(&store, b"only", b"once");

        let report = store.compact(0.5).unwrap();
        assert!(!report.rewritten);
        assert_eq!(report.bytes_before, report.bytes_after);
        assert!(store.compact(1.5).is_err());
    }

    #[test]
    fn test_batch_codec() {
        let ops = vec![
            (b"a".to_vec(), Some(b"1".to_vec())),
            (b"b".to_vec(), None),
        ];
        let frame = encode_batch(&ops);
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        let payload = &frame[8..8 + len];
        let crc = u32::from_le_bytes(frame[8 + len..].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(payload));
        assert_eq!(decode_batch(payload, count).unwrap(), ops);
    }
    mod replay {
        use super::*;
        use proptest::prelude::*;

        prop_compose! {
            fn arb_op()(
                key in 0u8..16,
                value in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..32)),
            ) -> (Vec<u8>, Option<Vec<u8>>) {
                (vec![b'k', key], value)
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn test_replay_matches_model(
                batches in proptest::collection::vec(proptest::collection::vec(arb_op(), 1..8), 1..12),
            ) {
                let tmp = TempDir::new().unwrap();
                let mut model = BTreeMap::new();
                {
                    let store = LogStore::open(tmp.path(), LogStoreOptions { sync_writes: false }).unwrap();
                    for batch in &batches {
                        store.update(|txn| -> Result<()> {
                            for (key, value) in batch {
                                match value {
                                    Some(v) => txn.set(key, v)?,
                                    None => {
                                        txn.delete(key)?;
                                    }
                                }
                            }
                            Ok(())
                        }).unwrap();
                        for (key, value) in batch {
                            match value {
                                Some(v) => { model.insert(key.clone(), v.clone()); }
                                None => { model.remove(key); }
                            }
                        }
                    }
                }

                let store = LogStore::open(tmp.path(), LogStoreOptions::default()).unwrap();
                let replayed: BTreeMap<_, _> = store.view(|txn| txn.scan_prefix(b"k")).unwrap().into_iter().collect();
                prop_assert_eq!(replayed, model);
            }
        }
    }
}
