/// Transactional key-value store contract
///
/// Read transactions see a consistent snapshot; write transactions are
/// exclusive and apply atomically on commit. Dropping a write transaction
/// without committing discards it.

use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

/// Read side of a transaction
pub trait ReadTxn {
    /// Get the value stored under `key`
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All pairs whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Write side of a transaction
pub trait WriteTxn: ReadTxn {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`, returning whether it was present
    fn delete(&mut self, key: &[u8]) -> Result<bool>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Outcome of a space reclamation pass
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompactionReport {
    /// Whether the store actually rewrote anything
    pub rewritten: bool,
    /// Log size before the pass
    pub bytes_before: u64,
    /// Log size after the pass
    pub bytes_after: u64,
}

pub trait TransactionalStore: Send + Sync {
    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>>;

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>>;

    /// Reclaim space held by overwritten and deleted entries.
    ///
    /// `discard_ratio` is the minimum share of garbage (0, 1] that makes a
    /// rewrite worthwhile.
    fn compact(&self, discard_ratio: f64) -> Result<CompactionReport>;

    /// Make every committed transaction durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Dump every key/value pair to `writer`, returning the entry count
    fn backup(&self, writer: &mut dyn Write) -> Result<u64> {
        let entries = self.begin_read()?.scan_prefix(&[])?;
        write_dump(writer, &entries)
    }

    /// Load a dump produced by [`TransactionalStore::backup`] in one transaction
    fn load(&self, reader: &mut dyn Read) -> Result<u64> {
        let entries = read_dump(reader)?;
        let mut txn = self.begin_write()?;
        for (key, value) in &entries {
            txn.set(key, value)?;
        }
        txn.commit()?;
        Ok(entries.len() as u64)
    }
}

/// Closure-scoped transactions over any store
pub trait StoreExt: TransactionalStore {
    /// Run `f` inside a read transaction
    fn view<T, E>(&self, f: impl FnOnce(&dyn ReadTxn) -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let txn = self.begin_read()?;
        f(&*txn)
    }

    /// Run `f` inside a write transaction, committing when it succeeds
    fn update<T, E>(
        &self,
        f: impl FnOnce(&mut dyn WriteTxn) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let mut txn = self.begin_write()?;
        let out = f(&mut *txn)?;
        txn.commit()?;
        Ok(out)
    }
}

impl<S: TransactionalStore + ?Sized> StoreExt for S {}

/// Read a big-endian u64 counter, treating a missing key as zero
pub fn read_counter<T: ReadTxn + ?Sized>(txn: &T, key: &[u8]) -> Result<u64> {
    match txn.get(key)? {
        None => Ok(0),
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                Error::Corruption(format!("counter value has {} bytes, expected 8", bytes.len()))
            })?;
            Ok(u64::from_be_bytes(raw))
        }
    }
}

/// Write a big-endian u64 counter
pub fn write_counter<T: WriteTxn + ?Sized>(txn: &mut T, key: &[u8], value: u64) -> Result<()> {
    txn.set(key, &value.to_be_bytes())
}

/// Pending writes of a transaction layered over committed data
#[derive(Debug, Default)]
pub(crate) struct Overlay {
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Overlay {
    pub(crate) fn get(&self, base: &BTreeMap<Vec<u8>, Vec<u8>>, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.get(key) {
            Some(pending) => pending.clone(),
            None => base.get(key).cloned(),
        }
    }

    pub(crate) fn scan_prefix(
        &self,
        base: &BTreeMap<Vec<u8>, Vec<u8>>,
        prefix: &[u8],
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = scan_map(base, prefix).collect();
        for (key, value) in self
            .pending
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    pub(crate) fn set(&mut self, key: &[u8], value: &[u8]) {
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub(crate) fn delete(&mut self, base: &BTreeMap<Vec<u8>, Vec<u8>>, key: &[u8]) -> bool {
        let existed = self.get(base, key).is_some();
        self.pending.insert(key.to_vec(), None);
        existed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.pending.into_iter().collect()
    }
}

/// Iterate the committed pairs under `prefix`
pub(crate) fn scan_map<'a>(
    map: &'a BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &'a [u8],
) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a {
    map.range(prefix.to_vec()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
}

const DUMP_MAGIC: u32 = 0x4453_5442; // "DSTB"
const DUMP_VERSION: u32 = 1;
const DUMP_END: u32 = u32::MAX;
/// Largest key or value a dump entry may announce
const MAX_DUMP_FIELD_SIZE: u32 = 64 * 1024 * 1024;

/// Dump format: [magic(4) | version(4)] [entry...] [end(4) | count(8)]
/// Entry: [key_len(4) | value_len(4) | key | value | crc(4)]
fn write_dump(writer: &mut dyn Write, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<u64> {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(DUMP_MAGIC);
    buf.put_u32_le(DUMP_VERSION);
    writer.write_all(&buf)?;

    for (key, value) in entries {
        let mut frame = BytesMut::with_capacity(12 + key.len() + value.len());
        frame.put_u32_le(key.len() as u32);
        frame.put_u32_le(value.len() as u32);
        frame.put_slice(key);
        frame.put_slice(value);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(value);
        frame.put_u32_le(hasher.finalize());
        writer.write_all(&frame)?;
    }

    let mut trailer = BytesMut::with_capacity(12);
    trailer.put_u32_le(DUMP_END);
    trailer.put_u64_le(entries.len() as u64);
    writer.write_all(&trailer)?;
    writer.flush()?;
    Ok(entries.len() as u64)
}

fn read_dump(reader: &mut dyn Read) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut header = [0u8; 8];
    read_exact_or_corrupt(reader, &mut header, "dump header")?;
    let mut header = &header[..];
    if header.get_u32() != DUMP_MAGIC {
        return Err(Error::Corruption("Invalid dump magic".to_string()));
    }
    let version = header.get_u32_le();
    if version != DUMP_VERSION {
        return Err(Error::Corruption(format!("Unsupported dump version {}", version)));
    }

    let mut entries = Vec::new();
    loop {
        let mut len = [0u8; 4];
        read_exact_or_corrupt(reader, &mut len, "entry header")?;
        let key_len = u32::from_le_bytes(len);
        if key_len == DUMP_END {
            let mut count = [0u8; 8];
            read_exact_or_corrupt(reader, &mut count, "dump trailer")?;
            let expected = u64::from_le_bytes(count);
            if expected != entries.len() as u64 {
                return Err(Error::Corruption(format!(
                    "Dump announces {} entries, found {}",
                    expected,
                    entries.len()
                )));
            }
            return Ok(entries);
        }

        read_exact_or_corrupt(reader, &mut len, "entry header")?;
        let value_len = u32::from_le_bytes(len);

        let key = read_field(reader, key_len, "entry key")?;
        let value = read_field(reader, value_len, "entry value")?;

        let mut crc = [0u8; 4];
        read_exact_or_corrupt(reader, &mut crc, "entry checksum")?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&key);
        hasher.update(&value);
        if u32::from_le_bytes(crc) != hasher.finalize() {
            return Err(Error::ChecksumMismatch);
        }

        entries.push((key, value));
    }
}

/// Read a length-prefixed field; the buffer only grows with bytes actually read
fn read_field(reader: &mut dyn Read, len: u32, what: &str) -> Result<Vec<u8>> {
    if len > MAX_DUMP_FIELD_SIZE {
        return Err(Error::Corruption(format!(
            "Dump {} of {} bytes exceeds {} bytes",
            what, len, MAX_DUMP_FIELD_SIZE
        )));
    }
    let mut buf = Vec::new();
    (&mut *reader).take(u64::from(len)).read_to_end(&mut buf)?;
    if buf.len() != len as usize {
        return Err(Error::Corruption(format!("Truncated dump: missing {}", what)));
    }
    Ok(buf)
}

fn read_exact_or_corrupt(reader: &mut dyn Read, buf: &mut [u8], what: &str) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(Error::Corruption(format!("Truncated dump: missing {}", what)))
        }
        Err(e) => Err(e.into()),
    }
}
