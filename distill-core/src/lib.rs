/// Storage layer for Distill
///
/// A small transactional key-value contract with two implementations: an
/// in-memory map and a durable, checksummed value log.

pub mod error;
pub mod keys;
pub mod store;
pub mod memory_store;
pub mod log_store;

pub use error::{Error, Result};
pub use keys::{decode as decode_key, encode as encode_key, KeyCategory};
pub use store::{
    read_counter, write_counter, CompactionReport, ReadTxn, StoreExt, TransactionalStore, WriteTxn,
};
pub use memory_store::MemoryStore;
pub use log_store::{LogStore, LogStoreOptions, LOG_FILE_NAME};
