/// Distill: a url shortener core
///
/// `Distill` is the session handle. It owns the store, the record repository
/// with its write-back cache, and the statistics workers, and exposes the
/// operations the HTTP and CLI layers build on.
///
/// # Example
///
/// ```no_run
/// use distill_api::{Distill, DistillConfig, Resolution, UrlRequest};
///
/// let distill = Distill::open(DistillConfig::in_memory())?;
/// let id = distill.upsert_url(UrlRequest::new("https://example.com").with_max_requests(1))?;
///
/// match distill.get_url_redirect(&id)? {
///     Resolution::Redirect(target) => println!("-> {}", target),
///     Resolution::Fallback { verdict, target } => println!("{}: {:?}", verdict, target),
/// }
/// distill.close()?;
/// # Ok::<(), distill_api::Error>(())
/// ```

pub mod cache;
pub mod config;
pub mod csv;
pub mod error;
pub mod lifecycle;
pub mod maintenance;
pub mod record;
pub mod repository;
pub mod stats;

pub use config::{DatastoreConfig, DistillConfig, ShortIdConfig, TuningConfig, CONFIG_FILE_NAME};
pub use error::{Error, Result, Verdict};
pub use lifecycle::Resolution;
pub use record::{Record, UrlRequest};
pub use stats::{Opcode, Statistics, UrlOp};

use chrono::Utc;
use distill_core::{LogStore, LogStoreOptions, MemoryStore, TransactionalStore};
use lifecycle::{build_record, check_id_policy, evaluate, resolution};
use maintenance::MaintenanceScheduler;
use repository::{IdGenerator, Repository};
use stats::StatsAggregator;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot formats understood by [`Distill::backup`] and [`Distill::restore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    /// Store dump of every key, counters included
    Binary,
    /// Record rows only
    Csv,
}

impl BackupFormat {
    /// Pick the format from the file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "bin" => Ok(BackupFormat::Binary),
            "csv" => Ok(BackupFormat::Csv),
            _ => Err(Error::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// A Distill session
pub struct Distill {
    config: DistillConfig,
    store: Arc<dyn TransactionalStore>,
    repo: Arc<Repository>,
    stats: StatsAggregator,
    closed: AtomicBool,
}

impl Distill {
    /// Open a session on the store described by `config.datastore`
    pub fn open(config: DistillConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidConfig)?;
        let store: Arc<dyn TransactionalStore> = if config.datastore.in_memory {
            Arc::new(MemoryStore::new())
        } else {
            let options = LogStoreOptions {
                sync_writes: config.datastore.sync_writes,
            };
            Arc::new(LogStore::open(&config.datastore.path, options)?)
        };
        Self::with_store(config, store)
    }

    /// Open a session on an existing store
    pub fn with_store(config: DistillConfig, store: Arc<dyn TransactionalStore>) -> Result<Self> {
        config.validate().map_err(Error::InvalidConfig)?;
        let ids = IdGenerator::new(
            &config.short_id.alphabet,
            config.short_id.length,
            config.tuning.id_generation_retries,
        );
        let repo = Arc::new(Repository::new(
            store.clone(),
            config.tuning.url_cache_size,
            ids,
        ));
        let maintenance = MaintenanceScheduler::new(
            store.clone(),
            config.tuning.db_gc_deletes_count,
            config.tuning.db_gc_discard_ratio,
        );
        let stats = StatsAggregator::start(repo.clone(), maintenance, &config.tuning)?;

        info!(
            "Distill session open ({}, {})",
            if config.datastore.in_memory {
                "in memory".to_string()
            } else {
                config.datastore.path.display().to_string()
            },
            stats.get_stats()
        );
        Ok(Self {
            config,
            store,
            repo,
            stats,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    /// Store a url, returning its id.
    ///
    /// Without an id a fresh one is generated. A caller-supplied id must
    /// satisfy the id policy and replaces any record with the same id.
    pub fn upsert_url(&self, request: UrlRequest) -> Result<String> {
        self.ensure_open()?;
        let id = request.id.trim();
        if !id.is_empty() {
            check_id_policy(id, &self.config.short_id)?;
        }
        self.store_request(&request)
    }

    fn store_request(&self, request: &UrlRequest) -> Result<String> {
        let mut record = build_record(request, &self.config.short_id, Utc::now())?;
        let opcode = if record.id.is_empty() {
            self.repo.insert(&mut record)?;
            Opcode::Insert
        } else if self.repo.upsert(&record)? {
            Opcode::Update
        } else {
            Opcode::Insert
        };
        debug!("Stored {} -> {} ({:?})", record.id, record.redirect_url, opcode);
        self.stats.push_event(UrlOp::new(opcode, record.id.as_str()));
        Ok(record.id)
    }

    /// Resolve `id`, counting the hit.
    ///
    /// A record past its lifecycle resolves to a fallback rather than an
    /// error; `Err` is reserved for missing ids and system failures.
    pub fn get_url_redirect(&self, id: &str) -> Result<Resolution> {
        self.ensure_open()?;
        let now = Utc::now();
        let record = self.repo.get(id, now)?;
        let verdict = evaluate(&record, now);
        let opcode = verdict.map_or(Opcode::Get, Opcode::from);
        self.stats.push_event(UrlOp::new(opcode, id));
        Ok(resolution(&record, verdict, &self.config.short_id))
    }

    /// Current state of `id` without counting a hit
    pub fn get_url_info(&self, id: &str) -> Result<Record> {
        self.ensure_open()?;
        self.repo.peek(id)
    }

    pub fn delete_url(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        self.repo.delete(id)?;
        self.stats.push_event(UrlOp::new(Opcode::Delete, id));
        Ok(())
    }

    /// Every stored record, in id order
    pub fn list_urls(&self) -> Result<Vec<Record>> {
        self.ensure_open()?;
        self.repo.scan()
    }

    pub fn get_stats(&self) -> Statistics {
        self.stats.get_stats()
    }

    /// Recompute the counters from the stored records
    pub fn reset_stats(&self) -> Result<Statistics> {
        self.ensure_open()?;
        self.stats.reset_stats()
    }

    /// Import `url,id,max_requests,ttl,expire_on` rows.
    ///
    /// Rows bypass the id policy and are stored as they are read. Stops at
    /// the first row that fails to parse or store, reporting its line; rows
    /// before it stay imported.
    pub fn import_csv(&self, reader: impl BufRead) -> Result<u64> {
        self.ensure_open()?;
        let mut count = 0;
        for row in csv::read_requests(reader) {
            let (line, request) = row?;
            self.store_request(&request).map_err(|e| match e {
                Error::Store(_) => e,
                other => Error::InvalidRecord {
                    line,
                    reason: other.to_string(),
                },
            })?;
            count += 1;
        }
        info!("Imported {} urls", count);
        Ok(count)
    }

    /// Write every record as CSV rows
    pub fn export_csv(&self, writer: &mut dyn Write, header: bool) -> Result<u64> {
        self.ensure_open()?;
        let records = self.repo.scan()?;
        csv::export_records(writer, &records, header)
    }

    /// Upsert every record of a CSV export, row by row.
    ///
    /// Stops at the first invalid row; rows before it stay restored.
    pub fn restore_csv(&self, reader: impl BufRead) -> Result<u64> {
        self.ensure_open()?;
        let mut count = 0;
        for row in csv::read_records(reader) {
            let (_, record) = row?;
            let opcode = if self.repo.upsert(&record)? {
                Opcode::Update
            } else {
                Opcode::Insert
            };
            self.stats.push_event(UrlOp::new(opcode, record.id.as_str()));
            count += 1;
        }
        info!("Restored {} records", count);
        Ok(count)
    }

    /// Write a snapshot to `path`, in the format its extension names
    pub fn backup(&self, path: &Path) -> Result<u64> {
        self.ensure_open()?;
        let format = BackupFormat::from_path(path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        let count = match format {
            BackupFormat::Binary => {
                self.repo.purge_cache();
                self.stats.save_stats()?;
                self.store.backup(&mut writer)?
            }
            BackupFormat::Csv => self.export_csv(&mut writer, true)?,
        };
        writer.flush()?;
        info!("Backup of {} entries written to {}", count, path.display());
        Ok(count)
    }

    /// Load a snapshot written by [`Distill::backup`]
    pub fn restore(&self, path: &Path) -> Result<u64> {
        self.ensure_open()?;
        let format = BackupFormat::from_path(path)?;
        let mut reader = BufReader::new(File::open(path)?);
        let count = match format {
            BackupFormat::Binary => {
                // cached copies would overwrite the loaded records on eviction
                self.repo.purge_cache();
                let count = self.store.load(&mut reader)?;
                self.stats.load_stats()?;
                count
            }
            BackupFormat::Csv => self.restore_csv(reader)?,
        };
        info!("Restored {} entries from {}", count, path.display());
        Ok(count)
    }

    /// Drain the stats queue, persist counters and cached records, and
    /// flush the store. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stats.shutdown();
        self.stats.save_stats()?;
        let written = self.repo.purge_cache();
        self.store.flush()?;
        info!(
            "Distill session closed ({} cached records written back, {})",
            written,
            self.stats.get_stats()
        );
        Ok(())
    }
}

impl Drop for Distill {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing Distill session: {}", e);
        }
    }
}
