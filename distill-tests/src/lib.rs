/// Test utilities and helpers for Distill testing
///
/// This module provides common test utilities to simplify writing tests.

use distill_api::{Distill, DistillConfig, Resolution, UrlRequest};
use distill_core::MemoryStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Test session wrapper that manages temporary directory lifecycle
pub struct TestDistill {
    pub distill: Distill,
    pub config: DistillConfig,
    _temp_dir: Option<TempDir>,
}

impl TestDistill {
    /// Create a session on a value log in a temporary directory
    pub fn new() -> Self {
        Self::with_config(DistillConfig::default())
    }

    /// Create an on-disk session with `config`; the datastore path is
    /// replaced by a temporary directory
    pub fn with_config(config: DistillConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = config
            .with_path(temp_dir.path().join("distill.db"))
            .with_sync_writes(false);
        let distill = Distill::open(config.clone()).expect("Failed to open session");

        Self {
            distill,
            config,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Create an in-memory session
    pub fn in_memory(config: DistillConfig) -> Self {
        let config = config.with_in_memory();
        let distill = Distill::open(config.clone()).expect("Failed to open session");

        Self {
            distill,
            config,
            _temp_dir: None,
        }
    }

    /// Create a session over a memory store the caller keeps a handle to
    pub fn on_store(config: DistillConfig, store: Arc<MemoryStore>) -> Self {
        let config = config.with_in_memory();
        let distill = Distill::with_store(config.clone(), store).expect("Failed to open session");

        Self {
            distill,
            config,
            _temp_dir: None,
        }
    }

    /// Datastore directory of an on-disk session
    pub fn path(&self) -> &Path {
        &self.config.datastore.path
    }

    /// Scratch directory for backup files
    pub fn scratch(&self, name: &str) -> PathBuf {
        match &self._temp_dir {
            Some(dir) => dir.path().join(name),
            None => std::env::temp_dir().join(name),
        }
    }

    /// Close and reopen the session (for testing persistence)
    pub fn reopen(self) -> Self {
        self.distill.close().expect("Failed to close session");
        drop(self.distill);
        let distill = Distill::open(self.config.clone()).expect("Failed to reopen session");

        Self {
            distill,
            config: self.config,
            _temp_dir: self._temp_dir,
        }
    }

    /// Drain pending statistics events by closing the session
    pub fn close(&self) {
        self.distill.close().expect("Failed to close session");
    }

    /// Shorten `url` with a generated id
    pub fn shorten(&self, url: &str) -> String {
        self.distill
            .upsert_url(UrlRequest::new(url))
            .expect("Failed to shorten url")
    }

    /// Resolve `id`, expecting it to exist
    pub fn resolve(&self, id: &str) -> Resolution {
        self.distill
            .get_url_redirect(id)
            .expect("Failed to resolve id")
    }
}

impl Default for TestDistill {
    fn default() -> Self {
        Self::new()
    }
}

/// Distinct target urls for bulk tests
pub fn sample_url(i: usize) -> String {
    format!("https://example.com/page/{}", i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_keeps_records() {
        let test = TestDistill::new();
        let id = test.shorten("https://example.com");
        let test = test.reopen();
        assert_eq!(
            test.resolve(&id),
            Resolution::Redirect("https://example.com/".to_string())
        );
    }
}
