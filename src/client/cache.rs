//! Ordered buffer of publications awaiting delivery
//!
//! Entries are replayed oldest first and removed one at a time, by id, only
//! after the transport reports the message as delivered. An optional
//! [`CacheStore`] receives a full snapshot after every mutation so the buffer
//! survives process restarts.

use crate::routing::Target;
use crate::transport::SendOptions;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cache behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Buffer publishes made while disconnected instead of failing them
    pub enabled: bool,
    /// Route every publish through the buffer, even while connected
    pub cache_while_connected: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_while_connected: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    /// Identity used for removal; increases with insertion order
    pub id: u64,
    pub target: Target,
    pub address: String,
    pub payload: Bytes,
    pub options: SendOptions,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Durable storage for cache snapshots
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn write_snapshot(&self, entries: &[CachedMessage]) -> Result<(), CacheStoreError>;

    async fn read_snapshot(&self) -> Result<Vec<CachedMessage>, CacheStoreError>;
}

/// JSON snapshot file, replaced atomically on every write
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    path: PathBuf,
}

impl FileCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn write_snapshot(&self, entries: &[CachedMessage]) -> Result<(), CacheStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(entries)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, body).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Vec<CachedMessage>, CacheStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(body) => Ok(serde_json::from_slice(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// FIFO publish buffer
#[derive(Default)]
pub struct PublishCache {
    entries: VecDeque<CachedMessage>,
    next_id: u64,
    flushing: bool,
    store: Option<Arc<dyn CacheStore>>,
}

impl PublishCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    /// Load a persisted snapshot, appending after anything already buffered
    pub async fn restore(&mut self) -> Result<usize, CacheStoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut restored = store.read_snapshot().await?;
        restored.sort_by_key(|entry| entry.id);
        let count = restored.len();
        for mut entry in restored {
            entry.id = self.next_id;
            self.next_id += 1;
            self.entries.push_back(entry);
        }
        if count > 0 {
            info!(count, "Restored cached publications");
        }
        Ok(count)
    }

    pub fn enqueue(
        &mut self,
        target: Target,
        address: String,
        payload: Bytes,
        options: SendOptions,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        debug!(id, address = %address, "Caching publication");
        self.entries.push_back(CachedMessage {
            id,
            target,
            address,
            payload,
            options,
            enqueued_at: Utc::now(),
        });
        id
    }

    /// Copy of the buffer in replay order
    pub fn snapshot(&self) -> Vec<CachedMessage> {
        self.entries.iter().cloned().collect()
    }

    /// Remove one entry by identity
    pub fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Claim the flush slot; false when a flush is already running
    pub fn try_begin_flush(&mut self) -> bool {
        if self.flushing {
            return false;
        }
        self.flushing = true;
        true
    }

    pub fn end_flush(&mut self) {
        self.flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Write the current buffer to the store, if any
    pub async fn persist(&self) -> Result<(), CacheStoreError> {
        if let Some(store) = &self.store {
            let snapshot = self.snapshot();
            store.write_snapshot(&snapshot).await?;
        }
        Ok(())
    }

    /// Persist, logging instead of failing
    pub(crate) async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist publish cache");
        }
    }
}
