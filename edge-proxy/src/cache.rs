//! Read-through response cache.
//!
//! Reads go straight to the [`CacheStore`]. Writes are handed to a background
//! writer task through a bounded queue, so storing a response never delays the
//! response itself and a failing store only costs cache effectiveness.
//!
//! The writer task also deletes expired entries: on demand when a read finds
//! one, and periodically by sweeping the whole store.

use crate::config::{CacheConfig, CacheStoreConfig};
use crate::metrics_defs::{CACHE_EVICTED, CACHE_WRITE_DROPPED, CACHE_WRITE_FAILED};
use crate::signature::RequestSignature;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;
use moka::sync::Cache as MokaCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::counter;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// A stored response. Immutable once written; a later write under the same key
/// replaces it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
    pub stored_at: SystemTime,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(status: StatusCode, content_type: &str, body: Bytes, ttl: Duration) -> Self {
        Self {
            status: status.as_u16(),
            content_type: content_type.to_string(),
            body,
            stored_at: SystemTime::now(),
            ttl,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY)
    }

    /// Time since the entry was stored. Zero if it was stored "in the future"
    /// after a clock step back.
    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.stored_at).unwrap_or_default()
    }

    /// Whether the entry may still be served at `now`.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        self.age_at(now) < self.ttl
    }
}

/// Storage backend for cache entries, keyed by [`RequestSignature::cache_key`].
///
/// Backends are free to evict at any time. Expiry is enforced by [`Cache::read`],
/// so a backend may also return entries past their TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    async fn put(&self, key: String, entry: CacheEntry) -> Result<(), CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
    /// Deletes every entry that is no longer fresh at `now`. Returns how many
    /// entries were deleted.
    async fn sweep(&self, now: SystemTime) -> Result<usize, CacheError>;
}

pub fn build_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
    match &config.store {
        CacheStoreConfig::Memory { max_entries } => {
            Arc::new(MemoryStore::new(*max_entries, config.max_ttl()))
        }
        CacheStoreConfig::Filesystem { base_dir } => Arc::new(FilesystemStore::new(base_dir)),
        CacheStoreConfig::None => Arc::new(NoopStore {}),
    }
}

/// In-process store. Moka evicts by size and by the longest configured TTL.
pub struct MemoryStore {
    cache: MokaCache<String, CacheEntry>,
}

impl MemoryStore {
    pub fn new(max_entries: u64, max_ttl: Duration) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .time_to_live(max_ttl)
            .build();

        MemoryStore { cache }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.cache.get(key))
    }

    async fn put(&self, key: String, entry: CacheEntry) -> Result<(), CacheError> {
        self.cache.insert(key, entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key);
        Ok(())
    }

    async fn sweep(&self, now: SystemTime) -> Result<usize, CacheError> {
        let mut removed = 0;
        for (key, entry) in self.cache.iter() {
            if !entry.is_fresh_at(now) {
                self.cache.invalidate(key.as_str());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Stores each entry in its own file, named after the SHA-256 of the key.
/// Entries survive restarts. Stale and unreadable files are deleted by
/// [`CacheStore::sweep`].
pub struct FilesystemStore {
    base_dir: PathBuf,
    config: bincode::config::Configuration,
}

impl FilesystemStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilesystemStore {
            base_dir: base_dir.into(),
            config: bincode::config::standard(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.base_dir.join(format!("{digest:x}.bin"))
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let data = match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (entry, _) = bincode::serde::decode_from_slice(&data, self.config)?;
        Ok(Some(entry))
    }

    async fn put(&self, key: String, entry: CacheEntry) -> Result<(), CacheError> {
        let data = bincode::serde::encode_to_vec(&entry, self.config)?;
        let path = self.path_for(&key);
        let tmp_path = path.with_extension("tmp");

        tokio::fs::create_dir_all(&self.base_dir).await?;
        // Write then rename so readers never see a partially written entry
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn sweep(&self, now: SystemTime) -> Result<usize, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }
            let Ok(data) = tokio::fs::read(&path).await else {
                // Removed concurrently
                continue;
            };
            let decoded = bincode::serde::decode_from_slice::<CacheEntry, _>(&data, self.config);
            let expired = match decoded {
                Ok((entry, _)) => !entry.is_fresh_at(now),
                Err(_) => true,
            };
            if expired {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

/// Caching disabled.
pub struct NoopStore {}

#[async_trait]
impl CacheStore for NoopStore {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn put(&self, _key: String, _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn sweep(&self, _now: SystemTime) -> Result<usize, CacheError> {
        Ok(0)
    }
}

#[derive(Debug)]
enum Command {
    Store { key: String, entry: CacheEntry },
    // Deletes the entry if it is still expired when the command is processed
    Evict { key: String },
    // Replies once every command queued before it has been processed
    Flush(oneshot::Sender<()>),
}

pub struct Cache {
    store: Arc<dyn CacheStore>,
    tx: mpsc::Sender<Command>,
}

impl Cache {
    /// Creates the cache and spawns its background writer on the current runtime.
    /// The writer sweeps the store for expired entries every `sweep_interval`.
    pub fn new(
        store: Arc<dyn CacheStore>,
        write_queue_size: usize,
        sweep_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(write_queue_size);
        tokio::spawn(run_writer(store.clone(), rx, sweep_interval));

        Cache { store, tx }
    }

    /// Returns the stored entry, or `None` on a miss. Expired entries and store
    /// failures are both misses; expired entries are queued for deletion.
    pub async fn read(&self, signature: &RequestSignature) -> Option<CacheEntry> {
        let key = signature.cache_key();
        let stored = self.store.get(&key).await;
        match stored {
            Ok(Some(entry)) if entry.is_fresh_at(SystemTime::now()) => Some(entry),
            Ok(Some(_)) => {
                // Best effort, the next sweep catches anything dropped here
                let _ = self.tx.try_send(Command::Evict { key });
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Queues the entry for storage without waiting for it.
    pub fn write(&self, signature: &RequestSignature, entry: CacheEntry) {
        let command = Command::Store {
            key: signature.cache_key(),
            entry,
        };
        if let Err(e) = self.tx.try_send(command) {
            counter!(CACHE_WRITE_DROPPED).increment(1);
            tracing::warn!(error = %e, "Dropped cache write");
        }
    }

    /// Waits until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(
    store: Arc<dyn CacheStore>,
    mut rx: mpsc::Receiver<Command>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    sweep.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => handle_command(store.as_ref(), command).await,
                None => break,
            },
            _ = sweep.tick() => sweep_store(store.as_ref()).await,
        }
    }
}

async fn handle_command(store: &dyn CacheStore, command: Command) {
    match command {
        Command::Store { key, entry } => {
            if let Err(e) = store.put(key.clone(), entry).await {
                counter!(CACHE_WRITE_FAILED).increment(1);
                tracing::warn!(key = %key, error = %e, "Cache write failed");
            }
        }
        Command::Evict { key } => {
            // A fresh entry may have been written since the read that queued this
            let expired = match store.get(&key).await {
                Ok(Some(entry)) => !entry.is_fresh_at(SystemTime::now()),
                Ok(None) => false,
                Err(_) => true,
            };
            if expired {
                match store.remove(&key).await {
                    Ok(()) => counter!(CACHE_EVICTED).increment(1),
                    Err(e) => tracing::warn!(key = %key, error = %e, "Cache eviction failed"),
                }
            }
        }
        Command::Flush(done) => {
            let _ = done.send(());
        }
    }
}

async fn sweep_store(store: &dyn CacheStore) {
    match store.sweep(SystemTime::now()).await {
        Ok(removed) => {
            counter!(CACHE_EVICTED).increment(removed as u64);
            tracing::debug!(removed, "Swept expired cache entries");
        }
        Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
    }
}
