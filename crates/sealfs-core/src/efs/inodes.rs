//! Per-inode shared state: metadata cell, write serialization, lock metrics.
//!
//! Every open file has exactly one [`Inode`] shared by all of its
//! descriptors. The inode carries the authoritative in-memory metadata and
//! the per-file write lock: operations that write chunks or metadata
//! serialize through it, while reads only take brief metadata snapshots.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::MutexGuard;
use tracing::trace;

use crate::fs::meta::FileMetadata;

/// Shared state of one open file.
#[derive(Debug)]
pub struct Inode {
    path: PathBuf,
    meta: RwLock<FileMetadata>,
    write_lock: tokio::sync::Mutex<()>,
    fd_count: AtomicUsize,
}

impl Inode {
    fn new(path: PathBuf, meta: FileMetadata) -> Self {
        Self {
            path,
            meta: RwLock::new(meta),
            write_lock: tokio::sync::Mutex::new(()),
            fd_count: AtomicUsize::new(0),
        }
    }

    /// The encrypted-store path this inode was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot the current metadata.
    pub fn meta(&self) -> FileMetadata {
        *self.meta.read().expect("inode metadata lock poisoned")
    }

    /// Replace the metadata. Callers hold the write lock.
    pub fn set_meta(&self, meta: FileMetadata) {
        *self.meta.write().expect("inode metadata lock poisoned") = meta;
    }

    /// Acquire the per-file write lock, recording fast-path hits and
    /// contended acquisitions.
    pub async fn lock_write(&self, metrics: &LockMetrics) -> MutexGuard<'_, ()> {
        metrics.record_file_lock();
        match self.write_lock.try_lock() {
            Ok(guard) => {
                metrics.record_fast_path_hit();
                guard
            }
            Err(_) => {
                metrics.record_fast_path_miss();
                self.write_lock.lock().await
            }
        }
    }
}

/// Registry mapping encrypted-store paths to live inodes.
///
/// Inodes are reference-counted by open descriptor: the last `release`
/// evicts the entry, and `unlink` evicts eagerly so a re-created path gets
/// fresh state.
#[derive(Debug, Default)]
pub struct InodeTable {
    inodes: DashMap<PathBuf, Arc<Inode>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the inode for `path`, creating it with `meta` if absent, and
    /// take one descriptor reference on it.
    pub fn acquire(&self, path: &Path, meta: FileMetadata) -> Arc<Inode> {
        let inode = Arc::clone(
            self.inodes
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Inode::new(path.to_path_buf(), meta)))
                .value(),
        );
        inode.fd_count.fetch_add(1, Ordering::AcqRel);
        inode
    }

    /// The live inode for `path`, if any descriptor holds it open.
    pub fn get(&self, path: &Path) -> Option<Arc<Inode>> {
        self.inodes.get(path).map(|i| Arc::clone(&i))
    }

    /// Drop one descriptor reference; evict the inode when it was the last.
    pub fn release(&self, inode: &Arc<Inode>) {
        if inode.fd_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inodes
                .remove_if(inode.path(), |_, current| current.fd_count.load(Ordering::Acquire) == 0);
            trace!(path = %inode.path().display(), "Evicted inode");
        }
    }

    /// Evict `path` unconditionally (unlink). Open descriptors keep their
    /// `Arc<Inode>` alive; a later open of the same path starts fresh.
    pub fn evict(&self, path: &Path) {
        self.inodes.remove(path);
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

/// Lock acquisition counters for profiling.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Uncontended write-lock acquisitions.
    fast_path_hits: AtomicU64,
    /// Write-lock acquisitions that had to wait.
    fast_path_misses: AtomicU64,
    /// Total per-file write-lock requests.
    file_lock_requests: AtomicU64,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_fast_path_hit(&self) {
        self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fast_path_miss(&self) {
        self.fast_path_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_file_lock(&self) {
        self.file_lock_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            fast_path_hits: self.fast_path_hits.load(Ordering::Relaxed),
            fast_path_misses: self.fast_path_misses.load(Ordering::Relaxed),
            file_lock_requests: self.file_lock_requests.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`LockMetrics`].
#[derive(Debug, Clone, Copy)]
pub struct LockMetricsSnapshot {
    pub fast_path_hits: u64,
    pub fast_path_misses: u64,
    pub file_lock_requests: u64,
}

impl LockMetricsSnapshot {
    /// Fraction of write-lock acquisitions that were uncontended.
    pub fn fast_path_hit_rate(&self) -> f64 {
        let total = self.fast_path_hits + self.fast_path_misses;
        if total == 0 {
            0.0
        } else {
            self.fast_path_hits as f64 / total as f64
        }
    }
}
