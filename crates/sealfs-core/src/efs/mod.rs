//! The encrypted filesystem handle and its POSIX-shaped surface.
//!
//! [`EncryptedFs`] wires the block engine, FD table, inode registry and
//! crypto codec together. It is `Send + Sync`; for concurrent use from many
//! tasks wrap it in an `Arc` (or call [`into_shared`](EncryptedFs::into_shared)):
//!
//! ```ignore
//! let efs = EncryptedFs::new(key, store, EfsOptions::default())?.into_shared();
//! let (a, b) = tokio::join!(
//!     efs.read(fd_a, &mut buf_a, 0, 4096, 0),
//!     efs.read(fd_b, &mut buf_b, 0, 4096, 0),
//! );
//! ```
//!
//! # Concurrency
//!
//! Operations that write chunks or metadata serialize per inode; reads run
//! concurrently with anything. Descriptors on different files never contend.

pub mod fd;
pub mod flags;
pub mod inodes;
pub mod options;

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, instrument, warn};

use crate::crypto::chunk::ChunkLayout;
use crate::crypto::workers::{ChunkCodec, CryptoPool};
use crate::crypto::MasterKey;
use crate::error::{EfsError, Target};
use crate::fs::engine::BlockEngine;
use crate::fs::geometry::Geometry;
use crate::fs::meta::FileMetadata;
use crate::fs::store::{BackingStore, MemStore, StoreOpenOptions};

use fd::{FdEntry, FdTable};
use flags::OpenFlags;
use inodes::{InodeTable, LockMetrics, LockMetricsSnapshot};
use options::{EfsOptions, MIN_BLOCK_SIZE};

/// File status as reported by [`EncryptedFs::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Plaintext length in bytes (from metadata, not the encrypted file).
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Number of data blocks backing the file.
    pub blocks: u64,
    /// Plaintext block size.
    pub block_size: usize,
}

/// A POSIX-like encrypted filesystem over one backing store.
pub struct EncryptedFs<S: BackingStore> {
    engine: BlockEngine<S>,
    store: Arc<S>,
    cache: Arc<MemStore>,
    key: Arc<MasterKey>,
    fds: FdTable,
    inodes: InodeTable,
    metrics: Arc<LockMetrics>,
    options: EfsOptions,
}

impl<S: BackingStore> EncryptedFs<S> {
    /// Construct a filesystem over `store`, sealing every block under
    /// `master_key`.
    ///
    /// The crypto worker pool (when `use_workers` is set) is started here
    /// and stopped when the instance is dropped or [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// `EINVAL` if `block_size` is below [`MIN_BLOCK_SIZE`]; an I/O error if
    /// the worker pool cannot be started.
    pub fn new(
        master_key: impl Into<MasterKey>,
        store: S,
        options: EfsOptions,
    ) -> Result<Self, EfsError> {
        if options.block_size < MIN_BLOCK_SIZE {
            return Err(EfsError::invalid_argument(
                "open",
                format!(
                    "block size {} below the minimum of {MIN_BLOCK_SIZE}",
                    options.block_size
                ),
            ));
        }

        let codec = if options.use_workers {
            ChunkCodec::Pooled(CryptoPool::new(options.worker_pool_size).map_err(|e| {
                EfsError::io(
                    "worker_pool",
                    Target::None,
                    std::io::Error::other(e.to_string()),
                )
            })?)
        } else {
            ChunkCodec::Inline
        };

        let key = Arc::new(master_key.into());
        let store = Arc::new(store);
        let cache = Arc::new(MemStore::new());
        let metrics = Arc::new(LockMetrics::new());
        let geometry = Geometry::new(ChunkLayout::new(options.block_size));

        info!(
            block_size = options.block_size,
            use_workers = options.use_workers,
            use_cache = options.use_cache,
            "EncryptedFs initialized"
        );

        Ok(Self {
            engine: BlockEngine::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                codec,
                Arc::clone(&key),
                geometry,
                Arc::clone(&metrics),
                options.use_cache,
            ),
            store,
            cache,
            key,
            fds: FdTable::new(),
            inodes: InodeTable::new(),
            metrics,
            options,
        })
    }

    /// Convert this instance into an `Arc` for sharing across tasks.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The options this instance was constructed with.
    pub fn options(&self) -> &EfsOptions {
        &self.options
    }

    /// Snapshot of per-file lock acquisition counters.
    pub fn lock_metrics(&self) -> LockMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The encrypted backing store. Useful for inspecting the on-disk chunk
    /// layout; writing through it bypasses the engine.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The plaintext cache store.
    pub fn cache(&self) -> &Arc<MemStore> {
        &self.cache
    }

    /// Number of open descriptors.
    pub fn open_fds(&self) -> usize {
        self.fds.len()
    }

    /// Stop the instance, dropping the crypto worker pool and all
    /// descriptors still in the table.
    pub fn shutdown(self) {
        drop(self);
    }

    // -----------------------------------------------------------------------
    // open / close / unlink
    // -----------------------------------------------------------------------

    /// Open `path`, returning a file descriptor.
    ///
    /// `flags` is a normalized [`OpenFlags`]; construct it from a mode
    /// string (`OpenFlags::try_from("r+")`) or numeric POSIX bits
    /// (`OpenFlags::try_from(O_RDWR | O_CREAT)`). `mode` applies to newly
    /// created files after the instance umask.
    ///
    /// The encrypted backing file is always opened read-write: the engine
    /// rewrites boundary chunks even for reads-only descriptors. On first
    /// open of an existing file the metadata canary is verified, so a wrong
    /// master key fails here with a key error rather than later with
    /// integrity errors.
    #[instrument(level = "debug", skip(self), fields(path = %path.as_ref().display()))]
    pub async fn open(
        &self,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<u64, EfsError> {
        let path = path.as_ref();
        let mode = mode & !self.options.umask & 0o7777;

        let enc_fd = self
            .store
            .open(
                path,
                &StoreOpenOptions {
                    create: flags.creates(),
                    create_new: flags.exclusive(),
                    mode,
                },
            )
            .await
            .map_err(|e| EfsError::io("open", Target::Path(path.to_path_buf()), e))?;

        // The plaintext cache entry always exists: it supplies the
        // caller-visible descriptor even when mirroring is disabled.
        let plain_fd = match self
            .cache
            .open(
                path,
                &StoreOpenOptions {
                    create: true,
                    create_new: false,
                    mode,
                },
            )
            .await
        {
            Ok(fd) => fd,
            Err(e) => {
                let _ = self.store.close(enc_fd).await;
                return Err(EfsError::io("open", Target::Path(path.to_path_buf()), e));
            }
        };

        match self.open_inner(path, flags, enc_fd, plain_fd).await {
            Ok(fd) => Ok(fd),
            Err(e) => {
                let _ = self.store.close(enc_fd).await;
                let _ = self.cache.close(plain_fd).await;
                Err(e)
            }
        }
    }

    async fn open_inner(
        &self,
        path: &Path,
        flags: OpenFlags,
        enc_fd: u64,
        plain_fd: u64,
    ) -> Result<u64, EfsError> {
        // Resolve initial metadata. An inode already open elsewhere is
        // authoritative; otherwise load (verifying the canary) or
        // initialize for empty/new files.
        let meta = if flags.truncates() {
            // Rewritten under the inode write lock below.
            FileMetadata::new(0, self.key.fingerprint())
        } else if let Some(inode) = self.inodes.get(path) {
            inode.meta()
        } else {
            let enc_size = self
                .store
                .size(enc_fd)
                .await
                .map_err(|e| EfsError::io("stat", Target::Path(path.to_path_buf()), e))?;
            if enc_size == 0 {
                self.engine.init_metadata(enc_fd, plain_fd, path).await?
            } else {
                self.engine.load_metadata(enc_fd, path).await?
            }
        };

        let inode = self.inodes.acquire(path, meta);

        if flags.truncates() {
            let _guard = inode.lock_write(&self.metrics).await;
            match self.engine.init_metadata(enc_fd, plain_fd, path).await {
                Ok(meta) => inode.set_meta(meta),
                Err(e) => {
                    drop(_guard);
                    self.inodes.release(&inode);
                    return Err(e);
                }
            }
        }

        let fd = self.fds.insert(FdEntry {
            enc_fd,
            plain_fd,
            flags,
            inode,
        });
        debug!(fd, "Opened file");
        Ok(fd)
    }

    /// Close a descriptor, releasing both backing descriptors.
    ///
    /// Closing an unknown (or already closed) descriptor is `EBADF`.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self, fd: u64) -> Result<(), EfsError> {
        let entry = self.fds.remove("close", fd)?;

        let enc_result = self.store.close(entry.enc_fd).await;
        if let Err(e) = self.cache.close(entry.plain_fd).await {
            warn!(error = %e, "Plaintext cache close failed (ignored)");
        }
        self.inodes.release(&entry.inode);

        enc_result.map_err(|e| EfsError::io("close", Target::Fd(fd), e))
    }

    /// Remove the file at `path` from both stores and drop its inode state.
    ///
    /// Open descriptors keep working against the unlinked file, POSIX-style;
    /// a subsequent open of the same path starts a fresh file.
    #[instrument(level = "debug", skip(self), fields(path = %path.as_ref().display()))]
    pub async fn unlink(&self, path: impl AsRef<Path>) -> Result<(), EfsError> {
        let path = path.as_ref();
        self.store
            .unlink(path)
            .await
            .map_err(|e| EfsError::io("unlink", Target::Path(path.to_path_buf()), e))?;

        if let Err(e) = self.cache.unlink(path).await {
            // The cache may simply never have seen this file.
            debug!(error = %e, "Plaintext cache unlink skipped");
        }
        self.inodes.evict(path);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // I/O
    // -----------------------------------------------------------------------

    /// Read up to `length` bytes at plaintext `position` into
    /// `buf[offset..]`. Returns the bytes read, clamped at end of file.
    pub async fn read(
        &self,
        fd: u64,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize, EfsError> {
        let entry = self.fds.get("read", fd)?;
        if !entry.flags.readable() {
            return Err(EfsError::bad_descriptor("read", fd));
        }
        self.engine
            .read(
                entry.enc_fd,
                entry.plain_fd,
                &entry.inode,
                buf,
                offset,
                length,
                position,
            )
            .await
    }

    /// Write `buf[offset..offset + length]` at plaintext `position`.
    /// Append-mode descriptors write at end of file regardless of
    /// `position`. Returns the bytes written (`length` on success).
    pub async fn write(
        &self,
        fd: u64,
        buf: &[u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize, EfsError> {
        let entry = self.fds.get("write", fd)?;
        if !entry.flags.writable() {
            return Err(EfsError::bad_descriptor("write", fd));
        }
        self.engine
            .write(
                entry.enc_fd,
                entry.plain_fd,
                &entry.inode,
                buf,
                offset,
                length,
                position,
                entry.flags.appends(),
            )
            .await
    }

    /// Set the file length to `len`: shrink drops chunks, extension reads
    /// back as zeros.
    pub async fn ftruncate(&self, fd: u64, len: u64) -> Result<(), EfsError> {
        let entry = self.fds.get("ftruncate", fd)?;
        if !entry.flags.writable() {
            return Err(EfsError::invalid_argument(
                "ftruncate",
                "descriptor not open for writing",
            ));
        }
        self.engine
            .truncate(entry.enc_fd, entry.plain_fd, &entry.inode, len)
            .await
    }

    /// Ensure `[offset, offset + len)` is allocated and covered by the file
    /// size. Never shrinks.
    pub async fn fallocate(&self, fd: u64, offset: u64, len: u64) -> Result<(), EfsError> {
        let entry = self.fds.get("fallocate", fd)?;
        if !entry.flags.writable() {
            return Err(EfsError::bad_descriptor("fallocate", fd));
        }
        self.engine
            .fallocate(entry.enc_fd, entry.plain_fd, &entry.inode, offset, len)
            .await
    }

    /// File status: plaintext size from metadata plus backing permissions.
    pub async fn stat(&self, fd: u64) -> Result<FileStat, EfsError> {
        let entry = self.fds.get("stat", fd)?;
        let meta = entry.inode.meta();
        let mode = self
            .store
            .mode(entry.enc_fd)
            .await
            .map_err(|e| EfsError::io("stat", Target::Fd(fd), e))?;
        Ok(FileStat {
            size: meta.size,
            mode,
            blocks: self.engine.geometry().block_count(meta.size),
            block_size: self.engine.geometry().block_size(),
        })
    }

    /// Flush the encrypted file's data and metadata to durable storage.
    pub async fn fsync(&self, fd: u64) -> Result<(), EfsError> {
        let entry = self.fds.get("fsync", fd)?;
        self.store
            .sync_all(entry.enc_fd)
            .await
            .map_err(|e| EfsError::io("fsync", Target::Fd(fd), e))
    }

    /// Flush the encrypted file's data to durable storage.
    pub async fn fdatasync(&self, fd: u64) -> Result<(), EfsError> {
        let entry = self.fds.get("fdatasync", fd)?;
        self.store
            .sync_data(entry.enc_fd)
            .await
            .map_err(|e| EfsError::io("fdatasync", Target::Fd(fd), e))
    }

    /// Set the encrypted file's access and modification times.
    pub async fn utimes(
        &self,
        fd: u64,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> Result<(), EfsError> {
        let entry = self.fds.get("utimes", fd)?;
        self.store
            .utimes(entry.enc_fd, atime, mtime)
            .await
            .map_err(|e| EfsError::io("utimes", Target::Fd(fd), e))
    }
}

impl<S: BackingStore> std::fmt::Debug for EncryptedFs<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFs")
            .field("block_size", &self.options.block_size)
            .field("open_fds", &self.fds.len())
            .field("inodes", &self.inodes.len())
            .finish_non_exhaustive()
    }
}
