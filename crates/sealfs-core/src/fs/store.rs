//! Backing-store adapters.
//!
//! The core drives two stores through one trait: the authoritative
//! **encrypted store** (chunks only, never plaintext) and the **plaintext
//! cache store** (a write-through mirror whose failures are demoted to
//! warnings). [`DiskStore`] backs onto a real filesystem; [`MemStore`] is an
//! in-memory VFS used for the plaintext cache and as the test substrate.
//!
//! All errors surface as [`std::io::Error`]; the EFS layer classifies them
//! and attaches syscall/path context.

use std::future::Future;
use std::io;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::task;
use tracing::trace;

/// How to open a file in a backing store.
///
/// Stores always open files read-write: the block engine rewrites boundary
/// chunks even for descriptors the caller opened read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOpenOptions {
    /// Create the file if missing.
    pub create: bool,
    /// Fail with `AlreadyExists` if the file exists.
    pub create_new: bool,
    /// Permission bits for newly created files (umask already applied).
    pub mode: u32,
}

/// Positional-I/O file store, the seam between the core and its hosts.
///
/// Implementations hand out opaque `u64` descriptors; the FD table maps
/// caller-visible descriptors onto them.
pub trait BackingStore: Send + Sync + 'static {
    /// Open `path`, returning a store descriptor.
    fn open(
        &self,
        path: &Path,
        opts: &StoreOpenOptions,
    ) -> impl Future<Output = io::Result<u64>> + Send;

    /// Close a store descriptor.
    fn close(&self, fd: u64) -> impl Future<Output = io::Result<()>> + Send;

    /// Read up to `len` bytes at `pos`. Returns a short (possibly empty)
    /// buffer at end of file.
    fn read_at(
        &self,
        fd: u64,
        len: usize,
        pos: u64,
    ) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Write all of `data` at `pos`, extending the file as needed.
    fn write_at(
        &self,
        fd: u64,
        data: Vec<u8>,
        pos: u64,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Current file length in bytes.
    fn size(&self, fd: u64) -> impl Future<Output = io::Result<u64>> + Send;

    /// Permission bits of the file.
    fn mode(&self, fd: u64) -> impl Future<Output = io::Result<u32>> + Send;

    /// Truncate or extend the file to exactly `len` bytes.
    fn set_len(&self, fd: u64, len: u64) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush file data and metadata to durable storage.
    fn sync_all(&self, fd: u64) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush file data to durable storage.
    fn sync_data(&self, fd: u64) -> impl Future<Output = io::Result<()>> + Send;

    /// Set the file's access and modification times.
    fn utimes(
        &self,
        fd: u64,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Remove the file at `path`. Open descriptors stay usable.
    fn unlink(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> impl Future<Output = io::Result<bool>> + Send;
}

fn unknown_fd(fd: u64) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("unknown store fd {fd}"))
}

// ---------------------------------------------------------------------------
// DiskStore
// ---------------------------------------------------------------------------

/// A [`BackingStore`] over a directory of a real filesystem.
///
/// Positional I/O uses `FileExt::read_at`/`write_at` on blocking worker
/// threads; descriptors are shared `std::fs::File` handles.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    files: DashMap<u64, Arc<std::fs::File>>,
    next_fd: AtomicU64,
}

impl DiskStore {
    /// Create a store rooted at `root`. Paths passed to [`BackingStore`]
    /// methods are resolved relative to it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: DashMap::new(),
            next_fd: AtomicU64::new(1),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn file(&self, fd: u64) -> io::Result<Arc<std::fs::File>> {
        self.files
            .get(&fd)
            .map(|f| Arc::clone(&f))
            .ok_or_else(|| unknown_fd(fd))
    }
}

impl BackingStore for DiskStore {
    async fn open(&self, path: &Path, opts: &StoreOpenOptions) -> io::Result<u64> {
        let full = self.resolve(path);
        let opts = *opts;
        let file = task::spawn_blocking(move || {
            let mut oo = std::fs::OpenOptions::new();
            oo.read(true).write(true);
            if opts.create_new {
                oo.create_new(true);
            } else if opts.create {
                oo.create(true);
            }
            let file = oo.open(&full)?;
            if opts.create || opts.create_new {
                // Freshly created files get the caller's (umasked) mode.
                let mut perms = file.metadata()?.permissions();
                perms.set_mode(opts.mode);
                let _ = file.set_permissions(perms);
            }
            Ok::<_, io::Error>(file)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))??;

        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.files.insert(fd, Arc::new(file));
        trace!(fd, "DiskStore opened file");
        Ok(fd)
    }

    async fn close(&self, fd: u64) -> io::Result<()> {
        self.files.remove(&fd).map(|_| ()).ok_or_else(|| unknown_fd(fd))
    }

    async fn read_at(&self, fd: u64, len: usize, pos: u64) -> io::Result<Vec<u8>> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match file.read_at(&mut buf[filled..], pos + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn write_at(&self, fd: u64, data: Vec<u8>, pos: u64) -> io::Result<()> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || file.write_all_at(&data, pos))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn size(&self, fd: u64) -> io::Result<u64> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn mode(&self, fd: u64) -> io::Result<u32> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || file.metadata().map(|m| m.permissions().mode() & 0o7777))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn set_len(&self, fd: u64, len: u64) -> io::Result<()> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || file.set_len(len))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn sync_all(&self, fd: u64) -> io::Result<()> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn sync_data(&self, fd: u64) -> io::Result<()> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn utimes(&self, fd: u64, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let file = self.file(fd)?;
        task::spawn_blocking(move || {
            let times = std::fs::FileTimes::new()
                .set_accessed(atime)
                .set_modified(mtime);
            file.set_times(times)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        let full = self.resolve(path);
        tokio::fs::remove_file(full).await
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }
}

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemFile {
    data: Vec<u8>,
    mode: u32,
    atime: SystemTime,
    mtime: SystemTime,
}

#[derive(Debug, Clone)]
struct MemHandle {
    file: Arc<RwLock<MemFile>>,
}

/// An in-memory [`BackingStore`].
///
/// Doubles as the plaintext-cache reference VFS and the unit-test substrate.
/// File contents live behind per-file `RwLock`s, so concurrent readers of a
/// file never observe a torn positional write.
#[derive(Debug, Default)]
pub struct MemStore {
    files: DashMap<PathBuf, Arc<RwLock<MemFile>>>,
    handles: DashMap<u64, MemHandle>,
    next_fd: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            handles: DashMap::new(),
            next_fd: AtomicU64::new(1),
        }
    }

    fn handle(&self, fd: u64) -> io::Result<MemHandle> {
        self.handles
            .get(&fd)
            .map(|h| h.clone())
            .ok_or_else(|| unknown_fd(fd))
    }

    fn lock_poisoned() -> io::Error {
        io::Error::other("memory store lock poisoned")
    }

    /// Access and modification times of an open file.
    pub fn times(&self, fd: u64) -> io::Result<(SystemTime, SystemTime)> {
        let handle = self.handle(fd)?;
        let file = handle.file.read().map_err(|_| Self::lock_poisoned())?;
        Ok((file.atime, file.mtime))
    }
}

impl BackingStore for MemStore {
    async fn open(&self, path: &Path, opts: &StoreOpenOptions) -> io::Result<u64> {
        use dashmap::mapref::entry::Entry;

        let key = path.to_path_buf();
        // The entry API settles races between concurrent opens of one path.
        let file = match self.files.entry(key) {
            Entry::Occupied(entry) => {
                if opts.create_new {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists", entry.key().display()),
                    ));
                }
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                if !(opts.create || opts.create_new) {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} not found", entry.key().display()),
                    ));
                }
                let now = SystemTime::now();
                let fresh = Arc::new(RwLock::new(MemFile {
                    data: Vec::new(),
                    mode: opts.mode,
                    atime: now,
                    mtime: now,
                }));
                Arc::clone(entry.insert(fresh).value())
            }
        };

        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fd, MemHandle { file });
        Ok(fd)
    }

    async fn close(&self, fd: u64) -> io::Result<()> {
        self.handles
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| unknown_fd(fd))
    }

    async fn read_at(&self, fd: u64, len: usize, pos: u64) -> io::Result<Vec<u8>> {
        let handle = self.handle(fd)?;
        let file = handle.file.read().map_err(|_| Self::lock_poisoned())?;
        let start = (pos as usize).min(file.data.len());
        let end = (start + len).min(file.data.len());
        Ok(file.data[start..end].to_vec())
    }

    async fn write_at(&self, fd: u64, data: Vec<u8>, pos: u64) -> io::Result<()> {
        let handle = self.handle(fd)?;
        let mut file = handle.file.write().map_err(|_| Self::lock_poisoned())?;
        let end = pos as usize + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[pos as usize..end].copy_from_slice(&data);
        Ok(())
    }

    async fn size(&self, fd: u64) -> io::Result<u64> {
        let handle = self.handle(fd)?;
        let file = handle.file.read().map_err(|_| Self::lock_poisoned())?;
        Ok(file.data.len() as u64)
    }

    async fn mode(&self, fd: u64) -> io::Result<u32> {
        let handle = self.handle(fd)?;
        let file = handle.file.read().map_err(|_| Self::lock_poisoned())?;
        Ok(file.mode)
    }

    async fn set_len(&self, fd: u64, len: u64) -> io::Result<()> {
        let handle = self.handle(fd)?;
        let mut file = handle.file.write().map_err(|_| Self::lock_poisoned())?;
        file.data.resize(len as usize, 0);
        Ok(())
    }

    async fn sync_all(&self, _fd: u64) -> io::Result<()> {
        Ok(())
    }

    async fn sync_data(&self, _fd: u64) -> io::Result<()> {
        Ok(())
    }

    async fn utimes(&self, fd: u64, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let handle = self.handle(fd)?;
        let mut file = handle.file.write().map_err(|_| Self::lock_poisoned())?;
        file.atime = atime;
        file.mtime = mtime;
        Ok(())
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        self.files
            .remove(&path.to_path_buf())
            .map(|_| ())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )
            })
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.files.contains_key(&path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw() -> StoreOpenOptions {
        StoreOpenOptions {
            create: true,
            create_new: false,
            mode: 0o644,
        }
    }

    #[tokio::test]
    async fn mem_store_read_write_round_trip() {
        let store = MemStore::new();
        let fd = store.open(Path::new("f"), &rw()).await.expect("open");

        store.write_at(fd, b"hello".to_vec(), 3).await.expect("write");
        assert_eq!(store.size(fd).await.expect("size"), 8);

        let data = store.read_at(fd, 8, 0).await.expect("read");
        assert_eq!(&data, b"\0\0\0hello");

        // Reads past EOF come back short.
        let tail = store.read_at(fd, 100, 6).await.expect("read tail");
        assert_eq!(&tail, b"lo");
    }

    #[tokio::test]
    async fn mem_store_missing_file_is_not_found() {
        let store = MemStore::new();
        let opts = StoreOpenOptions::default();
        let err = store.open(Path::new("nope"), &opts).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn mem_store_create_new_rejects_existing() {
        let store = MemStore::new();
        store.open(Path::new("f"), &rw()).await.expect("create");

        let excl = StoreOpenOptions {
            create_new: true,
            ..rw()
        };
        let err = store.open(Path::new("f"), &excl).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn mem_store_unlink_keeps_open_handles_usable() {
        let store = MemStore::new();
        let fd = store.open(Path::new("f"), &rw()).await.expect("open");
        store.write_at(fd, b"data".to_vec(), 0).await.expect("write");

        store.unlink(Path::new("f")).await.expect("unlink");
        assert!(!store.exists(Path::new("f")).await.expect("exists"));

        // POSIX semantics: the open handle still reads the old contents.
        assert_eq!(store.read_at(fd, 4, 0).await.expect("read"), b"data");
    }

    #[tokio::test]
    async fn mem_store_utimes_round_trip() {
        use std::time::Duration;

        let store = MemStore::new();
        let fd = store.open(Path::new("f"), &rw()).await.expect("open");

        let atime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000);
        store.utimes(fd, atime, mtime).await.expect("utimes");

        assert_eq!(store.times(fd).expect("times"), (atime, mtime));
        assert!(store.utimes(fd + 1, atime, mtime).await.is_err());
    }

    #[tokio::test]
    async fn mem_store_close_invalidates_fd() {
        let store = MemStore::new();
        let fd = store.open(Path::new("f"), &rw()).await.expect("open");
        store.close(fd).await.expect("close");
        assert!(store.close(fd).await.is_err());
        assert!(store.read_at(fd, 1, 0).await.is_err());
    }

    #[tokio::test]
    async fn disk_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path());

        let fd = store.open(Path::new("blob.bin"), &rw()).await.expect("open");
        store
            .write_at(fd, vec![7u8; 100], 50)
            .await
            .expect("write");
        assert_eq!(store.size(fd).await.expect("size"), 150);

        let data = store.read_at(fd, 100, 50).await.expect("read");
        assert_eq!(data, vec![7u8; 100]);

        store.set_len(fd, 60).await.expect("truncate");
        assert_eq!(store.size(fd).await.expect("size"), 60);

        store.sync_all(fd).await.expect("sync");
        store.close(fd).await.expect("close");

        assert!(store.exists(Path::new("blob.bin")).await.expect("exists"));
        store.unlink(Path::new("blob.bin")).await.expect("unlink");
        assert!(!store.exists(Path::new("blob.bin")).await.expect("exists"));
    }

    #[tokio::test]
    async fn disk_store_missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path());
        let err = store
            .open(Path::new("nope.bin"), &StoreOpenOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
