//! The file-descriptor table.
//!
//! Maps caller-visible descriptors to their backing pair: the encrypted
//! store descriptor and the plaintext cache descriptor. The table key (and
//! the value handed back from `open`) is the plaintext cache descriptor.
//! Lookups are strict: any descriptor not present yields `EBADF`, and
//! closing removes the entry, so a double close is `EBADF` too.

use std::sync::Arc;

use dashmap::DashMap;

use super::flags::OpenFlags;
use super::inodes::Inode;
use crate::error::EfsError;

/// One open descriptor: the backing pair, open mode and shared inode.
#[derive(Debug)]
pub struct FdEntry {
    /// Descriptor into the encrypted backing store (always read-write).
    pub enc_fd: u64,
    /// Descriptor into the plaintext cache store; also the table key.
    pub plain_fd: u64,
    /// Normalized open mode.
    pub flags: OpenFlags,
    /// Shared per-file state.
    pub inode: Arc<Inode>,
}

/// Thread-safe descriptor table.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: DashMap<u64, Arc<FdEntry>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under its `plain_fd`.
    pub fn insert(&self, entry: FdEntry) -> u64 {
        let fd = entry.plain_fd;
        self.entries.insert(fd, Arc::new(entry));
        fd
    }

    /// Look up a descriptor, failing with `EBADF` if absent.
    pub fn get(&self, syscall: &'static str, fd: u64) -> Result<Arc<FdEntry>, EfsError> {
        self.entries
            .get(&fd)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| EfsError::bad_descriptor(syscall, fd))
    }

    /// Remove a descriptor, failing with `EBADF` if absent.
    pub fn remove(&self, syscall: &'static str, fd: u64) -> Result<Arc<FdEntry>, EfsError> {
        self.entries
            .remove(&fd)
            .map(|(_, e)| e)
            .ok_or_else(|| EfsError::bad_descriptor(syscall, fd))
    }

    pub fn contains(&self, fd: u64) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::efs::inodes::InodeTable;
    use crate::error::ErrorKind;
    use crate::fs::meta::FileMetadata;

    fn entry(plain_fd: u64, inodes: &InodeTable) -> FdEntry {
        FdEntry {
            enc_fd: plain_fd + 100,
            plain_fd,
            flags: OpenFlags::try_from("r+").unwrap(),
            inode: inodes.acquire(Path::new("f"), FileMetadata::new(0, [0; 32])),
        }
    }

    #[test]
    fn insert_returns_plain_fd() {
        let inodes = InodeTable::new();
        let table = FdTable::new();

        let fd = table.insert(entry(7, &inodes));
        assert_eq!(fd, 7);
        assert!(table.contains(7));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lookup_is_strict() {
        let table = FdTable::new();
        let err = table.get("read", 42).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::BadDescriptor));
        assert_eq!(err.errno(), crate::error::errno::EBADF);
    }

    #[test]
    fn remove_then_remove_is_ebadf() {
        let inodes = InodeTable::new();
        let table = FdTable::new();
        let fd = table.insert(entry(3, &inodes));

        assert!(table.remove("close", fd).is_ok());
        assert!(table.is_empty());

        let err = table.remove("close", fd).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::BadDescriptor));
    }

    #[test]
    fn entries_share_the_inode() {
        let inodes = InodeTable::new();
        let table = FdTable::new();
        table.insert(entry(1, &inodes));
        table.insert(entry(2, &inodes));

        let a = table.get("read", 1).unwrap();
        let b = table.get("read", 2).unwrap();
        assert!(Arc::ptr_eq(&a.inode, &b.inode));
    }
}
