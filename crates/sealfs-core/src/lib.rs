//! Block-oriented encrypted filesystem core.
//!
//! sealfs maps plaintext file offsets onto fixed-size encrypted chunks stored
//! on an untrusted backing filesystem. Every chunk is independently
//! authenticated with AES-256-GCM under a key derived per chunk from the
//! master key, so the backing store never observes plaintext and any
//! tampering is detected on read.
//!
//! The crate exposes a POSIX-shaped surface ([`EncryptedFs`]): `open`,
//! `close`, positional `read`/`write`, `ftruncate`, `fallocate`, `stat`,
//! `fsync`, `utimes`, `unlink`. Directory trees, symlinks and name
//! resolution are the concern of a surrounding VFS layer, not of this crate.
//!
//! # Example
//!
//! ```no_run
//! use sealfs_core::{EncryptedFs, EfsOptions, MasterKey, MemStore, OpenFlags};
//!
//! # async fn example() -> Result<(), sealfs_core::EfsError> {
//! let efs = EncryptedFs::new(
//!     MasterKey::new("very password"),
//!     MemStore::new(),
//!     EfsOptions::default(),
//! )?;
//!
//! let fd = efs.open("notes.txt", OpenFlags::try_from("w+")?, 0o644).await?;
//! efs.write(fd, b"hello world", 0, 11, 0).await?;
//!
//! let mut buf = [0u8; 11];
//! let n = efs.read(fd, &mut buf, 0, 11, 0).await?;
//! assert_eq!(&buf[..n], b"hello world");
//! efs.close(fd).await?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod efs;
pub mod error;
pub mod fs;

pub use crypto::keys::MasterKey;
pub use efs::flags::OpenFlags;
pub use efs::options::EfsOptions;
pub use efs::{EncryptedFs, FileStat};
pub use error::{EfsError, ErrorKind};
pub use fs::store::{BackingStore, DiskStore, MemStore};
