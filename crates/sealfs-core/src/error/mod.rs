//! Error taxonomy for the encrypted filesystem core.
//!
//! Every failure surfaced to callers is an [`EfsError`]: a POSIX-style
//! [`ErrorKind`], the syscall that failed, and the path or descriptor it
//! targeted. Argument, descriptor and kind errors are detected synchronously
//! before any I/O; integrity and key errors abort the enclosing call with no
//! observable state change; plaintext-cache failures are demoted to warnings
//! and never reach callers.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

// Re-export error types defined next to their modules
pub use crate::crypto::CryptoError;
pub use crate::fs::meta::MetaError;

/// POSIX errno values surfaced by this crate.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
}

/// Classified failure kinds, each mapping to one POSIX errno.
#[derive(Error, Debug)]
pub enum ErrorKind {
    /// Out-of-range or inconsistent arguments (`EINVAL`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Descriptor not present in the FD table (`EBADF`).
    #[error("bad file descriptor")]
    BadDescriptor,

    /// Operation targeted a directory (`EISDIR`).
    #[error("is a directory")]
    IsDirectory,

    /// A path component was not a directory (`ENOTDIR`).
    #[error("not a directory")]
    NotDirectory,

    /// No such file (`ENOENT`).
    #[error("no such file or directory")]
    NotFound,

    /// Exclusive create of an existing file (`EEXIST`).
    #[error("file exists")]
    AlreadyExists,

    /// Backing store denied access (`EACCES`).
    #[error("permission denied")]
    PermissionDenied,

    /// A chunk failed AES-GCM authentication (`EIO`, integrity subcode).
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// The metadata canary did not match the master key (`EACCES`).
    #[error("master key does not match this file")]
    KeyMismatch,

    /// Backing-store I/O failure, surfaced verbatim (`EIO`).
    #[error("I/O error")]
    Io,
}

impl ErrorKind {
    /// The POSIX errno this kind maps to.
    pub fn errno(&self) -> i32 {
        match self {
            ErrorKind::InvalidArgument(_) => errno::EINVAL,
            ErrorKind::BadDescriptor => errno::EBADF,
            ErrorKind::IsDirectory => errno::EISDIR,
            ErrorKind::NotDirectory => errno::ENOTDIR,
            ErrorKind::NotFound => errno::ENOENT,
            ErrorKind::AlreadyExists => errno::EEXIST,
            ErrorKind::PermissionDenied => errno::EACCES,
            ErrorKind::Integrity(_) | ErrorKind::Io => errno::EIO,
            ErrorKind::KeyMismatch => errno::EACCES,
        }
    }
}

/// What an operation was addressing when it failed.
#[derive(Debug, Clone)]
pub enum Target {
    Path(PathBuf),
    Fd(u64),
    None,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Path(p) => write!(f, "{}", p.display()),
            Target::Fd(fd) => write!(f, "fd {fd}"),
            Target::None => write!(f, "-"),
        }
    }
}

/// A structured filesystem error: kind, syscall and target.
#[derive(Error, Debug)]
#[error("{syscall}({target}): {kind}")]
pub struct EfsError {
    kind: ErrorKind,
    syscall: &'static str,
    target: Target,
    #[source]
    source: Option<io::Error>,
}

impl EfsError {
    pub fn new(kind: ErrorKind, syscall: &'static str, target: Target) -> Self {
        Self {
            kind,
            syscall,
            target,
            source: None,
        }
    }

    /// Classify a backing-store error, keeping the original as source.
    pub fn io(syscall: &'static str, target: Target, source: io::Error) -> Self {
        let kind = match source.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ if source.raw_os_error() == Some(errno::EISDIR) => ErrorKind::IsDirectory,
            _ if source.raw_os_error() == Some(errno::ENOTDIR) => ErrorKind::NotDirectory,
            _ => ErrorKind::Io,
        };
        Self {
            kind,
            syscall,
            target,
            source: Some(source),
        }
    }

    pub fn invalid_argument(syscall: &'static str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidArgument(detail.into()),
            syscall,
            Target::None,
        )
    }

    pub fn bad_descriptor(syscall: &'static str, fd: u64) -> Self {
        Self::new(ErrorKind::BadDescriptor, syscall, Target::Fd(fd))
    }

    pub fn integrity(syscall: &'static str, target: Target, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity(detail.into()), syscall, target)
    }

    pub fn key_mismatch(path: &Path) -> Self {
        Self::new(
            ErrorKind::KeyMismatch,
            "open",
            Target::Path(path.to_path_buf()),
        )
    }

    /// The classified kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The POSIX errno for this error.
    pub fn errno(&self) -> i32 {
        self.kind.errno()
    }

    /// The syscall that failed.
    pub fn syscall(&self) -> &'static str {
        self.syscall
    }

    /// The path or descriptor the syscall targeted.
    pub fn target(&self) -> &Target {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            EfsError::invalid_argument("read", "length out of range").errno(),
            errno::EINVAL
        );
        assert_eq!(EfsError::bad_descriptor("close", 7).errno(), errno::EBADF);
        assert_eq!(
            EfsError::key_mismatch(Path::new("a.bin")).errno(),
            errno::EACCES
        );
        assert_eq!(
            EfsError::integrity("read", Target::Fd(3), "chunk 2").errno(),
            errno::EIO
        );
    }

    #[test]
    fn io_errors_are_classified() {
        let not_found = EfsError::io(
            "open",
            Target::Path(PathBuf::from("missing")),
            io::Error::new(io::ErrorKind::NotFound, "nope"),
        );
        assert!(matches!(not_found.kind(), ErrorKind::NotFound));
        assert_eq!(not_found.errno(), errno::ENOENT);

        let exists = EfsError::io(
            "open",
            Target::Path(PathBuf::from("taken")),
            io::Error::new(io::ErrorKind::AlreadyExists, "taken"),
        );
        assert!(matches!(exists.kind(), ErrorKind::AlreadyExists));

        let is_dir = EfsError::io(
            "open",
            Target::Path(PathBuf::from("dir")),
            io::Error::from_raw_os_error(errno::EISDIR),
        );
        assert!(matches!(is_dir.kind(), ErrorKind::IsDirectory));

        let not_dir = EfsError::io(
            "open",
            Target::Path(PathBuf::from("file/child")),
            io::Error::from_raw_os_error(errno::ENOTDIR),
        );
        assert!(matches!(not_dir.kind(), ErrorKind::NotDirectory));
        assert_eq!(not_dir.errno(), errno::ENOTDIR);
    }

    #[test]
    fn display_includes_syscall_and_target() {
        let err = EfsError::bad_descriptor("write", 42);
        let rendered = err.to_string();
        assert!(rendered.contains("write"));
        assert!(rendered.contains("fd 42"));
    }
}
