//! Open flags: mode strings and numeric POSIX constants.
//!
//! Callers may pass the familiar `fopen`-style strings (`"r"`, `"w+"`,
//! `"wx"`, …) or a bitwise OR of the numeric constants in [`consts`]; both
//! normalize to the same [`OpenFlags`].

use crate::error::EfsError;

/// Numeric POSIX open flags accepted by [`OpenFlags::try_from`].
pub mod consts {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 1;
    pub const O_RDWR: u32 = 2;
    pub const O_CREAT: u32 = 64;
    pub const O_EXCL: u32 = 128;
    pub const O_TRUNC: u32 = 512;
    pub const O_APPEND: u32 = 1024;

    /// Mask selecting the access mode out of a flag word.
    pub const O_ACCMODE: u32 = 3;
}

/// Normalized open mode of one file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    read: bool,
    write: bool,
    create: bool,
    excl: bool,
    truncate: bool,
    append: bool,
}

impl OpenFlags {
    /// Descriptor permits reads.
    pub fn readable(&self) -> bool {
        self.read
    }

    /// Descriptor permits writes.
    pub fn writable(&self) -> bool {
        self.write
    }

    /// Create the file if it does not exist.
    pub fn creates(&self) -> bool {
        self.create
    }

    /// Fail if the file already exists.
    pub fn exclusive(&self) -> bool {
        self.excl
    }

    /// Discard existing contents on open.
    pub fn truncates(&self) -> bool {
        self.truncate
    }

    /// Writes land at end of file regardless of position.
    pub fn appends(&self) -> bool {
        self.append
    }
}

impl TryFrom<&str> for OpenFlags {
    type Error = EfsError;

    fn try_from(flags: &str) -> Result<Self, EfsError> {
        let (read, write, create, excl, truncate, append) = match flags {
            "r" => (true, false, false, false, false, false),
            "r+" => (true, true, false, false, false, false),
            "w" => (false, true, true, false, true, false),
            "w+" => (true, true, true, false, true, false),
            "wx" => (false, true, true, true, true, false),
            "wx+" | "w+x" => (true, true, true, true, true, false),
            "a" => (false, true, true, false, false, true),
            "a+" => (true, true, true, false, false, true),
            _ => {
                return Err(EfsError::invalid_argument(
                    "open",
                    format!("unknown flags string {flags:?}"),
                ));
            }
        };
        Ok(Self {
            read,
            write,
            create,
            excl,
            truncate,
            append,
        })
    }
}

impl TryFrom<u32> for OpenFlags {
    type Error = EfsError;

    fn try_from(bits: u32) -> Result<Self, EfsError> {
        use consts::*;

        let (read, write) = match bits & O_ACCMODE {
            O_RDONLY => (true, false),
            O_WRONLY => (false, true),
            O_RDWR => (true, true),
            _ => {
                return Err(EfsError::invalid_argument(
                    "open",
                    format!("invalid access mode in flags {bits:#o}"),
                ));
            }
        };
        Ok(Self {
            read,
            write,
            create: bits & O_CREAT != 0,
            excl: bits & O_EXCL != 0,
            truncate: bits & O_TRUNC != 0,
            append: bits & O_APPEND != 0,
        })
    }
}
