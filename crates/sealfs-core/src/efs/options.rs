//! Construction-time options for an [`EncryptedFs`](crate::EncryptedFs).

use crate::crypto::chunk::DEFAULT_BLOCK_SIZE;

/// Smallest accepted block size.
///
/// The metadata record (a u64 size plus a 64-hex-digit key hash) must fit in
/// one block; 128 bytes covers the worst case with headroom.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Options fixed at filesystem construction.
#[derive(Debug, Clone)]
pub struct EfsOptions {
    /// Permission bits masked off newly created inodes.
    pub umask: u32,
    /// Plaintext block size in bytes. Must be at least [`MIN_BLOCK_SIZE`];
    /// a chunk's layout must match the instance reading it.
    pub block_size: usize,
    /// Off-load multi-block crypto to the worker pool.
    pub use_workers: bool,
    /// Worker pool thread count.
    pub worker_pool_size: usize,
    /// Mirror plaintext into the in-memory cache store for faster repeated
    /// reads. Disabling only skips the mirroring; correctness is unaffected.
    pub use_cache: bool,
}

impl Default for EfsOptions {
    fn default() -> Self {
        Self {
            umask: 0o022,
            block_size: DEFAULT_BLOCK_SIZE,
            use_workers: false,
            worker_pool_size: default_pool_size(),
            use_cache: true,
        }
    }
}

/// Default crypto pool size: `min(cpu_count, 4)`.
fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .min(4)
}
