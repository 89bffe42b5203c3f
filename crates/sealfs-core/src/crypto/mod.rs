//! Cryptographic primitives for the chunk store.

pub mod chunk;
pub mod keys;
pub mod workers;

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
///
/// Some errors indicate potential **adversarial tampering** of the encrypted
/// backing store. These should be treated as security events and are marked
/// with `[INTEGRITY VIOLATION]`. The remainder are programming errors
/// (invalid buffer lengths) or infrastructure failures (worker pool).
#[derive(Error, Debug)]
pub enum CryptoError {
    /// A chunk's AES-GCM authentication tag did not verify.
    ///
    /// **[INTEGRITY VIOLATION]** The chunk's ciphertext has been tampered
    /// with or corrupted, or the wrong master key is in use. The chunk must
    /// not be trusted and the enclosing operation must abort.
    #[error("[INTEGRITY VIOLATION] chunk authentication failed - ciphertext tampered or wrong key")]
    ChunkAuthentication,

    /// A plaintext block had the wrong length for encryption.
    ///
    /// Blocks are fixed-size; the block engine pads partial boundary blocks
    /// before sealing them.
    #[error("block length mismatch: expected {expected} bytes, got {actual}")]
    BlockLength { expected: usize, actual: usize },

    /// An encrypted chunk had the wrong length for decryption.
    #[error("chunk length mismatch: expected {expected} bytes, got {actual}")]
    ChunkLength { expected: usize, actual: usize },

    /// AES-GCM encryption failed unexpectedly.
    #[error("chunk encryption failed: {0}")]
    Encryption(String),

    /// The crypto worker pool could not be built or dropped a job.
    #[error("crypto worker pool failure: {0}")]
    Pool(String),
}

// Re-export commonly used types
pub use chunk::{ChunkLayout, open_chunk, seal_block};
pub use keys::MasterKey;
pub use workers::{ChunkCodec, CryptoPool};
