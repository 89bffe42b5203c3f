//! The chunk codec: block ↔ chunk transformation under AES-256-GCM.
//!
//! On disk, every plaintext block is represented by one chunk:
//!
//! ```text
//! [ salt : 64 ][ iv : 16 ][ auth_tag : 16 ][ ciphertext : block_size ]
//! ```
//!
//! Salt and IV are freshly random for every encryption; the AES key is
//! derived from the master key and the chunk's own salt. Two encryptions of
//! the same block therefore never produce the same chunk, and AES-GCM IV
//! uniqueness holds because the (key, IV) pair is fresh per encryption.

use aes::Aes256;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AesGcm, Key, Nonce};
use rand::RngCore;
use tracing::{trace, warn};

use super::CryptoError;
use super::keys::MasterKey;

/// Per-chunk salt length in bytes.
pub const SALT_LEN: usize = 64;

/// AES-GCM IV length in bytes.
pub const IV_LEN: usize = 16;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Fixed per-chunk overhead: salt, IV and tag.
pub const CHUNK_OVERHEAD: usize = SALT_LEN + IV_LEN + TAG_LEN;

/// Default plaintext block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// AES-256-GCM instantiated with the on-disk 16-byte IV.
type ChunkAead = AesGcm<Aes256, U16>;

/// Chunk framing parameters, fixed per filesystem instance.
///
/// Salt, IV and tag widths are compile-time constants; only the block size
/// is configurable, and a chunk's layout must match the instance reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    block_size: usize,
}

impl ChunkLayout {
    /// Create a layout for the given plaintext block size.
    pub fn new(block_size: usize) -> Self {
        debug_assert!(block_size > 0, "block size must be positive");
        Self { block_size }
    }

    /// Plaintext block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// On-disk chunk size in bytes: `block_size + CHUNK_OVERHEAD`.
    pub fn chunk_size(&self) -> usize {
        self.block_size + CHUNK_OVERHEAD
    }
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

/// Encrypt one plaintext block into a chunk.
///
/// Draws a fresh random salt and IV, derives the chunk key from the master
/// key and salt, and emits `salt || iv || tag || ciphertext`.
///
/// # Errors
///
/// [`CryptoError::BlockLength`] if `block` is not exactly one block.
pub fn seal_block(
    key: &MasterKey,
    layout: &ChunkLayout,
    block: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if block.len() != layout.block_size() {
        return Err(CryptoError::BlockLength {
            expected: layout.block_size(),
            actual: block.len(),
        });
    }

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut iv);

    let derived = key.derive_chunk_key(&salt);
    let cipher = ChunkAead::new(Key::<ChunkAead>::from_slice(derived.as_ref()));

    // The aead crate appends the tag to the ciphertext; the on-disk layout
    // stores the tag before the ciphertext.
    let sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), block)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut chunk = Vec::with_capacity(layout.chunk_size());
    chunk.extend_from_slice(&salt);
    chunk.extend_from_slice(&iv);
    chunk.extend_from_slice(tag);
    chunk.extend_from_slice(ciphertext);

    trace!(chunk_size = chunk.len(), "Sealed block");
    Ok(chunk)
}

/// Decrypt one chunk back into a plaintext block.
///
/// Splits the chunk by the fixed widths, derives the chunk key from the
/// embedded salt and verifies the authentication tag.
///
/// # Errors
///
/// - [`CryptoError::ChunkLength`] if `chunk` is not exactly one chunk.
/// - [`CryptoError::ChunkAuthentication`] on tag mismatch.
pub fn open_chunk(
    key: &MasterKey,
    layout: &ChunkLayout,
    chunk: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if chunk.len() != layout.chunk_size() {
        return Err(CryptoError::ChunkLength {
            expected: layout.chunk_size(),
            actual: chunk.len(),
        });
    }

    let salt = &chunk[..SALT_LEN];
    let iv = &chunk[SALT_LEN..SALT_LEN + IV_LEN];
    let tag = &chunk[SALT_LEN + IV_LEN..CHUNK_OVERHEAD];
    let ciphertext = &chunk[CHUNK_OVERHEAD..];

    let derived = key.derive_chunk_key(salt);
    let cipher = ChunkAead::new(Key::<ChunkAead>::from_slice(derived.as_ref()));

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::<U16>::from_slice(iv), sealed.as_ref())
        .map_err(|_| {
            warn!("Chunk decryption failed - authentication tag mismatch");
            CryptoError::ChunkAuthentication
        })
}
