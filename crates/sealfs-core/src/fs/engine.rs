//! The block engine: plaintext ranges in, whole chunks out.
//!
//! Reads and writes arrive as arbitrary `(position, length)` plaintext
//! ranges; the engine maps them onto whole blocks, runs the read-modify-write
//! overlay for partial boundary blocks, seals/opens chunks through the codec
//! and persists them to the encrypted store. Plaintext is mirrored
//! write-through into the in-memory cache store; cache failures are demoted
//! to warnings because the encrypted store is authoritative.
//!
//! Operations that write chunks or metadata serialize per inode through the
//! inode's write lock. Reads take no exclusive lock: each chunk is written
//! atomically, so a concurrent reader observes the old or the new chunk of
//! any block, never a torn one.

use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, instrument, trace, warn};

use crate::crypto::chunk::{self, ChunkLayout};
use crate::crypto::workers::ChunkCodec;
use crate::crypto::{CryptoError, MasterKey};
use crate::efs::inodes::{Inode, LockMetrics};
use crate::error::{EfsError, Target};
use crate::fs::geometry::{BlockIter, Geometry};
use crate::fs::meta::FileMetadata;
use crate::fs::store::{BackingStore, MemStore};

/// Chunk-level I/O engine over one encrypted backing store.
pub struct BlockEngine<S: BackingStore> {
    store: Arc<S>,
    cache: Arc<MemStore>,
    codec: ChunkCodec,
    key: Arc<MasterKey>,
    geometry: Geometry,
    metrics: Arc<LockMetrics>,
    mirror: bool,
}

impl<S: BackingStore> BlockEngine<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<MemStore>,
        codec: ChunkCodec,
        key: Arc<MasterKey>,
        geometry: Geometry,
        metrics: Arc<LockMetrics>,
        mirror: bool,
    ) -> Self {
        Self {
            store,
            cache,
            codec,
            key,
            geometry,
            metrics,
            mirror,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn layout(&self) -> ChunkLayout {
        *self.geometry.layout()
    }

    fn block_size(&self) -> usize {
        self.geometry.block_size()
    }

    fn chunk_size(&self) -> u64 {
        self.geometry.chunk_size() as u64
    }

    // -----------------------------------------------------------------------
    // Metadata chunk
    // -----------------------------------------------------------------------

    /// Read, decrypt and verify the metadata chunk of an existing file.
    ///
    /// The canary is checked here, so a wrong master key fails before any
    /// data chunk is touched.
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub async fn load_metadata(&self, enc_fd: u64, path: &Path) -> Result<FileMetadata, EfsError> {
        let enc_size = self
            .store
            .size(enc_fd)
            .await
            .map_err(|e| EfsError::io("stat", Target::Path(path.to_path_buf()), e))?;

        if enc_size == 0 || enc_size % self.chunk_size() != 0 {
            return Err(EfsError::integrity(
                "open",
                Target::Path(path.to_path_buf()),
                format!(
                    "encrypted file size {enc_size} is not a positive multiple of the {} byte chunk size",
                    self.chunk_size()
                ),
            ));
        }

        let meta_offset = enc_size - self.chunk_size();
        let raw = self
            .store
            .read_at(enc_fd, self.chunk_size() as usize, meta_offset)
            .await
            .map_err(|e| EfsError::io("read", Target::Path(path.to_path_buf()), e))?;

        // Metadata is a contention-sensitive single chunk: bypass the pool.
        let block = chunk::open_chunk(&self.key, &self.layout(), &raw).map_err(|e| {
            crypto_error("open", Target::Path(path.to_path_buf()), e)
        })?;

        let meta = FileMetadata::parse(&block).map_err(|e| {
            EfsError::integrity(
                "open",
                Target::Path(path.to_path_buf()),
                format!("metadata chunk did not parse: {e}"),
            )
        })?;

        if !self.key.verify_fingerprint(&meta.key_hash) {
            warn!(path = %path.display(), "Metadata canary mismatch - wrong master key");
            return Err(EfsError::key_mismatch(path));
        }

        debug!(size = meta.size, "Loaded file metadata");
        Ok(meta)
    }

    /// Initialize metadata for a fresh (or truncated-on-open) file.
    ///
    /// Writes `{size: 0}` as the only chunk and drops any stale tail.
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub async fn init_metadata(
        &self,
        enc_fd: u64,
        plain_fd: u64,
        path: &Path,
    ) -> Result<FileMetadata, EfsError> {
        let meta = FileMetadata::new(0, self.key.fingerprint());
        self.write_metadata(enc_fd, &meta, 0, path).await?;
        self.store
            .set_len(enc_fd, self.chunk_size())
            .await
            .map_err(|e| EfsError::io("ftruncate", Target::Path(path.to_path_buf()), e))?;

        if let Err(e) = self.cache.set_len(plain_fd, 0).await {
            warn!(error = %e, "Plaintext cache truncate failed (ignored)");
        }
        Ok(meta)
    }

    /// Seal and persist the metadata chunk after the last data chunk.
    async fn write_metadata(
        &self,
        enc_fd: u64,
        meta: &FileMetadata,
        data_chunks: u64,
        path: &Path,
    ) -> Result<(), EfsError> {
        let block = meta.encode(self.block_size()).map_err(|e| {
            EfsError::invalid_argument("write", format!("metadata record rejected: {e}"))
        })?;
        let sealed = chunk::seal_block(&self.key, &self.layout(), &block)
            .map_err(|e| crypto_error("write", Target::Path(path.to_path_buf()), e))?;

        self.store
            .write_at(enc_fd, sealed, self.geometry.chunk_to_offset(data_chunks))
            .await
            .map_err(|e| EfsError::io("write", Target::Path(path.to_path_buf()), e))?;
        trace!(data_chunks, size = meta.size, "Wrote metadata chunk");
        Ok(())
    }

    /// Number of data chunks currently persisted (excludes the metadata
    /// chunk). The encrypted file length must be a positive multiple of the
    /// chunk size.
    async fn data_chunks_on_disk(&self, enc_fd: u64, path: &Path) -> Result<u64, EfsError> {
        let enc_size = self
            .store
            .size(enc_fd)
            .await
            .map_err(|e| EfsError::io("stat", Target::Path(path.to_path_buf()), e))?;
        if enc_size == 0 || enc_size % self.chunk_size() != 0 {
            return Err(EfsError::integrity(
                "stat",
                Target::Path(path.to_path_buf()),
                format!("encrypted file size {enc_size} is corrupt"),
            ));
        }
        Ok(enc_size / self.chunk_size() - 1)
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Read up to `length` bytes at plaintext `position` into
    /// `buf[offset..]`, clamped so reads never cross the file size.
    #[instrument(level = "debug", skip(self, buf, inode), fields(path = %inode.path().display(), length, position))]
    pub async fn read(
        &self,
        enc_fd: u64,
        plain_fd: u64,
        inode: &Inode,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize, EfsError> {
        check_buffer_range("read", buf.len(), offset, length)?;

        let meta = inode.meta();
        if position >= meta.size || length == 0 {
            return Ok(0);
        }
        let length = length.min((meta.size - position) as usize);

        let (first, n_blocks) = self.geometry.block_span(position, length);
        let boundary = self.geometry.boundary_offset(position);
        let path = inode.path();
        let on_disk = self.data_chunks_on_disk(enc_fd, path).await?;

        trace!(first, n_blocks, "Reading chunk span");

        // Fetch the raw chunks; chunks past the persisted tail read as
        // virtual zero blocks (truncate-extended regions).
        let mut raw_chunks = Vec::with_capacity(n_blocks as usize);
        for k in first..first + n_blocks {
            if k >= on_disk {
                raw_chunks.push(None);
                continue;
            }
            let raw = self
                .store
                .read_at(
                    enc_fd,
                    self.chunk_size() as usize,
                    self.geometry.chunk_to_offset(k),
                )
                .await
                .map_err(|e| EfsError::io("read", Target::Path(path.to_path_buf()), e))?;
            if raw.len() != self.chunk_size() as usize {
                return Err(EfsError::integrity(
                    "read",
                    Target::Path(path.to_path_buf()),
                    format!("chunk {k} truncated: {} of {} bytes", raw.len(), self.chunk_size()),
                ));
            }
            raw_chunks.push(Some(raw));
        }

        // Decrypt. Multi-block spans go through the codec (and so the worker
        // pool, when enabled); a single block stays inline.
        let mut plain = Vec::with_capacity(n_blocks as usize * self.block_size());
        if n_blocks == 1 {
            match raw_chunks.pop().flatten() {
                Some(raw) => plain.extend_from_slice(
                    &chunk::open_chunk(&self.key, &self.layout(), &raw)
                        .map_err(|e| crypto_error("read", Target::Path(path.to_path_buf()), e))?,
                ),
                None => plain.resize(self.block_size(), 0),
            }
        } else {
            let opened = try_join_all(raw_chunks.into_iter().map(|raw| {
                let layout = self.layout();
                async move {
                    match raw {
                        Some(raw) => self.codec.open(&self.key, layout, raw).await,
                        None => Ok(vec![0u8; layout.block_size()]),
                    }
                }
            }))
            .await
            .map_err(|e| crypto_error("read", Target::Path(path.to_path_buf()), e))?;
            for block in opened {
                plain.extend_from_slice(&block);
            }
        }

        buf[offset..offset + length].copy_from_slice(&plain[boundary..boundary + length]);

        // Opportunistically mirror the decrypted blocks for later reads,
        // trimmed to the file size so the cache never claims bytes past it.
        if self.mirror {
            let block_start = self.geometry.block_to_offset(first);
            let usable = ((meta.size - block_start) as usize).min(plain.len());
            plain.truncate(usable);
            if let Err(e) = self.cache.write_at(plain_fd, plain, block_start).await {
                warn!(error = %e, "Plaintext cache mirror failed (ignored)");
            }
        }

        Ok(length)
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    /// Write `buf[offset..offset + length]` at plaintext `position`
    /// (or at end of file when `append`), returning the bytes written.
    #[instrument(level = "debug", skip(self, buf, inode), fields(path = %inode.path().display(), length, position))]
    pub async fn write(
        &self,
        enc_fd: u64,
        plain_fd: u64,
        inode: &Inode,
        buf: &[u8],
        offset: usize,
        length: usize,
        position: u64,
        append: bool,
    ) -> Result<usize, EfsError> {
        check_buffer_range("write", buf.len(), offset, length)?;
        if length == 0 {
            return Ok(0);
        }

        let _guard = inode.lock_write(&self.metrics).await;

        let meta = inode.meta();
        let position = if append { meta.size } else { position };
        let new_end = position
            .checked_add(length as u64)
            .ok_or_else(|| EfsError::invalid_argument("write", "position + length overflows"))?;

        let path = inode.path();
        let block_size = self.block_size();
        let (first, n_blocks) = self.geometry.block_span(position, length);
        let boundary = self.geometry.boundary_offset(position);
        let on_disk = self.data_chunks_on_disk(enc_fd, path).await?;

        trace!(first, n_blocks, boundary, "Writing chunk span");

        // Sparse write past the persisted tail: materialize encrypted zero
        // blocks for the hole so every chunk of the file stays decryptable.
        if first > on_disk {
            self.fill_zero_chunks(enc_fd, on_disk, first, path).await?;
        }

        // Assemble the plaintext blocks: a possibly-partial first block, any
        // aligned middle blocks, and a possibly-partial last block.
        let data = &buf[offset..offset + length];
        let first_len = (block_size - boundary).min(length);
        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(n_blocks as usize);

        blocks.push(
            self.overlay_segment(enc_fd, on_disk, first, &data[..first_len], boundary, path)
                .await?,
        );

        if n_blocks >= 2 {
            let last_len = boundary + length - (n_blocks as usize - 1) * block_size;
            let middle = &data[first_len..length - last_len];
            for aligned in BlockIter::new(middle, block_size) {
                // Aligned full-block overlays are the block.
                blocks.push(aligned.to_vec());
            }
            let last_block = first + n_blocks - 1;
            blocks.push(
                self.overlay_segment(
                    enc_fd,
                    on_disk,
                    last_block,
                    &data[length - last_len..],
                    0,
                    path,
                )
                .await?,
            );
        }

        // Mirror the plaintext span write-through before touching the
        // encrypted store; the cache is advisory, so failures only warn.
        if self.mirror {
            let mut span = Vec::with_capacity(blocks.len() * block_size);
            for block in &blocks {
                span.extend_from_slice(block);
            }
            if let Err(e) = self
                .cache
                .write_at(plain_fd, span, self.geometry.block_to_offset(first))
                .await
            {
                warn!(error = %e, "Plaintext cache write failed (ignored)");
            }
        }

        // Seal: single blocks inline, multi-block spans through the codec.
        let sealed: Vec<Vec<u8>> = if blocks.len() == 1 {
            vec![
                chunk::seal_block(&self.key, &self.layout(), &blocks[0])
                    .map_err(|e| crypto_error("write", Target::Path(path.to_path_buf()), e))?,
            ]
        } else {
            try_join_all(
                blocks
                    .into_iter()
                    .map(|block| self.codec.seal(&self.key, self.layout(), block)),
            )
            .await
            .map_err(|e| crypto_error("write", Target::Path(path.to_path_buf()), e))?
        };

        let mut span = Vec::with_capacity(sealed.len() * self.chunk_size() as usize);
        for chunk_bytes in &sealed {
            span.extend_from_slice(chunk_bytes);
        }
        self.store
            .write_at(enc_fd, span, self.geometry.chunk_to_offset(first))
            .await
            .map_err(|e| EfsError::io("write", Target::Path(path.to_path_buf()), e))?;

        // Metadata last: a cancellation before this point leaves valid
        // chunks past `size`, which later reads simply ignore.
        if new_end > meta.size {
            let data_chunks = on_disk.max(first + n_blocks);
            let updated = FileMetadata::new(new_end, meta.key_hash);
            self.write_metadata(enc_fd, &updated, data_chunks, path).await?;
            inode.set_meta(updated);
        } else if on_disk != self.geometry.block_count(meta.size) {
            // An earlier write was interrupted between persisting chunks and
            // updating metadata, leaving orphan chunks at the tail. Drop
            // them and put the metadata chunk back where readers expect it.
            let data_chunks = self.geometry.block_count(meta.size);
            self.store
                .set_len(enc_fd, (data_chunks + 1) * self.chunk_size())
                .await
                .map_err(|e| EfsError::io("ftruncate", Target::Path(path.to_path_buf()), e))?;
            self.write_metadata(enc_fd, &meta, data_chunks, path).await?;
        }

        debug!(written = length, new_end, "Write complete");
        Ok(length)
    }

    /// Produce the new plaintext for one block by splicing `overlay` into it
    /// at `splice_at`.
    ///
    /// An aligned overlay of exactly one block *is* the new block; anything
    /// else reads the existing block (a zero block when it was never
    /// written) and preserves the bytes around the overlay.
    async fn overlay_segment(
        &self,
        enc_fd: u64,
        on_disk: u64,
        block_index: u64,
        overlay: &[u8],
        splice_at: usize,
        path: &Path,
    ) -> Result<Vec<u8>, EfsError> {
        let block_size = self.block_size();
        if splice_at + overlay.len() > block_size {
            return Err(EfsError::invalid_argument(
                "write",
                format!(
                    "overlay of {} bytes at block offset {splice_at} spills past the {block_size}-byte block",
                    overlay.len()
                ),
            ));
        }

        if splice_at == 0 && overlay.len() == block_size {
            return Ok(overlay.to_vec());
        }

        let mut block = if block_index >= on_disk {
            vec![0u8; block_size]
        } else {
            let raw = self
                .store
                .read_at(
                    enc_fd,
                    self.chunk_size() as usize,
                    self.geometry.chunk_to_offset(block_index),
                )
                .await
                .map_err(|e| EfsError::io("read", Target::Path(path.to_path_buf()), e))?;
            if raw.len() != self.chunk_size() as usize {
                return Err(EfsError::integrity(
                    "read",
                    Target::Path(path.to_path_buf()),
                    format!("chunk {block_index} truncated during overlay"),
                ));
            }
            chunk::open_chunk(&self.key, &self.layout(), &raw)
                .map_err(|e| crypto_error("read", Target::Path(path.to_path_buf()), e))?
        };

        block[splice_at..splice_at + overlay.len()].copy_from_slice(overlay);
        Ok(block)
    }

    /// Seal zero blocks for chunk indices `[from, to)`.
    async fn fill_zero_chunks(
        &self,
        enc_fd: u64,
        from: u64,
        to: u64,
        path: &Path,
    ) -> Result<(), EfsError> {
        debug!(from, to, "Materializing zero chunks");
        let count = (to - from) as usize;
        let sealed: Vec<Vec<u8>> = if count == 1 {
            vec![
                chunk::seal_block(&self.key, &self.layout(), &vec![0u8; self.block_size()])
                    .map_err(|e| crypto_error("write", Target::Path(path.to_path_buf()), e))?,
            ]
        } else {
            try_join_all((0..count).map(|_| {
                self.codec
                    .seal(&self.key, self.layout(), vec![0u8; self.block_size()])
            }))
            .await
            .map_err(|e| crypto_error("write", Target::Path(path.to_path_buf()), e))?
        };

        let mut span = Vec::with_capacity(count * self.chunk_size() as usize);
        for chunk_bytes in &sealed {
            span.extend_from_slice(chunk_bytes);
        }
        self.store
            .write_at(enc_fd, span, self.geometry.chunk_to_offset(from))
            .await
            .map_err(|e| EfsError::io("write", Target::Path(path.to_path_buf()), e))
    }

    // -----------------------------------------------------------------------
    // Truncate / allocate
    // -----------------------------------------------------------------------

    /// Set the plaintext length to `len`.
    ///
    /// Shrinking drops now-unused chunks and relocates the metadata chunk;
    /// extension materializes zero blocks so every block through `len`
    /// remains decryptable.
    #[instrument(level = "debug", skip(self, inode), fields(path = %inode.path().display(), len))]
    pub async fn truncate(
        &self,
        enc_fd: u64,
        plain_fd: u64,
        inode: &Inode,
        len: u64,
    ) -> Result<(), EfsError> {
        let _guard = inode.lock_write(&self.metrics).await;

        let meta = inode.meta();
        if len == meta.size {
            return Ok(());
        }

        let path = inode.path();
        let new_chunks = self.geometry.block_count(len);
        let on_disk = self.data_chunks_on_disk(enc_fd, path).await?;

        let data_chunks = if len < meta.size {
            if new_chunks < on_disk {
                self.store
                    .set_len(enc_fd, (new_chunks + 1) * self.chunk_size())
                    .await
                    .map_err(|e| EfsError::io("ftruncate", Target::Path(path.to_path_buf()), e))?;
            }
            new_chunks
        } else {
            if new_chunks > on_disk {
                self.fill_zero_chunks(enc_fd, on_disk, new_chunks, path).await?;
            }
            // Chunks persisted past `size` by an interrupted write stay put;
            // the metadata chunk must land after the last of them.
            new_chunks.max(on_disk)
        };

        let updated = FileMetadata::new(len, meta.key_hash);
        self.write_metadata(enc_fd, &updated, data_chunks, path).await?;
        inode.set_meta(updated);

        if let Err(e) = self.cache.set_len(plain_fd, len).await {
            warn!(error = %e, "Plaintext cache truncate failed (ignored)");
        }
        Ok(())
    }

    /// Ensure `[offset, offset + len)` is backed by decryptable chunks and
    /// grow the size to cover it. Never shrinks.
    #[instrument(level = "debug", skip(self, inode), fields(path = %inode.path().display(), offset, len))]
    pub async fn fallocate(
        &self,
        enc_fd: u64,
        plain_fd: u64,
        inode: &Inode,
        offset: u64,
        len: u64,
    ) -> Result<(), EfsError> {
        if len == 0 {
            return Err(EfsError::invalid_argument("fallocate", "length must be positive"));
        }
        let target = offset
            .checked_add(len)
            .ok_or_else(|| EfsError::invalid_argument("fallocate", "offset + length overflows"))?;

        let _guard = inode.lock_write(&self.metrics).await;

        let meta = inode.meta();
        if target <= meta.size {
            return Ok(());
        }

        let path = inode.path();
        let new_chunks = self.geometry.block_count(target);
        let on_disk = self.data_chunks_on_disk(enc_fd, path).await?;
        if new_chunks > on_disk {
            self.fill_zero_chunks(enc_fd, on_disk, new_chunks, path).await?;
        }

        let updated = FileMetadata::new(target, meta.key_hash);
        self.write_metadata(enc_fd, &updated, new_chunks.max(on_disk), path)
            .await?;
        inode.set_meta(updated);

        if let Err(e) = self.cache.set_len(plain_fd, target).await {
            warn!(error = %e, "Plaintext cache extend failed (ignored)");
        }
        Ok(())
    }
}

/// Synchronous argument validation shared by read and write: the
/// `(offset, length)` window must lie inside the caller's buffer.
fn check_buffer_range(
    syscall: &'static str,
    buf_len: usize,
    offset: usize,
    length: usize,
) -> Result<(), EfsError> {
    match offset.checked_add(length) {
        Some(end) if end <= buf_len => Ok(()),
        _ => Err(EfsError::invalid_argument(
            syscall,
            format!("buffer window {offset}+{length} exceeds buffer of {buf_len} bytes"),
        )),
    }
}

fn crypto_error(syscall: &'static str, target: Target, e: CryptoError) -> EfsError {
    match e {
        CryptoError::ChunkAuthentication
        | CryptoError::BlockLength { .. }
        | CryptoError::ChunkLength { .. } => EfsError::integrity(syscall, target, e.to_string()),
        CryptoError::Encryption(_) | CryptoError::Pool(_) => {
            EfsError::io(syscall, target, std::io::Error::other(e.to_string()))
        }
    }
}
