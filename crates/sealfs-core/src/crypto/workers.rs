//! Worker-pool offload for the chunk codec.
//!
//! PBKDF2 key derivation dominates the cost of sealing or opening a chunk,
//! so multi-block operations can be spread across a dedicated thread pool
//! instead of stalling the async executor. Jobs are single-block closures;
//! completion order across concurrent submitters is unordered. Contention
//! sensitive paths (the metadata chunk, single-block writes) bypass the pool
//! and run the codec inline.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;
use tracing::debug;

use super::chunk::{self, ChunkLayout};
use super::keys::MasterKey;
use super::CryptoError;

/// A rayon-backed pool running single-block seal/open jobs.
pub struct CryptoPool {
    pool: ThreadPool,
}

impl CryptoPool {
    /// Build a pool with the given number of worker threads.
    pub fn new(threads: usize) -> Result<Self, CryptoError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("sealfs-crypto-{i}"))
            .build()
            .map_err(|e| CryptoError::Pool(e.to_string()))?;
        debug!(threads = threads.max(1), "Crypto worker pool started");
        Ok(Self { pool })
    }

    /// Seal one block on the pool.
    pub async fn seal_block(
        &self,
        key: &Arc<MasterKey>,
        layout: ChunkLayout,
        block: Vec<u8>,
    ) -> Result<Vec<u8>, CryptoError> {
        let (tx, rx) = oneshot::channel();
        let key = Arc::clone(key);
        self.pool.spawn(move || {
            let _ = tx.send(chunk::seal_block(&key, &layout, &block));
        });
        rx.await
            .map_err(|_| CryptoError::Pool("worker dropped seal result".to_string()))?
    }

    /// Open one chunk on the pool.
    pub async fn open_chunk(
        &self,
        key: &Arc<MasterKey>,
        layout: ChunkLayout,
        chunk: Vec<u8>,
    ) -> Result<Vec<u8>, CryptoError> {
        let (tx, rx) = oneshot::channel();
        let key = Arc::clone(key);
        self.pool.spawn(move || {
            let _ = tx.send(chunk::open_chunk(&key, &layout, &chunk));
        });
        rx.await
            .map_err(|_| CryptoError::Pool("worker dropped open result".to_string()))?
    }
}

impl std::fmt::Debug for CryptoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoPool")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

/// Codec dispatch: run the chunk codec inline or on the worker pool.
///
/// The block engine holds one of these per filesystem instance. Callers on
/// small paths invoke the inline functions in [`chunk`] directly.
#[derive(Debug)]
pub enum ChunkCodec {
    /// Run seal/open on the calling task.
    Inline,
    /// Off-load seal/open to a [`CryptoPool`].
    Pooled(CryptoPool),
}

impl ChunkCodec {
    /// Seal one block, dispatching per codec mode.
    pub async fn seal(
        &self,
        key: &Arc<MasterKey>,
        layout: ChunkLayout,
        block: Vec<u8>,
    ) -> Result<Vec<u8>, CryptoError> {
        match self {
            ChunkCodec::Inline => chunk::seal_block(key, &layout, &block),
            ChunkCodec::Pooled(pool) => pool.seal_block(key, layout, block).await,
        }
    }

    /// Open one chunk, dispatching per codec mode.
    pub async fn open(
        &self,
        key: &Arc<MasterKey>,
        layout: ChunkLayout,
        chunk_bytes: Vec<u8>,
    ) -> Result<Vec<u8>, CryptoError> {
        match self {
            ChunkCodec::Inline => chunk::open_chunk(key, &layout, &chunk_bytes),
            ChunkCodec::Pooled(pool) => pool.open_chunk(key, layout, chunk_bytes).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pooled_round_trip() {
        let key = Arc::new(MasterKey::new("pool key"));
        let layout = ChunkLayout::new(256);
        let pool = CryptoPool::new(2).expect("pool");

        let block = vec![0x77u8; 256];
        let chunk = pool
            .seal_block(&key, layout, block.clone())
            .await
            .expect("seal");
        let opened = pool.open_chunk(&key, layout, chunk).await.expect("open");
        assert_eq!(opened, block);
    }

    #[tokio::test]
    async fn concurrent_submissions_from_many_tasks() {
        let key = Arc::new(MasterKey::new("busy pool"));
        let layout = ChunkLayout::new(128);
        let pool = Arc::new(CryptoPool::new(2).expect("pool"));

        let mut joins = Vec::new();
        for i in 0..16u8 {
            let key = Arc::clone(&key);
            let pool = Arc::clone(&pool);
            joins.push(tokio::spawn(async move {
                let block = vec![i; 128];
                let chunk = pool.seal_block(&key, layout, block.clone()).await?;
                let opened = pool.open_chunk(&key, layout, chunk).await?;
                assert_eq!(opened, block);
                Ok::<_, CryptoError>(())
            }));
        }
        for join in joins {
            join.await.expect("task").expect("round trip");
        }
    }

    #[tokio::test]
    async fn inline_and_pooled_interoperate() {
        let key = Arc::new(MasterKey::new("either way"));
        let layout = ChunkLayout::new(64);

        let inline = ChunkCodec::Inline;
        let pooled = ChunkCodec::Pooled(CryptoPool::new(1).expect("pool"));

        let block = vec![0x10u8; 64];
        let chunk = inline.seal(&key, layout, block.clone()).await.expect("seal");
        let opened = pooled.open(&key, layout, chunk).await.expect("open");
        assert_eq!(opened, block);
    }
}
