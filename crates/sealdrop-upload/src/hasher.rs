//! SHA-256 chunk hashing on a dedicated thread pool.
//!
//! Hashing is CPU-bound; running it on the async runtime would stall other
//! sessions' I/O. The pool is injected so tests and embedders control its size.

use rayon::{ThreadPool, ThreadPoolBuilder};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{UploadError, UploadResult};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Case-insensitive comparison of two hex digests.
pub fn digest_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b)
}

pub struct HashPool {
    pool: ThreadPool,
}

impl HashPool {
    /// Build a pool with `workers` threads (0 = one per CPU).
    pub fn new(workers: usize) -> UploadResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("sealdrop-hash-{i}"))
            .build()
            .map_err(|e| UploadError::Other(anyhow::anyhow!("building hash pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Hash `data` on the pool and await the hex digest.
    pub async fn sha256(&self, data: Arc<Vec<u8>>) -> UploadResult<String> {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(sha256_hex(&data));
        });
        rx.await
            .map_err(|_| UploadError::Other(anyhow::anyhow!("hash worker dropped its result")))
    }
}

impl std::fmt::Debug for HashPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashPool")
            .field("workers", &self.workers())
            .finish()
    }
}
