//! sealdrop-upload: resumable chunked uploads
//!
//! Pipeline: `submit_chunk` × N (any order, retries allowed) → `finalize` →
//! chunks concatenated in index order → plaintext file or sealed container.
//!
//! Staging layout on disk:
//! ```text
//! <staging_root>/<session_id>/chunk_0
//!                            /chunk_1
//!                            ...
//! ```
//!
//! - `receiver`: per-chunk SHA-256 verification and staging
//! - `assembler`: completeness gate, ordered merge, whole-stream hash, sealing
//! - `session`: session ids, lifecycle state, per-session locks
//! - `hasher`: dedicated hashing thread pool

pub mod assembler;
pub mod error;
pub mod hasher;
pub mod receiver;
pub mod session;
pub mod staging;

pub use assembler::{MergedUpload, UploadAssembler};
pub use error::{UploadError, UploadResult};
pub use hasher::{sha256_hex, HashPool};
pub use receiver::{ChunkReceiver, RejectReason, SubmitOutcome};
pub use session::{SessionId, SessionRegistry, SessionState};
pub use staging::StagingArea;

use std::path::PathBuf;
use std::sync::Arc;

/// A receiver and assembler sharing one staging area, session registry and
/// hash pool.
#[derive(Clone)]
pub struct UploadPipeline {
    receiver: ChunkReceiver,
    assembler: UploadAssembler,
}

impl UploadPipeline {
    pub fn new(
        staging_root: impl Into<PathBuf>,
        storage_dir: impl Into<PathBuf>,
        hash_workers: usize,
    ) -> UploadResult<Self> {
        let staging = Arc::new(StagingArea::new(staging_root));
        let sessions = Arc::new(SessionRegistry::default());
        let hash_pool = Arc::new(HashPool::new(hash_workers)?);

        Ok(Self {
            receiver: ChunkReceiver::new(staging.clone(), sessions.clone(), hash_pool),
            assembler: UploadAssembler::new(staging, sessions, storage_dir),
        })
    }

    pub fn from_config(config: &sealdrop_core::SealdropConfig) -> UploadResult<Self> {
        Self::new(
            config.storage.staging_dir.clone(),
            config.storage.storage_dir.clone(),
            config.upload.hash_workers,
        )
    }

    pub fn receiver(&self) -> &ChunkReceiver {
        &self.receiver
    }

    pub fn assembler(&self) -> &UploadAssembler {
        &self.assembler
    }
}
