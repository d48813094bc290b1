//! Upload assembler: completeness gate, ordered merge, optional sealing.
//!
//! Finalize holds the session lock exclusively from the completeness check
//! until staging is removed, so no chunk can change underneath the merge and
//! two finalizes of one session cannot interleave. The merged stream is
//! written to a temp file beside the destination and renamed into place only
//! after it has been fully written and, when requested, its hash verified.

use sealdrop_crypto::{encrypt_stream, DerivedKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{UploadError, UploadResult};
use crate::hasher::digest_eq;
use crate::session::{SessionId, SessionRegistry, SessionState};
use crate::staging::{ChunkChain, StagingArea};

/// A finished upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedUpload {
    pub session_id: String,
    pub path: PathBuf,
    /// Bytes of merged plaintext (the container is larger when `sealed`)
    pub size: u64,
    /// Lowercase hex SHA-256 of the merged plaintext
    pub sha256: String,
    pub sealed: bool,
}

enum Output {
    Plain,
    Sealed(DerivedKey),
}

#[derive(Clone)]
pub struct UploadAssembler {
    staging: Arc<StagingArea>,
    sessions: Arc<SessionRegistry>,
    storage_dir: PathBuf,
}

impl UploadAssembler {
    pub fn new(
        staging: Arc<StagingArea>,
        sessions: Arc<SessionRegistry>,
        storage_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            staging,
            sessions,
            storage_dir: storage_dir.into(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Merge chunks `0..total` into a new plaintext file under the storage dir.
    ///
    /// Fails with `IncompleteUpload` (changing nothing) if any index is missing,
    /// and with `TotalMismatch` if the session staged or declared a different
    /// number of chunks.
    pub async fn finalize(&self, session_id: &str, total: u32) -> UploadResult<MergedUpload> {
        self.assemble(session_id, total, None, Output::Plain, None).await
    }

    /// `finalize`, but the merged plaintext must hash to `expected_sha256`.
    ///
    /// On mismatch nothing is persisted and the staged chunks are kept, so the
    /// client can resend the offending chunks and finalize again.
    pub async fn finalize_verified(
        &self,
        session_id: &str,
        total: u32,
        expected_sha256: &str,
    ) -> UploadResult<MergedUpload> {
        self.assemble(session_id, total, None, Output::Plain, Some(expected_sha256))
            .await
    }

    /// Merge chunks `0..total` straight into a sealed container at `dest`.
    ///
    /// Plaintext only ever exists as staged chunks; the merged stream goes
    /// directly through the container codec.
    pub async fn finalize_encrypted(
        &self,
        session_id: &str,
        total: u32,
        dest: &Path,
        key: &DerivedKey,
        expected_sha256: Option<&str>,
    ) -> UploadResult<MergedUpload> {
        self.assemble(
            session_id,
            total,
            Some(dest.to_path_buf()),
            Output::Sealed(key.clone()),
            expected_sha256,
        )
        .await
    }

    async fn assemble(
        &self,
        session_id: &str,
        total: u32,
        dest: Option<PathBuf>,
        output: Output,
        expected_sha256: Option<&str>,
    ) -> UploadResult<MergedUpload> {
        let id = SessionId::parse(session_id)?;
        if total == 0 {
            return Err(UploadError::InvalidChunkCount(total));
        }

        let lock = self.sessions.lock_for(&id);
        let _exclusive = lock.write().await;

        match self.sessions.terminal_state(&id) {
            Some(SessionState::Finalized) => {
                return Err(UploadError::AlreadyFinalized(id.to_string()))
            }
            Some(_) => return Err(UploadError::Expired(id.to_string())),
            None => {}
        }

        let staged = self.staging.indices(&id).await?;
        let beyond = staged.last().copied().filter(|&last| last >= total);
        let mismatch = self
            .sessions
            .declared_total(&id)
            .filter(|&declared| declared != total)
            .or(beyond.map(|last| last + 1));
        if let Some(declared) = mismatch {
            warn!(session = %id, declared, got = total, "finalize total disagrees with session");
            return Err(UploadError::TotalMismatch {
                declared,
                got: total,
            });
        }

        let missing: Vec<u32> = (0..total)
            .filter(|i| staged.binary_search(i).is_err())
            .collect();
        if !missing.is_empty() {
            warn!(
                session = %id,
                total,
                missing = missing.len(),
                "finalize before upload complete"
            );
            return Err(UploadError::IncompleteUpload { total, missing });
        }

        let plaintext_len = self.staging.staged_len(&id, total).await?;
        let dest = dest
            .unwrap_or_else(|| self.storage_dir.join(uuid::Uuid::new_v4().simple().to_string()));
        let sealed = matches!(output, Output::Sealed(_));

        let cancel = CancelOnDrop::new();
        let chain = self.staging.chain(&id, total, cancel.flag());
        let flag = cancel.flag();
        let task_dest = dest.clone();
        let expected = expected_sha256.map(str::to_owned);

        let (written, sha256) = tokio::task::spawn_blocking(move || {
            write_merged(chain, &task_dest, output, plaintext_len, expected.as_deref(), &flag)
        })
        .await
        .map_err(|e| UploadError::Other(anyhow::anyhow!("merge task failed: {e}")))??;
        cancel.disarm();

        if let Err(e) = self.staging.remove_session(&id).await {
            warn!(session = %id, error = %e, "merged, but staging cleanup failed");
        }
        self.sessions.mark_terminal(&id, SessionState::Finalized);

        info!(
            session = %id,
            chunks = total,
            bytes = written,
            sealed,
            path = %dest.display(),
            "upload finalized"
        );

        Ok(MergedUpload {
            session_id: id.to_string(),
            path: dest,
            size: written,
            sha256,
            sealed,
        })
    }
}

/// Merge `chain` into a temp file beside `dest` and persist it.
///
/// Returns plaintext bytes merged and their hex SHA-256. A cancel observed
/// after the rename removes `dest` again; one raised after this returns is
/// not seen, and the caller marks the session finalized as usual.
fn write_merged(
    chain: ChunkChain,
    dest: &Path,
    output: Output,
    plaintext_len: u64,
    expected_sha256: Option<&str>,
    cancelled: &AtomicBool,
) -> UploadResult<(u64, String)> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".sealdrop-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let mut reader = HashingReader::new(BufReader::new(chain));
    let written = {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let n = match &output {
            Output::Plain => io::copy(&mut reader, &mut writer)?,
            Output::Sealed(key) => {
                encrypt_stream(&mut reader, &mut writer, key, plaintext_len)?
            }
        };
        writer.flush()?;
        n
    };

    let actual = reader.finish();
    if let Some(expected) = expected_sha256 {
        if !digest_eq(&actual, expected) {
            return Err(UploadError::ContentHashMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
    }

    tmp.as_file().sync_all()?;
    if cancelled.load(Ordering::SeqCst) {
        return Err(UploadError::Cancelled);
    }
    tmp.persist(dest).map_err(|e| UploadError::Io(e.error))?;
    if cancelled.load(Ordering::SeqCst) {
        if let Err(e) = std::fs::remove_file(dest) {
            warn!(path = %dest.display(), error = %e, "cancelled merge left output behind");
        }
        return Err(UploadError::Cancelled);
    }
    Ok((written, actual))
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Raises the merge's cancel flag if the finalize future is dropped mid-merge.
struct CancelOnDrop {
    flag: Option<Arc<AtomicBool>>,
}

impl CancelOnDrop {
    fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.flag
            .clone()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(true)))
    }

    fn disarm(mut self) {
        self.flag = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}
