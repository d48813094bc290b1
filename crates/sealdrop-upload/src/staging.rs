//! On-disk chunk staging.
//!
//! Each chunk is written to a dot-prefixed part file and renamed to
//! `chunk_<index>`, so a staged chunk is always either absent or complete.
//! Re-staging an index replaces it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use crate::session::SessionId;

const CHUNK_PREFIX: &str = "chunk_";

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn chunk_path(&self, id: &SessionId, index: u32) -> PathBuf {
        self.session_dir(id).join(format!("{CHUNK_PREFIX}{index}"))
    }

    /// Atomically stage `data` as chunk `index` of `id`.
    pub async fn write_chunk(&self, id: &SessionId, index: u32, data: &[u8]) -> io::Result<()> {
        let dir = self.session_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        let part = dir.join(format!(
            ".{CHUNK_PREFIX}{index}.{}.part",
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = tokio::fs::write(&part, data).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&part, self.chunk_path(id, index)).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
        debug!(session = %id, index, bytes = data.len(), "chunk staged");
        Ok(())
    }

    /// Staged chunk indices of `id`, ascending. A missing session dir is empty.
    pub async fn indices(&self, id: &SessionId) -> io::Result<Vec<u32>> {
        let mut rd = match tokio::fs::read_dir(self.session_dir(id)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut indices = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            if let Some(index) = entry.file_name().to_str().and_then(chunk_index) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Total staged bytes of chunks `0..total`.
    pub async fn staged_len(&self, id: &SessionId, total: u32) -> io::Result<u64> {
        let mut len = 0u64;
        for index in 0..total {
            len += tokio::fs::metadata(self.chunk_path(id, index)).await?.len();
        }
        Ok(len)
    }

    /// Remove every staged artifact of `id`, then its directory.
    pub async fn remove_session(&self, id: &SessionId) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.session_dir(id)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Last modification of `id`'s staging directory, `None` if it has none.
    pub async fn modified(&self, id: &SessionId) -> io::Result<Option<SystemTime>> {
        match tokio::fs::metadata(self.session_dir(id)).await {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Session ids with a staging directory, paired with its last modification.
    pub async fn sessions(&self) -> io::Result<Vec<(SessionId, SystemTime)>> {
        let mut rd = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| SessionId::parse(name).ok())
            else {
                continue;
            };
            out.push((id, meta.modified()?));
        }
        Ok(out)
    }

    /// A reader over chunks `0..total` of `id`, concatenated in index order.
    pub fn chain(&self, id: &SessionId, total: u32, cancel: Arc<AtomicBool>) -> ChunkChain {
        ChunkChain {
            pending: (0..total).map(|i| self.chunk_path(id, i)).collect(),
            current: None,
            cancel,
        }
    }
}

/// Index of a staged chunk file name. Only the exact name `chunk_path` would
/// produce counts, so `chunk_007` or `chunk_+7` are ignored.
fn chunk_index(name: &str) -> Option<u32> {
    let index = name.strip_prefix(CHUNK_PREFIX)?.parse::<u32>().ok()?;
    (name == format!("{CHUNK_PREFIX}{index}")).then_some(index)
}

/// Sequential reader over staged chunk files.
///
/// Opens one file at a time. Once `cancel` is set every read fails.
pub struct ChunkChain {
    pending: VecDeque<PathBuf>,
    current: Option<File>,
    cancel: Arc<AtomicBool>,
}

impl Read for ChunkChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(io::Error::other("merge cancelled"));
            }
            let file = match self.current.as_mut() {
                Some(f) => f,
                None => match self.pending.pop_front() {
                    Some(path) => self.current.insert(File::open(path)?),
                    None => return Ok(0),
                },
            };
            match file.read(buf)? {
                0 if !buf.is_empty() => self.current = None,
                n => return Ok(n),
            }
        }
    }
}
