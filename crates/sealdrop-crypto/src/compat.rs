//! Format detection and legacy → current upgrades.
//!
//! Detection looks only at leading bytes. Decoding dispatches on the detected
//! `FormatKind`; the V0 decoder is kept isolated in `legacy`.

use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::{CryptoError, CryptoResult};
use crate::file::{encrypt_bytes, write_atomically};
use crate::header::read_full;
use crate::kdf::DerivedKey;
use crate::legacy::LEGACY_MARKER;
use crate::stream::encrypt_stream;
use crate::{FORMAT_VERSION, MAGIC};

/// Suffix of the staged replacement written by `upgrade_in_place`
pub const UPGRADE_SUFFIX: &str = "upgraded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FormatKind {
    /// Current framed ChaCha20-Poly1305 container
    Current,
    /// Deprecated single-seal AES-GCM container
    LegacyV0,
    /// Anything else, including current magic with an unknown version
    Unknown,
}

impl std::fmt::Display for FormatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatKind::Current => write!(f, "current (v{FORMAT_VERSION}, ChaCha20-Poly1305)"),
            FormatKind::LegacyV0 => write!(f, "legacy v0 (AES-256-GCM), needs upgrade"),
            FormatKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a container by its first bytes.
pub fn identify_format(header: &[u8]) -> FormatKind {
    if header.len() > MAGIC.len()
        && header.starts_with(MAGIC)
        && header[MAGIC.len()] == FORMAT_VERSION
    {
        FormatKind::Current
    } else if header.starts_with(LEGACY_MARKER) {
        FormatKind::LegacyV0
    } else {
        FormatKind::Unknown
    }
}

/// Classify a file by reading only its leading bytes.
pub fn identify_file(path: &Path) -> CryptoResult<FormatKind> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CryptoError::NotFound(path.to_path_buf()),
        _ => CryptoError::Io(e),
    })?;
    let mut buf = [0u8; 8];
    let n = read_full(&mut file, &mut buf)?;
    Ok(identify_format(&buf[..n]))
}

/// Re-encrypt a V0 container in the current format.
pub fn upgrade_bytes(old: &[u8], key: &DerivedKey) -> CryptoResult<Vec<u8>> {
    let plaintext = decode_legacy(old, key)?;
    encrypt_bytes(&plaintext, key)
}

/// Write a current-format copy of the V0 container at `input` to `output`.
///
/// `input` is left untouched. Returns the plaintext length.
pub fn upgrade_file(input: &Path, output: &Path, key: &DerivedKey) -> CryptoResult<u64> {
    let mut old = Vec::new();
    File::open(input)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CryptoError::NotFound(input.to_path_buf()),
            _ => CryptoError::Io(e),
        })?
        .read_to_end(&mut old)?;

    let plaintext = decode_legacy(&old, key)?;
    write_atomically(output, |out| {
        encrypt_stream(&mut &plaintext[..], out, key, plaintext.len() as u64)
    })
}

/// Upgrade a V0 container and replace it.
///
/// The new container is staged at `<path>.upgraded`; the original is only
/// replaced once the staged file exists, is non-empty and identifies as the
/// current format.
pub fn upgrade_in_place(path: &Path, key: &DerivedKey) -> CryptoResult<u64> {
    let staged = staged_path(path);

    let n = match upgrade_file(path, &staged, key) {
        Ok(n) => n,
        Err(e) => {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }
    };

    let staged_len = std::fs::metadata(&staged).map(|m| m.len()).unwrap_or(0);
    let kind = identify_file(&staged).unwrap_or(FormatKind::Unknown);
    if staged_len == 0 || kind != FormatKind::Current {
        let _ = std::fs::remove_file(&staged);
        return Err(CryptoError::Format(format!(
            "staged upgrade of {} failed verification ({staged_len} bytes, {kind})",
            path.display()
        )));
    }

    std::fs::rename(&staged, path)?;
    info!(path = %path.display(), bytes = n, "upgraded legacy container");
    Ok(n)
}

/// Outcome counts for a directory upgrade.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpgradeStats {
    pub total: usize,
    pub upgraded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl UpgradeStats {
    fn merge(self, other: Self) -> Self {
        Self {
            total: self.total + other.total,
            upgraded: self.upgraded + other.upgraded,
            failed: self.failed + other.failed,
            skipped: self.skipped + other.skipped,
        }
    }
}

/// Upgrade every V0 container directly inside `dir`.
///
/// Sub-directories are ignored. A failure on one file is counted and logged;
/// it never stops the rest. A missing directory yields zeroed stats.
pub fn batch_upgrade_dir(dir: &Path, key: &DerivedKey) -> UpgradeStats {
    let entries = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "upgrade directory unreadable");
            return UpgradeStats::default();
        }
    };

    let files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().map_or(true, |ext| ext != UPGRADE_SUFFIX))
        .collect();

    let stats = files
        .par_iter()
        .map(|path| upgrade_one(path, key))
        .reduce(UpgradeStats::default, UpgradeStats::merge);

    info!(
        dir = %dir.display(),
        total = stats.total,
        upgraded = stats.upgraded,
        failed = stats.failed,
        skipped = stats.skipped,
        "batch upgrade finished"
    );
    stats
}

fn upgrade_one(path: &Path, key: &DerivedKey) -> UpgradeStats {
    let mut stats = UpgradeStats {
        total: 1,
        ..Default::default()
    };
    match identify_file(path) {
        Ok(FormatKind::LegacyV0) => match upgrade_in_place(path, key) {
            Ok(_) => stats.upgraded = 1,
            Err(e) => {
                error!(path = %path.display(), error = %e, "upgrade failed");
                stats.failed = 1;
            }
        },
        Ok(kind) => {
            info!(path = %path.display(), format = %kind, "skipping");
            stats.skipped = 1;
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot classify");
            stats.failed = 1;
        }
    }
    stats
}

#[allow(deprecated)]
fn decode_legacy(old: &[u8], key: &DerivedKey) -> CryptoResult<Vec<u8>> {
    match identify_format(old) {
        FormatKind::LegacyV0 => crate::legacy::open_v0(old, key),
        FormatKind::Current => Err(CryptoError::Format(
            "container is already in the current format".into(),
        )),
        FormatKind::Unknown => Err(CryptoError::Format("unrecognized container format".into())),
    }
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(UPGRADE_SUFFIX);
    PathBuf::from(name)
}
