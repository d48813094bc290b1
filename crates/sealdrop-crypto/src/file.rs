//! File and in-memory entry points over the streaming codec.
//!
//! File outputs are written to a temp file in the destination directory and
//! renamed into place only after the codec succeeds, so a failed or
//! interrupted call never leaves a partial container or plaintext behind.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Seek, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::compat::{identify_format, FormatKind};
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::DerivedKey;
use crate::stream::{container_len, decrypt_stream, encrypt_stream};

/// Encrypt `input` into a container at `output`. Returns plaintext bytes encrypted.
pub fn encrypt_file(input: &Path, output: &Path, key: &DerivedKey) -> CryptoResult<u64> {
    let src = open_input(input)?;
    let plaintext_len = src.metadata()?.len();

    let result = write_atomically(output, |out| {
        let mut reader = BufReader::new(src);
        encrypt_stream(&mut reader, out, key, plaintext_len)
    });

    match &result {
        Ok(n) => info!(input = %input.display(), output = %output.display(), bytes = n, "encrypted"),
        Err(e) => warn!(input = %input.display(), error = %e, "encryption failed"),
    }
    result
}

/// Decrypt the container at `input` into `output`. Returns plaintext bytes written.
///
/// A missing `input` is `NotFound`, never an integrity error.
pub fn decrypt_file(input: &Path, output: &Path, key: &DerivedKey) -> CryptoResult<u64> {
    let src = open_input(input)?;

    let result = write_atomically(output, |out| {
        let mut reader = BufReader::new(src);
        decrypt_stream(&mut reader, out, key)
    });

    match &result {
        Ok(n) => info!(input = %input.display(), output = %output.display(), bytes = n, "decrypted"),
        Err(e) => warn!(input = %input.display(), error = %e, "decryption failed"),
    }
    result
}

/// Decrypt a container into an anonymous temp file, rewound to the start.
///
/// The plaintext is deleted when the returned handle drops, on every path.
pub fn decrypt_to_temp(input: &Path, key: &DerivedKey) -> CryptoResult<NamedTempFile> {
    let src = open_input(input)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".sealdrop-plain-")
        .tempfile()?;

    {
        let mut reader = BufReader::new(src);
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let n = decrypt_stream(&mut reader, &mut writer, key)?;
        debug!(input = %input.display(), bytes = n, "decrypted to temp");
    }

    tmp.as_file_mut().rewind()?;
    Ok(tmp)
}

/// Authenticate every frame of a container without keeping the plaintext.
pub fn verify_file(input: &Path, key: &DerivedKey) -> CryptoResult<u64> {
    let mut reader = BufReader::new(open_input(input)?);
    decrypt_stream(&mut reader, &mut std::io::sink(), key)
}

/// Encrypt an in-memory buffer into a container.
pub fn encrypt_bytes(data: &[u8], key: &DerivedKey) -> CryptoResult<Vec<u8>> {
    let mut out = Vec::with_capacity(container_len(data.len() as u64) as usize);
    encrypt_stream(&mut &data[..], &mut out, key, data.len() as u64)?;
    Ok(out)
}

/// Decrypt an in-memory container. Any integrity violation is an error; no
/// partial plaintext is returned.
pub fn decrypt_bytes(container: &[u8], key: &DerivedKey) -> CryptoResult<Vec<u8>> {
    let mut out = Vec::new();
    decrypt_stream(&mut &container[..], &mut out, key)?;
    Ok(out)
}

/// Encrypt and decrypt a multi-frame sample and check the result.
pub fn self_test(key: &DerivedKey) -> CryptoResult<()> {
    let sample = b"sealdrop container integrity sample / ".repeat(3000);

    let container = encrypt_bytes(&sample, key)?;
    if identify_format(&container) != FormatKind::Current {
        return Err(CryptoError::Format(
            "self-test container not recognized as current format".into(),
        ));
    }
    let back = decrypt_bytes(&container, key)?;
    if back != sample {
        return Err(CryptoError::SizeMismatch {
            declared: sample.len() as u64,
            found: back.len() as u64,
        });
    }
    Ok(())
}

fn open_input(path: &Path) -> CryptoResult<File> {
    File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CryptoError::NotFound(path.to_path_buf()),
        _ => CryptoError::Io(e),
    })
}

/// Run `fill` against a temp file beside `dest`, then rename it over `dest`.
pub(crate) fn write_atomically<F>(dest: &Path, fill: F) -> CryptoResult<u64>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> CryptoResult<u64>,
{
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".sealdrop-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let n = {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let n = fill(&mut writer)?;
        writer.flush()?;
        n
    };
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| CryptoError::Io(e.error))?;
    Ok(n)
}
