//! Container header: magic, version, nonce, declared plaintext length

use std::io::{ErrorKind, Read};

use crate::error::{CryptoError, CryptoResult};
use crate::{FORMAT_VERSION, HEADER_LEN, MAGIC, NONCE_SIZE};

const VERSION_OFFSET: usize = MAGIC.len();
const NONCE_OFFSET: usize = VERSION_OFFSET + 1;
const LENGTH_OFFSET: usize = NONCE_OFFSET + NONCE_SIZE;

/// Fixed-size prefix of every current-format container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub nonce: [u8; NONCE_SIZE],
    pub plaintext_len: u64,
}

impl ContainerHeader {
    pub fn new(nonce: [u8; NONCE_SIZE], plaintext_len: u64) -> Self {
        Self {
            nonce,
            plaintext_len,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..VERSION_OFFSET].copy_from_slice(MAGIC);
        out[VERSION_OFFSET] = FORMAT_VERSION;
        out[NONCE_OFFSET..LENGTH_OFFSET].copy_from_slice(&self.nonce);
        out[LENGTH_OFFSET..].copy_from_slice(&self.plaintext_len.to_be_bytes());
        out
    }

    /// Parse and validate a header. Magic and version are checked before
    /// anything else is interpreted.
    ///
    /// Input that carries the magic but stops before a full header is a cut
    /// container and reports `Truncation`; the declared length is unknown then.
    pub fn parse(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < VERSION_OFFSET || &bytes[..VERSION_OFFSET] != MAGIC {
            return Err(CryptoError::Format("bad magic: not a sealdrop container".into()));
        }
        match bytes.get(VERSION_OFFSET) {
            Some(&FORMAT_VERSION) => {}
            Some(&other) => {
                return Err(CryptoError::Format(format!(
                    "unsupported container version {other} (expected {FORMAT_VERSION})"
                )))
            }
            None => {}
        }
        if bytes.len() < HEADER_LEN {
            return Err(CryptoError::Truncation {
                declared: 0,
                recovered: 0,
            });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[NONCE_OFFSET..LENGTH_OFFSET]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[LENGTH_OFFSET..HEADER_LEN]);

        Ok(Self {
            nonce,
            plaintext_len: u64::from_be_bytes(len),
        })
    }
}

/// Read and validate a header from the start of a container stream.
pub fn read_header<R: Read>(reader: &mut R) -> CryptoResult<ContainerHeader> {
    let mut buf = [0u8; HEADER_LEN];
    let n = read_full(reader, &mut buf)?;
    ContainerHeader::parse(&buf[..n])
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF).
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
