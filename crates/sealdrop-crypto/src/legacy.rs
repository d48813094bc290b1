//! Deprecated V0 container: one AES-256-GCM seal over the whole file.
//!
//! ```text
//! [4 bytes: marker 00 00 00 20][12 bytes: nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! V0 has no framing, so opening one holds the full plaintext in memory. It is
//! only ever read in order to upgrade to the current format.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::DerivedKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Leading bytes of every V0 container
pub const LEGACY_MARKER: &[u8; 4] = &[0x00, 0x00, 0x00, 0x20];

const BODY_OFFSET: usize = LEGACY_MARKER.len() + NONCE_SIZE;

/// Decrypt a V0 container.
#[deprecated(note = "V0 containers are read only for upgrade; use the current codec")]
pub fn open_v0(container: &[u8], key: &DerivedKey) -> CryptoResult<Vec<u8>> {
    if !container.starts_with(LEGACY_MARKER) {
        return Err(CryptoError::Format("missing V0 marker".into()));
    }
    if container.len() < BODY_OFFSET + TAG_SIZE {
        return Err(CryptoError::Truncation {
            declared: 0,
            recovered: 0,
        });
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(&container[LEGACY_MARKER.len()..BODY_OFFSET]);

    cipher
        .decrypt(nonce, &container[BODY_OFFSET..])
        .map_err(|_| CryptoError::Authentication { frame: 0 })
}

/// Produce a V0 container. Exists so upgrade paths can be exercised.
#[doc(hidden)]
#[deprecated(note = "new data must be written in the current format")]
pub fn seal_v0(plaintext: &[u8], key: &DerivedKey) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::Io(std::io::Error::other(format!("V0 seal failed: {e}"))))?;

    let mut out = Vec::with_capacity(BODY_OFFSET + ciphertext.len());
    out.extend_from_slice(LEGACY_MARKER);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}
