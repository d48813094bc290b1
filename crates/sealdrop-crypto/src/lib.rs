//! sealdrop-crypto: streaming authenticated container format
//!
//! Container layout (all integers big-endian):
//! ```text
//! [6 bytes: magic "SEALDP"][1 byte: version = 2][12 bytes: nonce][8 bytes: plaintext length]
//! [frame 0: ciphertext || 16-byte tag][frame 1] ... [frame n-1]
//! ```
//!
//! Each frame carries at most `FRAME_SIZE` plaintext bytes; only the last one may
//! be shorter. Frames are sealed with ChaCha20-Poly1305 under one per-container
//! nonce, with AAD = frame index (u64 BE). The index is the only thing that
//! distinguishes frames, so it must never repeat within a container.
//!
//! Key: PBKDF2-HMAC-SHA256(secret, salt), 32 bytes, never persisted.

pub mod compat;
pub mod error;
pub mod file;
pub mod header;
pub mod kdf;
pub mod legacy;
pub mod stream;

pub use compat::{
    batch_upgrade_dir, identify_file, identify_format, upgrade_bytes, upgrade_file,
    upgrade_in_place, FormatKind, UpgradeStats,
};
pub use error::{CryptoError, CryptoResult};
pub use file::{
    decrypt_bytes, decrypt_file, decrypt_to_temp, encrypt_bytes, encrypt_file, self_test,
    verify_file,
};
pub use header::{read_header, ContainerHeader};
pub use kdf::{derive_key, DerivedKey, KdfParams};
pub use stream::{container_len, decrypt_stream, encrypt_stream};

/// Size of a ChaCha20-Poly1305 key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Plaintext bytes per frame (64 KiB)
pub const FRAME_SIZE: usize = 64 * 1024;

/// Container format identifier
pub const MAGIC: &[u8; 6] = b"SEALDP";

/// Current container format version
pub const FORMAT_VERSION: u8 = 2;

/// magic + version + nonce + plaintext length
pub const HEADER_LEN: usize = MAGIC.len() + 1 + NONCE_SIZE + 8;
