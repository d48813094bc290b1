//! Key derivation: PBKDF2-HMAC-SHA256 secret + salt → container key

use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

/// A 256-bit container key derived from a secret via PBKDF2.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from raw bytes; anything but exactly `KEY_SIZE` bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::Config(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// HMAC-SHA256 iterations (default: 1,000,000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 1_000_000,
        }
    }
}

/// Derive a 256-bit container key from a secret and salt using PBKDF2-HMAC-SHA256.
///
/// Deterministic for a given (secret, salt, params). An empty secret, empty
/// salt or zero iteration count is a configuration error.
pub fn derive_key(
    secret: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> CryptoResult<DerivedKey> {
    let secret = secret.expose_secret();
    if secret.is_empty() {
        return Err(CryptoError::Config("KDF secret is empty".into()));
    }
    if salt.is_empty() {
        return Err(CryptoError::Config("KDF salt is empty".into()));
    }
    if params.iterations == 0 {
        return Err(CryptoError::Config("PBKDF2 iterations must be >= 1".into()));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, params.iterations, &mut key);

    let derived = DerivedKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams { iterations: 1000 }
    }

    #[test]
    fn test_kdf_deterministic() {
        let secret = SecretString::from("test-secret-123");

        let key1 = derive_key(&secret, b"salt", &fast()).unwrap();
        let key2 = derive_key(&secret, b"salt", &fast()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_secrets() {
        let key1 = derive_key(&SecretString::from("secret-a"), b"salt", &fast()).unwrap();
        let key2 = derive_key(&SecretString::from("secret-b"), b"salt", &fast()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let secret = SecretString::from("same-secret");

        let key1 = derive_key(&secret, b"salt-1", &fast()).unwrap();
        let key2 = derive_key(&secret, b"salt-2", &fast()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_iterations_matter() {
        let secret = SecretString::from("same-secret");

        let key1 = derive_key(&secret, b"salt", &KdfParams { iterations: 1 }).unwrap();
        let key2 = derive_key(&secret, b"salt", &KdfParams { iterations: 2 }).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_rfc7914_vector() {
        // PBKDF2-HMAC-SHA256("passwd", "salt", c=1), RFC 7914 section 11
        let key = derive_key(&SecretString::from("passwd"), b"salt", &KdfParams { iterations: 1 })
            .unwrap();
        assert_eq!(
            key.as_bytes()[..8],
            [0x55, 0xac, 0x04, 0x6e, 0x56, 0xe3, 0x08, 0x9f]
        );
    }

    #[test]
    fn test_kdf_rejects_bad_input() {
        let secret = SecretString::from("s");
        assert!(matches!(
            derive_key(&SecretString::from(""), b"salt", &fast()),
            Err(CryptoError::Config(_))
        ));
        assert!(matches!(
            derive_key(&secret, b"", &fast()),
            Err(CryptoError::Config(_))
        ));
        assert!(matches!(
            derive_key(&secret, b"salt", &KdfParams { iterations: 0 }),
            Err(CryptoError::Config(_))
        ));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(DerivedKey::from_slice(&[0u8; 31]).is_err());
        assert!(DerivedKey::from_slice(&[0u8; 33]).is_err());
        assert!(DerivedKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = DerivedKey::from_bytes([0x41; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("65"));
    }
}
