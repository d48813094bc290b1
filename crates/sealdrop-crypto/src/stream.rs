//! Frame-by-frame ChaCha20-Poly1305 encryption/decryption over `Read`/`Write`
//!
//! Memory use is one frame buffer regardless of input size.
//!
//! Every frame of a container is sealed under the same nonce; frames differ
//! only by their AAD (the big-endian frame index). This reproduces the
//! established on-disk scheme bit for bit. ChaCha20's keystream depends on
//! (key, nonce) only, so frames within one container share a keystream; see
//! DESIGN.md before relying on this for new deployments.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::io::{self, Read, Write};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::header::{read_full, read_header, ContainerHeader};
use crate::kdf::DerivedKey;
use crate::{FRAME_SIZE, NONCE_SIZE, TAG_SIZE};

/// Encrypt exactly `plaintext_len` bytes from `reader` into a container on `writer`.
///
/// A fresh random nonce is generated per call. If the reader yields fewer or
/// more bytes than declared, fails with `SizeMismatch`; callers writing to a
/// file must discard what was written.
///
/// Returns the number of plaintext bytes encrypted.
pub fn encrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    key: &DerivedKey,
    plaintext_len: u64,
) -> CryptoResult<u64> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(reader, writer, key, plaintext_len, nonce)
}

fn encrypt_with_nonce<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    key: &DerivedKey,
    plaintext_len: u64,
    nonce_bytes: [u8; NONCE_SIZE],
) -> CryptoResult<u64> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    writer.write_all(&ContainerHeader::new(nonce_bytes, plaintext_len).encode())?;

    let mut buf = vec![0u8; FRAME_SIZE];
    let result = seal_frames(
        reader,
        writer,
        &cipher,
        Nonce::from_slice(&nonce_bytes),
        plaintext_len,
        &mut buf,
    );
    buf.zeroize();
    result
}

fn seal_frames<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    cipher: &ChaCha20Poly1305,
    nonce: &Nonce,
    plaintext_len: u64,
    buf: &mut [u8],
) -> CryptoResult<u64> {
    let mut frame: u64 = 0;
    let mut done: u64 = 0;

    while done < plaintext_len {
        let want = frame_len(plaintext_len - done);
        let n = read_full(reader, &mut buf[..want])?;
        if n < want {
            return Err(CryptoError::SizeMismatch {
                declared: plaintext_len,
                found: done + n as u64,
            });
        }

        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &buf[..n],
                    aad: &frame.to_be_bytes(),
                },
            )
            .map_err(|e| {
                CryptoError::Io(io::Error::other(format!(
                    "frame {frame} encryption failed: {e}"
                )))
            })?;
        writer.write_all(&sealed)?;

        done += n as u64;
        frame += 1;
    }

    let extra = io::copy(reader, &mut io::sink())?;
    if extra > 0 {
        return Err(CryptoError::SizeMismatch {
            declared: plaintext_len,
            found: plaintext_len + extra,
        });
    }
    writer.flush()?;
    Ok(done)
}

/// Decrypt a container from `reader`, writing plaintext to `writer`.
///
/// Each frame's tag is verified before any of its bytes are written. Frames
/// preceding a failing one may already have been written; file-level callers
/// write into a temp file so nothing partial survives.
///
/// Returns the number of plaintext bytes recovered (always the declared length).
pub fn decrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    key: &DerivedKey,
) -> CryptoResult<u64> {
    let header = read_header(reader)?;
    let declared = header.plaintext_len;

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(&header.nonce);

    let mut buf = vec![0u8; FRAME_SIZE + TAG_SIZE];
    let mut frame: u64 = 0;
    let mut recovered: u64 = 0;

    while recovered < declared {
        let want = frame_len(declared - recovered) + TAG_SIZE;
        let n = read_full(reader, &mut buf[..want])?;
        if n < want {
            return Err(CryptoError::Truncation {
                declared,
                recovered,
            });
        }

        let mut plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &buf[..n],
                    aad: &frame.to_be_bytes(),
                },
            )
            .map_err(|_| CryptoError::Authentication { frame })?;
        writer.write_all(&plaintext)?;

        recovered += plaintext.len() as u64;
        plaintext.zeroize();
        frame += 1;
    }

    let trailing = io::copy(reader, &mut io::sink())?;
    if trailing > 0 || recovered != declared {
        return Err(CryptoError::SizeMismatch {
            declared,
            found: recovered + trailing,
        });
    }

    writer.flush()?;
    Ok(recovered)
}

/// Total container size for a given plaintext length.
pub fn container_len(plaintext_len: u64) -> u64 {
    let frames = plaintext_len.div_ceil(FRAME_SIZE as u64);
    crate::HEADER_LEN as u64 + plaintext_len + frames * TAG_SIZE as u64
}

fn frame_len(remaining: u64) -> usize {
    remaining.min(FRAME_SIZE as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HEADER_LEN;
    use proptest::prelude::*;

    fn key(byte: u8) -> DerivedKey {
        DerivedKey::from_bytes([byte; 32])
    }

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i.wrapping_mul(31) ^ (i >> 7)) as u8).collect()
    }

    fn seal(data: &[u8], k: &DerivedKey) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream(&mut &data[..], &mut out, k, data.len() as u64).unwrap();
        out
    }

    fn open(container: &[u8], k: &DerivedKey) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_stream(&mut &container[..], &mut out, k)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_frame_boundaries() {
        let k = key(1);
        for size in [0, 1, FRAME_SIZE - 1, FRAME_SIZE, FRAME_SIZE + 1, 3 * FRAME_SIZE] {
            let data = pattern(size);
            let container = seal(&data, &k);
            assert_eq!(container.len() as u64, container_len(size as u64), "size {size}");
            assert_eq!(open(&container, &k).unwrap(), data, "size {size}");
        }
    }

    #[test]
    fn test_empty_plaintext_is_header_only() {
        let container = seal(b"", &key(1));
        assert_eq!(container.len(), HEADER_LEN);
    }

    #[test]
    fn test_same_plaintext_fresh_nonce() {
        let k = key(2);
        let a = seal(b"identical", &k);
        let b = seal(b"identical", &k);
        assert_ne!(a[7..19], b[7..19], "nonce must be random per container");
        assert_ne!(a, b);
    }

    #[test]
    fn test_deterministic_with_fixed_nonce() {
        let k = key(3);
        let data = pattern(FRAME_SIZE + 10);
        let mut a = Vec::new();
        let mut b = Vec::new();
        encrypt_with_nonce(&mut &data[..], &mut a, &k, data.len() as u64, [9; NONCE_SIZE]).unwrap();
        encrypt_with_nonce(&mut &data[..], &mut b, &k, data.len() as u64, [9; NONCE_SIZE]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tampered_frame_reports_frame_index() {
        let k = key(4);
        let data = pattern(2 * FRAME_SIZE + 100);
        let container = seal(&data, &k);

        let frame_stride = FRAME_SIZE + TAG_SIZE;
        for frame in 0..3u64 {
            let offset = HEADER_LEN + frame as usize * frame_stride + 5;
            let mut tampered = container.clone();
            tampered[offset] ^= 0x01;
            match open(&tampered, &k) {
                Err(CryptoError::Authentication { frame: f }) => assert_eq!(f, frame),
                other => panic!("expected auth failure at frame {frame}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_swapped_frames_fail() {
        let k = key(5);
        let data = pattern(2 * FRAME_SIZE);
        let mut container = seal(&data, &k);

        let stride = FRAME_SIZE + TAG_SIZE;
        let frames = &mut container[HEADER_LEN..];
        let (f0, f1) = frames.split_at_mut(stride);
        f0.swap_with_slice(f1);

        assert!(matches!(
            open(&container, &k),
            Err(CryptoError::Authentication { frame: 0 })
        ));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let container = seal(b"secret data", &key(6));
        assert!(matches!(
            open(&container, &key(7)),
            Err(CryptoError::Authentication { frame: 0 })
        ));
    }

    #[test]
    fn test_truncated_container() {
        let k = key(8);
        let data = pattern(FRAME_SIZE + 50);
        let container = seal(&data, &k);

        // cut inside the second frame
        let cut = &container[..container.len() - 10];
        match open(cut, &k) {
            Err(CryptoError::Truncation {
                declared,
                recovered,
            }) => {
                assert_eq!(declared, data.len() as u64);
                assert_eq!(recovered, FRAME_SIZE as u64);
            }
            other => panic!("expected truncation, got {other:?}"),
        }

        // header only
        assert!(matches!(
            open(&container[..HEADER_LEN], &k),
            Err(CryptoError::Truncation { recovered: 0, .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_are_size_mismatch() {
        let k = key(9);
        let mut container = seal(b"HelloWorld", &k);
        container.extend_from_slice(b"junk");
        assert!(matches!(
            open(&container, &k),
            Err(CryptoError::SizeMismatch { declared: 10, .. })
        ));
    }

    #[test]
    fn test_understated_length_on_frame_boundary_is_size_mismatch() {
        let k = key(10);
        let data = pattern(2 * FRAME_SIZE);
        let mut container = seal(&data, &k);
        container[19..27].copy_from_slice(&(FRAME_SIZE as u64).to_be_bytes());
        assert!(matches!(
            open(&container, &k),
            Err(CryptoError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_overstated_length_is_truncation() {
        let k = key(11);
        let mut container = seal(b"short", &k);
        container[19..27].copy_from_slice(&1_000_000u64.to_be_bytes());
        // the single frame is now read as 1,000,000 bytes and runs off the end
        assert!(matches!(
            open(&container, &k),
            Err(CryptoError::Truncation { .. })
        ));
    }

    #[test]
    fn test_encrypt_short_reader_is_size_mismatch() {
        let mut out = Vec::new();
        let err = encrypt_stream(&mut &b"abc"[..], &mut out, &key(1), 10).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::SizeMismatch {
                declared: 10,
                found: 3
            }
        ));
    }

    #[test]
    fn test_encrypt_long_reader_is_size_mismatch() {
        let mut out = Vec::new();
        let err = encrypt_stream(&mut &b"abcdef"[..], &mut out, &key(1), 4).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::SizeMismatch {
                declared: 4,
                found: 6
            }
        ));
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let mut container = seal(b"x", &key(1));
        container[0] = b'X';
        assert!(matches!(
            open(&container, &key(1)),
            Err(CryptoError::Format(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_any_length(data in proptest::collection::vec(any::<u8>(), 0..=(2 * FRAME_SIZE + 7))) {
            let k = key(42);
            let container = seal(&data, &k);
            prop_assert_eq!(container.len() as u64, container_len(data.len() as u64));
            prop_assert_eq!(open(&container, &k).unwrap(), data);
        }
    }
}
