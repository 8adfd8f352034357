//! Authenticated encryption for secrets at rest.
//!
//! Blobs are AES-256-GCM encrypted and encoded as
//! `v1.<nonce>.<ciphertext>.<tag>`, every segment base64url without padding.
//! The key is SHA-256 of the configured key material, so any length of
//! high-entropy material can be used.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

const VERSION: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors from sealing or opening a secret.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretBoxError {
    #[error("key material cannot be empty")]
    EmptyKey,

    #[error("encrypted secret is malformed")]
    Malformed,

    #[error("unsupported encrypted secret version")]
    UnsupportedVersion,

    /// Authentication tag mismatch: the blob was tampered with or the key is wrong.
    #[error("encrypted secret failed integrity check")]
    Integrity,

    #[error("encryption failed")]
    Encryption,
}

/// Symmetric sealing of small secrets (TOTP seeds, API tokens).
#[derive(Clone)]
pub struct SecretBox {
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").field("key", &"[REDACTED]").finish()
    }
}

impl SecretBox {
    /// Derive a box from arbitrary-length key material.
    ///
    /// # Errors
    ///
    /// Returns `SecretBoxError::EmptyKey` if `key_material` is empty.
    pub fn new(key_material: &[u8]) -> Result<Self, SecretBoxError> {
        if key_material.is_empty() {
            return Err(SecretBoxError::EmptyKey);
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&Sha256::digest(key_material));
        Ok(Self { key })
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns `SecretBoxError::Encryption` if the cipher rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecretBoxError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecretBoxError::Encryption)?;

        // aes-gcm appends the tag to the ciphertext
        let split = sealed
            .len()
            .checked_sub(TAG_LEN)
            .ok_or(SecretBoxError::Encryption)?;
        let (ciphertext, tag) = sealed.split_at(split);

        Ok(format!(
            "{VERSION}.{}.{}.{}",
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext),
            URL_SAFE_NO_PAD.encode(tag),
        ))
    }

    /// Decrypt a blob produced by [`SecretBox::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `SecretBoxError::Malformed` or `SecretBoxError::UnsupportedVersion`
    /// for structurally invalid blobs and `SecretBoxError::Integrity` when the
    /// authentication tag does not match.
    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>, SecretBoxError> {
        let mut parts = blob.split('.');
        let version = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or(SecretBoxError::Malformed)?;
        if version != VERSION {
            return Err(SecretBoxError::UnsupportedVersion);
        }

        let nonce = decode_segment(parts.next())?;
        let ciphertext = decode_segment(parts.next())?;
        let tag = decode_segment(parts.next())?;
        if parts.next().is_some() || nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(SecretBoxError::Malformed);
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        self.cipher()?
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| SecretBoxError::Integrity)
    }

    fn cipher(&self) -> Result<Aes256Gcm, SecretBoxError> {
        Aes256Gcm::new_from_slice(self.key.as_slice()).map_err(|_| SecretBoxError::Encryption)
    }
}

/// Encrypt `plaintext` with a key derived from `key_material`.
///
/// # Errors
///
/// See [`SecretBox::new`] and [`SecretBox::encrypt`].
pub fn encrypt(plaintext: &[u8], key_material: &[u8]) -> Result<String, SecretBoxError> {
    SecretBox::new(key_material)?.encrypt(plaintext)
}

/// Decrypt a blob with a key derived from `key_material`.
///
/// # Errors
///
/// See [`SecretBox::new`] and [`SecretBox::decrypt`].
pub fn decrypt(blob: &str, key_material: &[u8]) -> Result<Zeroizing<Vec<u8>>, SecretBoxError> {
    SecretBox::new(key_material)?.decrypt(blob)
}

fn decode_segment(segment: Option<&str>) -> Result<Vec<u8>, SecretBoxError> {
    let segment = segment.ok_or(SecretBoxError::Malformed)?;
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| SecretBoxError::Malformed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"k7Hq2pX9vR4mN8sT1wZ6yB3cF5gJ0dLa";

    fn segments(blob: &str) -> Vec<Vec<u8>> {
        blob.split('.')
            .skip(1)
            .map(|s| URL_SAFE_NO_PAD.decode(s).unwrap())
            .collect()
    }

    fn assemble(parts: &[Vec<u8>]) -> String {
        format!(
            "v1.{}.{}.{}",
            URL_SAFE_NO_PAD.encode(&parts[0]),
            URL_SAFE_NO_PAD.encode(&parts[1]),
            URL_SAFE_NO_PAD.encode(&parts[2]),
        )
    }

    #[test]
    fn test_roundtrip() {
        let cases: [&[u8]; 4] = [b"", b"x", b"JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP", &[0u8; 300]];
        for plaintext in cases {
            let blob = encrypt(plaintext, KEY).unwrap();
            assert_eq!(decrypt(&blob, KEY).unwrap().as_slice(), plaintext);
        }
    }

    #[test]
    fn test_format() {
        let blob = encrypt(b"hello", KEY).unwrap();
        assert!(blob.starts_with("v1."));
        let parts = segments(&blob);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), NONCE_LEN);
        assert_eq!(parts[1].len(), 5);
        assert_eq!(parts[2].len(), TAG_LEN);
    }

    #[test]
    fn test_nonce_is_fresh() {
        let a = encrypt(b"same", KEY).unwrap();
        let b = encrypt(b"same", KEY).unwrap();
        assert_ne!(segments(&a)[0], segments(&b)[0]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_bit_flip_in_ciphertext_or_tag_fails() {
        let blob = encrypt(b"totp-seed", KEY).unwrap();
        let parts = segments(&blob);

        for segment in 1..=2 {
            for byte in 0..parts[segment].len() {
                for bit in 0..8 {
                    let mut tampered = parts.clone();
                    tampered[segment][byte] ^= 1 << bit;
                    assert_eq!(
                        decrypt(&assemble(&tampered), KEY),
                        Err(SecretBoxError::Integrity),
                        "segment {segment} byte {byte} bit {bit}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_nonce_flip_fails() {
        let blob = encrypt(b"totp-seed", KEY).unwrap();
        let mut parts = segments(&blob);
        parts[0][0] ^= 0x01;
        assert_eq!(
            decrypt(&assemble(&parts), KEY),
            Err(SecretBoxError::Integrity)
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = encrypt(b"secret", KEY).unwrap();
        assert_eq!(
            decrypt(&blob, b"another key entirely"),
            Err(SecretBoxError::Integrity)
        );
    }

    #[test]
    fn test_unknown_version() {
        let blob = encrypt(b"secret", KEY).unwrap();
        let v2 = blob.replacen("v1.", "v2.", 1);
        assert_eq!(decrypt(&v2, KEY), Err(SecretBoxError::UnsupportedVersion));
    }

    #[test]
    fn test_malformed_blobs() {
        for blob in ["", "v1", "v1.a.b", "v1.!!.aa.bb", "v1.AAAA.AAAA.AAAA"] {
            assert_eq!(decrypt(blob, KEY), Err(SecretBoxError::Malformed), "{blob}");
        }
        let blob = encrypt(b"secret", KEY).unwrap();
        assert_eq!(
            decrypt(&format!("{blob}.extra"), KEY),
            Err(SecretBoxError::Malformed)
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        assert_eq!(SecretBox::new(b"").unwrap_err(), SecretBoxError::EmptyKey);
    }

    #[test]
    fn test_debug_redacts_key() {
        let sb = SecretBox::new(KEY).unwrap();
        assert!(format!("{sb:?}").contains("REDACTED"));
    }
}
