//! Master key handling and per-chunk key derivation.
//!
//! The master key is an arbitrary-length secret shared immutably across all
//! file descriptors of one [`EncryptedFs`](crate::EncryptedFs) instance.
//! Each chunk encryption derives a fresh AES key from the master key and the
//! chunk's own random salt, so no AES key is ever reused across chunks.

use std::fmt;
use std::num::NonZeroU32;

use ring::{digest, pbkdf2};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Length of a derived AES key (AES-256).
pub const DERIVED_KEY_LEN: usize = 32;

/// PBKDF2-HMAC-SHA512 iteration count for per-chunk key derivation.
pub const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(9816).unwrap();

/// The master secret of an encrypted filesystem instance.
///
/// # Security
///
/// The secret is held in [`Zeroizing`] storage so it is erased from memory
/// on drop, and the `Debug` implementation redacts it to prevent accidental
/// logging.
#[derive(Clone)]
pub struct MasterKey {
    secret: Zeroizing<Vec<u8>>,
}

impl MasterKey {
    /// Wrap an arbitrary-length secret as the master key.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Derive the AES-256 key for one chunk, keyed by that chunk's salt.
    ///
    /// Derivation is PBKDF2-HMAC-SHA512 with [`PBKDF2_ITERATIONS`]
    /// iterations. Because every encryption draws a fresh random salt, every
    /// chunk is sealed under a distinct derived key.
    pub fn derive_chunk_key(&self, salt: &[u8]) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
        let mut derived = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA512,
            PBKDF2_ITERATIONS,
            salt,
            &self.secret,
            derived.as_mut(),
        );
        derived
    }

    /// SHA-256 of the master secret.
    ///
    /// Stored in file metadata as a canary: on open of an existing file the
    /// recorded fingerprint is compared against the instance key, giving
    /// fast wrong-key detection before any data chunk is touched.
    pub fn fingerprint(&self) -> [u8; 32] {
        let d = digest::digest(&digest::SHA256, &self.secret);
        let mut out = [0u8; 32];
        out.copy_from_slice(d.as_ref());
        out
    }

    /// Constant-time comparison of a stored canary against this key.
    pub fn verify_fingerprint(&self, canary: &[u8; 32]) -> bool {
        self.fingerprint().ct_eq(canary).into()
    }
}

impl From<&str> for MasterKey {
    fn from(secret: &str) -> Self {
        Self::new(secret.as_bytes().to_vec())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let key = MasterKey::new("very password");
        let salt = [7u8; 64];
        assert_eq!(*key.derive_chunk_key(&salt), *key.derive_chunk_key(&salt));
    }

    #[test]
    fn different_salts_derive_different_keys() {
        let key = MasterKey::new("very password");
        assert_ne!(
            *key.derive_chunk_key(&[0u8; 64]),
            *key.derive_chunk_key(&[1u8; 64])
        );
    }

    #[test]
    fn different_secrets_derive_different_keys() {
        let salt = [0u8; 64];
        assert_ne!(
            *MasterKey::new("keyA").derive_chunk_key(&salt),
            *MasterKey::new("keyB").derive_chunk_key(&salt)
        );
    }

    #[test]
    fn fingerprint_is_sha256_of_secret() {
        // SHA-256("abc"), the classic FIPS 180 test vector.
        let key = MasterKey::new("abc");
        assert_eq!(
            hex::encode(key.fingerprint()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_verification() {
        let key = MasterKey::new("keyA");
        let canary = key.fingerprint();
        assert!(key.verify_fingerprint(&canary));
        assert!(!MasterKey::new("keyB").verify_fingerprint(&canary));
    }

    #[test]
    fn debug_redacts_secret() {
        let key = MasterKey::new("hunter2");
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("hunter2"));
    }
}
