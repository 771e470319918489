//! PBKDF2-SHA512 password to AES key/IV derivation.
//!
//! Every encrypted media file is keyed by a password that travels in the
//! stream URL (`k=<key>`). The password is stretched with PBKDF2-HMAC-SHA512
//! over a fixed application salt; the first 32 output bytes become the
//! AES-256 key and the next 16 bytes the IV / initial counter block.
//!
//! The same derivation is used by the offline encoders and by the server,
//! so a file encrypted with `encrypt` is readable by `serve` with the same
//! password and iteration count.

use std::fmt;

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// AES block / IV size in bytes.
pub const IV_SIZE: usize = 16;

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 12_415;

/// Password used when a stream URL carries no `k=` segment.
pub const FALLBACK_PASSWORD: &str = "default";

/// Fixed application-wide salt. Changing it makes every existing file unreadable.
pub const SALT: [u8; 16] = [
    183, 42, 199, 97, 158, 23, 4, 210, 126, 89, 172, 54, 101, 207, 68, 194,
];

#[derive(Debug, Error)]
pub enum KdfError {
    #[error("PBKDF2 iteration count must be at least 1")]
    ZeroIterations,
}

/// AES-256 key and IV derived from a password. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    /// AES-256 key.
    pub key: [u8; KEY_SIZE],
    /// CTR initial counter block, or the CBC IV.
    pub iv: [u8; IV_SIZE],
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey").finish_non_exhaustive()
    }
}

/// Derive the key/IV pair for `password`.
pub fn derive_key(password: &str, iterations: u32) -> Result<DerivedKey, KdfError> {
    if iterations == 0 {
        return Err(KdfError::ZeroIterations);
    }

    let mut okm = [0u8; KEY_SIZE + IV_SIZE];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), &SALT, iterations, &mut okm);

    let mut derived = DerivedKey {
        key: [0u8; KEY_SIZE],
        iv: [0u8; IV_SIZE],
    };
    derived.key.copy_from_slice(&okm[..KEY_SIZE]);
    derived.iv.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    Ok(derived)
}
