//! Hybrid crypto channel for the secure HTTP backend.
//!
//! The client generates a fresh 32-byte secret per process, seals it with
//! RSA-OAEP (SHA-256) under the recipient's public key, and opens responses
//! laid out as `IV(16) || AES-256-CBC ciphertext` with PKCS#7 padding.

use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::sha2::Sha256;
use rsa::{Oaep, RsaPublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use errors::CryptoError;

/// Length of the per-process session secret.
pub const SECRET_LEN: usize = 32;

/// AES block size; also the length of the IV prefix on every payload.
pub const AES_BLOCK_SIZE: usize = 16;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Per-process session secret for the secure backend.
///
/// Generated once, zeroized on drop, never serialized. The only form that
/// leaves the process is the RSA-OAEP-sealed blob produced by [`seal`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKeyring([u8; SECRET_LEN]);

impl SecretKeyring {
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Self(secret)
    }

    pub fn expose(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKeyring(..)")
    }
}

/// Seals a secret under the recipient's SPKI PEM public key with
/// RSA-OAEP (SHA-256).
pub fn seal(secret: &[u8], recipient_public_key_pem: &str) -> Result<Vec<u8>, CryptoError> {
    let recipient =
        RsaPublicKey::from_public_key_pem(recipient_public_key_pem).map_err(|e| {
            CryptoError::InvalidPublicKey {
                reason: e.to_string(),
            }
        })?;
    let mut rng = OsRng;
    recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), secret)
        .map_err(|e| CryptoError::Encrypt {
            reason: e.to_string(),
        })
}

/// Opens a payload laid out as `IV(16) || AES-256-CBC ciphertext`.
///
/// Pure transform: malformed input comes back as an error, never a panic.
pub fn open(payload: &[u8], secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < AES_BLOCK_SIZE {
        return Err(CryptoError::ShortPayload { len: payload.len() });
    }
    let (iv, ciphertext) = payload.split_at(AES_BLOCK_SIZE);
    let cipher = Aes256CbcDec::new_from_slices(secret, iv).map_err(|e| CryptoError::Decrypt {
        reason: e.to_string(),
    })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::Decrypt {
            reason: e.to_string(),
        })
}
