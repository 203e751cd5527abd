//! Passphrase encryption for extended private keys
//!
//! Keychains arrive from the wallet service with the private half wrapped
//! in an Argon2id + AES-256-GCM envelope. The wire format is the base64
//! encoding of `salt (16) ‖ nonce (12) ‖ ciphertext`; each encryption draws
//! a fresh salt and nonce. The passphrase itself is never stored.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::prelude::*;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Argon2id parameters: 64 MiB, 3 iterations, 4 lanes.
const ARGON2_M_COST: u32 = 65536;
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("invalid encrypted key format")]
    InvalidFormat,
}

/// Derive the AES key from a passphrase. The key material is zeroized when
/// the wrapper drops.
fn derive_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
) -> Result<Zeroizing<[u8; ARGON2_OUTPUT_LEN]>, CryptoError> {
    let params = Params::new(
        ARGON2_M_COST,
        ARGON2_T_COST,
        ARGON2_P_COST,
        Some(ARGON2_OUTPUT_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; ARGON2_OUTPUT_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    Ok(key)
}

/// Encrypt an extended private key under a passphrase.
pub fn encrypt_key(xprv: &str, passphrase: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let nonce_arr = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&nonce_arr);

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), xprv.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut envelope = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64_STANDARD.encode(envelope))
}

/// Decrypt an encrypted key envelope.
///
/// Returns the plaintext in a `Zeroizing` wrapper so the key string is
/// wiped from memory when the caller is done with it.
pub fn decrypt_key(envelope: &str, passphrase: &str) -> Result<Zeroizing<String>, CryptoError> {
    let bytes = BASE64_STANDARD
        .decode(envelope)
        .map_err(|_| CryptoError::InvalidFormat)?;
    // Minimum: salt + nonce + 1 ciphertext byte + 16 byte tag
    if bytes.len() < SALT_LEN + NONCE_LEN + 17 {
        return Err(CryptoError::InvalidFormat);
    }

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    salt.copy_from_slice(&bytes[0..SALT_LEN]);
    nonce.copy_from_slice(&bytes[SALT_LEN..SALT_LEN + NONCE_LEN]);
    let ciphertext = &bytes[SALT_LEN + NONCE_LEN..];

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));
    let mut plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed("wrong passphrase or corrupted data".into()))?;

    let result = match String::from_utf8(plaintext.clone()) {
        Ok(s) => Ok(Zeroizing::new(s)),
        Err(_) => Err(CryptoError::DecryptionFailed("not valid utf-8".into())),
    };
    plaintext.zeroize();
    result
}
