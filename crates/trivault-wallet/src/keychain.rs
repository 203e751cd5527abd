//! Wallet keychains
//!
//! Every wallet is backed by the fixed `[user, backup, bitgo]` keychain
//! triple. The public half is always present; the private half is either
//! attached directly (`prv`) or as a passphrase envelope (`encrypted_prv`).
//! Private material is zeroized when a keychain is dropped.

use crate::crypto::{decrypt_key, CryptoError};
use bitcoin::bip32::{Xpriv, Xpub};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("invalid extended public key: {0}")]
    InvalidXpub(String),

    #[error("invalid extended private key")]
    InvalidXprv,

    #[error("keychain has no private key material")]
    MissingPrv,

    #[error("encrypted private key requires a wallet passphrase")]
    MissingPassphrase,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Bitcoin signed-message signatures over the backup and bitgo public keys,
/// produced by the user key at wallet creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySignatures {
    pub backup_pub_sig: String,
    pub bitgo_pub_sig: String,
}

/// One keychain of the wallet triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keychain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "pub")]
    pub pub_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_prv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_signatures: Option<KeySignatures>,
}

impl Keychain {
    pub fn from_pub(pub_key: impl Into<String>) -> Self {
        Keychain {
            id: None,
            pub_key: pub_key.into(),
            prv: None,
            encrypted_prv: None,
            key_signatures: None,
        }
    }

    pub fn with_prv(pub_key: impl Into<String>, prv: impl Into<String>) -> Self {
        let mut keychain = Keychain::from_pub(pub_key);
        keychain.prv = Some(prv.into());
        keychain
    }

    pub fn with_encrypted_prv(pub_key: impl Into<String>, encrypted_prv: impl Into<String>) -> Self {
        let mut keychain = Keychain::from_pub(pub_key);
        keychain.encrypted_prv = Some(encrypted_prv.into());
        keychain
    }

    pub fn xpub(&self) -> Result<Xpub, KeychainError> {
        Xpub::from_str(&self.pub_key).map_err(|e| KeychainError::InvalidXpub(e.to_string()))
    }

    /// The private key string: directly attached, or decrypted from the
    /// passphrase envelope. The result is zeroized on drop.
    pub fn prv_string(&self, passphrase: Option<&str>) -> Result<Zeroizing<String>, KeychainError> {
        if let Some(prv) = &self.prv {
            return Ok(Zeroizing::new(prv.clone()));
        }
        let encrypted = self
            .encrypted_prv
            .as_deref()
            .ok_or(KeychainError::MissingPrv)?;
        let passphrase = passphrase.ok_or(KeychainError::MissingPassphrase)?;
        Ok(decrypt_key(encrypted, passphrase)?)
    }

    /// Parse the private half as an extended key.
    pub fn xprv(&self, passphrase: Option<&str>) -> Result<Xpriv, KeychainError> {
        let prv = self.prv_string(passphrase)?;
        Xpriv::from_str(&prv).map_err(|_| KeychainError::InvalidXprv)
    }
}

impl Zeroize for Keychain {
    fn zeroize(&mut self) {
        if let Some(prv) = &mut self.prv {
            prv.zeroize();
        }
    }
}

impl Drop for Keychain {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// The wallet's `[user, backup, bitgo]` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keychains {
    pub user: Keychain,
    pub backup: Keychain,
    pub bitgo: Keychain,
}

impl Keychains {
    pub fn as_array(&self) -> [&Keychain; 3] {
        [&self.user, &self.backup, &self.bitgo]
    }

    /// All three xpubs in wallet order.
    pub fn xpubs(&self) -> Result<Vec<Xpub>, KeychainError> {
        self.as_array().iter().map(|k| k.xpub()).collect()
    }
}
