//! BIP32 leaf-key derivation
//!
//! Wallet keys live along the fixed non-hardened path `m/0/0/<chain>/<index>`;
//! recovery scans derive from the `m/0/0` base. All derivation is public-path
//! only, so it works identically from an xpub or an xprv.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DerivationError {
    #[error("bip32 derivation failed: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("chain or index out of range: {0}")]
    OutOfRange(u32),
}

/// `m/0/0` — the base under which all wallet chains live.
pub fn base_path() -> DerivationPath {
    DerivationPath::from(vec![
        ChildNumber::from_normal_idx(0).expect("0 is a valid child index"),
        ChildNumber::from_normal_idx(0).expect("0 is a valid child index"),
    ])
}

/// `m/0/0/<chain>/<index>` for a leaf key.
pub fn leaf_path(chain: u32, index: u32) -> Result<DerivationPath, DerivationError> {
    let chain = ChildNumber::from_normal_idx(chain).map_err(|_| DerivationError::OutOfRange(chain))?;
    let index = ChildNumber::from_normal_idx(index).map_err(|_| DerivationError::OutOfRange(index))?;
    Ok(base_path().child(chain).child(index))
}

/// Derive the leaf public key at `m/0/0/<chain>/<index>` from an xpub.
pub fn derive_leaf_pubkey(
    secp: &Secp256k1<All>,
    xpub: &Xpub,
    chain: u32,
    index: u32,
) -> Result<PublicKey, DerivationError> {
    let derived = xpub.derive_pub(secp, &leaf_path(chain, index)?)?;
    Ok(derived.public_key)
}

/// Derive the leaf private key at `m/0/0/<chain>/<index>` from an xprv.
///
/// The returned key is secp `SecretKey` material; callers erase it with
/// `non_secure_erase` once the signature is produced.
pub fn derive_leaf_privkey(
    secp: &Secp256k1<All>,
    xprv: &Xpriv,
    chain: u32,
    index: u32,
) -> Result<SecretKey, DerivationError> {
    let derived = xprv.derive_priv(secp, &leaf_path(chain, index)?)?;
    Ok(derived.private_key)
}
