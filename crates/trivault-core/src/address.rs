//! Multisig address generation and verification
//!
//! Addresses are always 2-of-3 multisig over the `[user, backup, bitgo]`
//! keychain triple, derived at `m/0/0/<chain>/<index>`. The chain number
//! encodes the address type and whether the address is a change address:
//!
//! | type | main chain | change chain |
//! |---|---|---|
//! | P2SH | 0 | 1 |
//! | P2SH-P2WSH | 10 | 11 |
//! | P2WSH | 20 | 21 |
//!
//! Verification never trusts a supplied script: it rederives the address
//! from the keychains and compares the canonical encoding.

use crate::derivation::{derive_leaf_pubkey, DerivationError};
use crate::network::Network;
use crate::script::{multisig_script, p2sh_output_script, p2wsh_script, ScriptError};
use bitcoin::bip32::Xpub;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::{Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Multisig threshold used for all wallet addresses.
pub const DEFAULT_THRESHOLD: usize = 2;

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid address derivation property: {0}")]
    InvalidAddressDerivationProperty(String),

    #[error("missing coin-specific address verification data")]
    InvalidAddressVerificationObjectProperty,

    #[error("address validation failure: expected {expected}, got {actual}")]
    UnexpectedAddress { expected: String, actual: String },

    #[error("p2wsh addresses are not supported on this network")]
    P2wshUnsupported,

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(String),

    #[error("script cannot be encoded as an address")]
    UnencodableScript,

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),
}

/// Script classes the wallet can own addresses in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    #[serde(rename = "p2sh")]
    P2sh,
    #[serde(rename = "p2shP2wsh")]
    P2shP2wsh,
    #[serde(rename = "p2wsh")]
    P2wsh,
}

impl AddressType {
    pub fn main_chain(self) -> u32 {
        match self {
            AddressType::P2sh => 0,
            AddressType::P2shP2wsh => 10,
            AddressType::P2wsh => 20,
        }
    }

    pub fn change_chain(self) -> u32 {
        self.main_chain() + 1
    }

    /// Both chains of this type, main first.
    pub fn chains(self) -> [u32; 2] {
        [self.main_chain(), self.change_chain()]
    }

    /// Recover the type from a chain number, if the chain is canonical.
    pub fn from_chain(chain: u32) -> Option<AddressType> {
        match (chain / 10, chain % 10) {
            (0, 0) | (0, 1) => Some(AddressType::P2sh),
            (1, 0) | (1, 1) => Some(AddressType::P2shP2wsh),
            (2, 0) | (2, 1) => Some(AddressType::P2wsh),
            _ => None,
        }
    }

    pub fn all() -> [AddressType; 3] {
        [AddressType::P2sh, AddressType::P2shP2wsh, AddressType::P2wsh]
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::P2sh => write!(f, "p2sh"),
            AddressType::P2shP2wsh => write!(f, "p2shP2wsh"),
            AddressType::P2wsh => write!(f, "p2wsh"),
        }
    }
}

/// Hex-encoded scripts attached to an address record.
///
/// Presence of the script fields determines the address type:
/// witness+redeem → P2SH-P2WSH, witness only → P2WSH, redeem only → P2SH.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressScripts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_script: Option<String>,
}

impl AddressScripts {
    pub fn infer_address_type(&self) -> Option<AddressType> {
        match (&self.redeem_script, &self.witness_script) {
            (Some(_), Some(_)) => Some(AddressType::P2shP2wsh),
            (None, Some(_)) => Some(AddressType::P2wsh),
            (Some(_), None) => Some(AddressType::P2sh),
            (None, None) => None,
        }
    }
}

/// A fully derived wallet address with its scripts.
#[derive(Debug, Clone)]
pub struct GeneratedAddress {
    pub address: String,
    pub chain: u32,
    pub index: u32,
    pub address_type: AddressType,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub output_script: ScriptBuf,
}

/// Derive the canonical multisig address at `(chain, index)`.
///
/// Keychain order is significant: the multisig program embeds the leaf keys
/// in the `[user, backup, bitgo]` order the wallet was created with.
pub fn generate_address(
    secp: &Secp256k1<All>,
    network: &Network,
    keychains: &[Xpub],
    threshold: usize,
    address_type: AddressType,
    chain: u32,
    index: u32,
) -> Result<GeneratedAddress, AddressError> {
    if address_type == AddressType::P2wsh && !network.supports_p2wsh {
        return Err(AddressError::P2wshUnsupported);
    }

    let leaf_keys: Vec<PublicKey> = keychains
        .iter()
        .map(|xpub| derive_leaf_pubkey(secp, xpub, chain, index))
        .collect::<Result<_, _>>()?;
    let multisig = multisig_script(&leaf_keys, threshold)?;

    let (redeem_script, witness_script, output_script) = match address_type {
        AddressType::P2sh => {
            let output = p2sh_output_script(&multisig);
            (Some(multisig), None, output)
        }
        AddressType::P2shP2wsh => {
            let redeem = p2wsh_script(&multisig);
            let output = p2sh_output_script(&redeem);
            (Some(redeem), Some(multisig), output)
        }
        AddressType::P2wsh => {
            let output = p2wsh_script(&multisig);
            (None, Some(multisig), output)
        }
    };

    let address = address_from_output_script(network, &output_script)?;
    Ok(GeneratedAddress {
        address,
        chain,
        index,
        address_type,
        redeem_script,
        witness_script,
        output_script,
    })
}

/// Inputs to [`verify_address`].
#[derive(Debug)]
pub struct AddressVerificationParams<'a> {
    pub address: &'a str,
    pub address_type: AddressType,
    pub keychains: &'a [Xpub],
    pub threshold: usize,
    /// Derivation chain as supplied by the caller; validated here.
    pub chain: Option<i64>,
    /// Derivation index as supplied by the caller; validated here.
    pub index: Option<i64>,
    /// Script data attached to the address record. Required to be present.
    pub coin_specific: Option<&'a AddressScripts>,
}

/// Prove that `address` belongs to the wallet by rederiving it.
pub fn verify_address(
    secp: &Secp256k1<All>,
    network: &Network,
    params: &AddressVerificationParams<'_>,
) -> Result<(), AddressError> {
    // The address must parse against this network before anything else.
    decode_address(network, params.address, false)?;

    let chain = validate_derivation_component("chain", params.chain)?;
    let index = validate_derivation_component("index", params.index)?;

    if params.coin_specific.is_none() {
        return Err(AddressError::InvalidAddressVerificationObjectProperty);
    }

    let derived = generate_address(
        secp,
        network,
        params.keychains,
        params.threshold,
        params.address_type,
        chain,
        index,
    )?;

    if derived.address != params.address {
        return Err(AddressError::UnexpectedAddress {
            expected: derived.address,
            actual: params.address.to_string(),
        });
    }
    Ok(())
}

fn validate_derivation_component(name: &str, value: Option<i64>) -> Result<u32, AddressError> {
    match value {
        Some(v) if v >= 0 && v <= u32::MAX as i64 => Ok(v as u32),
        Some(v) => Err(AddressError::InvalidAddressDerivationProperty(format!(
            "{} out of range: {}",
            name, v
        ))),
        None => Err(AddressError::InvalidAddressDerivationProperty(format!(
            "missing {}",
            name
        ))),
    }
}

/// Encode an output script as the canonical address for `network`.
pub fn address_from_output_script(
    network: &Network,
    script: &Script,
) -> Result<String, AddressError> {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        return Ok(encode_base58(network.pub_key_hash, &bytes[3..23]));
    }
    if script.is_p2sh() {
        return Ok(encode_base58(network.script_hash, &bytes[2..22]));
    }
    if script.is_p2wsh() || script.is_p2wpkh() {
        let hrp = network
            .bech32_hrp
            .ok_or(AddressError::UnencodableScript)?;
        let hrp = bech32::Hrp::parse(hrp)
            .map_err(|e| AddressError::InvalidAddress(e.to_string()))?;
        return bech32::segwit::encode_v0(hrp, &bytes[2..])
            .map_err(|e| AddressError::InvalidAddress(e.to_string()));
    }
    Err(AddressError::UnencodableScript)
}

/// Decode an address into its output script, checking version bytes and HRP
/// against `network`.
pub fn decode_address(
    network: &Network,
    address: &str,
    force_alt_script_support: bool,
) -> Result<ScriptBuf, AddressError> {
    if let Ok(payload) = bitcoin::base58::decode_check(address) {
        if payload.len() != 21 {
            return Err(AddressError::InvalidAddress(format!(
                "base58 payload length {}",
                payload.len()
            )));
        }
        let version = payload[0];
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..21]);

        if !network
            .allowed_versions(force_alt_script_support)
            .contains(&version)
        {
            return Err(AddressError::InvalidAddress(format!(
                "version byte {} not valid for {}",
                version, network.coin
            )));
        }
        if version == network.pub_key_hash {
            return Ok(ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array(
                hash,
            )));
        }
        return Ok(ScriptBuf::new_p2sh(&bitcoin::ScriptHash::from_byte_array(
            hash,
        )));
    }

    if let Ok((hrp, version, program)) = bech32::segwit::decode(address) {
        let expected = network
            .bech32_hrp
            .ok_or_else(|| AddressError::InvalidAddress("network has no bech32 prefix".into()))?;
        if hrp.to_string().to_lowercase() != expected {
            return Err(AddressError::InvalidAddress(format!(
                "bech32 prefix {} not valid for {}",
                hrp, network.coin
            )));
        }
        if version != bech32::Fe32::Q {
            return Err(AddressError::InvalidAddress(
                "unsupported witness version".into(),
            ));
        }
        return match program.len() {
            20 => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&program);
                Ok(ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array(hash)))
            }
            32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&program);
                Ok(ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::from_byte_array(hash)))
            }
            n => Err(AddressError::InvalidAddress(format!(
                "witness program length {}",
                n
            ))),
        };
    }

    Err(AddressError::InvalidAddress(address.to_string()))
}

/// Whether `address` is well-formed for `network`.
pub fn is_valid_address(network: &Network, address: &str, force_alt_script_support: bool) -> bool {
    decode_address(network, address, force_alt_script_support).is_ok()
}

fn encode_base58(version: u8, hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);
    bitcoin::base58::encode_check(&payload)
}
