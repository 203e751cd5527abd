//! Multisig input signing
//!
//! Builds incremental (half-signed) or final signature scripts for the
//! three supported input shapes. Signature slots are keyed by the position
//! of the matching public key in the multisig program, so re-signing an
//! input with a key that already signed is a no-op rather than a
//! double-sign, and cosigners can complete a half-signed input without
//! disturbing existing signatures.

use crate::address::AddressType;
use crate::script::{parse_multisig, push_data, ScriptError};
use crate::sigcheck::sighash_message;
use crate::sigscript::parse_signature_script;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid, Witness};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("unspent carries no spendable script")]
    MissingScripts,

    #[error("signing key is not part of the multisig program")]
    KeyNotInScript,

    #[error("input has {have} of {need} required signatures")]
    MissingSignatures { have: usize, need: usize },

    #[error("existing signature does not verify against the program")]
    InvalidExistingSignature,

    #[error("invalid unspent txid: {0}")]
    InvalidTxid(String),

    #[error("sighash computation failed")]
    Sighash,

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// An unspent output owned by the wallet.
///
/// `witness_script` is present for P2SH-P2WSH and P2WSH unspents;
/// `redeem_script` for P2SH and P2SH-P2WSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unspent {
    pub txid: String,
    pub output_index: u32,
    pub value: u64,
    pub address: String,
    pub chain: u32,
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
}

impl Unspent {
    pub fn outpoint(&self) -> Result<OutPoint, SignError> {
        let txid =
            Txid::from_str(&self.txid).map_err(|_| SignError::InvalidTxid(self.txid.clone()))?;
        Ok(OutPoint {
            txid,
            vout: self.output_index,
        })
    }

    /// Address type implied by which scripts are attached.
    pub fn address_type(&self) -> Result<AddressType, SignError> {
        match (&self.redeem_script, &self.witness_script) {
            (Some(_), Some(_)) => Ok(AddressType::P2shP2wsh),
            (Some(_), None) => Ok(AddressType::P2sh),
            (None, Some(_)) => Ok(AddressType::P2wsh),
            (None, None) => Err(SignError::MissingScripts),
        }
    }

    fn redeem_script_bytes(&self) -> Result<Option<ScriptBuf>, SignError> {
        decode_script_hex(self.redeem_script.as_deref())
    }

    fn witness_script_bytes(&self) -> Result<Option<ScriptBuf>, SignError> {
        decode_script_hex(self.witness_script.as_deref())
    }
}

fn decode_script_hex(script: Option<&str>) -> Result<Option<ScriptBuf>, SignError> {
    match script {
        None => Ok(None),
        Some(hex_script) => {
            let bytes = hex::decode(hex_script)
                .map_err(|e| SignError::Script(ScriptError::Decode(e.to_string())))?;
            Ok(Some(ScriptBuf::from_bytes(bytes)))
        }
    }
}

/// Apply one signature to `tx.input[input_index]`.
///
/// With `is_last_signature` the input must end up with the full threshold
/// of signatures; otherwise missing cosigner slots are serialized as
/// placeholders for a later signing pass.
pub fn sign_input(
    secp: &Secp256k1<All>,
    tx: &mut Transaction,
    input_index: usize,
    unspent: &Unspent,
    key: &SecretKey,
    sighash_type: EcdsaSighashType,
    is_last_signature: bool,
) -> Result<(), SignError> {
    let address_type = unspent.address_type()?;
    let segwit = address_type != AddressType::P2sh;

    // The multisig program every sighash flavour commits to.
    let program = match address_type {
        AddressType::P2sh => unspent.redeem_script_bytes()?.ok_or(SignError::MissingScripts)?,
        AddressType::P2shP2wsh | AddressType::P2wsh => unspent
            .witness_script_bytes()?
            .ok_or(SignError::MissingScripts)?,
    };
    let (public_keys, threshold, _) = parse_multisig(&program)?;

    let signing_pubkey = PublicKey::from_secret_key(secp, key);
    if !public_keys.contains(&signing_pubkey) {
        return Err(SignError::KeyNotInScript);
    }

    // Collect signatures already present, slotted by program key order.
    let mut slots: Vec<Option<Vec<u8>>> = vec![None; public_keys.len()];
    let existing: Vec<Vec<u8>> = match parse_signature_script(tx, input_index) {
        Ok(parsed) => parsed.signatures.into_iter().filter(|s| !s.is_empty()).collect(),
        Err(_) => Vec::new(),
    };
    for signature in existing {
        let slot = match_signature_to_key(secp, tx, input_index, &program, unspent.value, segwit, &signature, &public_keys, &slots)?;
        slots[slot] = Some(signature);
    }

    // Sign unless this key's slot is already filled (idempotent re-sign).
    let our_slot = public_keys
        .iter()
        .position(|pk| *pk == signing_pubkey)
        .expect("membership checked above");
    if slots[our_slot].is_none() {
        let message = sighash_message(
            tx,
            input_index,
            &program,
            unspent.value,
            sighash_type.to_u32() as u8,
            segwit,
        )
        .ok_or(SignError::Sighash)?;
        let mut signature = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
        signature.push(sighash_type.to_u32() as u8);
        slots[our_slot] = Some(signature);
    }

    let present: Vec<&Vec<u8>> = slots.iter().flatten().collect();
    if is_last_signature && present.len() != threshold {
        return Err(SignError::MissingSignatures {
            have: present.len(),
            need: threshold,
        });
    }
    let placeholders = threshold.saturating_sub(present.len());

    match address_type {
        AddressType::P2sh => {
            let mut builder = Builder::new().push_int(0);
            for signature in &present {
                builder = builder.push_slice(push_data(signature)?);
            }
            for _ in 0..placeholders {
                builder = builder.push_int(0);
            }
            tx.input[input_index].script_sig = builder
                .push_slice(push_data(program.as_bytes())?)
                .into_script();
            tx.input[input_index].witness = Witness::new();
        }
        AddressType::P2shP2wsh | AddressType::P2wsh => {
            let mut witness = Witness::new();
            witness.push([0u8; 0]);
            for signature in &present {
                witness.push(signature.as_slice());
            }
            for _ in 0..placeholders {
                witness.push([0u8; 0]);
            }
            witness.push(program.as_bytes());
            tx.input[input_index].witness = witness;

            if address_type == AddressType::P2shP2wsh {
                let redeem = unspent
                    .redeem_script_bytes()?
                    .ok_or(SignError::MissingScripts)?;
                tx.input[input_index].script_sig = Builder::new()
                    .push_slice(push_data(redeem.as_bytes())?)
                    .into_script();
            } else {
                // Native segwit spends are witness-only.
                tx.input[input_index].script_sig = ScriptBuf::new();
            }
        }
    }

    Ok(())
}

/// Find which program key an existing signature belongs to.
#[allow(clippy::too_many_arguments)]
fn match_signature_to_key(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    program: &ScriptBuf,
    value: u64,
    segwit: bool,
    signature: &[u8],
    public_keys: &[PublicKey],
    slots: &[Option<Vec<u8>>],
) -> Result<usize, SignError> {
    let (sighash_type, der) = signature
        .split_last()
        .ok_or(SignError::InvalidExistingSignature)?;
    let mut ecdsa_sig = bitcoin::secp256k1::ecdsa::Signature::from_der(der)
        .map_err(|_| SignError::InvalidExistingSignature)?;
    ecdsa_sig.normalize_s();
    let message = sighash_message(tx, input_index, program, value, *sighash_type, segwit)
        .ok_or(SignError::Sighash)?;

    for (slot, public_key) in public_keys.iter().enumerate() {
        if slots[slot].is_some() {
            continue;
        }
        if secp.verify_ecdsa(&message, &ecdsa_sig, public_key).is_ok() {
            return Ok(slot);
        }
    }
    Err(SignError::InvalidExistingSignature)
}
