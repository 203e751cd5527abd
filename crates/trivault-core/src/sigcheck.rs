//! ECDSA signature verification against the correct sighash
//!
//! Works on fully- or half-signed transactions: placeholder slots are
//! skipped, and every remaining signature must verify against a distinct
//! public key from the input's multisig program. Callers can restrict the
//! check to a single signature slot or target one public key.

use crate::sigscript::{parse_signature_script, InputClassification};
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Script, Transaction};
use std::collections::HashSet;

/// Optional restrictions on [`verify_signature`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationSettings {
    /// Verify only the n-th non-placeholder signature.
    pub signature_index: Option<usize>,
    /// Require a signature by this specific public key.
    pub public_key: Option<PublicKey>,
}

/// Verify the signatures on `tx.input[input_index]`.
///
/// `amount` is the value of the spent output; it feeds the BIP143 digest
/// and is required for segwit inputs.
///
/// Without a target key, every non-placeholder signature must verify
/// against a distinct public key of the input's program. With
/// `settings.public_key`, the check passes as soon as any signature
/// verifies against that key.
pub fn verify_signature<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    amount: u64,
    settings: &VerificationSettings,
) -> bool {
    let parsed = match parse_signature_script(tx, input_index) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };

    match parsed.input_classification {
        InputClassification::ScriptHash | InputClassification::PubKeyHash => {}
        InputClassification::Nonstandard => return false,
    }

    // BIP143 digests commit to the input value; without it a segwit
    // signature cannot be checked.
    if parsed.is_segwit_input && amount == 0 {
        return false;
    }

    let mut signatures: Vec<&Vec<u8>> =
        parsed.signatures.iter().filter(|s| !s.is_empty()).collect();
    if let Some(index) = settings.signature_index {
        match signatures.get(index) {
            Some(signature) => signatures = vec![signature],
            None => return false,
        }
    }
    if signatures.is_empty() {
        return false;
    }

    let mut matched: HashSet<PublicKey> = HashSet::new();
    for signature in signatures {
        let Some((der, sighash_type)) = signature.split_last().map(|(t, der)| (der, *t)) else {
            return false;
        };
        let Ok(mut ecdsa_sig) = ecdsa::Signature::from_der(der) else {
            return false;
        };
        ecdsa_sig.normalize_s();

        let Some(message) = sighash_message(
            tx,
            input_index,
            &parsed.pub_script,
            amount,
            sighash_type,
            parsed.is_segwit_input,
        ) else {
            return false;
        };

        let mut matched_this_signature = false;
        for public_key in &parsed.public_keys {
            if matched.contains(public_key) {
                continue;
            }
            if let Some(target) = settings.public_key {
                if *public_key != target {
                    continue;
                }
            }
            if secp.verify_ecdsa(&message, &ecdsa_sig, public_key).is_ok() {
                if settings.public_key.is_some() {
                    return true;
                }
                matched.insert(*public_key);
                matched_this_signature = true;
                break;
            }
        }

        if settings.public_key.is_none() && !matched_this_signature {
            return false;
        }
    }

    // With a target key, reaching the end means no signature matched it.
    settings.public_key.is_none()
}

/// Compute the digest a signature with `sighash_type` committed to.
pub fn sighash_message(
    tx: &Transaction,
    input_index: usize,
    pub_script: &Script,
    amount: u64,
    sighash_type: u8,
    segwit: bool,
) -> Option<Message> {
    use bitcoin::hashes::Hash;

    let mut cache = SighashCache::new(tx);
    if segwit {
        let hash = cache
            .p2wsh_signature_hash(
                input_index,
                pub_script,
                Amount::from_sat(amount),
                EcdsaSighashType::from_consensus(sighash_type as u32),
            )
            .ok()?;
        Some(Message::from_digest(hash.to_byte_array()))
    } else {
        let hash = cache
            .legacy_signature_hash(input_index, pub_script, sighash_type as u32)
            .ok()?;
        Some(Message::from_digest(hash.to_byte_array()))
    }
}
