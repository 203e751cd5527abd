//! Input signature-script decomposition
//!
//! Splits a signed (or half-signed) input into its signatures, public keys,
//! and the script the sighash commits to, across the three supported input
//! shapes:
//!
//! - legacy P2SH multisig: `scriptSig = OP_0 <sig…> <redeem>`
//! - P2SH-P2WSH: `scriptSig = <redeem>`, `witness = [<> <sig…> <witness>]`
//! - native P2WSH: empty `scriptSig`, `witness = [<> <sig…> <witness>]`
//!
//! For native segwit inputs there is no script to classify, so the parser
//! synthesizes a faux `OP_0 <SHA256(last witness element)>` script and
//! classifies that instead. The faux script is a verifier-side construct
//! only; it never appears on the wire. The returned `pub_script` is the
//! multisig program itself, which is what both sighash flavours commit to.

use crate::script::{decompile, parse_multisig, p2pkh_output_script, ScriptElement};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Script, ScriptBuf, Transaction, WScriptHash};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigScriptError {
    #[error("input index {0} out of bounds")]
    InputIndexOutOfBounds(usize),

    #[error("script decode failed: {0}")]
    Decode(String),

    #[error("unexpected signature script layout: {0}")]
    UnexpectedLayout(String),

    #[error(transparent)]
    Script(#[from] crate::script::ScriptError),
}

/// Standard input classification, mirroring output-script classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputClassification {
    ScriptHash,
    PubKeyHash,
    Nonstandard,
}

/// Decomposed signature data for one input.
#[derive(Debug, Clone)]
pub struct ParsedSignatureScript {
    /// Raw signature pushes in script order. Empty entries are placeholder
    /// slots left by incremental signing.
    pub signatures: Vec<Vec<u8>>,
    pub public_keys: Vec<PublicKey>,
    pub is_segwit_input: bool,
    pub is_bech32_input: bool,
    pub input_classification: InputClassification,
    /// The script the sighash commits to: the multisig program for
    /// script-hash inputs, the reconstructed output script for P2PKH.
    pub pub_script: ScriptBuf,
}

/// Decompose the signature data of `tx.input[input_index]`.
pub fn parse_signature_script(
    tx: &Transaction,
    input_index: usize,
) -> Result<ParsedSignatureScript, SigScriptError> {
    let input = tx
        .input
        .get(input_index)
        .ok_or(SigScriptError::InputIndexOutOfBounds(input_index))?;

    let is_segwit_input = !input.witness.is_empty();
    let is_bech32_input = is_segwit_input && input.script_sig.is_empty();

    // Elements carrying the signatures: witness items for segwit inputs,
    // the decompiled scriptSig otherwise.
    let elements: Vec<Vec<u8>> = if is_segwit_input {
        input.witness.iter().map(|item| item.to_vec()).collect()
    } else {
        decompile(&input.script_sig)?
            .into_iter()
            .map(|element| match element {
                ScriptElement::Bytes(bytes) => Ok(bytes),
                ScriptElement::Op(op) => Err(SigScriptError::UnexpectedLayout(format!(
                    "non-push opcode {:#x} in signature script",
                    op
                ))),
            })
            .collect::<Result<_, _>>()?
    };

    // The script that gets classified. Bech32 inputs have no scriptSig, so
    // classification runs against the synthesized faux script.
    let classified_script: ScriptBuf = if is_bech32_input {
        let witness_script = elements
            .last()
            .ok_or_else(|| SigScriptError::UnexpectedLayout("empty witness".into()))?;
        let hash = sha256::Hash::hash(witness_script);
        ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array(hash.to_byte_array()))
    } else {
        input.script_sig.clone()
    };

    let input_classification = classify_input(&classified_script);

    match input_classification {
        InputClassification::ScriptHash => {
            let pub_script = ScriptBuf::from_bytes(
                elements
                    .last()
                    .ok_or_else(|| {
                        SigScriptError::UnexpectedLayout("script-hash input with no pushes".into())
                    })?
                    .clone(),
            );
            // All but the final push are signature slots; the leading
            // CHECKMULTISIG dummy decompiles to an empty entry.
            let signatures = elements[..elements.len() - 1].to_vec();
            let (public_keys, _, _) = parse_multisig(&pub_script)?;
            Ok(ParsedSignatureScript {
                signatures,
                public_keys,
                is_segwit_input,
                is_bech32_input,
                input_classification,
                pub_script,
            })
        }
        InputClassification::PubKeyHash => {
            let [signature, pubkey_bytes] = elements.as_slice() else {
                return Err(SigScriptError::UnexpectedLayout(
                    "p2pkh input must carry exactly signature and pubkey".into(),
                ));
            };
            let signature = signature.clone();
            let public_key = PublicKey::from_slice(pubkey_bytes)
                .map_err(|e| SigScriptError::UnexpectedLayout(e.to_string()))?;
            let pub_script = p2pkh_output_script(&public_key);
            Ok(ParsedSignatureScript {
                signatures: vec![signature],
                public_keys: vec![public_key],
                is_segwit_input,
                is_bech32_input,
                input_classification,
                pub_script,
            })
        }
        InputClassification::Nonstandard => Ok(ParsedSignatureScript {
            signatures: Vec::new(),
            public_keys: Vec::new(),
            is_segwit_input,
            is_bech32_input,
            input_classification,
            pub_script: ScriptBuf::new(),
        }),
    }
}

/// Classify a signature script the way standard nodes do.
fn classify_input(script: &Script) -> InputClassification {
    // The faux script synthesized for bech32 inputs is a witness-script-hash
    // program; its 32-byte digest is not a parseable script, so it is
    // recognized by shape before the push rules below.
    if script.is_p2wsh() {
        return InputClassification::ScriptHash;
    }

    let elements = match decompile(script) {
        Ok(elements) => elements,
        Err(_) => return InputClassification::Nonstandard,
    };
    if elements.is_empty() {
        return InputClassification::Nonstandard;
    }

    let pushes: Option<Vec<&Vec<u8>>> = elements
        .iter()
        .map(|e| match e {
            ScriptElement::Bytes(bytes) => Some(bytes),
            ScriptElement::Op(_) => None,
        })
        .collect();
    let Some(pushes) = pushes else {
        return InputClassification::Nonstandard;
    };

    // `<sig> <pubkey>` spends a P2PKH output
    if pushes.len() == 2 && is_canonical_signature(pushes[0]) && is_canonical_pubkey(pushes[1]) {
        return InputClassification::PubKeyHash;
    }

    // Push-only script whose final element is itself a parseable script:
    // the canonical P2SH spend shape. A P2SH-P2WSH scriptSig is a single
    // redeem-script push.
    if let Some(last) = pushes.last() {
        if !last.is_empty() && Script::from_bytes(last).instructions().all(|i| i.is_ok()) {
            return InputClassification::ScriptHash;
        }
    }

    InputClassification::Nonstandard
}

fn is_canonical_signature(bytes: &[u8]) -> bool {
    bytes.len() >= 9 && bytes.len() <= 73 && bytes[0] == 0x30
}

fn is_canonical_pubkey(bytes: &[u8]) -> bool {
    match bytes.len() {
        33 => bytes[0] == 0x02 || bytes[0] == 0x03,
        65 => bytes[0] == 0x04,
        _ => false,
    }
}
