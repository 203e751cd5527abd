//! Multisig script codec
//!
//! Builds and decomposes the three output classes the wallet owns:
//!
//! - **P2SH**: `redeem = OP_m <pk…> OP_n OP_CHECKMULTISIG`,
//!   `output = OP_HASH160 <HASH160(redeem)> OP_EQUAL`
//! - **P2SH-P2WSH**: `witness = multisig`, `redeem = OP_0 <SHA256(witness)>`,
//!   `output = OP_HASH160 <HASH160(redeem)> OP_EQUAL`
//! - **P2WSH**: `witness = multisig`, `output = OP_0 <SHA256(witness)>`

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Script, ScriptBuf, WScriptHash};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("invalid multisig threshold {m} of {n}")]
    InvalidThreshold { m: usize, n: usize },

    #[error("script decode failed: {0}")]
    Decode(String),

    #[error("not a multisig program")]
    NotMultisig,

    #[error("invalid public key in script: {0}")]
    InvalidPublicKey(String),

    #[error("push too large for script")]
    OversizePush,
}

/// A decompiled script element: either pushed data or a bare opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptElement {
    /// Pushed bytes. `OP_0` decompiles to an empty push.
    Bytes(Vec<u8>),
    /// Any non-push opcode.
    Op(u8),
}

/// Decompile a script into its elements.
pub fn decompile(script: &Script) -> Result<Vec<ScriptElement>, ScriptError> {
    let mut elements = Vec::new();
    for instruction in script.instructions() {
        match instruction.map_err(|e| ScriptError::Decode(e.to_string()))? {
            Instruction::PushBytes(bytes) => {
                elements.push(ScriptElement::Bytes(bytes.as_bytes().to_vec()))
            }
            Instruction::Op(op) => elements.push(ScriptElement::Op(op.to_u8())),
        }
    }
    Ok(elements)
}

/// Build the `OP_m <pk…> OP_n OP_CHECKMULTISIG` program.
///
/// Keys are included in the order given; callers that need a canonical
/// ordering sort before calling.
pub fn multisig_script(pubkeys: &[PublicKey], threshold: usize) -> Result<ScriptBuf, ScriptError> {
    if threshold == 0 || threshold > pubkeys.len() || pubkeys.len() > 16 {
        return Err(ScriptError::InvalidThreshold {
            m: threshold,
            n: pubkeys.len(),
        });
    }

    let mut builder = Builder::new().push_int(threshold as i64);
    for pk in pubkeys {
        builder = builder.push_slice(pk.serialize());
    }
    Ok(builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Decompose a multisig program into `(pubkeys, m, n)`.
pub fn parse_multisig(script: &Script) -> Result<(Vec<PublicKey>, usize, usize), ScriptError> {
    let elements = decompile(script)?;
    if elements.len() < 4 {
        return Err(ScriptError::NotMultisig);
    }

    let m = small_int(&elements[0]).ok_or(ScriptError::NotMultisig)?;
    let n = small_int(&elements[elements.len() - 2]).ok_or(ScriptError::NotMultisig)?;
    if elements[elements.len() - 1] != ScriptElement::Op(OP_CHECKMULTISIG.to_u8()) {
        return Err(ScriptError::NotMultisig);
    }

    let key_elements = &elements[1..elements.len() - 2];
    if key_elements.len() != n || m == 0 || m > n {
        return Err(ScriptError::NotMultisig);
    }

    let mut pubkeys = Vec::with_capacity(n);
    for element in key_elements {
        match element {
            ScriptElement::Bytes(bytes) => pubkeys.push(
                PublicKey::from_slice(bytes)
                    .map_err(|e| ScriptError::InvalidPublicKey(e.to_string()))?,
            ),
            ScriptElement::Op(_) => return Err(ScriptError::NotMultisig),
        }
    }
    Ok((pubkeys, m, n))
}

/// `OP_PUSHNUM_1..16` → its value.
fn small_int(element: &ScriptElement) -> Option<usize> {
    match element {
        ScriptElement::Op(op) if (0x51..=0x60).contains(op) => Some((op - 0x50) as usize),
        _ => None,
    }
}

/// `OP_HASH160 <HASH160(redeem)> OP_EQUAL`
pub fn p2sh_output_script(redeem_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2sh(&redeem_script.script_hash())
}

/// `OP_0 <SHA256(witness_script)>` — used both as the P2WSH output script
/// and as the redeem script of a P2SH-wrapped P2WSH output.
pub fn p2wsh_script(witness_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&WScriptHash::hash(witness_script.as_bytes()))
}

/// `OP_DUP OP_HASH160 <HASH160(pk)> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_output_script(pubkey: &PublicKey) -> ScriptBuf {
    let hash = bitcoin::PublicKey::new(*pubkey).pubkey_hash();
    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Push arbitrary bytes through the 520-byte script push limit.
pub fn push_data(data: &[u8]) -> Result<PushBytesBuf, ScriptError> {
    PushBytesBuf::try_from(data.to_vec()).map_err(|_| ScriptError::OversizePush)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_pubkeys(n: usize) -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        (1..=n as u8)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                PublicKey::from_secret_key(&secp, &sk)
            })
            .collect()
    }

    #[test]
    fn test_multisig_roundtrip() {
        let keys = test_pubkeys(3);
        let script = multisig_script(&keys, 2).unwrap();

        let (parsed, m, n) = parse_multisig(&script).unwrap();
        assert_eq!(m, 2);
        assert_eq!(n, 3);
        assert_eq!(parsed, keys);
    }

    #[test]
    fn test_multisig_script_shape() {
        // 2-of-3: OP_2 + 3×(push + 33 bytes) + OP_3 + OP_CHECKMULTISIG
        let script = multisig_script(&test_pubkeys(3), 2).unwrap();
        assert_eq!(script.len(), 1 + 3 * 34 + 1 + 1);
        assert!(script.is_multisig());
    }

    #[test]
    fn test_invalid_thresholds() {
        let keys = test_pubkeys(3);
        assert!(matches!(
            multisig_script(&keys, 0),
            Err(ScriptError::InvalidThreshold { m: 0, n: 3 })
        ));
        assert!(matches!(
            multisig_script(&keys, 4),
            Err(ScriptError::InvalidThreshold { m: 4, n: 3 })
        ));
    }

    #[test]
    fn test_parse_rejects_non_multisig() {
        let keys = test_pubkeys(1);
        let p2pkh = p2pkh_output_script(&keys[0]);
        assert!(matches!(parse_multisig(&p2pkh), Err(ScriptError::NotMultisig)));
    }

    #[test]
    fn test_output_script_classes() {
        let redeem = multisig_script(&test_pubkeys(3), 2).unwrap();

        assert!(p2sh_output_script(&redeem).is_p2sh());
        assert!(p2wsh_script(&redeem).is_p2wsh());

        // The wrapped redeem script is itself hashed into a P2SH output
        let wrapped_redeem = p2wsh_script(&redeem);
        assert!(p2sh_output_script(&wrapped_redeem).is_p2sh());
    }

    #[test]
    fn test_decompile_empty_push() {
        // OP_0 decompiles to an empty push, which the signature parser
        // treats as a placeholder slot
        let script = Builder::new().push_int(0).into_script();
        let elements = decompile(&script).unwrap();
        assert_eq!(elements, vec![ScriptElement::Bytes(vec![])]);
    }
}
