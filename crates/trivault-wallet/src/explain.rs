//! Transaction explanation
//!
//! Decodes a raw transaction into per-output `(address, amount)` records
//! and splits change from spend using a caller-supplied change-address
//! set. Outputs the network cannot encode as an address are reported by
//! script hex rather than aborting the explanation.
//!
//! Change detection here is presence-based only; the prebuild parser
//! re-verifies every output against the keychains and its verdict is the
//! authoritative one.

use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use trivault_core::address::address_from_output_script;
use trivault_core::network::Network;

#[derive(Error, Debug)]
pub enum ExplainError {
    #[error("invalid transaction hex: {0}")]
    InvalidHex(String),

    #[error("transaction decode failed: {0}")]
    Decode(String),
}

/// One decoded output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainedOutput {
    /// Canonical address, or the output script hex when the script has no
    /// address form on this network.
    pub address: String,
    pub amount: u64,
}

/// Structured view of a raw transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionExplanation {
    pub id: String,
    /// Spend outputs, in output order.
    pub outputs: Vec<ExplainedOutput>,
    /// Outputs matching the supplied change-address set, in output order.
    pub change_outputs: Vec<ExplainedOutput>,
    pub output_amount: u64,
    pub change_amount: u64,
    pub locktime: u32,
}

/// Decode a raw transaction from hex.
pub fn decode_transaction(tx_hex: &str) -> Result<Transaction, ExplainError> {
    let bytes = hex::decode(tx_hex).map_err(|e| ExplainError::InvalidHex(e.to_string()))?;
    deserialize(&bytes).map_err(|e| ExplainError::Decode(e.to_string()))
}

/// Explain a raw transaction, splitting change from spend outputs.
pub fn explain_transaction(
    network: &Network,
    tx_hex: &str,
    change_addresses: &HashSet<String>,
) -> Result<TransactionExplanation, ExplainError> {
    let tx = decode_transaction(tx_hex)?;

    let mut outputs = Vec::new();
    let mut change_outputs = Vec::new();
    for txout in &tx.output {
        let address = address_from_output_script(network, &txout.script_pubkey)
            .unwrap_or_else(|_| txout.script_pubkey.to_hex_string());
        let explained = ExplainedOutput {
            address,
            amount: txout.value.to_sat(),
        };
        if change_addresses.contains(&explained.address) {
            change_outputs.push(explained);
        } else {
            outputs.push(explained);
        }
    }

    let output_amount = outputs.iter().map(|o| o.amount).sum();
    let change_amount = change_outputs.iter().map(|o| o.amount).sum();

    Ok(TransactionExplanation {
        id: tx.compute_txid().to_string(),
        outputs,
        change_outputs,
        output_amount,
        change_amount,
        locktime: tx.lock_time.to_consensus_u32(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::consensus::encode::serialize_hex;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};
    use trivault_core::address::{decode_address, generate_address, AddressType, DEFAULT_THRESHOLD};
    use trivault_core::network::BITCOIN;

    fn test_addresses() -> Vec<String> {
        let secp = Secp256k1::new();
        let xpubs: Vec<_> = [21u8, 22, 23]
            .iter()
            .map(|seed| {
                let xprv =
                    bitcoin::bip32::Xpriv::new_master(bitcoin::NetworkKind::Main, &[*seed; 32])
                        .unwrap();
                bitcoin::bip32::Xpub::from_priv(&secp, &xprv)
            })
            .collect();
        (0..3)
            .map(|i| {
                generate_address(
                    &secp,
                    &BITCOIN,
                    &xpubs,
                    DEFAULT_THRESHOLD,
                    AddressType::P2sh,
                    0,
                    i,
                )
                .unwrap()
                .address
            })
            .collect()
    }

    fn tx_paying(addresses: &[(String, u64)]) -> String {
        let output = addresses
            .iter()
            .map(|(address, amount)| TxOut {
                value: Amount::from_sat(*amount),
                script_pubkey: decode_address(&BITCOIN, address, false).unwrap(),
            })
            .collect();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output,
        };
        serialize_hex(&tx)
    }

    #[test]
    fn test_explain_splits_change() {
        let addresses = test_addresses();
        let tx_hex = tx_paying(&[
            (addresses[0].clone(), 50_000),
            (addresses[1].clone(), 30_000),
            (addresses[2].clone(), 20_000),
        ]);

        let change: HashSet<String> = [addresses[1].clone()].into_iter().collect();
        let explanation = explain_transaction(&BITCOIN, &tx_hex, &change).unwrap();

        assert_eq!(explanation.outputs.len(), 2);
        assert_eq!(explanation.change_outputs.len(), 1);
        assert_eq!(explanation.output_amount, 70_000);
        assert_eq!(explanation.change_amount, 30_000);
        assert_eq!(explanation.change_outputs[0].address, addresses[1]);
    }

    #[test]
    fn test_explain_no_change_set() {
        let addresses = test_addresses();
        let tx_hex = tx_paying(&[(addresses[0].clone(), 10_000)]);

        let explanation = explain_transaction(&BITCOIN, &tx_hex, &HashSet::new()).unwrap();
        assert_eq!(explanation.outputs.len(), 1);
        assert!(explanation.change_outputs.is_empty());
    }

    #[test]
    fn test_nonstandard_output_reported_as_script_hex() {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(0),
                script_pubkey: ScriptBuf::new_op_return([0xde, 0xad]),
            }],
        };
        let explanation =
            explain_transaction(&BITCOIN, &serialize_hex(&tx), &HashSet::new()).unwrap();
        assert_eq!(explanation.outputs.len(), 1);
        // OP_RETURN 0xdead
        assert_eq!(explanation.outputs[0].address, "6a02dead");
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(matches!(
            explain_transaction(&BITCOIN, "zz", &HashSet::new()),
            Err(ExplainError::InvalidHex(_))
        ));
        assert!(matches!(
            explain_transaction(&BITCOIN, "0011", &HashSet::new()),
            Err(ExplainError::Decode(_))
        ));
    }
}
