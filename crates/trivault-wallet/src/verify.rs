//! Prebuild verification
//!
//! The last gate before signing. A prebuild passes only when:
//!
//! 1. the keychain triple provably belongs together — the user's private
//!    key matches its published public key, and the backup/bitgo public
//!    keys carry valid signed-message endorsements by the user key;
//! 2. every intended recipient appears in the decoded outputs;
//! 3. the implicit external spend (server-added pay-as-you-go outputs)
//!    stays within 150 basis points of the explicit external spend;
//! 4. inputs cover outputs, with input amounts proven from previous
//!    transactions rather than taken from the server's word.

use crate::error::WalletError;
use crate::explain::decode_transaction;
use crate::keychain::{Keychains, KeySignatures};
use crate::parse::{parse_transaction, ParseTransactionParams};
use crate::service::{Explorer, ReqId, WalletService};
use crate::types::{ParsedTransaction, TxPrebuild};
use bitcoin::absolute::LockTime;
use bitcoin::bip32::Xpub;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::sign_message::{signed_msg_hash, MessageSignature};
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use trivault_core::network::Network;

/// Implicit external spend allowance: 150 bps of the explicit external
/// spend.
const PAYGO_LIMIT_BASIS_POINTS: u128 = 150;

/// Verify a prebuild end to end. Returns the parsed verdict so callers can
/// surface the classification alongside the pass.
pub async fn verify_transaction(
    network: &Network,
    service: &dyn WalletService,
    explorer: &dyn Explorer,
    params: &ParseTransactionParams<'_>,
    req_id: &ReqId,
) -> Result<ParsedTransaction, WalletError> {
    let parsed = parse_transaction(network, service, params, req_id).await?;
    let secp = Secp256k1::new();

    match &parsed.key_signatures {
        Some(signatures) => verify_key_signatures(
            &secp,
            &parsed.keychains,
            signatures,
            params.tx_params.wallet_passphrase.as_deref(),
        )?,
        None => {
            if params.verification.disable_networking {
                return Err(WalletError::KeychainIntegrityFailure(
                    "keychain provenance cannot be checked offline without key signatures".into(),
                ));
            }
            log::warn!(
                "[{}] user keychain carries no key signatures; provenance not checked",
                req_id
            );
        }
    }

    if !parsed.missing_outputs.is_empty() {
        return Err(WalletError::MissingRecipients(parsed.missing_outputs));
    }

    let limit = (parsed.explicit_external_spend_amount as u128 * PAYGO_LIMIT_BASIS_POINTS
        / 10_000) as u64;
    if parsed.implicit_external_spend_amount > limit {
        return Err(WalletError::ImplicitSpendLimitExceeded {
            implicit: parsed.implicit_external_spend_amount,
            limit,
        });
    }

    let total_inputs = total_input_amount(
        params.tx_prebuild,
        explorer,
        params.verification.disable_networking,
        req_id,
    )
    .await?;
    let total_outputs: u64 = decode_transaction(&params.tx_prebuild.tx_hex)?
        .output
        .iter()
        .map(|o| o.value.to_sat())
        .sum();
    if total_outputs > total_inputs {
        return Err(WalletError::NegativeFee {
            total_inputs,
            total_outputs,
        });
    }

    log::info!(
        "[{}] prebuild verified: {} sat in, {} sat out, implicit external {} sat",
        req_id,
        total_inputs,
        total_outputs,
        parsed.implicit_external_spend_amount
    );
    Ok(parsed)
}

/// Prove the keychain triple belongs together.
///
/// The endorsements use Bitcoin signed-message format with the BTC mainnet
/// magic prefix on every coin; the signing address is the legacy P2PKH
/// encoding of the user xpub's own key.
pub fn verify_key_signatures(
    secp: &Secp256k1<All>,
    keychains: &Keychains,
    key_signatures: &KeySignatures,
    wallet_passphrase: Option<&str>,
) -> Result<(), WalletError> {
    let published = keychains
        .user
        .xpub()
        .map_err(|e| WalletError::KeychainIntegrityFailure(e.to_string()))?;
    let xprv = keychains
        .user
        .xprv(wallet_passphrase)
        .map_err(|e| WalletError::KeychainIntegrityFailure(format!("user private key: {}", e)))?;

    if Xpub::from_priv(secp, &xprv) != published {
        return Err(WalletError::KeychainIntegrityFailure(
            "user private key does not match published public key".into(),
        ));
    }

    let signing_address = bitcoin::Address::p2pkh(
        bitcoin::PublicKey::new(published.public_key),
        bitcoin::NetworkKind::Main,
    );

    let endorsements = [
        (
            "backup",
            &keychains.backup.pub_key,
            &key_signatures.backup_pub_sig,
        ),
        (
            "bitgo",
            &keychains.bitgo.pub_key,
            &key_signatures.bitgo_pub_sig,
        ),
    ];
    for (label, pub_key, signature) in endorsements {
        let msg_hash = signed_msg_hash(pub_key);
        let signature = MessageSignature::from_base64(signature).map_err(|e| {
            WalletError::KeychainIntegrityFailure(format!("{} key signature malformed: {}", label, e))
        })?;
        let valid = signature
            .is_signed_by_address(secp, &signing_address, msg_hash)
            .map_err(|e| {
                WalletError::KeychainIntegrityFailure(format!(
                    "{} key signature unverifiable: {}",
                    label, e
                ))
            })?;
        if !valid {
            return Err(WalletError::KeychainIntegrityFailure(format!(
                "{} public key was not endorsed by the user key",
                label
            )));
        }
    }
    Ok(())
}

/// Sum the values of all spent outputs, proving each against the previous
/// transaction it came from.
///
/// Previous transactions come from the prebuild when attached; the rest
/// are fetched once per txid from the explorer. The response cache lives
/// only for this call.
async fn total_input_amount(
    prebuild: &TxPrebuild,
    explorer: &dyn Explorer,
    disable_networking: bool,
    req_id: &ReqId,
) -> Result<u64, WalletError> {
    let tx = decode_transaction(&prebuild.tx_hex)?;

    let needed: HashSet<String> = tx
        .input
        .iter()
        .map(|input| input.previous_output.txid.to_string())
        .collect();

    // Output values by txid, seeded from the prebuild's attached hexes.
    let mut output_values: HashMap<String, Vec<u64>> = HashMap::new();
    for txid in &needed {
        let Some(prev_hex) = prebuild.tx_info.tx_hexes.get(txid) else {
            continue;
        };
        let prev_tx = decode_transaction(prev_hex)?;
        let actual = prev_tx.compute_txid().to_string();
        if actual != *txid {
            return Err(WalletError::PrevTxMismatch {
                expected: txid.clone(),
                actual,
            });
        }
        output_values.insert(
            txid.clone(),
            prev_tx.output.iter().map(|o| o.value.to_sat()).collect(),
        );
    }

    let missing: Vec<&String> = needed
        .iter()
        .filter(|txid| !output_values.contains_key(*txid))
        .collect();
    if !missing.is_empty() {
        if disable_networking {
            return Err(WalletError::NetworkingDisabled(format!(
                "{} previous transaction(s) not attached to prebuild",
                missing.len()
            )));
        }
        log::debug!(
            "[{}] fetching {} previous transaction(s) from explorer",
            req_id,
            missing.len()
        );
        let fetched = try_join_all(
            missing
                .iter()
                .map(|txid| explorer.transaction_outputs(txid, req_id)),
        )
        .await?;
        for (txid, outputs) in missing.into_iter().zip(fetched) {
            output_values.insert(txid.clone(), outputs.iter().map(|o| o.value).collect());
        }
    }

    let mut total = 0u64;
    for input in &tx.input {
        let txid = input.previous_output.txid.to_string();
        let value = output_values
            .get(&txid)
            .and_then(|values| values.get(input.previous_output.vout as usize))
            .ok_or_else(|| WalletError::PrevTxMismatch {
                expected: format!("{}:{}", txid, input.previous_output.vout),
                actual: "output not present in previous transaction".into(),
            })?;
        total += value;
    }
    Ok(total)
}

/// Pin a prebuild to the chain tip: `locktime = height + 1`, re-serialized.
pub async fn postprocess_prebuild(
    explorer: &dyn Explorer,
    tx_hex: &str,
    req_id: &ReqId,
) -> Result<String, WalletError> {
    let mut tx = decode_transaction(tx_hex)?;
    let height = explorer.latest_block_height(req_id).await?;
    tx.lock_time = LockTime::from_consensus(height as u32 + 1);
    Ok(serialize_hex(&tx))
}
