//! Trivault Recovery
//!
//! Cold recovery for 2-of-3 multisig wallets: rederive the wallet's
//! addresses from the three extended keys, scan a public explorer for
//! funds, and build a sweep to a destination address. Three modes,
//! selected by which private keys the caller actually holds:
//!
//! - **full sweep** — user and backup xprv: the sweep is cosigned and
//!   broadcast-ready;
//! - **KRS** — user xprv, backup xpub held by a key recovery service: the
//!   sweep is half-signed and carries the provider's fee output;
//! - **unsigned sweep** — xpubs only: an unsigned transaction in the
//!   offline-vault format, to be signed on an air-gapped machine.

pub mod krs;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use thiserror::Error;
use trivault_core::address::{decode_address, generate_address, AddressType, DEFAULT_THRESHOLD};
use trivault_core::derivation::derive_leaf_privkey;
use trivault_core::network::Network;
use trivault_core::sigcheck::{verify_signature, VerificationSettings};
use trivault_core::signer::{sign_input, Unspent};
use trivault_wallet::service::{Explorer, PriceFeed, ReqId, ServiceError};

/// Virtual sizes used for the sweep fee estimate.
const TX_OVERHEAD_SIZE: u64 = 10;
const TX_OUTPUT_SIZE: u64 = 34;
const TX_P2SH_INPUT_SIZE: u64 = 296;

/// Fallback fee rate when the caller does not supply one.
const DEFAULT_FEE_PER_BYTE: u64 = 100;

/// Consecutive unused addresses before a chain is considered exhausted.
const DEFAULT_SCAN_WINDOW: u32 = 20;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("invalid {role} key: {reason}")]
    InvalidKey { role: &'static str, reason: String },

    #[error("invalid recovery destination: {0}")]
    InvalidDestination(String),

    #[error("no recoverable funds found")]
    NoRecoverableFunds,

    #[error("recovered amount {available} does not cover costs {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("explorer unavailable: {0}")]
    ExplorerUnavailable(String),

    #[error("unknown key recovery service provider: {0}")]
    UnknownKrsProvider(String),

    #[error("krs provider does not support {0}")]
    UnsupportedKrsCoin(String),

    #[error("fee structure {0} not implemented")]
    FeeStructureNotImplemented(String),

    #[error("signing failed on input {input_index}: {reason}")]
    Signing { input_index: usize, reason: String },

    #[error(transparent)]
    Address(#[from] trivault_core::address::AddressError),

    #[error(transparent)]
    Derivation(#[from] trivault_core::derivation::DerivationError),
}

/// Inputs to [`recover`].
#[derive(Debug)]
pub struct RecoverParams<'a> {
    pub user_key: &'a str,
    pub backup_key: &'a str,
    pub bitgo_key: &'a str,
    pub recovery_destination: &'a str,
    /// Dry-streak window; defaults to [`DEFAULT_SCAN_WINDOW`].
    pub scan: Option<u32>,
    /// Address types to skip. Defaults to `[P2wsh]` — native segwit
    /// recovery is opt-in.
    pub ignore_address_types: Option<Vec<AddressType>>,
    /// KRS provider name when the backup key is custodial.
    pub krs_provider: Option<&'a str>,
    pub fee_per_byte: Option<u64>,
}

/// A signed (or half-signed) sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedRecovery {
    pub tx_hex: String,
    pub input_amount: u64,
    pub recovery_amount: u64,
    pub fee: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub krs_fee: Option<u64>,
}

/// Offline-vault export of an unsigned sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineVault {
    pub tx_hex: String,
    pub tx_info: OfflineVaultTxInfo,
    pub fee_info: FeeInfo,
    pub coin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineVaultTxInfo {
    pub unspents: Vec<OfflineVaultUnspent>,
}

/// Placeholder for fee metadata filled in by the offline signer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeInfo {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineVaultUnspent {
    pub chain: u32,
    pub index: u32,
    /// Derivation suffix under the keychain root; chain and index sit at
    /// positions 3 and 4 of `m/0/0/<chain>/<index>`.
    pub chain_path: String,
    pub address: String,
    pub txid: String,
    pub output_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
    pub value: u64,
}

/// Outcome of a recovery run.
#[derive(Debug, Clone)]
pub enum RecoveryTransaction {
    /// Broadcastable (full sweep) or ready for the KRS cosigner.
    Signed(SignedRecovery),
    /// Unsigned, in offline-vault format.
    Unsigned(OfflineVault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryMode {
    FullSweep,
    Krs,
    UnsignedSweep,
}

struct RecoveryKey {
    xpub: Xpub,
    xprv: Option<Xpriv>,
}

fn parse_key(
    secp: &Secp256k1<All>,
    role: &'static str,
    key: &str,
) -> Result<RecoveryKey, RecoveryError> {
    if let Ok(xprv) = Xpriv::from_str(key) {
        return Ok(RecoveryKey {
            xpub: Xpub::from_priv(secp, &xprv),
            xprv: Some(xprv),
        });
    }
    match Xpub::from_str(key) {
        Ok(xpub) => Ok(RecoveryKey { xpub, xprv: None }),
        Err(e) => Err(RecoveryError::InvalidKey {
            role,
            reason: e.to_string(),
        }),
    }
}

fn detect_mode(
    user: &RecoveryKey,
    backup: &RecoveryKey,
    krs_provider: Option<&str>,
) -> Result<RecoveryMode, RecoveryError> {
    match (&user.xprv, &backup.xprv) {
        (Some(_), Some(_)) => Ok(RecoveryMode::FullSweep),
        (Some(_), None) if krs_provider.is_some() => Ok(RecoveryMode::Krs),
        (Some(_), None) => Err(RecoveryError::InvalidKey {
            role: "backup",
            reason: "xpub backup key requires a KRS provider".into(),
        }),
        (None, None) => Ok(RecoveryMode::UnsignedSweep),
        (None, Some(_)) => Err(RecoveryError::InvalidKey {
            role: "user",
            reason: "backup xprv without user xprv is not a supported recovery".into(),
        }),
    }
}

/// Scan the explorer and sweep recovered funds to the destination.
pub async fn recover(
    network: &Network,
    explorer: &dyn Explorer,
    price_feed: Option<&dyn PriceFeed>,
    params: &RecoverParams<'_>,
    req_id: &ReqId,
) -> Result<RecoveryTransaction, RecoveryError> {
    let secp = Secp256k1::new();

    let user = parse_key(&secp, "user", params.user_key)?;
    let backup = parse_key(&secp, "backup", params.backup_key)?;
    let bitgo = parse_key(&secp, "bitgo", params.bitgo_key)?;
    let mode = detect_mode(&user, &backup, params.krs_provider)?;

    let destination_script = decode_address(network, params.recovery_destination, false)
        .map_err(|e| RecoveryError::InvalidDestination(e.to_string()))?;

    let xpubs = [user.xpub, backup.xpub, bitgo.xpub];
    let scan_window = params.scan.unwrap_or(DEFAULT_SCAN_WINDOW);
    let ignored = params
        .ignore_address_types
        .clone()
        .unwrap_or_else(|| vec![AddressType::P2wsh]);

    let unspents = scan_unspents(
        &secp, network, &xpubs, explorer, scan_window, &ignored, req_id,
    )
    .await?;
    let input_amount: u64 = unspents.iter().map(|u| u.value).sum();
    if input_amount == 0 {
        return Err(RecoveryError::NoRecoverableFunds);
    }
    log::info!(
        "[{}] found {} unspents totalling {} sat",
        req_id,
        unspents.len(),
        input_amount
    );

    let krs_entry = match (mode, params.krs_provider) {
        (RecoveryMode::Krs, Some(name)) => Some(krs::provider(name)?),
        _ => None,
    };
    let krs_fee = match krs_entry {
        Some(entry) => {
            let feed = price_feed.ok_or_else(|| {
                RecoveryError::ExplorerUnavailable("no market price feed configured".into())
            })?;
            Some(krs::calculate_fee(entry, network.coin, feed, req_id).await?)
        }
        None => None,
    };

    let output_count = if krs_fee.is_some() { 2 } else { 1 };
    let fee_per_byte = params.fee_per_byte.unwrap_or(DEFAULT_FEE_PER_BYTE);
    let fee = (TX_OVERHEAD_SIZE
        + TX_OUTPUT_SIZE * output_count
        + TX_P2SH_INPUT_SIZE * unspents.len() as u64)
        * fee_per_byte;

    let costs = fee + krs_fee.unwrap_or(0);
    let recovery_amount = input_amount
        .checked_sub(costs)
        .ok_or(RecoveryError::InsufficientFunds {
            available: input_amount,
            required: costs,
        })?;

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(recovery_amount),
        script_pubkey: destination_script,
    }];
    if let (Some(entry), Some(krs_fee)) = (krs_entry, krs_fee) {
        let fee_address = entry.fee_address(network.coin)?;
        outputs.push(TxOut {
            value: Amount::from_sat(krs_fee),
            script_pubkey: decode_address(network, fee_address, false)
                .map_err(|e| RecoveryError::InvalidDestination(e.to_string()))?,
        });
    }

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: unspents
            .iter()
            .enumerate()
            .map(|(input_index, unspent)| {
                Ok(TxIn {
                    previous_output: unspent.outpoint().map_err(|e| RecoveryError::Signing {
                        input_index,
                        reason: e.to_string(),
                    })?,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<_, RecoveryError>>()?,
        output: outputs,
    };

    if mode == RecoveryMode::UnsignedSweep {
        return Ok(RecoveryTransaction::Unsigned(offline_vault(
            network, &tx, &unspents,
        )));
    }

    let user_xprv = user.xprv.as_ref().ok_or(RecoveryError::InvalidKey {
        role: "user",
        reason: "private key required for signing".into(),
    })?;
    sign_sweep(&secp, network, &mut tx, &unspents, user_xprv, false)?;
    if mode == RecoveryMode::FullSweep {
        let backup_xprv = backup.xprv.as_ref().ok_or(RecoveryError::InvalidKey {
            role: "backup",
            reason: "private key required for signing".into(),
        })?;
        sign_sweep(&secp, network, &mut tx, &unspents, backup_xprv, true)?;
    }

    for (input_index, unspent) in unspents.iter().enumerate() {
        let valid = verify_signature(
            &secp,
            &tx,
            input_index,
            unspent.value,
            &VerificationSettings::default(),
        );
        if !valid {
            return Err(RecoveryError::Signing {
                input_index,
                reason: "sweep signature failed verification".into(),
            });
        }
    }

    Ok(RecoveryTransaction::Signed(SignedRecovery {
        tx_hex: serialize_hex(&tx),
        input_amount,
        recovery_amount,
        fee,
        krs_fee,
    }))
}

/// Walk every chain of every enabled address type, stopping a chain after
/// `scan_window` consecutive addresses with no transaction history.
async fn scan_unspents(
    secp: &Secp256k1<All>,
    network: &Network,
    xpubs: &[Xpub],
    explorer: &dyn Explorer,
    scan_window: u32,
    ignored: &[AddressType],
    req_id: &ReqId,
) -> Result<Vec<Unspent>, RecoveryError> {
    let mut pool = Vec::new();

    for address_type in AddressType::all() {
        if ignored.contains(&address_type) {
            continue;
        }
        if address_type == AddressType::P2wsh && !network.supports_p2wsh {
            continue;
        }

        for chain in address_type.chains() {
            let mut dry_streak = 0u32;
            let mut index = 0u32;
            while dry_streak < scan_window {
                let derived = generate_address(
                    secp,
                    network,
                    xpubs,
                    DEFAULT_THRESHOLD,
                    address_type,
                    chain,
                    index,
                )?;

                let info = with_retries(|| explorer.address_info(&derived.address, req_id))
                    .await
                    .map_err(|e| RecoveryError::ExplorerUnavailable(e.to_string()))?;

                if info.tx_count == 0 {
                    dry_streak += 1;
                } else {
                    dry_streak = 0;
                    if info.total_balance > 0 {
                        log::info!(
                            "[{}] {} sat at {} (chain {}, index {})",
                            req_id,
                            info.total_balance,
                            derived.address,
                            chain,
                            index
                        );
                        let found =
                            with_retries(|| explorer.address_unspents(&derived.address, req_id))
                                .await
                                .map_err(|e| RecoveryError::ExplorerUnavailable(e.to_string()))?;
                        for item in found {
                            pool.push(Unspent {
                                txid: item.txid,
                                output_index: item.output_index,
                                value: item.value,
                                address: derived.address.clone(),
                                chain,
                                index,
                                redeem_script: derived
                                    .redeem_script
                                    .as_ref()
                                    .map(|s| s.to_hex_string()),
                                witness_script: derived
                                    .witness_script
                                    .as_ref()
                                    .map(|s| s.to_hex_string()),
                            });
                        }
                    }
                }
                index += 1;
            }
        }
    }

    Ok(pool)
}

fn sign_sweep(
    secp: &Secp256k1<All>,
    network: &Network,
    tx: &mut Transaction,
    unspents: &[Unspent],
    xprv: &Xpriv,
    is_last_signature: bool,
) -> Result<(), RecoveryError> {
    for (input_index, unspent) in unspents.iter().enumerate() {
        let mut key = derive_leaf_privkey(secp, xprv, unspent.chain, unspent.index)?;
        let result = sign_input(
            secp,
            tx,
            input_index,
            unspent,
            &key,
            network.default_sighash,
            is_last_signature,
        );
        key.non_secure_erase();
        result.map_err(|e| RecoveryError::Signing {
            input_index,
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn offline_vault(network: &Network, tx: &Transaction, unspents: &[Unspent]) -> OfflineVault {
    OfflineVault {
        tx_hex: serialize_hex(tx),
        tx_info: OfflineVaultTxInfo {
            unspents: unspents
                .iter()
                .map(|unspent| OfflineVaultUnspent {
                    chain: unspent.chain,
                    index: unspent.index,
                    chain_path: format!("/0/0/{}/{}", unspent.chain, unspent.index),
                    address: unspent.address.clone(),
                    txid: unspent.txid.clone(),
                    output_index: unspent.output_index,
                    redeem_script: unspent.redeem_script.clone(),
                    witness_script: unspent.witness_script.clone(),
                    value: unspent.value,
                })
                .collect(),
        },
        fee_info: FeeInfo::default(),
        coin: network.coin.to_string(),
    }
}

/// Retry an external call twice before giving up.
pub(crate) async fn with_retries<T, F, Fut>(mut call: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut last_error = None;
    for _ in 0..3 {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| ServiceError::Unavailable("no attempts made".into())))
}
