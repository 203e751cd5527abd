//! Prebuild and intent records
//!
//! Value types exchanged with the wallet service: the user's intent
//! (`TxParams`), the server's proposal (`TxPrebuild`), and the parsed
//! verdict (`ParsedTransaction`). All of these are plain data — ownership
//! is passed by value and nothing here holds a shared mutable reference.

use crate::keychain::{Keychains, KeySignatures};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trivault_core::address::AddressScripts;
use trivault_core::signer::Unspent;

/// One intended payment, keyed in multiset comparisons by
/// `(address, amount)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub amount: u64,
}

/// User intent for a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxParams {
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_passphrase: Option<String>,
}

/// An address record as known to the wallet service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin_specific: Option<AddressScripts>,
}

impl AddressRecord {
    /// Field-wise merge, with `other` winning on conflicts.
    pub fn merged_with(&self, other: &AddressRecord) -> AddressRecord {
        AddressRecord {
            address: other.address.clone().or_else(|| self.address.clone()),
            chain: other.chain.or(self.chain),
            index: other.index.or(self.index),
            coin_specific: other
                .coin_specific
                .clone()
                .or_else(|| self.coin_specific.clone()),
        }
    }
}

/// Supporting data attached to a prebuild by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    pub unspents: Vec<Unspent>,
    /// Previous transactions by txid, for input-amount validation.
    #[serde(default)]
    pub tx_hexes: HashMap<String, String>,
    #[serde(default)]
    pub wallet_address_details: HashMap<String, AddressRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_addresses: Option<Vec<String>>,
}

/// A transaction proposal from the wallet service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxPrebuild {
    pub tx_hex: String,
    #[serde(default)]
    pub tx_info: TxInfo,
}

/// The wallet the prebuild claims to spend from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletInfo {
    pub id: String,
    /// Keychain ids in `[user, backup, bitgo]` order.
    pub keychain_ids: [String; 3],
    /// Base address of a migrated v1 wallet, exempt from rederivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_from: Option<String>,
}

/// Caller-supplied overrides for verification.
#[derive(Debug, Clone, Default)]
pub struct VerificationOptions {
    /// Pre-fetched keychains; skips the service round-trip.
    pub keychains: Option<Keychains>,
    /// Pre-fetched address records by address.
    pub addresses: HashMap<String, AddressRecord>,
    /// Forbid all suspension points. Verification fails instead of
    /// fetching.
    pub disable_networking: bool,
}

/// A classified output of the prebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletOutput {
    pub address: String,
    pub amount: u64,
    /// Whether the output pays outside the wallet.
    pub external: bool,
}

/// The parser's verdict on a prebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub keychains: Keychains,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_signatures: Option<KeySignatures>,
    pub outputs: Vec<WalletOutput>,
    pub missing_outputs: Vec<Recipient>,
    pub explicit_external_outputs: Vec<WalletOutput>,
    pub implicit_external_outputs: Vec<WalletOutput>,
    pub change_outputs: Vec<WalletOutput>,
    pub explicit_external_spend_amount: u64,
    pub implicit_external_spend_amount: u64,
}
