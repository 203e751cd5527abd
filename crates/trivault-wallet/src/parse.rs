//! Prebuild parsing and output classification
//!
//! Takes the server's proposal apart before any key touches it: every
//! output is proven internal by rederivation or declared external, the
//! user's intended recipients are matched as a multiset against the
//! decoded outputs, and the external spend is split into its explicit
//! (user-intended) and implicit (server-added) parts.
//!
//! Classification is fail-safe: only the specific, expected error shapes
//! are interpreted as "external"; anything else aborts the parse so a
//! malformed record can never be waved through as someone else's money.

use crate::error::WalletError;
use crate::explain::{explain_transaction, ExplainedOutput};
use crate::keychain::{Keychain, Keychains};
use crate::service::{ReqId, ServiceError, WalletService};
use crate::types::{
    AddressRecord, ParsedTransaction, Recipient, TxParams, TxPrebuild, VerificationOptions,
    WalletInfo, WalletOutput,
};
use bitcoin::bip32::Xpub;
use bitcoin::secp256k1::{All, Secp256k1};
use futures::future::try_join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use trivault_core::address::{
    verify_address, AddressError, AddressType, AddressVerificationParams, DEFAULT_THRESHOLD,
};
use trivault_core::network::Network;

/// How many address lookups may be in flight at once during output
/// classification.
const CLASSIFY_CONCURRENCY: usize = 8;

/// Inputs to [`parse_transaction`].
#[derive(Debug)]
pub struct ParseTransactionParams<'a> {
    pub tx_params: &'a TxParams,
    pub tx_prebuild: &'a TxPrebuild,
    pub wallet: &'a WalletInfo,
    pub verification: &'a VerificationOptions,
}

/// Classify every output of a prebuild against user intent.
pub async fn parse_transaction(
    network: &Network,
    service: &dyn WalletService,
    params: &ParseTransactionParams<'_>,
    req_id: &ReqId,
) -> Result<ParsedTransaction, WalletError> {
    let secp = Secp256k1::new();
    let keychains = resolve_keychains(service, params, req_id).await?;
    let xpubs = keychains.xpubs()?;

    let change_addresses: HashSet<String> = params
        .tx_prebuild
        .tx_info
        .change_addresses
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let explanation =
        explain_transaction(network, &params.tx_prebuild.tx_hex, &change_addresses)?;

    // The explainer's change split is tentative; classification below is
    // what decides internal vs external.
    let all_outputs: Vec<ExplainedOutput> = explanation
        .outputs
        .iter()
        .chain(explanation.change_outputs.iter())
        .cloned()
        .collect();

    let missing_outputs = missing_recipients(&params.tx_params.recipients, &all_outputs);

    log::debug!(
        "[{}] classifying {} outputs of prebuild {}",
        req_id,
        all_outputs.len(),
        explanation.id
    );
    // Bounded fan-out; results come back in output order regardless of
    // completion order.
    let classified: Vec<WalletOutput> = stream::iter(
        all_outputs
            .iter()
            .map(|output| classify_output(network, &secp, service, &xpubs, params, output, req_id)),
    )
    .buffered(CLASSIFY_CONCURRENCY)
    .try_collect()
    .await?;

    let (explicit_outputs, implicit_outputs) =
        split_explicit_implicit(&params.tx_params.recipients, &classified);

    let change_outputs: Vec<WalletOutput> = classified
        .iter()
        .filter(|o| !o.external)
        .cloned()
        .collect();
    let explicit_external_outputs: Vec<WalletOutput> = explicit_outputs
        .into_iter()
        .filter(|o| o.external)
        .collect();
    let implicit_external_outputs: Vec<WalletOutput> = implicit_outputs
        .into_iter()
        .filter(|o| o.external)
        .collect();

    let explicit_external_spend_amount = explicit_external_outputs.iter().map(|o| o.amount).sum();
    let implicit_external_spend_amount = implicit_external_outputs.iter().map(|o| o.amount).sum();

    let key_signatures = keychains.user.key_signatures.clone();
    Ok(ParsedTransaction {
        keychains,
        key_signatures,
        outputs: classified,
        missing_outputs,
        explicit_external_outputs,
        implicit_external_outputs,
        change_outputs,
        explicit_external_spend_amount,
        implicit_external_spend_amount,
    })
}

/// Use supplied keychains, or fetch the wallet's triple by id.
async fn resolve_keychains(
    service: &dyn WalletService,
    params: &ParseTransactionParams<'_>,
    req_id: &ReqId,
) -> Result<Keychains, WalletError> {
    if let Some(keychains) = &params.verification.keychains {
        return Ok(keychains.clone());
    }
    if params.verification.disable_networking {
        return Err(WalletError::NetworkingDisabled(
            "keychains must be supplied when networking is disabled".into(),
        ));
    }

    let fetched = try_join_all(
        params
            .wallet
            .keychain_ids
            .iter()
            .map(|id| service.get_keychain(id, req_id)),
    )
    .await?;
    let [user, backup, bitgo]: [Keychain; 3] = fetched.try_into().map_err(|_| {
        WalletError::Service(ServiceError::InvalidResponse(
            "expected exactly three keychains".into(),
        ))
    })?;
    Ok(Keychains {
        user,
        backup,
        bitgo,
    })
}

/// Decide whether one output pays the wallet or an external party.
async fn classify_output(
    network: &Network,
    secp: &Secp256k1<All>,
    service: &dyn WalletService,
    xpubs: &[Xpub],
    params: &ParseTransactionParams<'_>,
    output: &ExplainedOutput,
    req_id: &ReqId,
) -> Result<WalletOutput, WalletError> {
    let address = &output.address;

    let local = params
        .tx_prebuild
        .tx_info
        .wallet_address_details
        .get(address);
    let supplied = params.verification.addresses.get(address);
    let merged: Option<AddressRecord> = match (local, supplied) {
        (Some(local), Some(supplied)) => Some(local.merged_with(supplied)),
        (Some(local), None) => Some(local.clone()),
        (None, Some(supplied)) => Some(supplied.clone()),
        (None, None) => None,
    };

    let record = match merged {
        Some(record) => record,
        None => {
            if params.verification.disable_networking {
                return Err(WalletError::NetworkingDisabled(format!(
                    "no address record for {} and lookups are forbidden",
                    address
                )));
            }
            match service.get_wallet_address(address, req_id).await {
                Ok(record) => record,
                Err(ServiceError::WalletAddressNotFound(_)) => {
                    return Ok(external_unless_migrated(params.wallet, output));
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let address_type = record
        .coin_specific
        .as_ref()
        .and_then(|scripts| scripts.infer_address_type())
        .unwrap_or(AddressType::P2sh);

    let verification = verify_address(
        secp,
        network,
        &AddressVerificationParams {
            address,
            address_type,
            keychains: xpubs,
            threshold: DEFAULT_THRESHOLD,
            chain: record.chain,
            index: record.index,
            coin_specific: record.coin_specific.as_ref(),
        },
    );

    match verification {
        Ok(()) => Ok(WalletOutput {
            address: address.clone(),
            amount: output.amount,
            external: false,
        }),
        Err(AddressError::UnexpectedAddress { .. }) => {
            Ok(external_unless_migrated(params.wallet, output))
        }
        Err(AddressError::InvalidAddressDerivationProperty(_))
            if params.tx_params.change_address.as_deref() == Some(address.as_str()) =>
        {
            // User-supplied custom change address: no derivation data, but
            // explicitly blessed by intent.
            Ok(WalletOutput {
                address: address.clone(),
                amount: output.amount,
                external: false,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// An unknown address is external — unless it is the base address of a
/// migrated v1 wallet, which predates derivation records.
fn external_unless_migrated(wallet: &WalletInfo, output: &ExplainedOutput) -> WalletOutput {
    let external = wallet.migrated_from.as_deref() != Some(output.address.as_str());
    WalletOutput {
        address: output.address.clone(),
        amount: output.amount,
        external,
    }
}

/// Recipients not covered by the decoded outputs, as a multiset difference
/// keyed on `(address, amount)`.
fn missing_recipients(expected: &[Recipient], actual: &[ExplainedOutput]) -> Vec<Recipient> {
    let mut available: HashMap<(&str, u64), usize> = HashMap::new();
    for output in actual {
        *available
            .entry((output.address.as_str(), output.amount))
            .or_insert(0) += 1;
    }

    let mut missing = Vec::new();
    for recipient in expected {
        let key = (recipient.address.as_str(), recipient.amount);
        match available.get_mut(&key) {
            Some(count) if *count > 0 => *count -= 1,
            _ => missing.push(recipient.clone()),
        }
    }
    missing
}

/// Partition classified outputs into the explicitly requested multiset and
/// the implicit remainder, preserving output order.
fn split_explicit_implicit(
    expected: &[Recipient],
    outputs: &[WalletOutput],
) -> (Vec<WalletOutput>, Vec<WalletOutput>) {
    let mut wanted: HashMap<(&str, u64), usize> = HashMap::new();
    for recipient in expected {
        *wanted
            .entry((recipient.address.as_str(), recipient.amount))
            .or_insert(0) += 1;
    }

    let mut explicit = Vec::new();
    let mut implicit = Vec::new();
    for output in outputs {
        let key = (output.address.as_str(), output.amount);
        match wanted.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                explicit.push(output.clone());
            }
            _ => implicit.push(output.clone()),
        }
    }
    (explicit, implicit)
}
