//! Key recovery service directory
//!
//! KRS providers hold the backup key in custody. A KRS recovery is only
//! half-signed here; the provider cosigns after collecting its fee, which
//! is allocated as an extra sweep output in the provider's favour.

use crate::{with_retries, RecoveryError};
use trivault_wallet::service::{PriceFeed, ReqId};

/// Satoshis per whole coin; the base factor for USD fee conversion.
const SATS_PER_COIN: f64 = 100_000_000.0;

/// How a provider charges for cosigning a recovery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeeStructure {
    /// Flat USD amount, converted at the current market price.
    FlatUsd { amount_usd: f64 },
    /// A structure this library does not price.
    Other(&'static str),
}

/// A registered key recovery service.
#[derive(Debug, Clone)]
pub struct KrsProvider {
    pub name: &'static str,
    pub supported_coins: &'static [&'static str],
    pub fee_structure: FeeStructure,
    fee_addresses: &'static [(&'static str, &'static str)],
}

impl KrsProvider {
    pub fn supports(&self, coin: &str) -> bool {
        self.supported_coins.contains(&coin)
    }

    /// The provider's fee address for `coin`.
    pub fn fee_address(&self, coin: &str) -> Result<&'static str, RecoveryError> {
        self.fee_addresses
            .iter()
            .find(|(c, _)| *c == coin)
            .map(|(_, address)| *address)
            .ok_or_else(|| RecoveryError::UnsupportedKrsCoin(coin.to_string()))
    }
}

const PROVIDERS: &[KrsProvider] = &[KrsProvider {
    name: "keyternal",
    supported_coins: &["btc", "tbtc", "ltc", "tltc"],
    fee_structure: FeeStructure::FlatUsd { amount_usd: 99.0 },
    fee_addresses: &[
        ("btc", "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
        ("tbtc", "mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn"),
    ],
}];

/// Look a provider up by name.
pub fn provider(name: &str) -> Result<&'static KrsProvider, RecoveryError> {
    PROVIDERS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| RecoveryError::UnknownKrsProvider(name.to_string()))
}

/// The provider's fee in satoshis at the current market price.
pub async fn calculate_fee(
    provider: &KrsProvider,
    coin: &str,
    price_feed: &dyn PriceFeed,
    req_id: &ReqId,
) -> Result<u64, RecoveryError> {
    if !provider.supports(coin) {
        return Err(RecoveryError::UnsupportedKrsCoin(coin.to_string()));
    }

    match provider.fee_structure {
        FeeStructure::FlatUsd { amount_usd } => {
            let price = with_retries(|| price_feed.market_price_usd(coin, req_id))
                .await
                .map_err(|e| RecoveryError::ExplorerUnavailable(e.to_string()))?;
            if price <= 0.0 {
                return Err(RecoveryError::ExplorerUnavailable(format!(
                    "non-positive market price {} for {}",
                    price, coin
                )));
            }
            Ok((amount_usd / price * SATS_PER_COIN).ceil() as u64)
        }
        FeeStructure::Other(kind) => Err(RecoveryError::FeeStructureNotImplemented(kind.into())),
    }
}
