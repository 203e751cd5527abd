//! Collaborator interfaces
//!
//! The verification pipeline never talks to the network directly: it
//! consumes these narrow traits. Every call carries a [`ReqId`] correlation
//! token so an upstream cancel can abort the whole chain; implementations
//! must return promptly once their caller is dropped.
//!
//! Errors are structured — the parser branches on
//! [`ServiceError::WalletAddressNotFound`], never on message text.

use crate::keychain::Keychain;
use crate::types::AddressRecord;
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Correlation token threaded through all outbound calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqId(String);

impl ReqId {
    /// A fresh random token.
    pub fn new() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        ReqId(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReqId {
    fn default() -> Self {
        ReqId::new()
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReqId {
    fn from(s: &str) -> Self {
        ReqId(s.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    /// The wallet service does not know this address.
    #[error("wallet address not found: {0}")]
    WalletAddressNotFound(String),

    #[error("keychain not found: {0}")]
    KeychainNotFound(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed service response: {0}")]
    InvalidResponse(String),
}

/// The wallet/keychain service the platform exposes.
#[async_trait]
pub trait WalletService: Send + Sync {
    async fn get_keychain(&self, id: &str, req_id: &ReqId) -> Result<Keychain, ServiceError>;

    /// Look up an address record owned by the wallet. Unknown addresses
    /// return [`ServiceError::WalletAddressNotFound`].
    async fn get_wallet_address(
        &self,
        address: &str,
        req_id: &ReqId,
    ) -> Result<AddressRecord, ServiceError>;
}

/// One output of a transaction as reported by the explorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerOutput {
    pub address: Option<String>,
    pub value: u64,
}

/// Address summary used by the recovery scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInfo {
    pub tx_count: u64,
    pub total_balance: u64,
}

/// An unspent output as reported by the explorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorerUnspent {
    pub txid: String,
    pub output_index: u32,
    pub value: u64,
}

/// Public block explorer.
#[async_trait]
pub trait Explorer: Send + Sync {
    async fn latest_block_height(&self, req_id: &ReqId) -> Result<u64, ServiceError>;

    /// The outputs of a confirmed transaction, in output order.
    async fn transaction_outputs(
        &self,
        txid: &str,
        req_id: &ReqId,
    ) -> Result<Vec<ExplorerOutput>, ServiceError>;

    async fn address_info(&self, address: &str, req_id: &ReqId)
        -> Result<AddressInfo, ServiceError>;

    async fn address_unspents(
        &self,
        address: &str,
        req_id: &ReqId,
    ) -> Result<Vec<ExplorerUnspent>, ServiceError>;
}

/// Market price source for KRS fee conversion.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Current USD price of one coin.
    async fn market_price_usd(&self, coin: &str, req_id: &ReqId) -> Result<f64, ServiceError>;
}
