//! Trivault Electrum
//!
//! Electrum-protocol implementation of the recovery explorer interface:
//! address history and balances for the scanner, unspent listings for the
//! sweep builder, and previous-transaction lookups for fee validation.
//!
//! # Security
//!
//! - Always use SSL/TLS connections (ssl:// or tcp+tls://)
//! - All data received from the server is re-validated by the core before
//!   any signing decision depends on it
//! - Private keys never touch this crate

use async_trait::async_trait;
use bitcoin::Txid;
use electrum_client::{ElectrumApi, Error as ElectrumError};
use std::str::FromStr;
use thiserror::Error;
use trivault_core::address::{address_from_output_script, decode_address};
use trivault_core::network::Network;
use trivault_wallet::service::{
    AddressInfo, Explorer, ExplorerOutput, ExplorerUnspent, ReqId, ServiceError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("electrum protocol error: {0}")]
    Protocol(#[from] ElectrumError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Electrum-backed explorer.
pub struct ElectrumExplorer {
    client: electrum_client::Client,
    network: &'static Network,
}

impl ElectrumExplorer {
    /// Connect to an Electrum server.
    ///
    /// # Security
    /// Always use SSL URLs in production. Plaintext connections can be
    /// MITM'd.
    pub fn new(url: &str, network: &'static Network) -> Result<Self, Error> {
        if !url.starts_with("ssl://") && !url.contains("tls") {
            log::warn!("connecting to Electrum without SSL - insecure for mainnet!");
        }

        let client = electrum_client::Client::new(url)
            .map_err(|e: ElectrumError| Error::Connection(e.to_string()))?;
        Ok(Self { client, network })
    }

    pub fn network(&self) -> &'static Network {
        self.network
    }

    fn script_for(&self, address: &str) -> Result<bitcoin::ScriptBuf, ServiceError> {
        decode_address(self.network, address, false)
            .map_err(|e| ServiceError::InvalidResponse(format!("address {}: {}", address, e)))
    }
}

#[async_trait]
impl Explorer for ElectrumExplorer {
    async fn latest_block_height(&self, req_id: &ReqId) -> Result<u64, ServiceError> {
        log::debug!("[{}] fetching chain tip", req_id);
        let notification = self
            .client
            .block_headers_subscribe()
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(notification.height as u64)
    }

    async fn transaction_outputs(
        &self,
        txid: &str,
        req_id: &ReqId,
    ) -> Result<Vec<ExplorerOutput>, ServiceError> {
        log::debug!("[{}] fetching transaction {}", req_id, txid);
        let txid = Txid::from_str(txid)
            .map_err(|e| ServiceError::InvalidResponse(format!("txid {}: {}", txid, e)))?;
        let tx = self
            .client
            .transaction_get(&txid)
            .map_err(|_| ServiceError::TransactionNotFound(txid.to_string()))?;

        Ok(tx
            .output
            .iter()
            .map(|txout| ExplorerOutput {
                address: address_from_output_script(self.network, &txout.script_pubkey).ok(),
                value: txout.value.to_sat(),
            })
            .collect())
    }

    async fn address_info(
        &self,
        address: &str,
        req_id: &ReqId,
    ) -> Result<AddressInfo, ServiceError> {
        log::debug!("[{}] address info for {}", req_id, address);
        let script = self.script_for(address)?;

        let history = self
            .client
            .script_get_history(&script)
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        let balance = self
            .client
            .script_get_balance(&script)
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        // Unconfirmed can be negative (pending spends)
        let total = balance.confirmed as i64 + balance.unconfirmed;
        Ok(AddressInfo {
            tx_count: history.len() as u64,
            total_balance: total.max(0) as u64,
        })
    }

    async fn address_unspents(
        &self,
        address: &str,
        req_id: &ReqId,
    ) -> Result<Vec<ExplorerUnspent>, ServiceError> {
        log::debug!("[{}] unspents for {}", req_id, address);
        let script = self.script_for(address)?;
        let unspent = self
            .client
            .script_list_unspent(&script)
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        Ok(unspent
            .into_iter()
            .map(|u| ExplorerUnspent {
                txid: u.tx_hash.to_string(),
                output_index: u.tx_pos as u32,
                value: u.value,
            })
            .collect())
    }
}

/// Default Electrum servers per network.
pub fn default_server(network: &Network) -> &'static str {
    match network.coin {
        "btc" => "ssl://blockstream.info:700",
        "tbtc" => "ssl://blockstream.info:993",
        "ltc" => "ssl://electrum-ltc.bysh.me:50002",
        "tltc" => "ssl://electrum.ltc.xurious.com:51002",
        _ => "ssl://blockstream.info:700",
    }
}
