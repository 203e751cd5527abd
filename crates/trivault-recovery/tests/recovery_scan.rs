//! Recovery scans and sweep construction against a scripted explorer.

use async_trait::async_trait;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{NetworkKind, Transaction};
use std::collections::HashMap;
use std::sync::Mutex;
use trivault_core::address::{decode_address, generate_address, AddressType, DEFAULT_THRESHOLD};
use trivault_core::network::BITCOIN;
use trivault_core::parse_signature_script;
use trivault_core::sigcheck::{verify_signature, VerificationSettings};
use trivault_recovery::{
    recover, RecoverParams, RecoveryError, RecoveryTransaction,
};
use trivault_wallet::service::{
    AddressInfo, Explorer, ExplorerOutput, ExplorerUnspent, PriceFeed, ReqId, ServiceError,
};

struct ScriptedExplorer {
    info: HashMap<String, AddressInfo>,
    unspents: HashMap<String, Vec<ExplorerUnspent>>,
    queried: Mutex<Vec<String>>,
}

impl ScriptedExplorer {
    fn empty() -> Self {
        ScriptedExplorer {
            info: HashMap::new(),
            unspents: HashMap::new(),
            queried: Mutex::new(Vec::new()),
        }
    }

    fn fund(&mut self, address: &str, value: u64) {
        self.info.insert(
            address.to_string(),
            AddressInfo {
                tx_count: 1,
                total_balance: value,
            },
        );
        self.unspents.insert(
            address.to_string(),
            vec![ExplorerUnspent {
                txid: "cd".repeat(32),
                output_index: 0,
                value,
            }],
        );
    }

    fn queried_addresses(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl Explorer for ScriptedExplorer {
    async fn latest_block_height(&self, _req_id: &ReqId) -> Result<u64, ServiceError> {
        Ok(850_000)
    }

    async fn transaction_outputs(
        &self,
        txid: &str,
        _req_id: &ReqId,
    ) -> Result<Vec<ExplorerOutput>, ServiceError> {
        Err(ServiceError::TransactionNotFound(txid.to_string()))
    }

    async fn address_info(
        &self,
        address: &str,
        _req_id: &ReqId,
    ) -> Result<AddressInfo, ServiceError> {
        self.queried.lock().unwrap().push(address.to_string());
        Ok(self.info.get(address).copied().unwrap_or(AddressInfo {
            tx_count: 0,
            total_balance: 0,
        }))
    }

    async fn address_unspents(
        &self,
        address: &str,
        _req_id: &ReqId,
    ) -> Result<Vec<ExplorerUnspent>, ServiceError> {
        Ok(self.unspents.get(address).cloned().unwrap_or_default())
    }
}

struct FixedPrice(f64);

#[async_trait]
impl PriceFeed for FixedPrice {
    async fn market_price_usd(&self, _coin: &str, _req_id: &ReqId) -> Result<f64, ServiceError> {
        Ok(self.0)
    }
}

const DESTINATION: &str = "3P14159f73E4gFr7JterCCQh9QjiTjiZrG";

struct Wallet {
    user_prv: String,
    user_pub: String,
    backup_prv: String,
    backup_pub: String,
    bitgo_pub: String,
    xpubs: Vec<Xpub>,
}

fn wallet() -> Wallet {
    let secp = Secp256k1::new();
    let xprvs: Vec<Xpriv> = [71u8, 72, 73]
        .iter()
        .map(|seed| Xpriv::new_master(NetworkKind::Main, &[*seed; 32]).unwrap())
        .collect();
    let xpubs: Vec<Xpub> = xprvs.iter().map(|x| Xpub::from_priv(&secp, x)).collect();
    Wallet {
        user_prv: xprvs[0].to_string(),
        user_pub: xpubs[0].to_string(),
        backup_prv: xprvs[1].to_string(),
        backup_pub: xpubs[1].to_string(),
        bitgo_pub: xpubs[2].to_string(),
        xpubs,
    }
}

fn wallet_address(w: &Wallet, address_type: AddressType, chain: u32, index: u32) -> String {
    let secp = Secp256k1::new();
    generate_address(
        &secp,
        &BITCOIN,
        &w.xpubs,
        DEFAULT_THRESHOLD,
        address_type,
        chain,
        index,
    )
    .unwrap()
    .address
}

fn p2sh_only_params<'a>(w: &'a Wallet, scan: u32) -> RecoverParams<'a> {
    RecoverParams {
        user_key: &w.user_prv,
        backup_key: &w.backup_prv,
        bitgo_key: &w.bitgo_pub,
        recovery_destination: DESTINATION,
        scan: Some(scan),
        ignore_address_types: Some(vec![AddressType::P2shP2wsh, AddressType::P2wsh]),
        krs_provider: None,
        fee_per_byte: None,
    }
}

fn decode(tx_hex: &str) -> Transaction {
    bitcoin::consensus::encode::deserialize(&hex::decode(tx_hex).unwrap()).unwrap()
}

#[tokio::test]
async fn dry_streak_stops_scanning() {
    let w = wallet();
    let explorer = ScriptedExplorer::empty();

    let result = recover(
        &BITCOIN,
        &explorer,
        None,
        &p2sh_only_params(&w, 3),
        &ReqId::new(),
    )
    .await;
    assert!(matches!(result, Err(RecoveryError::NoRecoverableFunds)));

    // Three empty indices end the chain: index 3 is never queried
    let queried = explorer.queried_addresses();
    for chain in [0u32, 1] {
        for index in 0..3 {
            let address = wallet_address(&w, AddressType::P2sh, chain, index);
            assert!(
                queried.contains(&address),
                "chain {} index {} should have been scanned",
                chain,
                index
            );
        }
        let fourth = wallet_address(&w, AddressType::P2sh, chain, 3);
        assert!(
            !queried.contains(&fourth),
            "chain {} index 3 must not be scanned after the dry streak",
            chain
        );
    }
}

#[tokio::test]
async fn used_address_resets_dry_streak() {
    let w = wallet();
    let mut explorer = ScriptedExplorer::empty();

    // Index 2 has history (but no balance): the streak restarts after it
    let used = wallet_address(&w, AddressType::P2sh, 0, 2);
    explorer.info.insert(
        used,
        AddressInfo {
            tx_count: 4,
            total_balance: 0,
        },
    );

    let result = recover(
        &BITCOIN,
        &explorer,
        None,
        &p2sh_only_params(&w, 3),
        &ReqId::new(),
    )
    .await;
    assert!(matches!(result, Err(RecoveryError::NoRecoverableFunds)));

    let queried = explorer.queried_addresses();
    // Indices 3, 4, 5 form the new streak after the reset at index 2
    let fifth = wallet_address(&w, AddressType::P2sh, 0, 5);
    let sixth = wallet_address(&w, AddressType::P2sh, 0, 6);
    assert!(queried.contains(&fifth));
    assert!(!queried.contains(&sixth));
}

#[tokio::test]
async fn full_sweep_signs_and_pays_destination() {
    let w = wallet();
    let mut explorer = ScriptedExplorer::empty();
    let funded = wallet_address(&w, AddressType::P2sh, 0, 1);
    explorer.fund(&funded, 1_000_000);

    let result = recover(
        &BITCOIN,
        &explorer,
        None,
        &p2sh_only_params(&w, 3),
        &ReqId::new(),
    )
    .await
    .unwrap();

    let RecoveryTransaction::Signed(signed) = result else {
        panic!("expected a signed sweep");
    };
    assert_eq!(signed.input_amount, 1_000_000);
    // (10 + 34 + 296) * 100 sat/byte
    assert_eq!(signed.fee, 34_000);
    assert_eq!(signed.recovery_amount, 966_000);
    assert_eq!(signed.krs_fee, None);

    let tx = decode(&signed.tx_hex);
    assert_eq!(tx.input.len(), 1);
    assert_eq!(tx.output.len(), 1);
    assert_eq!(tx.output[0].value.to_sat(), 966_000);
    assert_eq!(
        tx.output[0].script_pubkey,
        decode_address(&BITCOIN, DESTINATION, false).unwrap()
    );

    // Fully signed: two live signatures that verify
    let secp = Secp256k1::new();
    let parsed = parse_signature_script(&tx, 0).unwrap();
    let live: Vec<_> = parsed.signatures.iter().filter(|s| !s.is_empty()).collect();
    assert_eq!(live.len(), 2);
    assert!(verify_signature(
        &secp,
        &tx,
        0,
        1_000_000,
        &VerificationSettings::default()
    ));
}

#[tokio::test]
async fn krs_recovery_adds_fee_output_and_half_signs() {
    let w = wallet();
    let mut explorer = ScriptedExplorer::empty();
    let funded = wallet_address(&w, AddressType::P2sh, 0, 0);
    explorer.fund(&funded, 10_000_000);

    let params = RecoverParams {
        user_key: &w.user_prv,
        backup_key: &w.backup_pub,
        bitgo_key: &w.bitgo_pub,
        recovery_destination: DESTINATION,
        scan: Some(2),
        ignore_address_types: Some(vec![AddressType::P2shP2wsh, AddressType::P2wsh]),
        krs_provider: Some("keyternal"),
        fee_per_byte: None,
    };
    let price_feed = FixedPrice(10_000.0);

    let result = recover(&BITCOIN, &explorer, Some(&price_feed), &params, &ReqId::new())
        .await
        .unwrap();
    let RecoveryTransaction::Signed(signed) = result else {
        panic!("expected a half-signed KRS sweep");
    };

    // $99 at $10,000/coin
    assert_eq!(signed.krs_fee, Some(990_000));
    // (10 + 2*34 + 296) * 100
    assert_eq!(signed.fee, 37_400);
    assert_eq!(signed.recovery_amount, 10_000_000 - 37_400 - 990_000);

    let tx = decode(&signed.tx_hex);
    assert_eq!(tx.output.len(), 2);
    assert_eq!(tx.output[1].value.to_sat(), 990_000);

    // Only the user signature is present
    let parsed = parse_signature_script(&tx, 0).unwrap();
    let live: Vec<_> = parsed.signatures.iter().filter(|s| !s.is_empty()).collect();
    assert_eq!(live.len(), 1);
}

#[tokio::test]
async fn unsigned_sweep_exports_offline_vault() {
    let w = wallet();
    let mut explorer = ScriptedExplorer::empty();
    let funded = wallet_address(&w, AddressType::P2sh, 0, 1);
    explorer.fund(&funded, 500_000);

    let params = RecoverParams {
        user_key: &w.user_pub,
        backup_key: &w.backup_pub,
        bitgo_key: &w.bitgo_pub,
        recovery_destination: DESTINATION,
        scan: Some(2),
        ignore_address_types: Some(vec![AddressType::P2shP2wsh, AddressType::P2wsh]),
        krs_provider: None,
        fee_per_byte: None,
    };

    let result = recover(&BITCOIN, &explorer, None, &params, &ReqId::new())
        .await
        .unwrap();
    let RecoveryTransaction::Unsigned(vault) = result else {
        panic!("expected an offline vault export");
    };

    assert_eq!(vault.coin, "btc");
    assert_eq!(vault.tx_info.unspents.len(), 1);
    let unspent = &vault.tx_info.unspents[0];
    assert_eq!(unspent.chain, 0);
    assert_eq!(unspent.index, 1);
    assert_eq!(unspent.chain_path, "/0/0/0/1");
    assert_eq!(unspent.value, 500_000);
    assert!(unspent.redeem_script.is_some());
    assert!(unspent.witness_script.is_none());

    // The transaction is present but unsigned
    let tx = decode(&vault.tx_hex);
    assert_eq!(tx.input.len(), 1);
    assert!(tx.input[0].script_sig.is_empty());
    assert!(tx.input[0].witness.is_empty());

    // Wire shape: camelCase with an empty feeInfo object
    let json = serde_json::to_value(&vault).unwrap();
    assert!(json.get("txHex").is_some());
    assert_eq!(json["feeInfo"], serde_json::json!({}));
    assert_eq!(json["txInfo"]["unspents"][0]["chainPath"], "/0/0/0/1");
}

#[tokio::test]
async fn dust_balance_fails_with_cost_report() {
    let w = wallet();
    let mut explorer = ScriptedExplorer::empty();
    let funded = wallet_address(&w, AddressType::P2sh, 0, 0);
    explorer.fund(&funded, 10_000);

    let result = recover(
        &BITCOIN,
        &explorer,
        None,
        &p2sh_only_params(&w, 2),
        &ReqId::new(),
    )
    .await;
    let Err(RecoveryError::InsufficientFunds {
        available,
        required,
    }) = result
    else {
        panic!("expected insufficient funds");
    };
    assert_eq!(available, 10_000);
    assert_eq!(required, 34_000);
}

#[tokio::test]
async fn wrapped_segwit_chains_are_scanned_by_default() {
    let w = wallet();
    let mut explorer = ScriptedExplorer::empty();
    let funded = wallet_address(&w, AddressType::P2shP2wsh, 10, 0);
    explorer.fund(&funded, 2_000_000);

    // Default ignore list excludes only P2WSH
    let params = RecoverParams {
        user_key: &w.user_prv,
        backup_key: &w.backup_prv,
        bitgo_key: &w.bitgo_pub,
        recovery_destination: DESTINATION,
        scan: Some(2),
        ignore_address_types: None,
        krs_provider: None,
        fee_per_byte: None,
    };

    let result = recover(&BITCOIN, &explorer, None, &params, &ReqId::new())
        .await
        .unwrap();
    let RecoveryTransaction::Signed(signed) = result else {
        panic!("expected a signed sweep");
    };
    assert_eq!(signed.input_amount, 2_000_000);

    // No P2WSH chain was scanned
    let queried = explorer.queried_addresses();
    let p2wsh_first = wallet_address(&w, AddressType::P2wsh, 20, 0);
    assert!(!queried.contains(&p2wsh_first));

    // The wrapped-segwit input carries witness data and verifies
    let tx = decode(&signed.tx_hex);
    let parsed = parse_signature_script(&tx, 0).unwrap();
    assert!(parsed.is_segwit_input);
    let secp = Secp256k1::new();
    assert!(verify_signature(
        &secp,
        &tx,
        0,
        2_000_000,
        &VerificationSettings::default()
    ));
}
