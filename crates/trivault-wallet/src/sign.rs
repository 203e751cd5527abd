//! Wallet signing entry point
//!
//! Applies the user key to every input of a verified prebuild, producing a
//! half-signed transaction for the platform to cosign (or a fully signed
//! one when the caller holds the final signature). Failures are collected
//! per input and surfaced together so one bad input does not mask the
//! rest.

use crate::error::{SignatureIssue, WalletError};
use crate::explain::decode_transaction;
use crate::keychain::Keychain;
use crate::types::TxPrebuild;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::Transaction;
use trivault_core::derivation::derive_leaf_privkey;
use trivault_core::network::Network;
use trivault_core::sigcheck::{verify_signature, VerificationSettings};
use trivault_core::signer::sign_input;

/// Inputs to [`sign_transaction`].
#[derive(Debug)]
pub struct SignTransactionParams<'a> {
    pub tx_prebuild: &'a TxPrebuild,
    /// The signing keychain; its private half is required.
    pub keychain: &'a Keychain,
    /// Passphrase for `encrypted_prv`, when `prv` is not attached.
    pub wallet_passphrase: Option<&'a str>,
    /// True when this signature completes the threshold.
    pub is_last_signature: bool,
}

/// The signed transaction and what was signed.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub tx_hex: String,
    /// Inputs actually signed (replay-protection inputs are skipped).
    pub signed_inputs: usize,
}

/// Sign every input of the prebuild with the keychain's leaf keys.
pub fn sign_transaction(
    network: &Network,
    params: &SignTransactionParams<'_>,
) -> Result<SignedTransaction, WalletError> {
    let secp = Secp256k1::new();
    let xprv = params.keychain.xprv(params.wallet_passphrase)?;

    let mut tx: Transaction = decode_transaction(&params.tx_prebuild.tx_hex)?;
    let unspents = &params.tx_prebuild.tx_info.unspents;

    let mut issues: Vec<SignatureIssue> = Vec::new();
    let mut signed_inputs = 0usize;

    for input_index in 0..tx.input.len() {
        let Some(unspent) = unspents.get(input_index) else {
            return Err(WalletError::MissingUnspent(input_index));
        };

        if network.is_replay_protection_unspent(&unspent.address) {
            log::debug!(
                "skipping replay-protection input {} ({})",
                input_index,
                unspent.address
            );
            continue;
        }

        let path = format!("m/0/0/{}/{}", unspent.chain, unspent.index);
        let result = sign_one_input(
            &secp,
            network,
            &mut tx,
            input_index,
            unspent,
            &xprv,
            params.is_last_signature,
        );
        match result {
            Ok(()) => signed_inputs += 1,
            Err(error) => issues.push(SignatureIssue {
                input_index,
                unspent: unspent.clone(),
                path,
                error,
            }),
        }
    }

    if !issues.is_empty() {
        return Err(WalletError::InputSignatureFailure(issues));
    }

    Ok(SignedTransaction {
        tx_hex: serialize_hex(&tx),
        signed_inputs,
    })
}

fn sign_one_input(
    secp: &Secp256k1<bitcoin::secp256k1::All>,
    network: &Network,
    tx: &mut Transaction,
    input_index: usize,
    unspent: &trivault_core::signer::Unspent,
    xprv: &bitcoin::bip32::Xpriv,
    is_last_signature: bool,
) -> Result<(), String> {
    let outpoint = unspent.outpoint().map_err(|e| e.to_string())?;
    if tx.input[input_index].previous_output != outpoint {
        return Err(format!(
            "unspent {} does not match input outpoint {}",
            outpoint, tx.input[input_index].previous_output
        ));
    }

    let mut key = derive_leaf_privkey(secp, xprv, unspent.chain, unspent.index)
        .map_err(|e| e.to_string())?;
    let public_key = PublicKey::from_secret_key(secp, &key);

    let result = sign_input(
        secp,
        tx,
        input_index,
        unspent,
        &key,
        network.default_sighash,
        is_last_signature,
    )
    .map_err(|e| e.to_string());
    key.non_secure_erase();
    result?;

    // Check the signature that was just placed before reporting success.
    let valid = verify_signature(
        secp,
        tx,
        input_index,
        unspent.value,
        &VerificationSettings {
            public_key: Some(public_key),
            ..Default::default()
        },
    );
    if !valid {
        return Err("produced signature failed verification".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxInfo;
    use bitcoin::absolute::LockTime;
    use bitcoin::bip32::{Xpriv, Xpub};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, NetworkKind, ScriptBuf, Sequence, TxIn, TxOut, Witness};
    use trivault_core::address::{generate_address, AddressType, DEFAULT_THRESHOLD};
    use trivault_core::network::BITCOIN;
    use trivault_core::signer::Unspent;

    struct Fixture {
        user: Keychain,
        backup_xprv: Xpriv,
        unspents: Vec<Unspent>,
        prebuild: TxPrebuild,
    }

    fn fixture(address_types: &[AddressType]) -> Fixture {
        let secp = Secp256k1::new();
        let xprvs: Vec<Xpriv> = [41u8, 42, 43]
            .iter()
            .map(|seed| Xpriv::new_master(NetworkKind::Main, &[*seed; 32]).unwrap())
            .collect();
        let xpubs: Vec<Xpub> = xprvs.iter().map(|x| Xpub::from_priv(&secp, x)).collect();

        let mut unspents = Vec::new();
        let mut inputs = Vec::new();
        for (i, address_type) in address_types.iter().enumerate() {
            let chain = address_type.main_chain();
            let generated = generate_address(
                &secp,
                &BITCOIN,
                &xpubs,
                DEFAULT_THRESHOLD,
                *address_type,
                chain,
                i as u32,
            )
            .unwrap();
            let unspent = Unspent {
                txid: format!("{:02x}", i + 1).repeat(32),
                output_index: 0,
                value: 100_000,
                address: generated.address,
                chain,
                index: i as u32,
                redeem_script: generated.redeem_script.map(|s| s.to_hex_string()),
                witness_script: generated.witness_script.map(|s| s.to_hex_string()),
            };
            inputs.push(TxIn {
                previous_output: unspent.outpoint().unwrap(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
            unspents.push(unspent);
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: vec![TxOut {
                value: Amount::from_sat(90_000),
                script_pubkey: ScriptBuf::new_op_return([1u8; 4]),
            }],
        };

        let prebuild = TxPrebuild {
            tx_hex: serialize_hex(&tx),
            tx_info: TxInfo {
                unspents: unspents.clone(),
                ..Default::default()
            },
        };

        Fixture {
            user: Keychain::with_prv(xpubs[0].to_string(), xprvs[0].to_string()),
            backup_xprv: xprvs[1].clone(),
            unspents,
            prebuild,
        }
    }

    #[test]
    fn test_half_sign_all_input_types() {
        let f = fixture(&[AddressType::P2sh, AddressType::P2shP2wsh, AddressType::P2wsh]);
        let signed = sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &f.prebuild,
                keychain: &f.user,
                wallet_passphrase: None,
                is_last_signature: false,
            },
        )
        .unwrap();
        assert_eq!(signed.signed_inputs, 3);

        // Every signed input verifies on the decoded result
        let secp = Secp256k1::new();
        let tx = decode_transaction(&signed.tx_hex).unwrap();
        for (i, unspent) in f.unspents.iter().enumerate() {
            assert!(
                verify_signature(
                    &secp,
                    &tx,
                    i,
                    unspent.value,
                    &VerificationSettings::default()
                ),
                "input {} failed verification",
                i
            );
        }
    }

    #[test]
    fn test_cosign_completes_transaction() {
        let f = fixture(&[AddressType::P2sh, AddressType::P2wsh]);

        let half = sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &f.prebuild,
                keychain: &f.user,
                wallet_passphrase: None,
                is_last_signature: false,
            },
        )
        .unwrap();

        // Backup key completes the half-signed transaction
        let secp = Secp256k1::new();
        let backup_xpub = Xpub::from_priv(&secp, &f.backup_xprv);
        let backup = Keychain::with_prv(backup_xpub.to_string(), f.backup_xprv.to_string());
        let half_prebuild = TxPrebuild {
            tx_hex: half.tx_hex,
            tx_info: TxInfo {
                unspents: f.unspents.clone(),
                ..Default::default()
            },
        };
        let full = sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &half_prebuild,
                keychain: &backup,
                wallet_passphrase: None,
                is_last_signature: true,
            },
        )
        .unwrap();

        let tx = decode_transaction(&full.tx_hex).unwrap();
        for (i, unspent) in f.unspents.iter().enumerate() {
            let parsed = trivault_core::parse_signature_script(&tx, i).unwrap();
            let live: Vec<_> = parsed.signatures.iter().filter(|s| !s.is_empty()).collect();
            assert_eq!(live.len(), 2, "input {} should carry both signatures", i);
            assert!(verify_signature(
                &secp,
                &tx,
                i,
                unspent.value,
                &VerificationSettings::default()
            ));
        }
    }

    #[test]
    fn test_missing_unspent_metadata_fails() {
        let mut f = fixture(&[AddressType::P2sh]);
        f.prebuild.tx_info.unspents.clear();
        let result = sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &f.prebuild,
                keychain: &f.user,
                wallet_passphrase: None,
                is_last_signature: false,
            },
        );
        assert!(matches!(result, Err(WalletError::MissingUnspent(0))));
    }

    #[test]
    fn test_foreign_keychain_reports_per_input_issues() {
        let f = fixture(&[AddressType::P2sh, AddressType::P2wsh]);
        let secp = Secp256k1::new();
        let foreign_xprv = Xpriv::new_master(NetworkKind::Main, &[0x77; 32]).unwrap();
        let foreign = Keychain::with_prv(
            Xpub::from_priv(&secp, &foreign_xprv).to_string(),
            foreign_xprv.to_string(),
        );

        let result = sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &f.prebuild,
                keychain: &foreign,
                wallet_passphrase: None,
                is_last_signature: false,
            },
        );
        let Err(WalletError::InputSignatureFailure(issues)) = result else {
            panic!("expected aggregated signature failure");
        };
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].input_index, 0);
        assert_eq!(issues[0].path, "m/0/0/0/0");
        assert_eq!(issues[1].input_index, 1);
    }

    #[test]
    fn test_encrypted_keychain_signs_with_passphrase() {
        let f = fixture(&[AddressType::P2sh]);
        let prv = f.user.prv.clone().unwrap();
        let encrypted = Keychain::with_encrypted_prv(
            f.user.pub_key.clone(),
            crate::crypto::encrypt_key(&prv, "letmein").unwrap(),
        );

        assert!(sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &f.prebuild,
                keychain: &encrypted,
                wallet_passphrase: None,
                is_last_signature: false,
            },
        )
        .is_err());

        let signed = sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &f.prebuild,
                keychain: &encrypted,
                wallet_passphrase: Some("letmein"),
                is_last_signature: false,
            },
        )
        .unwrap();
        assert_eq!(signed.signed_inputs, 1);
    }

    #[test]
    fn test_outpoint_mismatch_reported() {
        let mut f = fixture(&[AddressType::P2sh]);
        f.prebuild.tx_info.unspents[0].txid = "00".repeat(32);

        let result = sign_transaction(
            &BITCOIN,
            &SignTransactionParams {
                tx_prebuild: &f.prebuild,
                keychain: &f.user,
                wallet_passphrase: None,
                is_last_signature: false,
            },
        );
        assert!(matches!(result, Err(WalletError::InputSignatureFailure(_))));
    }
}
