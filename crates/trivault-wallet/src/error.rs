//! Wallet-level error taxonomy
//!
//! Classification errors raised while sorting outputs are interpreted
//! locally by the parser; everything surfaced through [`WalletError`]
//! propagates to the caller unchanged.

use crate::crypto::CryptoError;
use crate::explain::ExplainError;
use crate::keychain::KeychainError;
use crate::service::ServiceError;
use crate::types::Recipient;
use thiserror::Error;
use trivault_core::address::AddressError;
use trivault_core::signer::{SignError, Unspent};

/// A per-input failure collected by the signer.
#[derive(Debug)]
pub struct SignatureIssue {
    pub input_index: usize,
    pub unspent: Unspent,
    /// Derivation path of the key that should have signed.
    pub path: String,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Explain(#[from] ExplainError),

    #[error(transparent)]
    Keychain(#[from] KeychainError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("expected outputs missing from prebuild: {0:?}")]
    MissingRecipients(Vec<Recipient>),

    #[error("implicit external spend {implicit} exceeds limit {limit}")]
    ImplicitSpendLimitExceeded { implicit: u64, limit: u64 },

    #[error("total output amount {total_outputs} exceeds total input amount {total_inputs}")]
    NegativeFee {
        total_inputs: u64,
        total_outputs: u64,
    },

    #[error("keychain integrity failure: {0}")]
    KeychainIntegrityFailure(String),

    #[error("{} input(s) failed to sign", .0.len())]
    InputSignatureFailure(Vec<SignatureIssue>),

    #[error("networking disabled: {0}")]
    NetworkingDisabled(String),

    #[error("previous transaction mismatch: expected {expected}, decoded {actual}")]
    PrevTxMismatch { expected: String, actual: String },

    #[error("no unspent metadata for input {0}")]
    MissingUnspent(usize),
}
