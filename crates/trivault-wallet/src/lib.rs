//! Trivault Wallet
//!
//! The asynchronous verification pipeline of the wallet core. Before any
//! private key is applied, a server-supplied transaction prebuild is
//! independently proven to match user intent: every output is rederived
//! from the keychain triple or declared external, implicit server-added
//! spend is capped at 150 bps of the intended external spend, and input
//! amounts are validated against the previous transactions they came from.
//!
//! Network access happens only through the collaborator traits in
//! [`service`]; pure computation is delegated to `trivault-core`.

pub mod crypto;
pub mod error;
pub mod explain;
pub mod keychain;
pub mod parse;
pub mod service;
pub mod sign;
pub mod types;
pub mod verify;

pub use error::{SignatureIssue, WalletError};
pub use explain::{explain_transaction, TransactionExplanation};
pub use keychain::{Keychain, Keychains, KeySignatures};
pub use parse::{parse_transaction, ParseTransactionParams};
pub use service::{Explorer, PriceFeed, ReqId, ServiceError, WalletService};
pub use sign::{sign_transaction, SignTransactionParams, SignedTransaction};
pub use types::{
    AddressRecord, ParsedTransaction, Recipient, TxInfo, TxParams, TxPrebuild,
    VerificationOptions, WalletInfo, WalletOutput,
};
pub use verify::{postprocess_prebuild, verify_transaction};
