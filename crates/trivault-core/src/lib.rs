//! Trivault Core
//!
//! Pure primitives for 2-of-3 multisig wallets on Bitcoin-family chains:
//! network profiles, the multisig script codec, BIP32 leaf derivation,
//! address generation and verification, signature-script parsing, sighash
//! computation with ECDSA verification, and incremental input signing.
//!
//! Everything in this crate is synchronous and side-effect free; the
//! asynchronous verification pipeline lives in `trivault-wallet`.

pub mod address;
pub mod derivation;
pub mod network;
pub mod script;
pub mod sigcheck;
pub mod signer;
pub mod sigscript;

pub use address::{
    generate_address, is_valid_address, verify_address, AddressError, AddressScripts, AddressType,
    AddressVerificationParams, GeneratedAddress, DEFAULT_THRESHOLD,
};
pub use network::{CoinFamily, Network, BITCOIN, BITCOIN_TESTNET, LITECOIN, LITECOIN_TESTNET};
pub use sigcheck::{verify_signature, VerificationSettings};
pub use signer::{sign_input, SignError, Unspent};
pub use sigscript::{parse_signature_script, InputClassification, ParsedSignatureScript};
