//! Per-coin network profiles
//!
//! Every algorithm in this workspace is parameterised by a [`Network`]: the
//! base58 version bytes, the bech32 HRP, and the capability bits that decide
//! which script classes a coin supports. Profiles are plain constants — the
//! core takes them by shared reference and never mutates them.

use bitcoin::sighash::EcdsaSighashType;

/// Coin family a network belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoinFamily {
    Bitcoin,
    Litecoin,
}

/// Immutable per-coin constants and capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    /// Short coin ticker, e.g. "btc" or "tltc".
    pub coin: &'static str,
    pub family: CoinFamily,
    /// Base58check version byte for P2PKH addresses.
    pub pub_key_hash: u8,
    /// Base58check version byte for P2SH addresses.
    pub script_hash: u8,
    /// Legacy P2SH version byte kept for coins that migrated prefixes
    /// (Litecoin `3…`/`2…` addresses). Only honoured when alt-script
    /// destinations are enabled.
    pub alt_script_hash: Option<u8>,
    /// Human-readable part for native segwit addresses, if the coin has one.
    pub bech32_hrp: Option<&'static str>,
    /// Whether native P2WSH outputs can be generated for this coin.
    pub supports_p2wsh: bool,
    /// Whether addresses under `alt_script_hash` are accepted without the
    /// caller opting in per call.
    pub supports_alt_script_destination: bool,
    /// Whether fee-estimating collaborators may ask for a confirmation
    /// block target on this coin. Unused by the core itself.
    pub supports_block_target: bool,
    /// Sighash flag applied when no override is given.
    pub default_sighash: EcdsaSighashType,
}

impl Network {
    /// Version bytes accepted for base58 addresses on this network.
    ///
    /// The alt script-hash byte is included only when the network enables it
    /// globally or the caller forces it for a single validation.
    pub fn allowed_versions(&self, force_alt_script_support: bool) -> Vec<u8> {
        let mut versions = vec![self.pub_key_hash, self.script_hash];
        if force_alt_script_support || self.supports_alt_script_destination {
            if let Some(alt) = self.alt_script_hash {
                versions.push(alt);
            }
        }
        versions
    }

    /// Whether an unspent is a platform-attached replay-protection input.
    ///
    /// Such inputs are signed by the platform, never by the user key, so the
    /// signer skips them. None of the profiles shipped here taint unspents;
    /// fork coins with replay protection override this via the address list.
    pub fn is_replay_protection_unspent(&self, address: &str) -> bool {
        self.replay_protection_addresses()
            .iter()
            .any(|a| *a == address)
    }

    fn replay_protection_addresses(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Bitcoin mainnet.
pub const BITCOIN: Network = Network {
    coin: "btc",
    family: CoinFamily::Bitcoin,
    pub_key_hash: 0x00,
    script_hash: 0x05,
    alt_script_hash: None,
    bech32_hrp: Some("bc"),
    supports_p2wsh: true,
    supports_alt_script_destination: false,
    supports_block_target: true,
    default_sighash: EcdsaSighashType::All,
};

/// Bitcoin testnet.
pub const BITCOIN_TESTNET: Network = Network {
    coin: "tbtc",
    family: CoinFamily::Bitcoin,
    pub_key_hash: 0x6f,
    script_hash: 0xc4,
    alt_script_hash: None,
    bech32_hrp: Some("tb"),
    supports_p2wsh: true,
    supports_alt_script_destination: false,
    supports_block_target: true,
    default_sighash: EcdsaSighashType::All,
};

/// Litecoin mainnet. Carries the legacy `3…` script-hash byte as an alt
/// version: old-style addresses validate only when alt destinations are
/// explicitly enabled.
pub const LITECOIN: Network = Network {
    coin: "ltc",
    family: CoinFamily::Litecoin,
    pub_key_hash: 0x30,
    script_hash: 0x32,
    alt_script_hash: Some(0x05),
    bech32_hrp: Some("ltc"),
    supports_p2wsh: false,
    supports_alt_script_destination: false,
    supports_block_target: true,
    default_sighash: EcdsaSighashType::All,
};

/// Litecoin testnet.
pub const LITECOIN_TESTNET: Network = Network {
    coin: "tltc",
    family: CoinFamily::Litecoin,
    pub_key_hash: 0x6f,
    script_hash: 0x3a,
    alt_script_hash: Some(0xc4),
    bech32_hrp: Some("tltc"),
    supports_p2wsh: false,
    supports_alt_script_destination: false,
    supports_block_target: true,
    default_sighash: EcdsaSighashType::All,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alt_version_requires_opt_in() {
        // Litecoin's legacy prefix is not accepted by default
        let versions = LITECOIN.allowed_versions(false);
        assert!(!versions.contains(&0x05));

        // ...but is when the caller forces alt-script support
        let versions = LITECOIN.allowed_versions(true);
        assert!(versions.contains(&0x05));
    }

    #[test]
    fn test_bitcoin_has_no_alt_version() {
        // Forcing alt support on a coin without an alt byte changes nothing
        assert_eq!(
            BITCOIN.allowed_versions(true),
            BITCOIN.allowed_versions(false)
        );
    }

    #[test]
    fn test_p2wsh_capability() {
        assert!(BITCOIN.supports_p2wsh);
        assert!(!LITECOIN.supports_p2wsh);
    }

    #[test]
    fn test_no_replay_protection_on_base_profiles() {
        assert!(!BITCOIN.is_replay_protection_unspent("3P14159f73E4gFr7JterCCQh9QjiTjiZrG"));
    }
}
