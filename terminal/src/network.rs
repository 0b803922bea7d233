//! # Network Allow-List
//!
//! Static table of chain ids the application supports. The session validates
//! the wallet's reported chain against this table; an unknown chain puts the
//! session into the `NetworkInvalid` state rather than failing the connection.

/// A supported network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub chain_id: u64,
    pub name: &'static str,
}

/// Networks the deposit/earnings backend operates on. Not mutable at runtime.
pub const SUPPORTED_NETWORKS: &[Network] = &[
    Network { chain_id: 1, name: "Ethereum Mainnet" },
    Network { chain_id: 56, name: "BNB Smart Chain" },
    Network { chain_id: 137, name: "Polygon" },
    Network { chain_id: 42161, name: "Arbitrum One" },
];

/// Look up a supported network by chain id.
pub fn find(chain_id: u64) -> Option<&'static Network> {
    SUPPORTED_NETWORKS.iter().find(|n| n.chain_id == chain_id)
}

pub fn is_supported(chain_id: u64) -> bool {
    find(chain_id).is_some()
}

/// Parse a provider-reported hex chain id (`"0x1"`). Tolerates a missing
/// `0x` prefix, which some wallets omit.
pub fn parse_chain_id_hex(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
