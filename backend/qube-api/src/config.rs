//! Application configuration loaded from environment variables.
//!
//! Everything is read and validated once at startup; request handlers only
//! ever see the resulting [`Config`].

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;

use crate::errors::{QubeError, Result};

/// Wallet credited with the protocol fee on every escrow withdrawal.
pub const PROTOCOL_FEE_RECIPIENT: &str = "0xe5502c6a5a6e4Aa86ACc87Aa3aAAD1B87BCFFA93";

/// Largest decimals value ethers unit conversion accepts.
pub const MAX_TOKEN_DECIMALS: u32 = 77;

#[derive(Debug, Clone)]
pub struct Config {
    /// Signer built from `WALLET_PRIVATE_KEY`. `Debug` only shows its address.
    pub signer: LocalWallet,
    /// JSON-RPC endpoint of the chain hosting the escrow contract
    pub provider_url: String,
    /// Escrow contract holding deposited project rewards
    pub escrow_contract: Address,
    /// Protocol fee recipient, always [`PROTOCOL_FEE_RECIPIENT`]
    pub fee_recipient: Address,
    /// Chain id for transaction signing; queried on the first withdrawal when unset
    pub chain_id: Option<u64>,
    /// Decimals of the reward token, used to convert amounts to base units
    pub token_decimals: u32,
    /// Upper bound on a single withdrawal submission
    pub settlement_timeout_secs: u64,
    /// SQLite database URL
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. `from_env` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let signer = var("WALLET_PRIVATE_KEY")
            .ok_or_else(|| {
                QubeError::Config("WALLET_PRIVATE_KEY environment variable is required".to_string())
            })?
            .trim()
            .parse::<LocalWallet>()
            .map_err(|_| QubeError::Config("Invalid WALLET_PRIVATE_KEY".to_string()))?;

        let provider_url = var("PROVIDER_URL").ok_or_else(|| {
            QubeError::Config("PROVIDER_URL environment variable is required".to_string())
        })?;

        let escrow_contract = var("ESCROW_CONTRACT_ADDRESS")
            .ok_or_else(|| {
                QubeError::Config(
                    "ESCROW_CONTRACT_ADDRESS environment variable is required".to_string(),
                )
            })?
            .trim()
            .parse::<Address>()
            .map_err(|_| QubeError::Config("Invalid ESCROW_CONTRACT_ADDRESS".to_string()))?;

        let fee_recipient = PROTOCOL_FEE_RECIPIENT
            .parse::<Address>()
            .map_err(|_| QubeError::Config("Invalid protocol fee recipient".to_string()))?;

        let chain_id = match var("CHAIN_ID") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| QubeError::Config("Invalid CHAIN_ID".to_string()))?,
            ),
            None => None,
        };

        let token_decimals = var("TOKEN_DECIMALS")
            .unwrap_or_else(|| "18".to_string())
            .parse::<u32>()
            .ok()
            .filter(|d| *d <= MAX_TOKEN_DECIMALS)
            .ok_or_else(|| {
                QubeError::Config(format!(
                    "Invalid TOKEN_DECIMALS: expected an integer from 0 to {MAX_TOKEN_DECIMALS}"
                ))
            })?;

        Ok(Config {
            signer,
            provider_url,
            escrow_contract,
            fee_recipient,
            chain_id,
            token_decimals,
            settlement_timeout_secs: var("SETTLEMENT_TIMEOUT_SECS")
                .unwrap_or_else(|| "60".to_string())
                .parse()
                .map_err(|_| QubeError::Config("Invalid SETTLEMENT_TIMEOUT_SECS".to_string()))?,
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite:./qube.db".to_string()),
            api_port: var("API_PORT")
                .unwrap_or_else(|| "3000".to_string())
                .parse()
                .map_err(|_| QubeError::Config("Invalid API_PORT".to_string()))?,
        })
    }

    /// Address the withdrawals are signed from.
    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from_map(map: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
        move |key| map.get(key).cloned()
    }

    // Well-known development key (anvil account #0).
    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn base() -> HashMap<String, String> {
        HashMap::from([
            ("WALLET_PRIVATE_KEY".to_string(), DEV_KEY.to_string()),
            ("PROVIDER_URL".to_string(), "http://127.0.0.1:8545".to_string()),
            (
                "ESCROW_CONTRACT_ADDRESS".to_string(),
                "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
            ),
        ])
    }

    #[test]
    fn defaults_applied() {
        let config = Config::from_lookup(lookup_from_map(base())).unwrap();
        assert_eq!(config.api_port, 3000);
        assert_eq!(config.token_decimals, 18);
        assert_eq!(config.settlement_timeout_secs, 60);
        assert_eq!(config.database_url, "sqlite:./qube.db");
        assert_eq!(config.chain_id, None);
        assert_eq!(
            config.fee_recipient,
            PROTOCOL_FEE_RECIPIENT.parse::<Address>().unwrap()
        );
        assert_eq!(config.signer_address(), DEV_ADDRESS.parse::<Address>().unwrap());
    }

    #[test]
    fn accepts_prefixed_key_and_overrides() {
        let mut env = base();
        env.insert("WALLET_PRIVATE_KEY".into(), format!("0x{DEV_KEY}"));
        env.insert("CHAIN_ID".into(), "31337".into());
        env.insert("TOKEN_DECIMALS".into(), "6".into());
        env.insert("API_PORT".into(), "8080".into());

        let config = Config::from_lookup(lookup_from_map(env)).unwrap();
        assert_eq!(config.chain_id, Some(31337));
        assert_eq!(config.token_decimals, 6);
        assert_eq!(config.api_port, 8080);
    }

    #[test]
    fn missing_required_values_are_rejected() {
        for key in ["WALLET_PRIVATE_KEY", "PROVIDER_URL", "ESCROW_CONTRACT_ADDRESS"] {
            let mut env = base();
            env.remove(key);
            let err = Config::from_lookup(lookup_from_map(env)).unwrap_err();
            assert!(matches!(err, QubeError::Config(ref m) if m.contains(key)), "{key}: {err}");
        }
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut env = base();
        env.insert("ESCROW_CONTRACT_ADDRESS".into(), "0x1234".into());
        assert!(Config::from_lookup(lookup_from_map(env)).is_err());

        let mut env = base();
        env.insert("WALLET_PRIVATE_KEY".into(), "not-a-key".into());
        assert!(Config::from_lookup(lookup_from_map(env)).is_err());

        let mut env = base();
        env.insert("API_PORT".into(), "99999".into());
        assert!(Config::from_lookup(lookup_from_map(env)).is_err());

        for decimals in ["78", "100", "-1"] {
            let mut env = base();
            env.insert("TOKEN_DECIMALS".into(), decimals.into());
            let err = Config::from_lookup(lookup_from_map(env)).unwrap_err();
            assert!(matches!(err, QubeError::Config(ref m) if m.contains("TOKEN_DECIMALS")));
        }

        let mut env = base();
        env.insert("TOKEN_DECIMALS".into(), MAX_TOKEN_DECIMALS.to_string());
        assert_eq!(
            Config::from_lookup(lookup_from_map(env)).unwrap().token_decimals,
            MAX_TOKEN_DECIMALS
        );
    }
}
