//! Environment-based configuration.
//!
//! All of the behavior-affecting environment variables named in the
//! external-interfaces contract are read exactly once, here, into a
//! [`Config`] value. Nothing downstream touches `std::env` directly —
//! orchestrators take `&Config` explicitly.
//!
//! ## Environment variables
//!
//! - `BCH_STEALTH_NETWORK` - "mainnet", "testnet", or "regtest" (default: "mainnet")
//! - `BCH_STEALTH_ALLOW_BASE_IMPORT` - "1" to permit importing non-stealth deposits
//! - `BCH_STEALTH_CATEGORY_MODE` - pin the category-mode fallback to "null"/"reverse"/"raw"
//! - `BCH_STEALTH_FUNDING_PREFER` - "base-first" or "stealth-first" (default: "base-first")
//! - `BCH_STEALTH_MAX_ROLE_INDEX` - cap on derived role index (default 2048, hard cap 65536)
//! - `BCH_STEALTH_DEBUG_*` - any such variable set to "1" turns on verbose diagnostics

use std::env;
use std::str::FromStr;

use thiserror::Error;

use crate::shard::CategoryMode;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// BCH network selector. Drives the CashAddr prefix and the default
/// Electrum endpoint a front-end might choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" | "reg" => Ok(Network::Regtest),
            other => Err(ConfigError::InvalidValue(
                "BCH_STEALTH_NETWORK".to_string(),
                format!("unknown network: {other}"),
            )),
        }
    }
}

impl Network {
    /// CashAddr human-readable prefix for this network.
    pub fn cashaddr_prefix(&self) -> &'static str {
        match self {
            Network::Mainnet => "bitcoincash",
            Network::Testnet | Network::Regtest => "bchtest",
        }
    }

    /// Lowercase name, as stored in the wallet-state envelope's
    /// `network` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// Funding-selector preference order, env-overridable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingPreference {
    BaseFirst,
    StealthFirst,
}

impl FromStr for FundingPreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base-first" => Ok(FundingPreference::BaseFirst),
            "stealth-first" => Ok(FundingPreference::StealthFirst),
            other => Err(ConfigError::InvalidValue(
                "BCH_STEALTH_FUNDING_PREFER".to_string(),
                format!("unknown preference: {other}"),
            )),
        }
    }
}

/// Default and hard-cap role index bound.
pub const DEFAULT_MAX_ROLE_INDEX: u32 = 2048;
pub const MAX_ROLE_INDEX_CAP: u32 = 65536;

/// Process-wide configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    /// Required to import non-stealth ("base address") deposits.
    pub allow_base_import: bool,
    /// Pins the category-mode fallback loop to a single mode instead of
    /// trying `null, reverse, raw` in order.
    pub category_mode_override: Option<CategoryMode>,
    pub funding_prefer: FundingPreference,
    pub max_role_index: u32,
    pub debug: bool,
}

impl Config {
    /// Load configuration from environment variables, first merging in
    /// a `.env` file if one is present (never overrides a variable
    /// already set in the process environment).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv();

        let network = env::var("BCH_STEALTH_NETWORK")
            .unwrap_or_else(|_| "mainnet".to_string())
            .parse()?;

        let allow_base_import = env::var("BCH_STEALTH_ALLOW_BASE_IMPORT")
            .map(|v| v == "1")
            .unwrap_or(false);

        let category_mode_override = match env::var("BCH_STEALTH_CATEGORY_MODE") {
            Ok(v) if v.is_empty() => None,
            Ok(v) => Some(match v.to_lowercase().as_str() {
                "null" => CategoryMode::Null,
                "reverse" => CategoryMode::Reverse,
                "raw" => CategoryMode::Raw,
                other => {
                    return Err(ConfigError::InvalidValue(
                        "BCH_STEALTH_CATEGORY_MODE".to_string(),
                        format!("unknown mode: {other}"),
                    ))
                }
            }),
            Err(_) => None,
        };

        let funding_prefer = env::var("BCH_STEALTH_FUNDING_PREFER")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(FundingPreference::BaseFirst);

        let max_role_index = env::var("BCH_STEALTH_MAX_ROLE_INDEX")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_ROLE_INDEX)
            .min(MAX_ROLE_INDEX_CAP);

        let debug = env::vars().any(|(k, v)| k.starts_with("BCH_STEALTH_DEBUG_") && v == "1");

        Ok(Self {
            network,
            allow_base_import,
            category_mode_override,
            funding_prefer,
            max_role_index,
            debug,
        })
    }

    /// A configuration suitable for tests: regtest, no env overrides.
    pub fn for_tests() -> Self {
        Self {
            network: Network::Regtest,
            allow_base_import: false,
            category_mode_override: None,
            funding_prefer: FundingPreference::BaseFirst,
            max_role_index: DEFAULT_MAX_ROLE_INDEX,
            debug: false,
        }
    }

    /// Print a configuration summary (no sensitive values live in this
    /// struct, unlike the Solana/FROST signing config it replaces).
    pub fn print_summary(&self) {
        println!("=== bch-stealth-pool configuration ===");
        println!("network: {:?}", self.network);
        println!("allow_base_import: {}", self.allow_base_import);
        println!("category_mode_override: {:?}", self.category_mode_override);
        println!("funding_prefer: {:?}", self.funding_prefer);
        println!("max_role_index: {}", self.max_role_index);
        println!("debug: {}", self.debug);
        println!("=======================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("testnet".parse::<Network>(), Ok(Network::Testnet)));
        assert!(matches!("regtest".parse::<Network>(), Ok(Network::Regtest)));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn cashaddr_prefixes() {
        assert_eq!(Network::Mainnet.cashaddr_prefix(), "bitcoincash");
        assert_eq!(Network::Testnet.cashaddr_prefix(), "bchtest");
    }

    #[test]
    fn max_role_index_is_capped() {
        std::env::set_var("BCH_STEALTH_MAX_ROLE_INDEX", "999999999");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.max_role_index, MAX_ROLE_INDEX_CAP);
        std::env::remove_var("BCH_STEALTH_MAX_ROLE_INDEX");
    }

    #[test]
    fn funding_preference_default() {
        std::env::remove_var("BCH_STEALTH_FUNDING_PREFER");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.funding_prefer, FundingPreference::BaseFirst);
    }
}
