//! Configuration management for the Conduit bridge
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bridge: BridgeConfig,
    pub intake: IntakeConfig,
    pub watcher: WatcherConfig,
    pub dispatcher: DispatcherConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub source_chain: ChainConfig,
    pub destination_chain: ChainConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub instance_id: String,
    /// Window after which a transaction with no observed deposit expires
    pub expiry_window_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    /// Idle intake sessions are dropped after this long
    pub session_idle_timeout_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    /// Source-chain confirmations before a deposit is treated as final
    pub confirmation_depth: u64,
    pub rpc_timeout_secs: u64,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    pub poll_interval_secs: u64,
    /// Destination-chain confirmations before a release is treated as final
    pub confirmation_depth: u64,
    pub rpc_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: LedgerBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// How many recent blocks the deposit scan walks per poll
    pub scan_depth: u64,
    /// Directory where freshly issued deposit keys are stored
    pub keystore_dir: Option<String>,
    /// Environment variable holding the treasury signing key
    pub wallet_key_env: Option<String>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("CONDUIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Load settings for a specific environment
    pub fn load_env(env_name: &str) -> Result<Self> {
        let config_path = PathBuf::from(format!("config/{}.toml", env_name));
        env::set_var("CONDUIT_CONFIG", config_path.to_str().unwrap());
        Self::load()
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.intake.min_amount <= Decimal::ZERO {
            anyhow::bail!("intake.min_amount must be positive");
        }
        if self.intake.min_amount >= self.intake.max_amount {
            anyhow::bail!("intake.min_amount must be below intake.max_amount");
        }
        if self.bridge.expiry_window_secs == 0 {
            anyhow::bail!("bridge.expiry_window_secs must be non-zero");
        }

        for chain in [&self.source_chain, &self.destination_chain] {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
        }

        if self.database.backend == LedgerBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url is required for the postgres backend");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_intake_bounds_parse_from_strings() {
        let raw = r#"min_amount = "0.001"
max_amount = "1""#;
        let intake: IntakeConfig = toml::from_str(raw).unwrap();
        assert_eq!(intake.min_amount, Decimal::new(1, 3));
        assert_eq!(intake.max_amount, Decimal::ONE);
    }
}
