//! Configuration management for the public transaction engine
//!
//! Loads configuration from TOML files with environment variable
//! substitution. Section defaults are tuned for a small-to-medium signer
//! population; every interval/bound is overridable per deployment.

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::gas::{GasPriceSource, GasPricing};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub balance_manager: BalanceManagerConfig,
    pub ledger: LedgerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine poll period (idle-orchestrator reaping)
    pub interval_ms: u64,
    /// Global orchestrator cap; -1 = unlimited
    pub max_inflight_orchestrators: i64,
    /// Reap idle orchestrators after this
    pub max_orchestrator_idle_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_inflight_orchestrators: 50,
            max_orchestrator_idle_secs: 600,
        }
    }
}

impl EngineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_orchestrator_idle(&self) -> Duration {
        Duration::from_secs(self.max_orchestrator_idle_secs)
    }

    /// `None` means unlimited.
    pub fn orchestrator_cap(&self) -> Option<usize> {
        usize::try_from(self.max_inflight_orchestrators).ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Orchestrator poll period
    pub interval_ms: u64,
    /// Per-signer in-flight cap; -1 = unlimited
    pub max_inflight_transactions: i64,
    /// Retries for transient submission errors before giving the tick up
    pub submission_retry_count: u32,
    /// How long a submission may go unconfirmed before a bump is considered
    pub resubmit_staleness_secs: u64,
    /// Market price must exceed the submitted price by this margin before a
    /// bump fires
    pub resubmit_price_margin_percent: u64,
    /// Relative gas-price bump
    pub gas_price_increase_percent: u64,
    /// Absolute gas-price bump floor, decimal wei
    pub gas_price_increase_absolute: String,
    /// Absolute ceiling on bumped gas price, decimal wei; unset = unbounded
    pub gas_price_increase_max: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_inflight_transactions: 500,
            submission_retry_count: 3,
            resubmit_staleness_secs: 300,
            resubmit_price_margin_percent: 10,
            gas_price_increase_percent: 10,
            gas_price_increase_absolute: "0".to_string(),
            gas_price_increase_max: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn resubmit_staleness(&self) -> Duration {
        Duration::from_secs(self.resubmit_staleness_secs)
    }

    /// `None` means unlimited.
    pub fn transaction_cap(&self) -> Option<usize> {
        usize::try_from(self.max_inflight_transactions).ok()
    }

    pub fn gas_price_increase_absolute(&self) -> EngineResult<U256> {
        parse_decimal_u256(&self.gas_price_increase_absolute, "gas_price_increase_absolute")
    }

    pub fn gas_price_increase_max(&self) -> EngineResult<U256> {
        match &self.gas_price_increase_max {
            None => Ok(U256::MAX),
            Some(raw) => parse_decimal_u256(raw, "gas_price_increase_max"),
        }
    }
}

/// Gas price source selection
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasSourceKind {
    Fixed,
    Zero,
    Node,
}

/// Fixed gas price: a single decimal legacy price, or an EIP-1559 fee pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FixedGasPrice {
    Single(String),
    Eip1559 {
        max_fee_per_gas: String,
        max_priority_fee_per_gas: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    pub source: GasSourceKind,
    pub fixed_price: Option<FixedGasPrice>,
    pub cache_ttl_secs: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            source: GasSourceKind::Node,
            fixed_price: None,
            cache_ttl_secs: 10,
        }
    }
}

impl GasConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Resolve the configured source into an oracle source, validating the
    /// fixed price when present.
    pub fn resolve_source(&self) -> EngineResult<GasPriceSource> {
        match self.source {
            GasSourceKind::Zero => Ok(GasPriceSource::Zero),
            GasSourceKind::Node => Ok(GasPriceSource::Node),
            GasSourceKind::Fixed => {
                let fixed = self.fixed_price.as_ref().ok_or_else(|| {
                    EngineError::GasPriceConfigInvalid(
                        "gas.source = \"fixed\" requires gas.fixed_price".to_string(),
                    )
                })?;
                let pricing = match fixed {
                    FixedGasPrice::Single(raw) => {
                        GasPricing::Legacy(parse_decimal_u256(raw, "gas.fixed_price")?)
                    }
                    FixedGasPrice::Eip1559 {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                    } => GasPricing::Eip1559 {
                        max_fee_per_gas: parse_decimal_u256(
                            max_fee_per_gas,
                            "gas.fixed_price.max_fee_per_gas",
                        )?,
                        max_priority_fee_per_gas: parse_decimal_u256(
                            max_priority_fee_per_gas,
                            "gas.fixed_price.max_priority_fee_per_gas",
                        )?,
                    },
                };
                Ok(GasPriceSource::Fixed(pricing))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalanceManagerConfig {
    pub cache_ttl_secs: u64,
    pub auto_fueling: AutoFuelingConfig,
}

impl Default for BalanceManagerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            auto_fueling: AutoFuelingConfig::default(),
        }
    }
}

impl BalanceManagerConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AutoFuelingConfig {
    pub enabled: bool,
    /// Treasury signer the top-ups are sent from
    pub source_address: Option<String>,
    /// Refuse to fuel when the treasury would fall below this, decimal wei
    pub source_min_balance: Option<String>,
    /// Fueling triggers when a destination dips below this, decimal wei
    pub min_dest_balance: Option<String>,
    /// Top destinations up to this, decimal wei
    pub target_dest_balance: Option<String>,
}

/// Validated auto-fueling parameters.
#[derive(Debug, Clone)]
pub struct AutoFuelingPolicy {
    pub source: Address,
    pub source_min_balance: U256,
    pub min_dest_balance: U256,
    pub target_dest_balance: U256,
}

impl AutoFuelingConfig {
    /// Resolve into a policy; `Ok(None)` when fueling is disabled.
    pub fn resolve(&self) -> EngineResult<Option<AutoFuelingPolicy>> {
        if !self.enabled {
            return Ok(None);
        }
        let source_raw = self.source_address.as_ref().ok_or_else(|| {
            EngineError::Config(
                "balance_manager.auto_fueling.source_address is required when enabled"
                    .to_string(),
            )
        })?;
        let source: Address = source_raw.parse().map_err(|_| {
            EngineError::Config(format!(
                "balance_manager.auto_fueling.source_address {source_raw} is not an address"
            ))
        })?;
        let min_dest_balance = parse_decimal_u256(
            self.min_dest_balance.as_deref().unwrap_or("0"),
            "balance_manager.auto_fueling.min_dest_balance",
        )?;
        let target_dest_balance = parse_decimal_u256(
            self.target_dest_balance.as_deref().unwrap_or("0"),
            "balance_manager.auto_fueling.target_dest_balance",
        )?;
        if target_dest_balance < min_dest_balance {
            return Err(EngineError::Config(
                "balance_manager.auto_fueling.target_dest_balance must be >= min_dest_balance"
                    .to_string(),
            ));
        }
        Ok(Some(AutoFuelingPolicy {
            source,
            source_min_balance: parse_decimal_u256(
                self.source_min_balance.as_deref().unwrap_or("0"),
                "balance_manager.auto_fueling.source_min_balance",
            )?,
            min_dest_balance,
            target_dest_balance,
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub keystore_path: Option<String>,
    pub private_key_env: Option<String>,
}

impl Settings {
    /// Load settings from the configuration file named by `TXPILOT_CONFIG`
    /// (default `config/default.toml`).
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXPILOT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {config_path:?}"))?;

        Self::load_from_str(&config_str)
    }

    /// Parse settings from a TOML string (after env substitution).
    pub fn load_from_str(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        let settings: Settings =
            toml::from_str(&substituted).with_context(|| "Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration; runs every fallible resolution once so bad
    /// values abort startup rather than surfacing mid-flight.
    fn validate(&self) -> Result<()> {
        if self.ledger.rpc_urls.is_empty() {
            anyhow::bail!("ledger.rpc_urls must not be empty");
        }
        self.orchestrator.gas_price_increase_max()?;
        self.orchestrator.gas_price_increase_absolute()?;
        self.gas.resolve_source()?;
        self.balance_manager.auto_fueling.resolve()?;
        Ok(())
    }
}

/// Parse a decimal string into a U256, surfacing a stable config error.
fn parse_decimal_u256(raw: &str, field: &str) -> EngineResult<U256> {
    U256::from_dec_str(raw.trim()).map_err(|_| {
        EngineError::GasPriceConfigInvalid(format!("{field}: {raw:?} is not a decimal integer"))
    })
}

lazy_static! {
    static ref ENV_PLACEHOLDER: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// Expand `${VAR}` placeholders from the process environment.
///
/// A placeholder whose variable is unset is left in the text, so a typo'd
/// reference fails loudly at TOML parse time instead of silently becoming
/// an empty value.
fn substitute_env_vars(raw: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
