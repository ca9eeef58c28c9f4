use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
use carry_risk::RiskConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading / validation failures. Fatal at startup (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime environment the process operates in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// Per-venue API credentials and transport knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExchangeConfig {
    #[serde(rename = "type")]
    pub exchange: ExchangeId,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
    /// Request timeout in milliseconds.
    #[serde(default = "default_exchange_timeout_ms")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
}

fn default_exchange_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// One strategy entry. Parameters are typed per strategy kind rather than free-form maps.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyEntryConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub params: StrategyParams,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FundingArbitrage,
}

/// Typed funding-arbitrage strategy parameters, validated at load time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyParams {
    pub min_spread_annualized: f64,
    pub min_spread_to_hold: f64,
    pub max_risk_score: f64,
    pub kelly_fraction: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            min_spread_annualized: 0.15,
            min_spread_to_hold: 0.05,
            max_risk_score: 70.0,
            kelly_fraction: 0.25,
        }
    }
}

/// Executor tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub default_algorithm: String,
    pub max_concurrent_executions: usize,
    pub max_retries: u32,
    pub enable_risk_check: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_algorithm: "market".to_owned(),
            max_concurrent_executions: 10,
            max_retries: 3,
            enable_risk_check: true,
        }
    }
}

/// Monitoring cadence and alert channels.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Seconds between health checks.
    pub health_check_interval: u64,
    /// Seconds between statistics publications.
    pub metrics_interval: u64,
    pub channels: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            health_check_interval: 30,
            metrics_interval: 60,
            channels: vec![],
        }
    }
}

/// Top-level live-mode configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub env: Environment,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub exchanges: Vec<ExchangeConfig>,
    pub strategies: Vec<StrategyEntryConfig>,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub paper_trading: bool,
    #[serde(default)]
    pub data_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl SystemConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot safely start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.env == Environment::Production && !self.paper_trading {
            let missing = self
                .exchanges
                .iter()
                .find(|exchange| exchange.api_key.is_empty() || exchange.api_secret.is_empty());
            if let Some(exchange) = missing {
                return Err(ConfigError::Invalid(format!(
                    "live mode requires credentials for {}",
                    exchange.exchange
                )));
            }
            if self.exchanges.is_empty() {
                return Err(ConfigError::Invalid(
                    "live mode requires at least one exchange".to_owned(),
                ));
            }
        }

        if self.strategies.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one strategy must be configured".to_owned(),
            ));
        }
        for strategy in &self.strategies {
            if strategy.symbols.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "strategy '{}' has no symbols",
                    strategy.name
                )));
            }
        }
        Ok(())
    }

    /// Venues referenced by the configuration.
    pub fn exchange_ids(&self) -> Vec<ExchangeId> {
        self.exchanges
            .iter()
            .map(|exchange| exchange.exchange)
            .collect()
    }

    /// Union of all enabled strategies' symbols.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .strategies
            .iter()
            .filter(|strategy| strategy.enabled)
            .flat_map(|strategy| strategy.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}
