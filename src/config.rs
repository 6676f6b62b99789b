//! Configuration management for the swap agent
//!
//! A single TOML file, path taken from `SWAP_AGENT_CONFIG`, with `${NAME}`
//! placeholders expanded from the environment before parsing.

use crate::error::{SwapError, SwapResult};
use crate::swap::{ChainSide, TimelockPolicy};

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Everything the agent reads at startup
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub agent: AgentConfig,
    pub timelock: TimelockConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: ChainsConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub instance_id: String,
    /// Local account; must match the wallet key
    pub account: String,
    #[serde(default)]
    pub auction_ids: Vec<u64>,
    /// Also track every ended auction where the account is maker or taker
    #[serde(default)]
    pub discover: bool,
    pub poll_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Upper bound on how long one swap is driven before giving up
    pub max_wait_secs: u64,
    /// Bounded history window for the reconciler's log scan
    pub lookback_blocks: u64,
    pub log_chunk_blocks: u64,
    pub health_check_interval_secs: u64,
    /// How long a submitted write may wait for its confirmations
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
}

fn default_receipt_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelockConfig {
    pub window_a_secs: u64,
    pub window_b_secs: u64,
    pub margin_secs: u64,
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
pub struct ChainsConfig {
    pub a: ChainConfig,
    pub b: ChainConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub escrow_address: String,
    /// Only read on chain A
    pub auction_address: Option<String>,
    pub confirmation_blocks: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

impl Settings {
    /// Read, expand and validate the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_AGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Reject settings the agent cannot run with
    fn validate(&self) -> Result<()> {
        self.account()?;
        TimelockPolicy::from_config(&self.timelock)?;

        for side in [ChainSide::A, ChainSide::B] {
            let chain = self.chain(side);
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
            chain.escrow()?;
        }
        self.chains.a.auction_house()?;

        if self.chains.a.chain_id == self.chains.b.chain_id {
            tracing::warn!(
                "Chains A and B share chain id {}; swaps will run on a single ledger",
                self.chains.a.chain_id
            );
        }
        if self.agent.poll_interval_ms == 0 || self.agent.rpc_timeout_ms == 0 {
            anyhow::bail!("poll_interval_ms and rpc_timeout_ms must be positive");
        }
        if self.agent.log_chunk_blocks == 0 {
            anyhow::bail!("log_chunk_blocks must be positive");
        }
        if self.agent.auction_ids.is_empty() && !self.agent.discover {
            tracing::warn!("No auction ids configured and discovery disabled; agent will idle");
        }

        Ok(())
    }

    pub fn account(&self) -> SwapResult<Address> {
        parse_address("agent.account", &self.agent.account)
    }

    pub fn chain(&self, side: ChainSide) -> &ChainConfig {
        match side {
            ChainSide::A => &self.chains.a,
            ChainSide::B => &self.chains.b,
        }
    }

    pub fn timelock_policy(&self) -> SwapResult<TimelockPolicy> {
        TimelockPolicy::from_config(&self.timelock)
    }
}

impl ChainConfig {
    pub fn escrow(&self) -> SwapResult<Address> {
        parse_address("escrow_address", &self.escrow_address)
    }

    pub fn auction_house(&self) -> SwapResult<Address> {
        let raw = self.auction_address.as_deref().ok_or_else(|| {
            SwapError::Config(format!("Chain {} has no auction_address", self.name))
        })?;
        parse_address("auction_address", raw)
    }
}

fn parse_address(field: &str, raw: &str) -> SwapResult<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| SwapError::Config(format!("Invalid {} {:?}: {}", field, raw, e)))
}

/// Expand `${NAME}` placeholders; unset variables become empty
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
