//! Configuration management for the position manager.
//!
//! Loads settings from environment variables and config files.

use crate::ledger::{Address, PositionSide, ReferrerCode, SimulatedLedgerConfig};
use crate::lemma::{ControllerConfig, LemmaSettings};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Market identity and settlement token precision
    #[serde(default)]
    pub market: MarketConfig,
    /// Roles, caps and sizing of the position manager
    #[serde(default)]
    pub lemma: LemmaConfig,
    /// Parameters of the in-memory protocol used by `scenario`
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Base token (hex address or label)
    #[serde(default = "default_base_token")]
    pub base_token: String,
    /// Quote token (hex address or label)
    #[serde(default = "default_quote_token")]
    pub quote_token: String,
    /// Native precision of the settlement token
    #[serde(default = "default_collateral_decimals")]
    pub collateral_decimals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LemmaConfig {
    /// Account of the position manager itself
    #[serde(default = "default_lemma_address")]
    pub address: String,
    /// Owner allowed to change settings
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Only account allowed to open and close
    #[serde(default = "default_usd_issuer")]
    pub usd_issuer: String,
    /// Account allowed to rebalance (unset until configured)
    #[serde(default)]
    pub rebalancer: Option<String>,
    /// Referral code attached to clearing house calls (max 31 bytes)
    #[serde(default)]
    pub referrer_code: String,
    /// Cap on open notional in quote units (unset = unbounded)
    #[serde(default)]
    pub max_position: Option<Decimal>,
    /// Side opened by exact-collateral opens
    #[serde(default = "default_direction")]
    pub direction: PositionSide,
    /// Position notional per unit of collateral value
    #[serde(default = "default_target_leverage")]
    pub target_leverage: Decimal,
    /// Accepted deviation of realized leverage from the target
    #[serde(default = "default_leverage_tolerance")]
    pub leverage_tolerance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Virtual base reserve of the market
    #[serde(default = "default_base_reserve")]
    pub base_reserve: Decimal,
    /// Virtual quote reserve of the market
    #[serde(default = "default_quote_reserve")]
    pub quote_reserve: Decimal,
    /// Trading fee on the quote leg (0.0-1.0)
    #[serde(default = "default_fee_ratio")]
    pub fee_ratio: Decimal,
    /// Initial margin ratio (0.0-1.0)
    #[serde(default = "default_initial_margin_ratio")]
    pub initial_margin_ratio: Decimal,
    /// Oracle price of one settlement token in quote units
    #[serde(default = "default_collateral_price")]
    pub collateral_price: Decimal,
    /// Settlement tokens held by the vault for makers
    #[serde(default = "default_vault_liquidity")]
    pub vault_liquidity: Decimal,
}

// Default value functions
fn default_base_token() -> String {
    "vETH".to_string()
}

fn default_quote_token() -> String {
    "vUSD".to_string()
}

fn default_collateral_decimals() -> u32 {
    6
}

fn default_lemma_address() -> String {
    "perp_lemma".to_string()
}

fn default_owner() -> String {
    "owner".to_string()
}

fn default_usd_issuer() -> String {
    "usd_lemma".to_string()
}

fn default_direction() -> PositionSide {
    PositionSide::Short
}

fn default_target_leverage() -> Decimal {
    Decimal::ONE // 1x
}

fn default_leverage_tolerance() -> Decimal {
    Decimal::new(31, 3) // 0.031
}

fn default_base_reserve() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_quote_reserve() -> Decimal {
    Decimal::new(1_000_000, 0) // price 100
}

fn default_fee_ratio() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1%)
}

fn default_initial_margin_ratio() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_collateral_price() -> Decimal {
    Decimal::ONE
}

fn default_vault_liquidity() -> Decimal {
    Decimal::new(1_000_000, 0)
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("PERP_LEMMA"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.market.collateral_decimals <= 18,
            "collateral_decimals must be at most 18"
        );

        anyhow::ensure!(
            self.lemma.target_leverage > Decimal::ZERO,
            "target_leverage must be positive"
        );

        anyhow::ensure!(
            self.lemma.leverage_tolerance >= Decimal::ZERO,
            "leverage_tolerance must not be negative"
        );

        anyhow::ensure!(
            self.lemma.max_position.map_or(true, |cap| cap >= Decimal::ZERO),
            "max_position must not be negative"
        );

        self.lemma
            .referrer_code
            .parse::<ReferrerCode>()
            .map_err(anyhow::Error::msg)?;

        anyhow::ensure!(
            self.simulation.base_reserve > Decimal::ZERO
                && self.simulation.quote_reserve > Decimal::ZERO,
            "simulation reserves must be positive"
        );

        anyhow::ensure!(
            self.simulation.fee_ratio >= Decimal::ZERO && self.simulation.fee_ratio < Decimal::ONE,
            "fee_ratio must be between 0 and 1"
        );

        anyhow::ensure!(
            self.simulation.initial_margin_ratio > Decimal::ZERO
                && self.simulation.initial_margin_ratio <= Decimal::ONE,
            "initial_margin_ratio must be between 0 and 1"
        );

        anyhow::ensure!(
            self.simulation.collateral_price > Decimal::ZERO,
            "collateral_price must be positive"
        );

        Ok(())
    }

    /// Initial settings record of the position manager.
    pub fn lemma_settings(&self) -> Result<LemmaSettings> {
        let referrer_code = self
            .lemma
            .referrer_code
            .parse::<ReferrerCode>()
            .map_err(anyhow::Error::msg)
            .context("Invalid referrer code")?;

        Ok(LemmaSettings {
            owner: Address::parse_or_label(&self.lemma.owner),
            usd_issuer: Address::parse_or_label(&self.lemma.usd_issuer),
            rebalancer: self.lemma.rebalancer.as_deref().map(Address::parse_or_label),
            referrer_code,
            max_position: self.lemma.max_position.unwrap_or(Decimal::MAX),
        })
    }

    /// Static sizing parameters of the position manager.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            address: Address::parse_or_label(&self.lemma.address),
            base_token: Address::parse_or_label(&self.market.base_token),
            direction: self.lemma.direction,
            target_leverage: self.lemma.target_leverage,
        }
    }

    pub fn simulated_ledger_config(&self) -> SimulatedLedgerConfig {
        SimulatedLedgerConfig {
            collateral_decimals: self.market.collateral_decimals,
            initial_margin_ratio: self.simulation.initial_margin_ratio,
            vault_liquidity: self.simulation.vault_liquidity,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            market: MarketConfig::default(),
            lemma: LemmaConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_token: default_base_token(),
            quote_token: default_quote_token(),
            collateral_decimals: default_collateral_decimals(),
        }
    }
}

impl Default for LemmaConfig {
    fn default() -> Self {
        Self {
            address: default_lemma_address(),
            owner: default_owner(),
            usd_issuer: default_usd_issuer(),
            rebalancer: None,
            referrer_code: String::new(),
            max_position: None,
            direction: default_direction(),
            target_leverage: default_target_leverage(),
            leverage_tolerance: default_leverage_tolerance(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            base_reserve: default_base_reserve(),
            quote_reserve: default_quote_reserve(),
            fee_ratio: default_fee_ratio(),
            initial_margin_ratio: default_initial_margin_ratio(),
            collateral_price: default_collateral_price(),
            vault_liquidity: default_vault_liquidity(),
        }
    }
}
