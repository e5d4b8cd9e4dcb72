//! World configuration
//!
//! All recognized configuration keys for a simulation. Parsed with serde
//! so a JSON document from the (out-of-scope) transport layer maps
//! directly onto these sections. Every field has a default; `validate()`
//! rejects combinations the engine cannot run with.

use serde::{Deserialize, Serialize};

/// Top level timing and scale parameters for a simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParameters {
    /// Number of ticks in one simulated day.
    ///
    /// Strictly configuration: the design documents assume 100 while the
    /// shipped default is 3 (test-friendly). Economic formulas that
    /// convert annual rates to per-tick rates presuppose whatever value
    /// is configured here.
    pub ticks_per_day: u64,

    /// Number of days a `run_day`-driven simulation is expected to last.
    pub simulation_days: u64,

    /// Number of households synthesized for a fresh world.
    pub num_households: u64,

    /// Seed for all deterministic randomness (world synthesis and every
    /// per-tick purpose stream).
    pub global_rng_seed: u64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            ticks_per_day: 3,
            simulation_days: 30,
            num_households: 100,
            global_rng_seed: 42,
        }
    }
}

/// Goods market parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoodsMarketConfig {
    pub base_price: f64,
    /// Minimum goods a household aims to consume per day.
    pub subsistence_consumption: f64,
}

impl Default for GoodsMarketConfig {
    fn default() -> Self {
        Self {
            base_price: 10.0,
            subsistence_consumption: 1.0,
        }
    }
}

/// Labor market parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaborMarketConfig {
    pub base_wage: f64,
    /// Baseline number of government jobs kept open.
    pub government_jobs: u64,
}

impl Default for LaborMarketConfig {
    fn default() -> Self {
        Self {
            base_wage: 80.0,
            government_jobs: 20,
        }
    }
}

/// Finance market parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinanceMarketConfig {
    /// Annual deposit rate used for per-tick interest accrual.
    pub deposit_rate: f64,
    /// Annual loan rate the bank posts by default.
    pub loan_rate: f64,
    /// Annual coupon rate on government bonds.
    pub bond_coupon_rate: f64,
    /// Whether coupons are paid on the first tick of each day.
    ///
    /// When false, bonds instead pay their accumulated coupon on
    /// redemption after being held at least one full day. The two source
    /// designs disagreed; day-start coupons are the default.
    pub coupon_on_day_start: bool,
    /// Minimum collateral/income score for a loan to be approved.
    pub loan_approval_floor: f64,
}

impl Default for FinanceMarketConfig {
    fn default() -> Self {
        Self {
            deposit_rate: 0.01,
            loan_rate: 0.05,
            bond_coupon_rate: 0.03,
            coupon_on_day_start: true,
            loan_approval_floor: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub goods: GoodsMarketConfig,
    pub labor: LaborMarketConfig,
    pub finance: FinanceMarketConfig,
}

/// Central bank policy targets and starting levers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralBankPolicy {
    pub inflation_target: f64,
    pub unemployment_target: f64,
    pub base_rate: f64,
    pub reserve_ratio: f64,
}

impl Default for CentralBankPolicy {
    fn default() -> Self {
        Self {
            inflation_target: 0.02,
            unemployment_target: 0.05,
            base_rate: 0.03,
            reserve_ratio: 0.1,
        }
    }
}

/// Fiscal policy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiscalPolicyConfig {
    pub tax_rate: f64,
    pub unemployment_benefit: f64,
    pub government_spending: f64,
    /// Education level gained per day of study.
    pub education_gain: f64,
    pub central_bank: CentralBankPolicy,
}

impl Default for FiscalPolicyConfig {
    fn default() -> Self {
        Self {
            tax_rate: 0.15,
            unemployment_benefit: 50.0,
            government_spending: 10_000.0,
            education_gain: 0.05,
            central_bank: CentralBankPolicy::default(),
        }
    }
}

/// Sandbox resource limits and pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget per script invocation (seconds).
    pub script_timeout_seconds: f64,
    /// Resident-memory cap per worker (MB).
    pub script_memory_limit_mb: u64,
    /// CPU-seconds cap per worker.
    pub script_cpu_limit_seconds: u64,
    /// Number of worker processes kept in the pool.
    pub worker_pool_size: usize,
    /// Invocations before a worker process is recycled.
    pub worker_max_invocations: u64,
    /// Concurrent sandbox invocations per tick.
    pub script_execution_concurrency: usize,
    /// Interpreter binary the workers run.
    pub python_bin: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            script_timeout_seconds: 0.75,
            script_memory_limit_mb: 256,
            script_cpu_limit_seconds: 1,
            worker_pool_size: 4,
            worker_max_invocations: 200,
            script_execution_concurrency: 8,
            python_bin: "python3".to_string(),
        }
    }
}

/// Durable-store retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Write attempts before a durable failure escalates to
    /// `PersistenceError` and freezes the simulation.
    pub durable_retry_budget: u32,
    /// First backoff delay (milliseconds); doubles per attempt.
    pub durable_retry_base_ms: u64,
    /// Number of recent tick-log entries kept in the cache ring.
    pub log_ring_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durable_retry_budget: 3,
            durable_retry_base_ms: 20,
            log_ring_capacity: 512,
        }
    }
}

/// Feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Inject household-level shocks each tick.
    pub shock_enabled: bool,
    /// Let the baseline cover agents without a bound script.
    pub allow_fallback_for_missing: bool,
    /// Std-dev of the ability shock multiplier.
    pub shock_ability_std: f64,
    /// Std-dev of the asset shock (fraction of cash).
    pub shock_asset_std: f64,
    /// Per-household cap on the shock magnitude (fraction).
    pub shock_max_fraction: f64,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            shock_enabled: false,
            allow_fallback_for_missing: true,
            shock_ability_std: 0.05,
            shock_asset_std: 0.02,
            shock_max_fraction: 0.2,
        }
    }
}

/// Complete world configuration.
///
/// # Example
/// ```
/// use econ_sim_core_rs::WorldConfig;
///
/// let mut config = WorldConfig::default();
/// config.simulation.ticks_per_day = 3;
/// config.simulation.global_rng_seed = 42;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub simulation: SimulationParameters,
    pub markets: MarketConfig,
    pub policies: FiscalPolicyConfig,
    pub sandbox: SandboxConfig,
    pub store: StoreConfig,
    pub features: FeatureFlags,
}

impl WorldConfig {
    /// Validate parameter combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.simulation.ticks_per_day == 0 {
            return Err("ticks_per_day must be > 0".to_string());
        }
        if self.simulation.simulation_days == 0 {
            return Err("simulation_days must be > 0".to_string());
        }
        if self.simulation.num_households == 0 {
            return Err("num_households must be > 0".to_string());
        }
        if self.sandbox.script_timeout_seconds <= 0.0 {
            return Err("script_timeout_seconds must be positive".to_string());
        }
        if self.sandbox.worker_pool_size == 0 {
            return Err("worker_pool_size must be > 0".to_string());
        }
        if self.sandbox.script_execution_concurrency == 0 {
            return Err("script_execution_concurrency must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.policies.central_bank.reserve_ratio) {
            return Err("reserve_ratio must lie in [0, 1]".to_string());
        }
        Ok(())
    }

    /// Per-tick deposit interest derived from the annual rate:
    /// `(1 + r)^(1 / (ticks_per_day * 365)) - 1`.
    pub fn per_tick_interest(&self, annual_rate: f64) -> f64 {
        let periods = (self.simulation.ticks_per_day * 365) as f64;
        (1.0 + annual_rate).powf(1.0 / periods) - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(WorldConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_ticks_per_day() {
        let mut config = WorldConfig::default();
        config.simulation.ticks_per_day = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_tick_interest_compounds_to_annual() {
        let config = WorldConfig::default();
        let per_tick = config.per_tick_interest(0.05);
        let periods = (config.simulation.ticks_per_day * 365) as f64;
        let compounded = (1.0 + per_tick).powf(periods);
        assert!((compounded - 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_partial_document_fills_remaining_defaults() {
        let raw = r#"{"simulation": {"ticks_per_day": 5, "global_rng_seed": 7}}"#;
        let config: WorldConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.simulation.ticks_per_day, 5);
        assert_eq!(config.simulation.global_rng_seed, 7);
        // untouched sections keep defaults
        assert_eq!(config.sandbox.script_timeout_seconds, 0.75);
    }
}
