//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Every engine threshold lives in [`EngineConfig`]; this module only maps
//! `PERPGUARD_*` variables onto it and validates the result.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use perpguard_domain::{EngineConfig, Leverage};
use rust_decimal::Decimal;

use crate::error::{DaemonError, DaemonResult};

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine thresholds, intervals and limits
    pub engine: EngineConfig,

    /// Environment (test, development, production)
    pub environment: Environment,

    /// JSON-lines journal file; in-memory journal when unset
    pub journal_path: Option<PathBuf>,

    /// PostgreSQL journal (feature `postgres`); takes precedence over the file
    pub database_url: Option<String>,

    /// Starting balance of the stub exchange
    pub stub_balance: Decimal,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> DaemonResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = Self::load_environment(&lookup)?;
        let engine = Self::load_engine_config(&lookup)?;

        Ok(Self {
            engine,
            environment,
            journal_path: lookup("PERPGUARD_JOURNAL_PATH").map(PathBuf::from),
            database_url: lookup("PERPGUARD_DATABASE_URL"),
            stub_balance: parse_var(&lookup, "PERPGUARD_STUB_BALANCE", Decimal::new(1000, 0))?,
        })
    }

    /// Create test configuration.
    ///
    /// Short intervals and backoff so loops and retries run quickly.
    pub fn test() -> Self {
        Self {
            engine: EngineConfig {
                slow_cycle_interval: Duration::from_millis(200),
                fast_monitor_interval: Duration::from_millis(50),
                retry_base_delay: Duration::from_millis(10),
                max_calls_per_window: 1000,
                ..EngineConfig::default()
            },
            environment: Environment::Test,
            journal_path: None,
            database_url: None,
            stub_balance: Decimal::new(1000, 0),
        }
    }

    fn load_environment<F>(lookup: &F) -> DaemonResult<Environment>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_str = lookup("PERPGUARD_ENV").unwrap_or_else(|| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid PERPGUARD_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_engine_config<F>(lookup: &F) -> DaemonResult<EngineConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();

        let leverage = parse_var(lookup, "PERPGUARD_LEVERAGE", defaults.leverage.value())?;
        let leverage = Leverage::new(leverage)
            .map_err(|e| DaemonError::Config(format!("Invalid PERPGUARD_LEVERAGE: {e}")))?;

        let config = EngineConfig {
            leverage,
            max_concurrent_positions: parse_var(
                lookup,
                "PERPGUARD_MAX_POSITIONS",
                defaults.max_concurrent_positions,
            )?,
            initial_stop_pct: parse_var(lookup, "PERPGUARD_INITIAL_STOP_PCT", defaults.initial_stop_pct)?,
            initial_take_profit_pct: parse_optional(lookup, "PERPGUARD_TAKE_PROFIT_PCT")?,
            trailing_activation_roe: parse_var(
                lookup,
                "PERPGUARD_TRAILING_ACTIVATION_ROE",
                defaults.trailing_activation_roe,
            )?,
            trailing_protection_margin_roe: parse_var(
                lookup,
                "PERPGUARD_TRAILING_MARGIN_ROE",
                defaults.trailing_protection_margin_roe,
            )?,
            trailing_min_change_pct: parse_var(
                lookup,
                "PERPGUARD_TRAILING_MIN_CHANGE_PCT",
                defaults.trailing_min_change_pct,
            )?,
            max_allocation_fraction: parse_var(
                lookup,
                "PERPGUARD_MAX_ALLOCATION",
                defaults.max_allocation_fraction,
            )?,
            slow_cycle_interval: Duration::from_secs(parse_var(
                lookup,
                "PERPGUARD_SLOW_CYCLE_SECS",
                defaults.slow_cycle_interval.as_secs(),
            )?),
            fast_monitor_interval: Duration::from_secs(parse_var(
                lookup,
                "PERPGUARD_FAST_MONITOR_SECS",
                defaults.fast_monitor_interval.as_secs(),
            )?),
            confidence_threshold: parse_var(
                lookup,
                "PERPGUARD_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            )?,
            min_stop_distance_pct: parse_var(
                lookup,
                "PERPGUARD_MIN_STOP_DISTANCE_PCT",
                defaults.min_stop_distance_pct,
            )?,
            price_tick: parse_optional(lookup, "PERPGUARD_PRICE_TICK")?,
            min_position_margin: parse_var(
                lookup,
                "PERPGUARD_MIN_POSITION_MARGIN",
                defaults.min_position_margin,
            )?,
            min_position_notional: parse_var(
                lookup,
                "PERPGUARD_MIN_POSITION_NOTIONAL",
                defaults.min_position_notional,
            )?,
            max_stop_attempts: parse_var(lookup, "PERPGUARD_MAX_STOP_ATTEMPTS", defaults.max_stop_attempts)?,
            max_order_attempts: parse_var(
                lookup,
                "PERPGUARD_MAX_ORDER_ATTEMPTS",
                defaults.max_order_attempts,
            )?,
            retry_base_delay: Duration::from_millis(parse_var(
                lookup,
                "PERPGUARD_RETRY_BASE_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            ticker_ttl: Duration::from_secs(parse_var(
                lookup,
                "PERPGUARD_TICKER_TTL_SECS",
                defaults.ticker_ttl.as_secs(),
            )?),
            positions_ttl: Duration::from_secs(parse_var(
                lookup,
                "PERPGUARD_POSITIONS_TTL_SECS",
                defaults.positions_ttl.as_secs(),
            )?),
            max_calls_per_window: parse_var(
                lookup,
                "PERPGUARD_RATE_MAX_CALLS",
                defaults.max_calls_per_window,
            )?,
            rate_window: Duration::from_secs(parse_var(
                lookup,
                "PERPGUARD_RATE_WINDOW_SECS",
                defaults.rate_window.as_secs(),
            )?),
        };

        config
            .validate()
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> DaemonResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
        None => Ok(default),
    }
}

fn parse_optional<T, F>(lookup: &F, key: &str) -> DaemonResult<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) if val.trim().is_empty() => Ok(None),
        Some(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
        None => Ok(None),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            environment: Environment::Development,
            journal_path: None,
            database_url: None,
            stub_balance: Decimal::new(1000, 0),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.engine.leverage.value(), 8);
        assert_eq!(config.engine.max_concurrent_positions, 3);
    }

    #[test]
    fn test_test_config() {
        let config = Config::test();

        assert_eq!(config.environment, Environment::Test);
        assert!(config.engine.fast_monitor_interval < config.engine.slow_cycle_interval);
        assert!(config.engine.validate().is_ok());
    }

    #[test]
    fn test_empty_lookup_gives_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.journal_path.is_none());
        assert_eq!(config.stub_balance, dec!(1000));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("PERPGUARD_ENV", "prod"),
            ("PERPGUARD_LEVERAGE", "5"),
            ("PERPGUARD_MAX_POSITIONS", "2"),
            ("PERPGUARD_TAKE_PROFIT_PCT", "0.05"),
            ("PERPGUARD_FAST_MONITOR_SECS", "2"),
            ("PERPGUARD_RETRY_BASE_MS", "250"),
            ("PERPGUARD_JOURNAL_PATH", "/var/lib/perpguard/journal.jsonl"),
        ]))
        .unwrap();

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.engine.leverage.value(), 5);
        assert_eq!(config.engine.max_concurrent_positions, 2);
        assert_eq!(config.engine.initial_take_profit_pct, Some(dec!(0.05)));
        assert_eq!(config.engine.fast_monitor_interval, Duration::from_secs(2));
        assert_eq!(config.engine.retry_base_delay, Duration::from_millis(250));
        assert_eq!(
            config.journal_path,
            Some(PathBuf::from("/var/lib/perpguard/journal.jsonl"))
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("PERPGUARD_INITIAL_STOP_PCT", "two")])).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));

        let err = Config::from_lookup(lookup(&[("PERPGUARD_ENV", "staging")])).unwrap_err();
        assert!(err.to_string().contains("PERPGUARD_ENV"));

        let err = Config::from_lookup(lookup(&[("PERPGUARD_LEVERAGE", "0")])).unwrap_err();
        assert!(err.to_string().contains("PERPGUARD_LEVERAGE"));
    }

    #[test]
    fn test_inconsistent_trailing_config_is_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("PERPGUARD_TRAILING_ACTIVATION_ROE", "0.10"),
            ("PERPGUARD_TRAILING_MARGIN_ROE", "0.20"),
        ]));
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Production.to_string(), "production");
    }
}
