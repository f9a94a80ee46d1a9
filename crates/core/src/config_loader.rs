use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    pub const ENV_PREFIX: &'static str = "CRYPTOBOT_";

    /// Loads configuration by layering built-in defaults, an optional TOML
    /// file and `CRYPTOBOT_`-prefixed environment variables, later layers
    /// winning. Nested keys in the environment are separated by `__` and keep
    /// their camelCase spelling, e.g. `CRYPTOBOT_RISK__maxTradesPerDay=3`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed, a value has the wrong
    /// type, or the rate limits could stall requests indefinitely.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: AppConfig = figment
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__").lowercase(false))
            .extract()
            .context("Failed to load configuration")?;
        config
            .rate_limits
            .validate()
            .context("Invalid rate limit configuration")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradingMode;
    use rust_decimal_macros::dec;

    #[test]
    fn test_toml_then_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cryptobot.toml",
                r#"
                [trading]
                mode = "live"
                leverage = 5

                [risk]
                maxTradesPerDay = 4
                riskPct = "0.01"

                [strategies.ma_crossover]
                weight = "0.8"
                "#,
            )?;
            jail.set_env("CRYPTOBOT_RISK__maxTradesPerDay", "7");

            let config = ConfigLoader::load(Some(Path::new("cryptobot.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.trading.mode, TradingMode::Live);
            assert_eq!(config.trading.leverage, 5);
            assert_eq!(config.trading.taker_fee, dec!(0.001));
            assert_eq!(config.risk.max_trades_per_day, 7);
            assert_eq!(config.risk.risk_pct, dec!(0.01));
            assert_eq!(config.strategies["ma_crossover"].weight, dec!(0.8));
            Ok(())
        });
    }

    #[test]
    fn test_stalling_refill_rate_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cryptobot.toml",
                r#"
                [rateLimits.orders]
                capacity = 50.0
                refillRate = 1e-300
                burstAllowance = 10.0
                "#,
            )?;
            let err = ConfigLoader::load(Some(Path::new("cryptobot.toml"))).unwrap_err();
            assert!(format!("{err:#}").contains("rateLimits.orders"));

            jail.create_file(
                "cryptobot.toml",
                r#"
                [rateLimits.public]
                capacity = 120.0
                refillRate = 0.0
                burstAllowance = 10.0
                "#,
            )?;
            assert!(ConfigLoader::load(Some(Path::new("cryptobot.toml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_default_rate_limits_are_valid() {
        assert!(AppConfig::default().rate_limits.validate().is_ok());
    }

    #[test]
    fn test_defaults_without_file() {
        figment::Jail::expect_with(|_jail| {
            let config = ConfigLoader::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config, AppConfig::default());
            Ok(())
        });
    }
}
