use crate::error::{MarketError, Result};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Yahoo,
    AlphaVantage,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yahoo" | "yfinance" => Ok(Self::Yahoo),
            "alpha_vantage" | "alphavantage" => Ok(Self::AlphaVantage),
            other => Err(MarketError::Config(format!(
                "DATA_PROVIDER must be yahoo or alpha_vantage (value: {})",
                other
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Yahoo => "yahoo",
            Self::AlphaVantage => "alpha_vantage",
        }
    }
}

/// Process-level settings for the service and CLI.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub server_host: String,
    pub server_port: u16,
    pub database_path: String,
    pub provider: ProviderKind,
    pub alpha_vantage_api_key: Option<String>,
    pub cache_ttl: Duration,
    pub http_timeout: Duration,
    pub backtest_workers: usize,
    pub risk_free_rate: f64,
    pub prediction_min_history: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 8000,
            database_path: "market-desk.db".to_string(),
            provider: ProviderKind::Yahoo,
            alpha_vantage_api_key: None,
            cache_ttl: Duration::from_secs(300),
            http_timeout: Duration::from_secs(10),
            backtest_workers: num_cpus::get().max(1),
            risk_free_rate: 0.02,
            prediction_min_history: 60,
        }
    }
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let server_host = optional_setting(settings, "SERVER_HOST")
            .map(str::to_string)
            .unwrap_or(defaults.server_host);
        let server_port =
            setting_usize_or(settings, "SERVER_PORT", defaults.server_port as usize, 1)?;
        if server_port > u16::MAX as usize {
            return Err(MarketError::Config(format!(
                "Setting SERVER_PORT must be <= {} (value: {})",
                u16::MAX,
                server_port
            )));
        }
        let database_path = optional_setting(settings, "DATABASE_PATH")
            .map(str::to_string)
            .unwrap_or(defaults.database_path);
        let provider = optional_setting(settings, "DATA_PROVIDER")
            .map(ProviderKind::parse)
            .transpose()?
            .unwrap_or(defaults.provider);
        let alpha_vantage_api_key =
            optional_setting(settings, "ALPHA_VANTAGE_API_KEY").map(str::to_string);
        let cache_ttl_secs = setting_usize_or(
            settings,
            "CACHE_TTL_SECONDS",
            defaults.cache_ttl.as_secs() as usize,
            1,
        )?;
        let http_timeout_secs = setting_usize_or(
            settings,
            "HTTP_TIMEOUT_SECONDS",
            defaults.http_timeout.as_secs() as usize,
            1,
        )?;
        let backtest_workers =
            setting_usize_or(settings, "BACKTEST_WORKERS", defaults.backtest_workers, 1)?;
        let risk_free_rate = setting_f64_or(
            settings,
            "RISK_FREE_RATE",
            defaults.risk_free_rate,
            Some(0.0),
            Some(1.0),
        )?;
        let prediction_min_history = setting_usize_or(
            settings,
            "PREDICTION_MIN_HISTORY",
            defaults.prediction_min_history,
            30,
        )?;

        if provider == ProviderKind::AlphaVantage && alpha_vantage_api_key.is_none() {
            return Err(MarketError::Config(
                "ALPHA_VANTAGE_API_KEY must be set when DATA_PROVIDER is alpha_vantage"
                    .to_string(),
            ));
        }

        Ok(Self {
            server_host,
            server_port: server_port as u16,
            database_path,
            provider,
            alpha_vantage_api_key,
            cache_ttl: Duration::from_secs(cache_ttl_secs as u64),
            http_timeout: Duration::from_secs(http_timeout_secs as u64),
            backtest_workers,
            risk_free_rate,
            prediction_min_history,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// Simulation parameters for a single backtest run
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    pub position_size_ratio: f64,
    pub stop_loss_ratio: f64,
    pub take_profit_ratio: f64,
    pub fee_rate: f64,
    pub slippage_rate: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            position_size_ratio: 0.95,
            stop_loss_ratio: 0.05,
            take_profit_ratio: 0.0,
            fee_rate: 0.001,
            slippage_rate: 0.0005,
        }
    }
}

impl BacktestConfig {
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> Result<Self> {
        use crate::param_utils::get_param_f64;

        let defaults = Self::default();
        let config = Self {
            initial_capital: get_param_f64(parameters, "initialCapital", defaults.initial_capital),
            position_size_ratio: get_param_f64(
                parameters,
                "positionSizeRatio",
                defaults.position_size_ratio,
            ),
            stop_loss_ratio: get_param_f64(parameters, "stopLossRatio", defaults.stop_loss_ratio),
            take_profit_ratio: get_param_f64(
                parameters,
                "takeProfitRatio",
                defaults.take_profit_ratio,
            ),
            fee_rate: get_param_f64(parameters, "feeRate", defaults.fee_rate),
            slippage_rate: get_param_f64(parameters, "slippageRate", defaults.slippage_rate),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(MarketError::InvalidRequest(format!(
                "initialCapital must be positive (value: {})",
                self.initial_capital
            )));
        }
        if !(self.position_size_ratio > 0.0 && self.position_size_ratio <= 1.0) {
            return Err(MarketError::InvalidRequest(format!(
                "positionSizeRatio must be in (0, 1] (value: {})",
                self.position_size_ratio
            )));
        }
        for (key, value) in [
            ("stopLossRatio", self.stop_loss_ratio),
            ("takeProfitRatio", self.take_profit_ratio),
            ("feeRate", self.fee_rate),
            ("slippageRate", self.slippage_rate),
        ] {
            if !value.is_finite() || !(0.0..1.0).contains(&value) {
                return Err(MarketError::InvalidRequest(format!(
                    "{} must be in [0, 1) (value: {})",
                    key, value
                )));
            }
        }
        Ok(())
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_f64_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| MarketError::Config(format!("Setting {} must be a number (value: {})", key, raw)))?;
    if !value.is_finite() {
        return Err(MarketError::Config(format!(
            "Setting {} must be finite (value: {})",
            key, raw
        )));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(MarketError::Config(format!(
                "Setting {} must be >= {} (value: {})",
                key, min_value, raw
            )));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(MarketError::Config(format!(
                "Setting {} must be <= {} (value: {})",
                key, max_value, raw
            )));
        }
    }
    Ok(value)
}

fn setting_usize_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| MarketError::Config(format!("Setting {} must be a number (value: {})", key, raw)))?;
    if !value.is_finite() {
        return Err(MarketError::Config(format!(
            "Setting {} must be finite (value: {})",
            key, raw
        )));
    }
    if value.fract() != 0.0 {
        return Err(MarketError::Config(format!(
            "Setting {} must be an integer (value: {})",
            key, raw
        )));
    }
    if value < min as f64 {
        return Err(MarketError::Config(format!(
            "Setting {} must be >= {} (value: {})",
            key, min, raw
        )));
    }
    Ok(value as usize)
}
