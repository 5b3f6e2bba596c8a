use crate::error::{MarketError, Result};
use crate::models::*;
use std::collections::HashMap;

/// Signal generator evaluated bar by bar; must only read `candles[..=candle_index]`.
pub trait Strategy {
    fn template_id(&self) -> &str;
    fn generate_signal(&self, candles: &[Candle], candle_index: usize) -> StrategySignal;
    /// Bars of history required before the first signal.
    fn min_data_points(&self) -> usize;
}

#[path = "strategies/rsi.rs"]
pub mod rsi;

pub use rsi::RSIStrategy;

#[path = "strategies/macd.rs"]
pub mod macd;

pub use macd::MACDStrategy;

#[path = "strategies/bollinger.rs"]
pub mod bollinger;

pub use bollinger::BollingerStrategy;

#[path = "strategies/sma_crossover.rs"]
pub mod sma_crossover;

pub use sma_crossover::SmaCrossoverStrategy;

#[path = "strategies/buy_and_hold.rs"]
pub mod buy_and_hold;

pub use buy_and_hold::BuyAndHoldStrategy;

const STRATEGY_IDS: [&str; 5] = ["rsi", "macd", "bollinger", "sma_crossover", "buy_and_hold"];

pub fn available_strategies() -> Vec<&'static str> {
    STRATEGY_IDS.to_vec()
}

pub fn create_strategy(
    template_id: &str,
    parameters: HashMap<String, f64>,
) -> Result<Box<dyn Strategy + Send + Sync>> {
    match template_id.trim().to_ascii_lowercase().as_str() {
        "rsi" => Ok(Box::new(RSIStrategy::new(parameters)?)),
        "macd" => Ok(Box::new(MACDStrategy::new(parameters)?)),
        "bollinger" => Ok(Box::new(BollingerStrategy::new(parameters)?)),
        "sma_crossover" => Ok(Box::new(SmaCrossoverStrategy::new(parameters)?)),
        "buy_and_hold" => Ok(Box::new(BuyAndHoldStrategy::new(parameters))),
        other => Err(MarketError::InvalidRequest(format!(
            "Unknown strategy template: {} (available: {})",
            other,
            STRATEGY_IDS.join(", ")
        ))),
    }
}
