use crate::error::Result;
use crate::indicators;
use crate::models::*;
use crate::param_utils::{get_param_f64, get_param_flag, get_param_usize_at_least};
use crate::strategy_utils::{buy_signal, hold_signal, sell_signal};
use std::collections::HashMap;

/// Mean reversion: enter below the lower band, exit back at the middle (or upper) band.
pub struct BollingerStrategy {
    pub template_id: String,
    period: usize,
    std_dev: f64,
    exit_at_upper: bool,
}

impl BollingerStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Result<Self> {
        let period =
            get_param_usize_at_least(&parameters, "period", indicators::BOLLINGER_PERIOD, 2)?;
        let std_dev = get_param_f64(&parameters, "stdDev", indicators::BOLLINGER_STD_DEV).max(0.1);
        let exit_at_upper = get_param_flag(&parameters, "exitAtUpper", false);
        Ok(Self {
            template_id: "bollinger".to_string(),
            period,
            std_dev,
            exit_at_upper,
        })
    }
}

impl super::Strategy for BollingerStrategy {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn generate_signal(&self, candles: &[Candle], candle_index: usize) -> StrategySignal {
        if candle_index + 1 < self.period || candle_index >= candles.len() {
            return hold_signal();
        }

        let window: Vec<f64> = candles[candle_index + 1 - self.period..=candle_index]
            .iter()
            .map(|c| c.close)
            .collect();
        let (upper, middle, lower) =
            indicators::calculate_bollinger_bands(&window, self.period, self.std_dev);
        let (Some(&upper), Some(&middle), Some(&lower)) = (upper.last(), middle.last(), lower.last())
        else {
            return hold_signal();
        };
        let width = upper - lower;
        if width <= 0.0 {
            return hold_signal();
        }

        let close = candles[candle_index].close;
        if close <= lower {
            let confidence = (0.5 + (lower - close) / width).min(1.0);
            return buy_signal(confidence);
        }

        let exit_level = if self.exit_at_upper { upper } else { middle };
        if close >= exit_level {
            let confidence = (0.5 + (close - exit_level) / width).min(1.0);
            return sell_signal(confidence);
        }

        hold_signal()
    }

    fn min_data_points(&self) -> usize {
        self.period
    }
}
