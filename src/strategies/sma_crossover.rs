use crate::error::Result;
use crate::indicators;
use crate::models::*;
use crate::param_utils::get_param_usize_at_least;
use crate::strategy_utils::{buy_signal, crossed_above, crossed_below, hold_signal, sell_signal};
use std::collections::HashMap;

pub struct SmaCrossoverStrategy {
    pub template_id: String,
    fast_period: usize,
    slow_period: usize,
}

impl SmaCrossoverStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Result<Self> {
        let fast_period = get_param_usize_at_least(&parameters, "fastPeriod", 20, 2)?;
        let slow_period =
            get_param_usize_at_least(&parameters, "slowPeriod", 50, fast_period + 1)?;
        Ok(Self {
            template_id: "sma_crossover".to_string(),
            fast_period,
            slow_period,
        })
    }

    fn mean(window: &[f64]) -> f64 {
        window.iter().sum::<f64>() / window.len() as f64
    }
}

impl super::Strategy for SmaCrossoverStrategy {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn generate_signal(&self, candles: &[Candle], candle_index: usize) -> StrategySignal {
        // Need the slow window at both the current and the previous bar.
        if candle_index < self.slow_period || candle_index >= candles.len() {
            return hold_signal();
        }

        let closes: Vec<f64> = candles[candle_index - self.slow_period..=candle_index]
            .iter()
            .map(|c| c.close)
            .collect();
        let last = closes.len() - 1;
        let fast_now = Self::mean(&closes[last + 1 - self.fast_period..]);
        let fast_prev = Self::mean(&closes[last - self.fast_period..last]);
        let slow_now = Self::mean(&closes[1..]);
        let slow_prev = Self::mean(&closes[..last]);

        let spread = if slow_now > 0.0 {
            ((fast_now - slow_now) / slow_now).abs()
        } else {
            0.0
        };
        let confidence = (0.5 + spread * indicators::TRADING_DAYS_PER_YEAR / 10.0).min(1.0);

        if crossed_above(fast_prev, slow_prev, fast_now, slow_now) {
            return buy_signal(confidence);
        }
        if crossed_below(fast_prev, slow_prev, fast_now, slow_now) {
            return sell_signal(confidence);
        }
        hold_signal()
    }

    fn min_data_points(&self) -> usize {
        self.slow_period
    }
}
