use crate::error::Result;
use crate::indicators;
use crate::models::*;
use crate::param_utils::{get_param_f64, get_param_usize_at_least};
use crate::strategy_utils::{
    buy_signal, closes_through, crossed_above, crossed_below, hold_signal,
    meets_confidence_threshold, sell_signal,
};
use std::collections::HashMap;

pub struct MACDStrategy {
    pub template_id: String,
    min_confidence: f64,
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
    min_data_points: usize,
}

impl MACDStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Result<Self> {
        let min_confidence = get_param_f64(&parameters, "minConfidence", 0.5);
        let fast_period =
            get_param_usize_at_least(&parameters, "fastPeriod", indicators::MACD_FAST, 2)?;
        let slow_period = get_param_usize_at_least(
            &parameters,
            "slowPeriod",
            indicators::MACD_SLOW,
            fast_period + 1,
        )?;
        let signal_period =
            get_param_usize_at_least(&parameters, "signalPeriod", indicators::MACD_SIGNAL, 2)?;
        let min_data_points = slow_period.max(50) + signal_period;
        Ok(Self {
            template_id: "macd".to_string(),
            min_confidence,
            fast_period,
            slow_period,
            signal_period,
            min_data_points,
        })
    }

    fn crossover_confidence(macd: f64, signal: f64) -> f64 {
        let scale = signal.abs().max(1e-9);
        ((macd - signal).abs() / scale * 10.0 + 0.5).min(1.0)
    }
}

impl super::Strategy for MACDStrategy {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn generate_signal(&self, candles: &[Candle], candle_index: usize) -> StrategySignal {
        if candle_index < 1 || candle_index >= candles.len() {
            return hold_signal();
        }
        let prices = closes_through(candles, candle_index);
        let (macd_line, signal_line, _histogram) = indicators::calculate_macd(
            &prices,
            self.fast_period,
            self.slow_period,
            self.signal_period,
        );

        if macd_line.len() < 2 || signal_line.len() < 2 {
            return hold_signal();
        }

        let current_macd = macd_line[macd_line.len() - 1];
        let prev_macd = macd_line[macd_line.len() - 2];
        let current_signal = signal_line[signal_line.len() - 1];
        let prev_signal = signal_line[signal_line.len() - 2];

        if crossed_above(prev_macd, prev_signal, current_macd, current_signal) {
            let confidence = Self::crossover_confidence(current_macd, current_signal);
            if meets_confidence_threshold(confidence, self.min_confidence) {
                return buy_signal(confidence);
            }
        }

        if crossed_below(prev_macd, prev_signal, current_macd, current_signal) {
            let confidence = Self::crossover_confidence(current_macd, current_signal);
            if meets_confidence_threshold(confidence, self.min_confidence) {
                return sell_signal(confidence);
            }
        }

        hold_signal()
    }

    fn min_data_points(&self) -> usize {
        self.min_data_points
    }
}
