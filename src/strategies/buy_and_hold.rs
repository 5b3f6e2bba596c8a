use crate::models::*;
use crate::strategy_utils::buy_signal;
use std::collections::HashMap;

/// Benchmark strategy: always wants to be long, so it enters on the first
/// tradable bar and never emits a sell.
pub struct BuyAndHoldStrategy {
    template_id: String,
}

impl BuyAndHoldStrategy {
    pub fn new(_parameters: HashMap<String, f64>) -> Self {
        Self {
            template_id: "buy_and_hold".to_string(),
        }
    }
}

impl super::Strategy for BuyAndHoldStrategy {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn generate_signal(&self, _candles: &[Candle], _candle_index: usize) -> StrategySignal {
        buy_signal(1.0)
    }

    fn min_data_points(&self) -> usize {
        0
    }
}
