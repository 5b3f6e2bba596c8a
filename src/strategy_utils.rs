use crate::models::{Candle, SignalAction, StrategySignal};

/// Create a hold signal (default action when no trade signal is generated)
pub fn hold_signal() -> StrategySignal {
    StrategySignal {
        action: SignalAction::Hold,
        confidence: 0.0,
    }
}

/// Create a buy signal with the given confidence
pub fn buy_signal(confidence: f64) -> StrategySignal {
    StrategySignal {
        action: SignalAction::Buy,
        confidence,
    }
}

/// Create a sell signal with the given confidence
pub fn sell_signal(confidence: f64) -> StrategySignal {
    StrategySignal {
        action: SignalAction::Sell,
        confidence,
    }
}

/// Check if confidence meets the minimum threshold
pub fn meets_confidence_threshold(confidence: f64, min_confidence: f64) -> bool {
    confidence >= min_confidence - 1e-6
}

/// Closing prices up to and including `candle_index`
pub fn closes_through(candles: &[Candle], candle_index: usize) -> Vec<f64> {
    let end = candle_index.saturating_add(1).min(candles.len());
    candles[..end].iter().map(|c| c.close).collect()
}

/// True when `fast` moved from at-or-below `slow` to above it on the last step
pub fn crossed_above(prev_fast: f64, prev_slow: f64, fast: f64, slow: f64) -> bool {
    prev_fast <= prev_slow && fast > slow
}

pub fn crossed_below(prev_fast: f64, prev_slow: f64, fast: f64, slow: f64) -> bool {
    prev_fast >= prev_slow && fast < slow
}
