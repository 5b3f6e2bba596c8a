use crate::models::Candle;

pub const PRICE_EPSILON: f64 = 1e-6;

/// Whole-share quantity affordable with `available_cash × size_ratio`, fees included.
pub fn determine_position_size(
    price: f64,
    available_cash: f64,
    size_ratio: f64,
    fee_rate: f64,
) -> u64 {
    if price <= 0.0 || !price.is_finite() || !available_cash.is_finite() {
        return 0;
    }
    let allocation = available_cash.max(0.0) * size_ratio.clamp(0.0, 1.0);
    let unit_cost = price * (1.0 + fee_rate.max(0.0));
    let shares = (allocation / unit_cost + PRICE_EPSILON).floor();
    if shares.is_finite() && shares > 0.0 {
        shares as u64
    } else {
        0
    }
}

pub fn stop_loss_level(entry_price: f64, stop_loss_ratio: f64) -> Option<f64> {
    (stop_loss_ratio.is_finite() && stop_loss_ratio > 0.0 && stop_loss_ratio < 1.0)
        .then(|| entry_price * (1.0 - stop_loss_ratio))
}

pub fn take_profit_level(entry_price: f64, take_profit_ratio: f64) -> Option<f64> {
    (take_profit_ratio.is_finite() && take_profit_ratio > 0.0)
        .then(|| entry_price * (1.0 + take_profit_ratio))
}

/// Fill price for a long stop: the stop itself, or the open when the bar gapped below it.
pub fn stop_loss_exit_price(current_candle: &Candle, stop_loss: f64) -> Option<f64> {
    if current_candle.low <= stop_loss {
        if current_candle.open <= stop_loss {
            Some(current_candle.open)
        } else {
            Some(stop_loss)
        }
    } else {
        None
    }
}

pub fn take_profit_exit_price(current_candle: &Candle, target: f64) -> Option<f64> {
    if current_candle.high >= target {
        if current_candle.open >= target {
            Some(current_candle.open)
        } else {
            Some(target)
        }
    } else {
        None
    }
}

pub fn apply_entry_slippage(price: f64, slippage_rate: f64) -> f64 {
    price * (1.0 + slippage_rate)
}

pub fn apply_exit_slippage(price: f64, slippage_rate: f64) -> f64 {
    price * (1.0 - slippage_rate)
}
