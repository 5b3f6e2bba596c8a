use crate::error::{MarketError, Result};
use crate::models::{Candle, SignalAction};
use serde::{Deserialize, Serialize};

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_DEV: f64 = 2.0;
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period <= 1 {
        return prices.to_vec();
    }
    if prices.len() < period {
        return vec![prices[0]; prices.len()];
    }

    // Warm-up entries repeat the first price so the output stays index-aligned.
    let mut sma_values = vec![prices[0]; period - 1];
    sma_values.reserve(prices.len() - period + 1);

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values.push(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values.push(window_sum / period as f64);
    }

    sma_values
}

pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<f64> {
    let Some(&first) = prices.first() else {
        return Vec::new();
    };

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(prices.len());
    let mut previous = first;
    ema_values.push(first);

    for &price in &prices[1..] {
        previous = price * multiplier + previous * (1.0 - multiplier);
        ema_values.push(previous);
    }

    ema_values
}

pub fn calculate_macd(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast_ema = calculate_ema(prices, fast_period);
    let slow_ema = calculate_ema(prices, slow_period);

    let macd_line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(fast, slow)| fast - slow)
        .collect();
    let signal_line = calculate_ema(&macd_line, signal_period);
    let histogram = macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(macd, signal)| macd - signal)
        .collect();

    (macd_line, signal_line, histogram)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Wilder-smoothed RSI. Entries before `period` are neutral (50).
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    let mut rsi_values = vec![50.0; prices.len()];
    if period == 0 || prices.len() < period + 1 {
        return rsi_values;
    }

    let (mut sum_gain, mut sum_loss) = (0.0f64, 0.0f64);
    for window in prices[..=period].windows(2) {
        let delta = window[1] - window[0];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss -= delta;
        }
    }

    let periods = period as f64;
    let mut avg_gain = sum_gain / periods;
    let mut avg_loss = sum_loss / periods;
    rsi_values[period] = rsi_from_averages(avg_gain, avg_loss);

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        avg_gain = (avg_gain * (periods - 1.0) + delta.max(0.0)) / periods;
        avg_loss = (avg_loss * (periods - 1.0) + (-delta).max(0.0)) / periods;
        rsi_values[i] = rsi_from_averages(avg_gain, avg_loss);
    }

    rsi_values
}

/// Bollinger bands over full windows only; each output has `len - period + 1`
/// entries, the last aligned with the last price.
pub fn calculate_bollinger_bands(
    prices: &[f64],
    period: usize,
    std_dev: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    if period == 0 || prices.len() < period {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    let count = prices.len() - period + 1;
    let mut upper = Vec::with_capacity(count);
    let mut middle = Vec::with_capacity(count);
    let mut lower = Vec::with_capacity(count);

    for window in prices.windows(period) {
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let band = std_dev * variance.sqrt();
        upper.push(mean + band);
        middle.push(mean);
        lower.push(mean - band);
    }

    (upper, middle, lower)
}

/// Average true range as a simple mean of true ranges; `len - period` entries.
pub fn calculate_atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = highs.len().min(lows.len()).min(closes.len());
    if period == 0 || n < period + 1 {
        return Vec::new();
    }

    let true_ranges: Vec<f64> = (1..n)
        .map(|i| {
            (highs[i] - lows[i])
                .max((highs[i] - closes[i - 1]).abs())
                .max((lows[i] - closes[i - 1]).abs())
        })
        .collect();

    true_ranges
        .windows(period)
        .map(|window| window.iter().sum::<f64>() / period as f64)
        .collect()
}

/// Percentage rate of change; `len - period` entries.
pub fn calculate_roc(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() <= period {
        return Vec::new();
    }

    (period..prices.len())
        .map(|idx| {
            let previous = prices[idx - period];
            if previous.abs() < f64::EPSILON {
                0.0
            } else {
                (prices[idx] - previous) / previous * 100.0
            }
        })
        .collect()
}

pub fn daily_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Annualized sample volatility of simple returns over the trailing
/// `lookback` returns (all returns when shorter).
pub fn annualized_volatility(closes: &[f64], lookback: usize) -> f64 {
    let returns = daily_returns(closes);
    let start = returns.len().saturating_sub(lookback);
    let window = &returns[start..];
    if window.len() < 2 {
        return 0.0;
    }

    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let variance = window.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
        / (window.len() as f64 - 1.0);
    variance.max(0.0).sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Least-squares slope of `values` against their index.
pub fn linear_regression_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;
    let (mut cov, mut var) = (0.0, 0.0);
    for (i, &y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (y - mean_y);
        var += dx * dx;
    }
    if var == 0.0 {
        0.0
    } else {
        cov / var
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSignal {
    pub action: SignalAction,
    pub bullish: u32,
    pub bearish: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    pub symbol: String,
    pub price: f64,
    pub sma_20: f64,
    pub sma_50: Option<f64>,
    pub ema_12: f64,
    pub ema_26: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bollinger_upper: f64,
    pub bollinger_middle: f64,
    pub bollinger_lower: f64,
    pub bollinger_percent_b: f64,
    pub atr: Option<f64>,
    pub volatility: f64,
    pub volume_ratio: Option<f64>,
    pub signal: IndicatorSignal,
}

impl TechnicalSnapshot {
    pub const MIN_CANDLES: usize = MACD_SLOW;

    pub fn from_candles(candles: &[Candle]) -> Result<Self> {
        if candles.len() < Self::MIN_CANDLES {
            return Err(MarketError::InvalidRequest(format!(
                "at least {} candles are required for indicators (got {})",
                Self::MIN_CANDLES,
                candles.len()
            )));
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume as f64).collect();
        let last = closes.len() - 1;
        let price = closes[last];

        let sma_20 = calculate_sma(&closes, BOLLINGER_PERIOD)[last];
        let sma_50 = (closes.len() >= 50).then(|| calculate_sma(&closes, 50)[last]);
        let ema_12 = calculate_ema(&closes, MACD_FAST)[last];
        let ema_26 = calculate_ema(&closes, MACD_SLOW)[last];
        let rsi = calculate_rsi(&closes, RSI_PERIOD)[last];
        let (macd_line, signal_line, histogram) =
            calculate_macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        let (upper, middle, lower) =
            calculate_bollinger_bands(&closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV);
        let (bollinger_upper, bollinger_middle, bollinger_lower) = match (
            upper.last(),
            middle.last(),
            lower.last(),
        ) {
            (Some(u), Some(m), Some(l)) => (*u, *m, *l),
            _ => (price, price, price),
        };
        let band_width = bollinger_upper - bollinger_lower;
        let bollinger_percent_b = if band_width > 0.0 {
            (price - bollinger_lower) / band_width
        } else {
            0.5
        };
        let atr = calculate_atr(&highs, &lows, &closes, RSI_PERIOD).last().copied();
        let volatility = annualized_volatility(&closes, BOLLINGER_PERIOD);
        let volume_window = &volumes[volumes.len().saturating_sub(BOLLINGER_PERIOD)..];
        let avg_volume = volume_window.iter().sum::<f64>() / volume_window.len() as f64;
        let volume_ratio = (avg_volume > 0.0).then(|| volumes[last] / avg_volume);

        let macd = macd_line[last];
        let macd_signal = signal_line[last];
        let macd_histogram = histogram[last];

        let mut bullish = 0;
        let mut bearish = 0;
        if rsi < 30.0 {
            bullish += 1;
        } else if rsi > 70.0 {
            bearish += 1;
        }
        if macd_histogram > 0.0 {
            bullish += 1;
        } else if macd_histogram < 0.0 {
            bearish += 1;
        }
        if let Some(sma_50) = sma_50 {
            if price > sma_50 {
                bullish += 1;
            } else if price < sma_50 {
                bearish += 1;
            }
        }
        if bollinger_percent_b < 0.0 {
            bullish += 1;
        } else if bollinger_percent_b > 1.0 {
            bearish += 1;
        }
        let action = if bullish >= bearish + 2 {
            SignalAction::Buy
        } else if bearish >= bullish + 2 {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        };

        Ok(Self {
            symbol: candles[last].symbol.clone(),
            price,
            sma_20,
            sma_50,
            ema_12,
            ema_26,
            rsi,
            macd,
            macd_signal,
            macd_histogram,
            bollinger_upper,
            bollinger_middle,
            bollinger_lower,
            bollinger_percent_b,
            atr,
            volatility,
            volume_ratio,
            signal: IndicatorSignal {
                action,
                bullish,
                bearish,
            },
        })
    }
}
