//! Heuristic ensemble forecaster.
//!
//! Five small models each turn recent price action into an expected return over
//! the forecast horizon plus a confidence. The ensemble is the
//! confidence-weighted mean of those returns; its own confidence is the mean
//! model confidence scaled by how many models agree with the final direction.

use crate::error::{MarketError, Result};
use crate::indicators::{
    self, calculate_bollinger_bands, calculate_macd, calculate_rsi, calculate_sma,
    linear_regression_slope, TechnicalSnapshot,
};
use crate::models::{Candle, PredictionRecord, SignalAction};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_HORIZON_DAYS: u32 = 30;
pub const DEFAULT_SIGNAL_THRESHOLD: f64 = 0.005;
pub const DEFAULT_MIN_HISTORY: usize = 60;
const NEUTRAL_EPSILON: f64 = 1e-9;
const VOLATILITY_LOOKBACK: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub trend: f64,
    pub momentum: f64,
    pub mean_reversion: f64,
    pub volatility_drift: f64,
    pub volume: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            trend: 0.25,
            momentum: 0.20,
            mean_reversion: 0.20,
            volatility_drift: 0.20,
            volume: 0.15,
        }
    }
}

impl EnsembleWeights {
    pub fn validate(&self) -> Result<()> {
        let weights = self.as_pairs();
        if let Some((name, value)) = weights
            .iter()
            .find(|(_, value)| !value.is_finite() || *value < 0.0)
        {
            return Err(MarketError::InvalidRequest(format!(
                "ensemble weight {} must be a non-negative number (value: {})",
                name, value
            )));
        }
        if weights.iter().map(|(_, value)| value).sum::<f64>() <= 0.0 {
            return Err(MarketError::InvalidRequest(
                "ensemble weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }

    fn as_pairs(&self) -> [(&'static str, f64); 5] {
        [
            ("trend", self.trend),
            ("momentum", self.momentum),
            ("mean_reversion", self.mean_reversion),
            ("volatility_drift", self.volatility_drift),
            ("volume", self.volume),
        ]
    }

    fn weight_for(&self, model: &str) -> f64 {
        self.as_pairs()
            .iter()
            .find(|(name, _)| *name == model)
            .map(|(_, weight)| *weight)
            .unwrap_or(0.0)
    }

    /// Stable identifier: crate version plus an FNV-1a digest of the weights.
    pub fn version(&self) -> String {
        let canonical: String = self
            .as_pairs()
            .iter()
            .map(|(name, value)| format!("{}={:.6};", name, value))
            .collect();
        let mut hash: u32 = 0x811c_9dc5;
        for byte in canonical.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        format!("{}-w{:08x}", env!("CARGO_PKG_VERSION"), hash)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelForecast {
    pub model: String,
    pub expected_return: f64,
    pub confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub symbol: String,
    pub as_of: DateTime<Utc>,
    pub current_price: f64,
    pub predicted_price: f64,
    pub predicted_return: f64,
    pub confidence: f64,
    pub direction: SignalAction,
    pub horizon_days: u32,
    pub target_date: NaiveDate,
    pub rsi: f64,
    pub macd: f64,
    pub models: Vec<ModelForecast>,
    pub model_version: String,
    pub indicators: TechnicalSnapshot,
}

impl EnsemblePrediction {
    pub fn to_record(&self) -> Result<PredictionRecord> {
        Ok(PredictionRecord {
            id: Uuid::new_v4().to_string(),
            symbol: self.symbol.clone(),
            created_at: Utc::now(),
            horizon_days: self.horizon_days,
            target_date: self.target_date,
            current_price: self.current_price,
            predicted_price: self.predicted_price,
            predicted_return: self.predicted_return,
            confidence: self.confidence,
            direction: self.direction,
            model_version: self.model_version.clone(),
            components: serde_json::to_value(&self.models)?,
            actual_price: None,
            evaluated_at: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EnsemblePredictor {
    weights: EnsembleWeights,
    signal_threshold: f64,
    min_history: usize,
}

impl EnsemblePredictor {
    pub fn new(weights: EnsembleWeights) -> Self {
        Self {
            weights,
            signal_threshold: DEFAULT_SIGNAL_THRESHOLD,
            min_history: DEFAULT_MIN_HISTORY,
        }
    }

    pub fn with_min_history(mut self, min_history: usize) -> Self {
        self.min_history = min_history.max(TechnicalSnapshot::MIN_CANDLES);
        self
    }

    pub fn with_signal_threshold(mut self, signal_threshold: f64) -> Self {
        self.signal_threshold = signal_threshold.abs();
        self
    }

    pub fn weights(&self) -> &EnsembleWeights {
        &self.weights
    }

    pub fn model_version(&self) -> String {
        self.weights.version()
    }

    pub fn predict(
        &self,
        symbol: &str,
        candles: &[Candle],
        horizon_days: u32,
    ) -> Result<EnsemblePrediction> {
        if !(1..=MAX_HORIZON_DAYS).contains(&horizon_days) {
            return Err(MarketError::InvalidRequest(format!(
                "horizon_days must be between 1 and {} (value: {})",
                MAX_HORIZON_DAYS, horizon_days
            )));
        }
        if candles.len() < self.min_history {
            return Err(MarketError::InvalidRequest(format!(
                "at least {} candles are required for a prediction of {} (got {})",
                self.min_history,
                symbol,
                candles.len()
            )));
        }
        self.weights.validate()?;

        let snapshot = TechnicalSnapshot::from_candles(candles)?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let current_price = snapshot.price;
        let horizon = horizon_days as f64;

        let sigma = daily_sigma(&closes, VOLATILITY_LOOKBACK);
        let cap = 3.0 * sigma * horizon.sqrt();

        let raw = [
            ("trend", trend_model(&closes, horizon)),
            ("momentum", momentum_model(&closes, horizon)),
            ("mean_reversion", mean_reversion_model(&closes, &snapshot, horizon)),
            ("volatility_drift", volatility_drift_model(&closes, horizon)),
            ("volume", volume_model(candles, horizon)),
        ];
        let models: Vec<ModelForecast> = raw
            .into_iter()
            .map(|(name, (expected_return, confidence))| ModelForecast {
                model: name.to_string(),
                expected_return: sanitize(expected_return).clamp(-cap, cap),
                confidence: sanitize(confidence).clamp(0.0, 1.0),
                weight: self.weights.weight_for(name),
            })
            .collect();

        let (predicted_return, confidence) = combine(&models);
        let direction = if predicted_return > self.signal_threshold {
            SignalAction::Buy
        } else if predicted_return < -self.signal_threshold {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        };

        let as_of = candles[candles.len() - 1].date;
        log::debug!(
            "Ensemble {} h={}d: return {:.4} confidence {:.3} ({})",
            symbol,
            horizon_days,
            predicted_return,
            confidence,
            direction.as_str()
        );

        Ok(EnsemblePrediction {
            symbol: symbol.to_string(),
            as_of,
            current_price,
            predicted_price: current_price * (1.0 + predicted_return),
            predicted_return,
            confidence,
            direction,
            horizon_days,
            target_date: add_business_days(as_of.date_naive(), horizon_days),
            rsi: snapshot.rsi,
            macd: snapshot.macd,
            models,
            model_version: self.model_version(),
            indicators: snapshot,
        })
    }
}

/// Confidence-weighted mean return and agreement-scaled confidence.
fn combine(models: &[ModelForecast]) -> (f64, f64) {
    let total_weight: f64 = models.iter().map(|m| m.weight * m.confidence).sum();
    let predicted_return = if total_weight > 0.0 {
        models
            .iter()
            .map(|m| m.weight * m.confidence * m.expected_return)
            .sum::<f64>()
            / total_weight
    } else {
        0.0
    };

    let base_total: f64 = models.iter().map(|m| m.weight).sum();
    let mean_confidence = if base_total > 0.0 {
        models.iter().map(|m| m.weight * m.confidence).sum::<f64>() / base_total
    } else {
        0.0
    };

    let directional: Vec<&ModelForecast> = models
        .iter()
        .filter(|m| m.expected_return.abs() >= NEUTRAL_EPSILON)
        .collect();
    let directional_weight: f64 = directional.iter().map(|m| m.weight).sum();
    let agreement = if predicted_return.abs() < NEUTRAL_EPSILON || directional_weight <= 0.0 {
        0.0
    } else {
        directional
            .iter()
            .filter(|m| m.expected_return.signum() == predicted_return.signum())
            .map(|m| m.weight)
            .sum::<f64>()
            / directional_weight
    };

    (predicted_return, (mean_confidence * agreement).clamp(0.0, 1.0))
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn daily_sigma(closes: &[f64], lookback: usize) -> f64 {
    indicators::annualized_volatility(closes, lookback) / indicators::TRADING_DAYS_PER_YEAR.sqrt()
}

fn last(values: &[f64]) -> f64 {
    values.last().copied().unwrap_or(0.0)
}

/// Moving-average spread plus the 20-day regression slope.
fn trend_model(closes: &[f64], horizon: f64) -> (f64, f64) {
    let price = last(closes);
    let slow_period = closes.len().min(50);
    let sma_fast = last(&calculate_sma(closes, 20));
    let sma_slow = last(&calculate_sma(closes, slow_period));
    let spread = if sma_slow > 0.0 {
        (sma_fast - sma_slow) / sma_slow
    } else {
        0.0
    };

    let window = &closes[closes.len().saturating_sub(20)..];
    let slope = linear_regression_slope(window);
    let daily_drift = if price > 0.0 { slope / price } else { 0.0 };
    let fit = r_squared(window, slope);

    let expected = 0.5 * daily_drift * horizon + 0.5 * spread * (horizon / 20.0).min(1.0);
    let agree = spread.signum() == daily_drift.signum();
    let confidence = (0.3 + 0.5 * fit) * if agree { 1.0 } else { 0.6 };
    (expected, confidence)
}

fn r_squared(values: &[f64], slope: f64) -> f64 {
    let n = values.len();
    if n < 3 {
        return 0.0;
    }
    let mean_x = (n as f64 - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n as f64;
    let intercept = mean_y - slope * mean_x;
    let (mut ss_res, mut ss_tot) = (0.0, 0.0);
    for (i, &y) in values.iter().enumerate() {
        let fitted = intercept + slope * i as f64;
        ss_res += (y - fitted).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }
    if ss_tot <= 0.0 {
        0.0
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    }
}

/// 10-day rate of change, confirmed by the MACD histogram and damped by half.
fn momentum_model(closes: &[f64], horizon: f64) -> (f64, f64) {
    let n = closes.len();
    if n < 11 || closes[n - 11] <= 0.0 {
        return (0.0, 0.0);
    }
    let roc = closes[n - 1] / closes[n - 11] - 1.0;
    let (_, _, histogram) = calculate_macd(
        closes,
        indicators::MACD_FAST,
        indicators::MACD_SLOW,
        indicators::MACD_SIGNAL,
    );
    let hist_now = histogram[n - 1];
    let hist_prev = histogram[n - 2];

    let expected = 0.5 * (roc / 10.0) * horizon;
    let mut confidence = 0.3;
    if hist_now.signum() == roc.signum() {
        confidence += 0.3;
    }
    if (hist_now - hist_prev).signum() == roc.signum() {
        confidence += 0.2;
    }
    (expected, confidence)
}

/// Pull toward the Bollinger middle band, scaled by how stretched RSI and %B are.
fn mean_reversion_model(closes: &[f64], snapshot: &TechnicalSnapshot, horizon: f64) -> (f64, f64) {
    let price = last(closes);
    let (_, middle, _) = calculate_bollinger_bands(
        closes,
        indicators::BOLLINGER_PERIOD,
        indicators::BOLLINGER_STD_DEV,
    );
    let middle = middle.last().copied().unwrap_or(price);
    if price <= 0.0 {
        return (0.0, 0.0);
    }

    let rsi_stretch = ((calculate_rsi(closes, indicators::RSI_PERIOD)
        .last()
        .copied()
        .unwrap_or(50.0)
        - 50.0)
        .abs()
        / 50.0)
        .min(1.0);
    let band_stretch = ((snapshot.bollinger_percent_b - 0.5).abs() * 2.0).min(1.0);
    let strength = 0.5 * rsi_stretch + 0.5 * band_stretch;

    let gap = (middle - price) / price;
    let expected = gap * strength * (horizon / 10.0).min(1.0);
    (expected, 0.3 + 0.5 * strength)
}

/// Recent mean log return carried forward; calmer series earn more confidence.
fn volatility_drift_model(closes: &[f64], horizon: f64) -> (f64, f64) {
    let start = closes.len().saturating_sub(VOLATILITY_LOOKBACK + 1);
    let log_returns: Vec<f64> = closes[start..]
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if log_returns.is_empty() {
        return (0.0, 0.0);
    }
    let mu = log_returns.iter().sum::<f64>() / log_returns.len() as f64;
    let expected = (mu * horizon).exp() - 1.0;

    let annual_vol = indicators::annualized_volatility(closes, VOLATILITY_LOOKBACK);
    let confidence = (1.0 / (1.0 + annual_vol / 0.2)).clamp(0.1, 0.9);
    (expected, confidence)
}

/// Short-term move, amplified when volume is above its 20-day average.
fn volume_model(candles: &[Candle], horizon: f64) -> (f64, f64) {
    let n = candles.len();
    if n < 6 || candles[n - 6].close <= 0.0 {
        return (0.0, 0.0);
    }
    let five_day = candles[n - 1].close / candles[n - 6].close - 1.0;

    let window = &candles[n.saturating_sub(20)..];
    let avg_volume = window.iter().map(|c| c.volume as f64).sum::<f64>() / window.len() as f64;
    let ratio = if avg_volume > 0.0 {
        candles[n - 1].volume as f64 / avg_volume
    } else {
        1.0
    };
    let multiplier = ratio.min(2.0);

    let expected = 0.5 * (five_day / 5.0) * horizon * multiplier;
    let confidence = if ratio > 1.0 {
        0.3 + 0.2 * (ratio - 1.0).min(1.0)
    } else {
        0.25
    };
    (expected, confidence)
}

pub fn add_business_days(start: NaiveDate, days: u32) -> NaiveDate {
    let mut date = start;
    let mut remaining = days;
    while remaining > 0 {
        date += Duration::days(1);
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            remaining -= 1;
        }
    }
    date
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::candles_from_closes;

    fn wave(len: usize, drift: f64) -> Vec<f64> {
        (0..len)
            .map(|i| 100.0 * (1.0 + drift).powi(i as i32) * (1.0 + 0.01 * (i as f64 * 0.9).sin()))
            .collect()
    }

    #[test]
    fn uptrend_predicts_buy() {
        let candles = candles_from_closes("AAA", &wave(120, 0.004));
        let predictor = EnsemblePredictor::new(EnsembleWeights::default());
        let prediction = predictor.predict("AAA", &candles, 5).unwrap();

        assert_eq!(prediction.direction, SignalAction::Buy);
        assert!(prediction.predicted_return > 0.0);
        assert!(prediction.predicted_price > prediction.current_price);
        assert!(prediction.confidence > 0.0 && prediction.confidence <= 1.0);
        assert_eq!(prediction.models.len(), 5);
        assert_eq!(prediction.rsi, prediction.indicators.rsi);
    }

    #[test]
    fn downtrend_predicts_sell() {
        let candles = candles_from_closes("AAA", &wave(120, -0.004));
        let predictor = EnsemblePredictor::new(EnsembleWeights::default());
        let prediction = predictor.predict("AAA", &candles, 5).unwrap();
        assert_eq!(prediction.direction, SignalAction::Sell);
        assert!(prediction.predicted_price < prediction.current_price);
    }

    #[test]
    fn flat_series_is_hold_with_zero_confidence() {
        let candles = candles_from_closes("AAA", &[50.0; 80]);
        let predictor = EnsemblePredictor::new(EnsembleWeights::default());
        let prediction = predictor.predict("AAA", &candles, 3).unwrap();
        assert_eq!(prediction.direction, SignalAction::Hold);
        assert_eq!(prediction.predicted_return, 0.0);
        assert_eq!(prediction.confidence, 0.0);
        assert_eq!(prediction.predicted_price, 50.0);
    }

    #[test]
    fn model_returns_are_capped_by_volatility() {
        let candles = candles_from_closes("AAA", &wave(120, 0.01));
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let cap = 3.0 * daily_sigma(&closes, VOLATILITY_LOOKBACK) * 10f64.sqrt();
        let prediction = EnsemblePredictor::new(EnsembleWeights::default())
            .predict("AAA", &candles, 10)
            .unwrap();
        assert!(prediction
            .models
            .iter()
            .all(|m| m.expected_return.abs() <= cap + 1e-12));
    }

    #[test]
    fn is_deterministic() {
        let candles = candles_from_closes("AAA", &wave(90, 0.002));
        let predictor = EnsemblePredictor::new(EnsembleWeights::default());
        let a = predictor.predict("AAA", &candles, 7).unwrap();
        let b = predictor.predict("AAA", &candles, 7).unwrap();
        assert_eq!(a.predicted_return, b.predicted_return);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.models, b.models);
    }

    #[test]
    fn validates_inputs() {
        let predictor = EnsemblePredictor::new(EnsembleWeights::default());
        let candles = candles_from_closes("AAA", &wave(90, 0.0));
        assert!(predictor.predict("AAA", &candles, 0).is_err());
        assert!(predictor.predict("AAA", &candles, 31).is_err());
        assert!(predictor.predict("AAA", &candles[..40], 5).is_err());

        let zero = EnsembleWeights {
            trend: 0.0,
            momentum: 0.0,
            mean_reversion: 0.0,
            volatility_drift: 0.0,
            volume: 0.0,
        };
        assert!(EnsemblePredictor::new(zero)
            .predict("AAA", &candles, 5)
            .is_err());
    }

    #[test]
    fn combine_weights_by_confidence_and_agreement() {
        let forecast = |model: &str, r: f64, c: f64, w: f64| ModelForecast {
            model: model.to_string(),
            expected_return: r,
            confidence: c,
            weight: w,
        };
        let models = vec![
            forecast("a", 0.02, 1.0, 0.5),
            forecast("b", -0.01, 0.5, 0.25),
            forecast("c", 0.0, 0.8, 0.25),
        ];
        let (ret, conf) = combine(&models);
        // (0.5*1*0.02 + 0.25*0.5*-0.01) / (0.5 + 0.125 + 0.2)
        let expected_ret = (0.01 - 0.00125) / 0.825;
        assert!((ret - expected_ret).abs() < 1e-12);
        // mean confidence 0.825, agreement 0.5 / 0.75
        assert!((conf - 0.825 * (0.5 / 0.75)).abs() < 1e-12);
    }

    #[test]
    fn version_tracks_weights() {
        let default_version = EnsembleWeights::default().version();
        assert!(default_version.starts_with(env!("CARGO_PKG_VERSION")));
        assert_eq!(default_version, EnsembleWeights::default().version());
        let tweaked = EnsembleWeights {
            trend: 0.3,
            ..EnsembleWeights::default()
        };
        assert_ne!(default_version, tweaked.version());
    }

    #[test]
    fn business_days_skip_weekends() {
        let friday = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        assert_eq!(add_business_days(friday, 1), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
        assert_eq!(add_business_days(friday, 5), NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }
}
