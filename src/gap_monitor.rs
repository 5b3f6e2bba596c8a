//! Overnight ASX 200 gap estimate from the previous US session.

use crate::error::{MarketError, Result};
use crate::models::{Candle, HistoryRange};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub const ASX_200_SYMBOL: &str = "^AXJO";
pub const GAP_HISTORY_RANGE: HistoryRange = HistoryRange::FiveDays;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexWeight {
    pub symbol: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    pub correlation: f64,
    pub indices: Vec<IndexWeight>,
    pub asx_symbol: String,
    pub flat_threshold_percent: f64,
    pub moderate_threshold_percent: f64,
    pub strong_threshold_percent: f64,
}

impl Default for GapConfig {
    fn default() -> Self {
        let index = |symbol: &str, weight: f64| IndexWeight {
            symbol: symbol.to_string(),
            weight,
        };
        Self {
            correlation: 0.65,
            indices: vec![index("^GSPC", 0.5), index("^IXIC", 0.3), index("^DJI", 0.2)],
            asx_symbol: ASX_200_SYMBOL.to_string(),
            flat_threshold_percent: 0.1,
            moderate_threshold_percent: 0.3,
            strong_threshold_percent: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapDirection {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStrength {
    Weak,
    Moderate,
    Strong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMove {
    pub symbol: String,
    pub previous_close: f64,
    pub last_close: f64,
    pub change_percent: f64,
    /// Weight after renormalising over the indices that had data.
    pub weight: f64,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapPrediction {
    pub generated_at: DateTime<Utc>,
    pub indices: Vec<IndexMove>,
    pub weighted_change_percent: f64,
    pub predicted_gap_percent: f64,
    pub direction: GapDirection,
    pub strength: GapStrength,
    pub confidence: f64,
    pub correlation: f64,
    pub asx_last_close: Option<f64>,
    pub predicted_open: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct GapPredictor {
    config: GapConfig,
}

impl GapPredictor {
    pub fn new(config: GapConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GapConfig {
        &self.config
    }

    pub fn predict(
        &self,
        us_indices: &HashMap<String, Vec<Candle>>,
        asx: Option<&[Candle]>,
    ) -> Result<GapPrediction> {
        let mut moves: Vec<IndexMove> = Vec::with_capacity(self.config.indices.len());
        for index in &self.config.indices {
            let Some(candles) = us_indices.get(&index.symbol) else {
                log::warn!("No data for {}, excluding it from the gap estimate", index.symbol);
                continue;
            };
            match last_change(candles) {
                Some((previous_close, last_close, as_of)) => moves.push(IndexMove {
                    symbol: index.symbol.clone(),
                    previous_close,
                    last_close,
                    change_percent: (last_close / previous_close - 1.0) * 100.0,
                    weight: index.weight,
                    as_of,
                }),
                None => log::warn!(
                    "Need two valid closes for {} (got {} candles), skipping",
                    index.symbol,
                    candles.len()
                ),
            }
        }

        let total_weight: f64 = moves.iter().map(|m| m.weight).sum();
        if moves.is_empty() || total_weight <= 0.0 {
            return Err(MarketError::data_unavailable(
                "US indices",
                "no index closes available for the gap estimate",
            ));
        }
        for m in &mut moves {
            m.weight /= total_weight;
        }

        let weighted_change_percent: f64 = moves.iter().map(|m| m.weight * m.change_percent).sum();
        let predicted_gap_percent = self.config.correlation * weighted_change_percent;

        let agreement = if weighted_change_percent == 0.0 {
            0.0
        } else {
            moves
                .iter()
                .filter(|m| {
                    m.change_percent != 0.0
                        && m.change_percent.signum() == weighted_change_percent.signum()
                })
                .map(|m| m.weight)
                .sum()
        };

        let asx_last_close = asx
            .and_then(|candles| candles.iter().rev().find(|c| c.close > 0.0))
            .map(|c| c.close);
        let predicted_open = asx_last_close.map(|close| close * (1.0 + predicted_gap_percent / 100.0));

        Ok(GapPrediction {
            generated_at: Utc::now(),
            indices: moves,
            weighted_change_percent,
            predicted_gap_percent,
            direction: self.direction(predicted_gap_percent),
            strength: self.strength(predicted_gap_percent),
            confidence: (self.config.correlation * agreement).clamp(0.0, 1.0),
            correlation: self.config.correlation,
            asx_last_close,
            predicted_open,
        })
    }

    fn direction(&self, gap_percent: f64) -> GapDirection {
        if gap_percent.abs() < self.config.flat_threshold_percent {
            GapDirection::Flat
        } else if gap_percent > 0.0 {
            GapDirection::Up
        } else {
            GapDirection::Down
        }
    }

    fn strength(&self, gap_percent: f64) -> GapStrength {
        let magnitude = gap_percent.abs();
        if magnitude >= self.config.strong_threshold_percent {
            GapStrength::Strong
        } else if magnitude >= self.config.moderate_threshold_percent {
            GapStrength::Moderate
        } else {
            GapStrength::Weak
        }
    }
}

fn last_change(candles: &[Candle]) -> Option<(f64, f64, DateTime<Utc>)> {
    let mut valid = candles.iter().rev().filter(|c| c.close > 0.0 && c.close.is_finite());
    let last = valid.next()?;
    let previous = valid.next()?;
    Some((previous.close, last.close, last.date))
}

/// Pulls recent index history concurrently and feeds it to a [`GapPredictor`].
pub struct GapMonitor {
    predictor: Arc<GapPredictor>,
}

impl GapMonitor {
    pub fn new(predictor: Arc<GapPredictor>) -> Self {
        Self { predictor }
    }

    /// Index fetch failures only shrink the basket; an ASX failure drops the
    /// predicted open.
    pub async fn run<F, Fut>(&self, fetch: F) -> Result<GapPrediction>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Arc<Vec<Candle>>>>,
    {
        let config = self.predictor.config();
        let mut symbols: Vec<String> = config.indices.iter().map(|i| i.symbol.clone()).collect();
        symbols.push(config.asx_symbol.clone());

        let results = join_all(symbols.iter().cloned().map(&fetch)).await;

        let mut us_indices = HashMap::new();
        let mut asx: Option<Arc<Vec<Candle>>> = None;
        for (symbol, result) in symbols.into_iter().zip(results) {
            match result {
                Ok(candles) if symbol == config.asx_symbol => asx = Some(candles),
                Ok(candles) => {
                    us_indices.insert(symbol, candles.as_ref().clone());
                }
                Err(err) => log::warn!("Gap monitor could not fetch {}: {}", symbol, err),
            }
        }

        self.predictor
            .predict(&us_indices, asx.as_ref().map(|c| c.as_slice()))
    }
}
