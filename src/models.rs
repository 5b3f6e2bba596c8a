use crate::error::{MarketError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: Option<f64>,
    pub volume: u64,
}

impl Candle {
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|value| value.is_finite() && *value > 0.0)
    }
}

/// Lookback window for historical daily bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HistoryRange {
    #[serde(rename = "5d")]
    FiveDays,
    #[serde(rename = "1mo")]
    OneMonth,
    #[serde(rename = "3mo")]
    ThreeMonths,
    #[serde(rename = "6mo")]
    SixMonths,
    #[default]
    #[serde(rename = "1y")]
    OneYear,
    #[serde(rename = "2y")]
    TwoYears,
    #[serde(rename = "5y")]
    FiveYears,
    #[serde(rename = "10y")]
    TenYears,
    #[serde(rename = "max")]
    Max,
}

impl HistoryRange {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "5d" => Ok(Self::FiveDays),
            "1mo" => Ok(Self::OneMonth),
            "3mo" => Ok(Self::ThreeMonths),
            "6mo" => Ok(Self::SixMonths),
            "1y" => Ok(Self::OneYear),
            "2y" => Ok(Self::TwoYears),
            "5y" => Ok(Self::FiveYears),
            "10y" => Ok(Self::TenYears),
            "max" => Ok(Self::Max),
            other => Err(MarketError::InvalidRequest(format!(
                "Unsupported range '{}' (expected one of 5d, 1mo, 3mo, 6mo, 1y, 2y, 5y, 10y, max)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveDays => "5d",
            Self::OneMonth => "1mo",
            Self::ThreeMonths => "3mo",
            Self::SixMonths => "6mo",
            Self::OneYear => "1y",
            Self::TwoYears => "2y",
            Self::FiveYears => "5y",
            Self::TenYears => "10y",
            Self::Max => "max",
        }
    }

    /// Calendar days covered by the range; `None` means unbounded.
    pub fn approx_days(&self) -> Option<i64> {
        match self {
            Self::FiveDays => Some(7),
            Self::OneMonth => Some(31),
            Self::ThreeMonths => Some(92),
            Self::SixMonths => Some(183),
            Self::OneYear => Some(366),
            Self::TwoYears => Some(731),
            Self::FiveYears => Some(1827),
            Self::TenYears => Some(3653),
            Self::Max => None,
        }
    }
}

impl fmt::Display for HistoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub open: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub volume: u64,
    pub as_of: DateTime<Utc>,
}

impl Quote {
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        let last = candles.last()?;
        let previous_close = candles
            .len()
            .checked_sub(2)
            .and_then(|idx| candles.get(idx))
            .map(|c| c.close);
        let change = previous_close.map(|prev| last.close - prev);
        let change_percent = previous_close
            .filter(|prev| *prev > 0.0)
            .map(|prev| (last.close - prev) / prev * 100.0);

        Some(Self {
            symbol: last.symbol.clone(),
            price: last.close,
            previous_close,
            change,
            change_percent,
            open: last.open,
            day_high: last.high,
            day_low: last.low,
            volume: last.volume,
            as_of: last.date,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCalendar {
    pub symbol: String,
    pub earnings_dates: Vec<NaiveDate>,
    pub ex_dividend_date: Option<NaiveDate>,
    pub dividend_date: Option<NaiveDate>,
}

impl EventCalendar {
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

impl FromStr for SignalAction {
    type Err = MarketError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(MarketError::InvalidRequest(format!(
                "Unknown signal action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub action: SignalAction,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    EndOfData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub quantity: u64,
    pub entry_price: f64,
    pub entry_date: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_date: Option<DateTime<Utc>>,
    pub pnl: Option<f64>,
    pub fees: f64,
    pub exit_reason: Option<ExitReason>,
}

impl Trade {
    pub fn is_closed(&self) -> bool {
        self.exit_date.is_some()
    }

    pub fn pnl_percent(&self) -> Option<f64> {
        let exposure = self.entry_price * self.quantity as f64;
        match self.pnl {
            Some(pnl) if exposure > 0.0 => Some(pnl / exposure * 100.0),
            _ => None,
        }
    }

    pub fn duration_days(&self) -> Option<i64> {
        self.exit_date
            .map(|exit| (exit - self.entry_date).num_days())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestDataPoint {
    pub date: DateTime<Utc>,
    pub portfolio_value: f64,
    pub cash: f64,
    pub position_value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub total_return: f64,
    pub total_return_percent: f64,
    pub cagr: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Mean per-trade return on the capital committed at entry.
    #[serde(default)]
    pub avg_trade_return_percent: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub avg_trade_duration_days: f64,
    pub exposure_percent: f64,
    pub buy_and_hold_return_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: HashMap<String, f64>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_capital: f64,
    pub final_value: f64,
    pub trades: Vec<Trade>,
    pub daily_snapshots: Vec<BacktestDataPoint>,
    pub performance: StrategyPerformance,
    pub created_at: DateTime<Utc>,
}

/// Row stored in `backtest_results`; the full trade list is not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: HashMap<String, f64>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_capital: f64,
    pub final_value: f64,
    pub total_return_percent: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_percent: f64,
    pub win_rate: f64,
    pub total_trades: u32,
    pub performance: StrategyPerformance,
    pub created_at: DateTime<Utc>,
}

impl From<&BacktestResult> for BacktestSummary {
    fn from(result: &BacktestResult) -> Self {
        Self {
            id: result.id.clone(),
            symbol: result.symbol.clone(),
            strategy_id: result.strategy_id.clone(),
            parameters: result.parameters.clone(),
            start_date: result.start_date,
            end_date: result.end_date,
            initial_capital: result.initial_capital,
            final_value: result.final_value,
            total_return_percent: result.performance.total_return_percent,
            sharpe_ratio: result.performance.sharpe_ratio,
            max_drawdown_percent: result.performance.max_drawdown_percent,
            win_rate: result.performance.win_rate,
            total_trades: result.performance.total_trades,
            performance: result.performance.clone(),
            created_at: result.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub weights: serde_json::Value,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub symbol: String,
    pub created_at: DateTime<Utc>,
    pub horizon_days: u32,
    pub target_date: NaiveDate,
    pub current_price: f64,
    pub predicted_price: f64,
    pub predicted_return: f64,
    pub confidence: f64,
    pub direction: SignalAction,
    pub model_version: String,
    pub components: serde_json::Value,
    pub actual_price: Option<f64>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionAccuracy {
    pub evaluated: u32,
    pub direction_hits: u32,
    pub direction_accuracy: f64,
    pub mean_absolute_percent_error: f64,
}
