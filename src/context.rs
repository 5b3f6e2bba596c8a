use crate::backtester::{run_batch, run_job, BacktestJob};
use crate::cache::MarketDataCache;
use crate::config::ServiceSettings;
use crate::database::Database;
use crate::ensemble::{EnsemblePrediction, EnsemblePredictor, EnsembleWeights};
use crate::error::{MarketError, Result};
use crate::event_risk::{EventRiskAssessment, EventRiskConfig, EventRiskGuard};
use crate::gap_monitor::{GapConfig, GapMonitor, GapPrediction, GapPredictor, GAP_HISTORY_RANGE};
use crate::indicators::TechnicalSnapshot;
use crate::models::*;
use crate::provider::{create_provider, normalize_symbol, MarketDataProvider};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub const ENSEMBLE_MODEL_NAME: &str = "ensemble";
pub const DEFAULT_HORIZON_DAYS: u32 = 5;
const PREDICTION_RANGE: HistoryRange = HistoryRange::OneYear;
const RISK_RANGE: HistoryRange = HistoryRange::OneYear;
const MAX_BATCH_JOBS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockOverview {
    pub symbol: String,
    pub current_price: f64,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: u64,
    pub as_of: DateTime<Utc>,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub bollinger_upper: f64,
    pub bollinger_lower: f64,
    pub quote: Quote,
    pub indicators: TechnicalSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub symbol: String,
    pub strategy: String,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    #[serde(default)]
    pub range: Option<HistoryRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBacktestRequest {
    pub symbols: Vec<String>,
    pub strategies: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    #[serde(default)]
    pub range: Option<HistoryRange>,
}

/// Stored summary plus the trade list of a fresh run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    #[serde(flatten)]
    pub summary: BacktestSummary,
    pub trades: Vec<Trade>,
}

impl From<BacktestResult> for BacktestReport {
    fn from(result: BacktestResult) -> Self {
        Self {
            summary: BacktestSummary::from(&result),
            trades: result.trades,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub error: String,
    pub kind: String,
}

impl From<&MarketError> for BatchFailure {
    fn from(err: &MarketError) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub symbol: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BacktestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<BatchFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub as_of: Option<NaiveDate>,
    pub due: usize,
    pub evaluated: usize,
    pub pending: usize,
    pub failed: usize,
}

/// Shared handle to everything the CLI and HTTP server need.
#[derive(Clone)]
pub struct AppContext {
    settings: Arc<ServiceSettings>,
    provider: Arc<dyn MarketDataProvider>,
    cache: MarketDataCache,
    database: Database,
    predictor: Arc<EnsemblePredictor>,
    risk_guard: Arc<EventRiskGuard>,
    gap_predictor: Arc<GapPredictor>,
    ensemble_model: Arc<OnceCell<ModelRecord>>,
}

impl AppContext {
    pub fn initialize(settings: ServiceSettings) -> Result<Self> {
        let provider = create_provider(&settings)?;
        let database = Database::open(&settings.database_path)?;
        info!("Logging results to SQLite at {}", settings.database_path);
        Ok(Self::with_components(settings, provider, database))
    }

    pub fn with_components(
        settings: ServiceSettings,
        provider: Arc<dyn MarketDataProvider>,
        database: Database,
    ) -> Self {
        let predictor = EnsemblePredictor::new(EnsembleWeights::default())
            .with_min_history(settings.prediction_min_history);
        Self {
            cache: MarketDataCache::new(settings.cache_ttl),
            settings: Arc::new(settings),
            provider,
            database,
            predictor: Arc::new(predictor),
            risk_guard: Arc::new(EventRiskGuard::new(EventRiskConfig::default())),
            gap_predictor: Arc::new(GapPredictor::new(GapConfig::default())),
            ensemble_model: Arc::new(OnceCell::new()),
        }
    }

    /// Same database and settings, different data source (e.g. a loaded snapshot).
    pub fn with_provider(&self, provider: Arc<dyn MarketDataProvider>) -> Self {
        Self::with_components(
            self.settings.as_ref().clone(),
            provider,
            self.database.clone(),
        )
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn cache(&self) -> &MarketDataCache {
        &self.cache
    }

    pub async fn history(&self, symbol: &str, range: HistoryRange) -> Result<Arc<Vec<Candle>>> {
        let symbol = normalize_symbol(symbol)?;
        let key = MarketDataCache::history_key(self.provider.name(), &symbol, range);
        let provider = Arc::clone(&self.provider);
        self.cache
            .history()
            .get_or_try_fetch(&key, move || async move {
                let candles = provider.fetch_history(&symbol, range).await?;
                if candles.is_empty() {
                    return Err(MarketError::data_unavailable(
                        &symbol,
                        format!("no candles returned for range {}", range),
                    ));
                }
                Ok(Arc::new(candles))
            })
            .await
    }

    pub async fn calendar(&self, symbol: &str) -> Result<EventCalendar> {
        let symbol = normalize_symbol(symbol)?;
        let key = MarketDataCache::calendar_key(self.provider.name(), &symbol);
        let provider = Arc::clone(&self.provider);
        self.cache
            .calendars()
            .get_or_try_fetch(&key, move || async move {
                provider.fetch_event_calendar(&symbol).await
            })
            .await
    }

    pub async fn stock_overview(&self, symbol: &str, range: HistoryRange) -> Result<StockOverview> {
        let candles = self.history(symbol, range).await?;
        let quote = Quote::from_candles(&candles)
            .ok_or_else(|| MarketError::data_unavailable(symbol, "no quote available"))?;
        let indicators = TechnicalSnapshot::from_candles(&candles)?;
        Ok(StockOverview {
            symbol: quote.symbol.clone(),
            current_price: quote.price,
            previous_close: quote.previous_close,
            change: quote.change,
            change_percent: quote.change_percent,
            volume: quote.volume,
            as_of: quote.as_of,
            rsi: indicators.rsi,
            macd: indicators.macd,
            macd_signal: indicators.macd_signal,
            bollinger_upper: indicators.bollinger_upper,
            bollinger_lower: indicators.bollinger_lower,
            quote,
            indicators,
        })
    }

    pub async fn quote(&self, symbol: &str) -> Result<Quote> {
        let candles = self.history(symbol, HistoryRange::OneMonth).await?;
        Quote::from_candles(&candles)
            .ok_or_else(|| MarketError::data_unavailable(symbol, "no quote available"))
    }

    pub async fn indicators(&self, symbol: &str, range: HistoryRange) -> Result<TechnicalSnapshot> {
        let candles = self.history(symbol, range).await?;
        TechnicalSnapshot::from_candles(&candles)
    }

    /// Registers the active ensemble weights once per process.
    pub async fn ensemble_model(&self) -> Result<ModelRecord> {
        let record = self
            .ensemble_model
            .get_or_try_init(|| async {
                let weights = self.predictor.weights();
                self.database
                    .register_model(
                        ENSEMBLE_MODEL_NAME,
                        &weights.version(),
                        serde_json::to_value(weights)?,
                        Some("confidence-weighted heuristic ensemble".to_string()),
                    )
                    .await
            })
            .await?;
        Ok(record.clone())
    }

    pub async fn predict(&self, symbol: &str, horizon_days: u32) -> Result<EnsemblePrediction> {
        let model = self.ensemble_model().await?;
        let candles = self.history(symbol, PREDICTION_RANGE).await?;
        let symbol = normalize_symbol(symbol)?;
        let predictor = Arc::clone(&self.predictor);
        let prediction = tokio::task::spawn_blocking(move || {
            predictor.predict(&symbol, &candles, horizon_days)
        })
        .await??;

        self.database.insert_prediction(&prediction.to_record()?).await?;
        info!(
            "Prediction {} +{}d: {:.2} -> {:.2} ({}, confidence {:.2}, model {})",
            prediction.symbol,
            prediction.horizon_days,
            prediction.current_price,
            prediction.predicted_price,
            prediction.direction.as_str(),
            prediction.confidence,
            model.version
        );
        Ok(prediction)
    }

    pub async fn backtest(&self, request: BacktestRequest) -> Result<BacktestReport> {
        let range = request.range.unwrap_or_default();
        let candles = self.history(&request.symbol, range).await?;
        let job = BacktestJob {
            symbol: normalize_symbol(&request.symbol)?,
            strategy_id: request.strategy,
            parameters: request.parameters,
            candles,
        };
        let risk_free_rate = self.settings.risk_free_rate;
        let result = tokio::task::spawn_blocking(move || run_job(&job, risk_free_rate)).await??;

        self.database.insert_backtest_result(&result).await?;
        info!(
            "Backtest {} {}: return {:.2}%, sharpe {:.2}, max drawdown {:.2}%, win rate {:.0}%",
            result.symbol,
            result.strategy_id,
            result.performance.total_return_percent,
            result.performance.sharpe_ratio,
            result.performance.max_drawdown_percent,
            result.performance.win_rate * 100.0
        );
        Ok(BacktestReport::from(result))
    }

    /// Every symbol × strategy pair; each pair succeeds or fails on its own.
    pub async fn backtest_batch(&self, request: BatchBacktestRequest) -> Result<Vec<BatchItem>> {
        if request.symbols.is_empty() || request.strategies.is_empty() {
            return Err(MarketError::InvalidRequest(
                "symbols and strategies must both be non-empty".to_string(),
            ));
        }
        let job_count = request.symbols.len() * request.strategies.len();
        if job_count > MAX_BATCH_JOBS {
            return Err(MarketError::InvalidRequest(format!(
                "batch of {} backtests exceeds the limit of {}",
                job_count, MAX_BATCH_JOBS
            )));
        }

        let range = request.range.unwrap_or_default();
        let histories = join_all(
            request
                .symbols
                .iter()
                .map(|symbol| self.history(symbol, range)),
        )
        .await;

        let mut items: Vec<BatchItem> = Vec::with_capacity(job_count);
        let mut jobs: Vec<BacktestJob> = Vec::new();
        let mut job_slots: Vec<usize> = Vec::new();
        for (symbol, history) in request.symbols.iter().zip(histories) {
            for strategy in &request.strategies {
                let mut item = BatchItem {
                    symbol: symbol.trim().to_ascii_uppercase(),
                    strategy: strategy.clone(),
                    result: None,
                    failure: None,
                };
                match &history {
                    Ok(candles) => {
                        job_slots.push(items.len());
                        jobs.push(BacktestJob {
                            symbol: item.symbol.clone(),
                            strategy_id: strategy.clone(),
                            parameters: request.parameters.clone(),
                            candles: Arc::clone(candles),
                        });
                    }
                    Err(err) => item.failure = Some(BatchFailure::from(err)),
                }
                items.push(item);
            }
        }

        let workers = self.settings.backtest_workers;
        let risk_free_rate = self.settings.risk_free_rate;
        let results =
            tokio::task::spawn_blocking(move || run_batch(&jobs, workers, risk_free_rate))
                .await??;

        for (slot, result) in job_slots.into_iter().zip(results) {
            match result {
                Ok(result) => {
                    if let Err(err) = self.database.insert_backtest_result(&result).await {
                        warn!("Failed to log backtest {}: {}", result.id, err);
                    }
                    items[slot].result = Some(BacktestReport::from(result));
                }
                Err(err) => items[slot].failure = Some(BatchFailure::from(&err)),
            }
        }
        Ok(items)
    }

    pub async fn list_backtests(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<BacktestSummary>> {
        let symbol = symbol.map(normalize_symbol).transpose()?;
        self.database.list_backtest_results(symbol, limit).await
    }

    pub async fn list_predictions(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>> {
        let symbol = symbol.map(normalize_symbol).transpose()?;
        self.database.list_predictions(symbol, limit).await
    }

    pub async fn event_risk(&self, symbol: &str, vix: Option<f64>) -> Result<EventRiskAssessment> {
        let candles = self.history(symbol, RISK_RANGE).await?;
        let symbol = normalize_symbol(symbol)?;
        let calendar = match self.calendar(&symbol).await {
            Ok(calendar) => calendar,
            Err(err) => {
                warn!(
                    "Event calendar unavailable for {} ({}); assessing without it",
                    symbol, err
                );
                EventCalendar::empty(&symbol)
            }
        };
        self.risk_guard
            .assess(&symbol, &candles, &calendar, vix, Utc::now().date_naive())
    }

    pub async fn gap_prediction(&self) -> Result<GapPrediction> {
        GapMonitor::new(Arc::clone(&self.gap_predictor))
            .run(|symbol| async move { self.history(&symbol, GAP_HISTORY_RANGE).await })
            .await
    }

    /// Scores every matured prediction against the first close on or after
    /// its target date, ignoring bars later than `as_of`.
    pub async fn evaluate_due_predictions(&self, as_of: NaiveDate) -> Result<EvaluationSummary> {
        let due = self.database.due_predictions(as_of).await?;
        let mut summary = EvaluationSummary {
            as_of: Some(as_of),
            due: due.len(),
            ..EvaluationSummary::default()
        };
        let today = Utc::now().date_naive();

        for prediction in due {
            let candles = match self
                .history_reaching(&prediction.symbol, prediction.target_date, today)
                .await
            {
                Ok(candles) => candles,
                Err(err) => {
                    warn!(
                        "Cannot evaluate prediction {} for {}: {}",
                        prediction.id, prediction.symbol, err
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            let Some(actual) = candles
                .iter()
                .find(|c| c.date.date_naive() >= prediction.target_date)
                .filter(|c| c.date.date_naive() <= as_of)
            else {
                summary.pending += 1;
                continue;
            };

            self.database
                .record_prediction_outcome(&prediction.id, actual.close, Utc::now())
                .await?;
            summary.evaluated += 1;
        }

        info!(
            "Evaluated {} of {} due predictions ({} pending, {} failed)",
            summary.evaluated, summary.due, summary.pending, summary.failed
        );
        Ok(summary)
    }

    /// History whose first bar is on or before `date`. Ranges count back from
    /// the newest bar, so the window is sized from `today` and widened to
    /// `max` when the provider's newest bar is older than expected.
    async fn history_reaching(
        &self,
        symbol: &str,
        date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Arc<Vec<Candle>>> {
        let days_back = (today - date).num_days().max(0) + 10;
        let mut range = range_covering(days_back);
        loop {
            let candles = self.history(symbol, range).await?;
            let reaches = candles
                .first()
                .is_some_and(|first| first.date.date_naive() <= date);
            if reaches {
                return Ok(candles);
            }
            if range == HistoryRange::Max {
                return Err(MarketError::data_unavailable(
                    symbol,
                    format!("history does not reach back to {}", date),
                ));
            }
            range = HistoryRange::Max;
        }
    }

    pub async fn prediction_accuracy(&self, symbol: Option<&str>) -> Result<PredictionAccuracy> {
        let symbol = symbol.map(normalize_symbol).transpose()?;
        self.database.prediction_accuracy(symbol).await
    }
}

/// Smallest range reaching `days` calendar days back.
fn range_covering(days: i64) -> HistoryRange {
    [
        HistoryRange::FiveDays,
        HistoryRange::OneMonth,
        HistoryRange::ThreeMonths,
        HistoryRange::SixMonths,
        HistoryRange::OneYear,
        HistoryRange::TwoYears,
        HistoryRange::FiveYears,
        HistoryRange::TenYears,
    ]
    .into_iter()
    .find(|range| range.approx_days().is_some_and(|covered| covered >= days))
    .unwrap_or(HistoryRange::Max)
}
