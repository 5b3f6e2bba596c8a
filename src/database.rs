use crate::error::{MarketError, Result};
use crate::models::*;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS backtest_results (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    strategy_id TEXT NOT NULL,
    parameters TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    initial_capital REAL NOT NULL,
    final_value REAL NOT NULL,
    total_return_percent REAL NOT NULL,
    sharpe_ratio REAL NOT NULL,
    max_drawdown_percent REAL NOT NULL,
    win_rate REAL NOT NULL,
    total_trades INTEGER NOT NULL,
    performance TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backtest_results_symbol
    ON backtest_results (symbol, created_at);

CREATE TABLE IF NOT EXISTS model_registry (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    weights TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS predictions (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    created_at TEXT NOT NULL,
    horizon_days INTEGER NOT NULL,
    target_date TEXT NOT NULL,
    current_price REAL NOT NULL,
    predicted_price REAL NOT NULL,
    predicted_return REAL NOT NULL,
    confidence REAL NOT NULL,
    direction TEXT NOT NULL,
    model_version TEXT NOT NULL,
    components TEXT NOT NULL,
    actual_price REAL,
    evaluated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_predictions_symbol
    ON predictions (symbol, created_at);
CREATE INDEX IF NOT EXISTS idx_predictions_due
    ON predictions (target_date) WHERE actual_price IS NULL;
";

const PREDICTION_COLUMNS: &str = "id, symbol, created_at, horizon_days, target_date, current_price,
     predicted_price, predicted_return, confidence, direction, model_version, components,
     actual_price, evaluated_at";

const BACKTEST_COLUMNS: &str = "id, symbol, strategy_id, parameters, start_date, end_date,
     initial_capital, final_value, total_return_percent, sharpe_ratio, max_drawdown_percent,
     win_rate, total_trades, performance, created_at";

/// SQLite log of backtests, registered models and predictions.
///
/// The connection is shared behind a mutex and every query runs on the
/// blocking pool so async callers never stall the runtime.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                MarketError::Config(format!(
                    "cannot create database directory {}: {}",
                    parent.display(),
                    err
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Opened {} (journal_mode={})", path.display(), mode);
        Self::initialize(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| MarketError::Internal("database connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await?
    }

    pub async fn insert_backtest_result(&self, result: &BacktestResult) -> Result<()> {
        let summary = BacktestSummary::from(result);
        let parameters = serde_json::to_string(&summary.parameters)?;
        let performance = serde_json::to_string(&summary.performance)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backtest_results (
                    id, symbol, strategy_id, parameters, start_date, end_date,
                    initial_capital, final_value, total_return_percent, sharpe_ratio,
                    max_drawdown_percent, win_rate, total_trades, performance, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    summary.id,
                    summary.symbol,
                    summary.strategy_id,
                    parameters,
                    summary.start_date,
                    summary.end_date,
                    summary.initial_capital,
                    summary.final_value,
                    summary.total_return_percent,
                    summary.sharpe_ratio,
                    summary.max_drawdown_percent,
                    summary.win_rate,
                    summary.total_trades,
                    performance,
                    summary.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Newest first, optionally filtered by symbol.
    pub async fn list_backtest_results(
        &self,
        symbol: Option<String>,
        limit: usize,
    ) -> Result<Vec<BacktestSummary>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM backtest_results
                 WHERE (?1 IS NULL OR symbol = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
                BACKTEST_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![symbol, limit as i64], backtest_summary_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Registers `name`/`version` once; later calls return the stored record.
    pub async fn register_model(
        &self,
        name: &str,
        version: &str,
        weights: Value,
        description: Option<String>,
    ) -> Result<ModelRecord> {
        let name = name.to_string();
        let version = version.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO model_registry (id, name, version, weights, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    name,
                    version,
                    weights,
                    description,
                    Utc::now(),
                ],
            )?;
            if inserted > 0 {
                log::info!("Registered model {} version {}", name, version);
            }
            let record = conn.query_row(
                "SELECT id, name, version, weights, description, created_at
                 FROM model_registry WHERE name = ?1 AND version = ?2",
                params![name, version],
                model_from_row,
            )?;
            Ok(record)
        })
        .await
    }

    pub async fn latest_model(&self, name: &str) -> Result<Option<ModelRecord>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, name, version, weights, description, created_at
                     FROM model_registry WHERE name = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1",
                    params![name],
                    model_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    pub async fn insert_prediction(&self, record: &PredictionRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO predictions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    PREDICTION_COLUMNS
                ),
                params![
                    record.id,
                    record.symbol,
                    record.created_at,
                    record.horizon_days,
                    record.target_date,
                    record.current_price,
                    record.predicted_price,
                    record.predicted_return,
                    record.confidence,
                    record.direction.as_str(),
                    record.model_version,
                    record.components,
                    record.actual_price,
                    record.evaluated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_predictions(
        &self,
        symbol: Option<String>,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM predictions
                 WHERE (?1 IS NULL OR symbol = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
                PREDICTION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![symbol, limit as i64], prediction_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Unevaluated predictions whose target date is on or before `as_of`.
    pub async fn due_predictions(&self, as_of: NaiveDate) -> Result<Vec<PredictionRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM predictions
                 WHERE target_date <= ?1 AND actual_price IS NULL
                 ORDER BY target_date ASC, rowid ASC",
                PREDICTION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![as_of], prediction_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn record_prediction_outcome(
        &self,
        id: &str,
        actual_price: f64,
        evaluated_at: DateTime<Utc>,
    ) -> Result<()> {
        if !actual_price.is_finite() || actual_price <= 0.0 {
            return Err(MarketError::InvalidRequest(format!(
                "actual price must be positive (value: {})",
                actual_price
            )));
        }
        let id = id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE predictions SET actual_price = ?1, evaluated_at = ?2 WHERE id = ?3",
                params![actual_price, evaluated_at, id],
            )?;
            if updated == 0 {
                return Err(MarketError::InvalidRequest(format!(
                    "unknown prediction id {}",
                    id
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn prediction_accuracy(&self, symbol: Option<String>) -> Result<PredictionAccuracy> {
        let outcomes = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT current_price, predicted_price, actual_price FROM predictions
                     WHERE actual_price IS NOT NULL AND (?1 IS NULL OR symbol = ?1)",
                )?;
                let rows = stmt
                    .query_map(params![symbol], |row| {
                        Ok((
                            row.get::<_, f64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, f64>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(summarize_accuracy(&outcomes))
    }
}

/// Direction hit rate and MAPE over `(current, predicted, actual)` prices.
pub fn summarize_accuracy(outcomes: &[(f64, f64, f64)]) -> PredictionAccuracy {
    let scored: Vec<&(f64, f64, f64)> = outcomes.iter().filter(|(_, _, actual)| *actual > 0.0).collect();
    if scored.is_empty() {
        return PredictionAccuracy::default();
    }
    let direction_hits = scored
        .iter()
        .filter(|(current, predicted, actual)| {
            direction_of(predicted - current) == direction_of(actual - current)
        })
        .count() as u32;
    let mape = scored
        .iter()
        .map(|(_, predicted, actual)| ((predicted - actual) / actual).abs())
        .sum::<f64>()
        / scored.len() as f64
        * 100.0;
    PredictionAccuracy {
        evaluated: scored.len() as u32,
        direction_hits,
        direction_accuracy: direction_hits as f64 / scored.len() as f64,
        mean_absolute_percent_error: mape,
    }
}

fn direction_of(delta: f64) -> i8 {
    if delta > 0.0 {
        1
    } else if delta < 0.0 {
        -1
    } else {
        0
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn backtest_summary_from_row(row: &Row<'_>) -> rusqlite::Result<BacktestSummary> {
    Ok(BacktestSummary {
        id: row.get(0)?,
        symbol: row.get(1)?,
        strategy_id: row.get(2)?,
        parameters: json_column(row, 3)?,
        start_date: row.get(4)?,
        end_date: row.get(5)?,
        initial_capital: row.get(6)?,
        final_value: row.get(7)?,
        total_return_percent: row.get(8)?,
        sharpe_ratio: row.get(9)?,
        max_drawdown_percent: row.get(10)?,
        win_rate: row.get(11)?,
        total_trades: row.get(12)?,
        performance: json_column(row, 13)?,
        created_at: row.get(14)?,
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    Ok(ModelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        weights: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<PredictionRecord> {
    let direction: String = row.get(9)?;
    let direction = direction
        .parse::<SignalAction>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(err)))?;
    Ok(PredictionRecord {
        id: row.get(0)?,
        symbol: row.get(1)?,
        created_at: row.get(2)?,
        horizon_days: row.get(3)?,
        target_date: row.get(4)?,
        current_price: row.get(5)?,
        predicted_price: row.get(6)?,
        predicted_return: row.get(7)?,
        confidence: row.get(8)?,
        direction,
        model_version: row.get(10)?,
        components: row.get(11)?,
        actual_price: row.get(12)?,
        evaluated_at: row.get(13)?,
    })
}
