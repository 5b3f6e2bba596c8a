use crate::error::{MarketError, Result};
use crate::models::{Candle, EventCalendar, HistoryRange};
use crate::provider::{
    clean_candles, read_response, status_error, trim_to_range, MarketDataProvider,
};
use crate::retry::retry_operation;
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const PROVIDER_NAME: &str = "alpha_vantage";
const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";
const TIME_SERIES_KEY: &str = "Time Series (Daily)";
// Free tier allows 5 requests per minute.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(12);

pub struct AlphaVantageClient {
    http: Client,
    api_key: String,
    base_url: String,
    min_interval: Duration,
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl AlphaVantageClient {
    pub fn new(http: Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            min_interval: DEFAULT_MIN_INTERVAL,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Hold the gate until `min_interval` has passed since the previous request.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                log::debug!("Alpha Vantage throttle: waiting {}ms", wait.as_millis());
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn request_daily(&self, symbol: &str, range: HistoryRange) -> Result<Vec<Candle>> {
        self.throttle().await;
        let output_size = output_size_for(range);
        log::debug!(
            "GET {} TIME_SERIES_DAILY symbol={} outputsize={}",
            self.base_url,
            symbol,
            output_size
        );
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("function", "TIME_SERIES_DAILY"),
                ("symbol", symbol),
                ("outputsize", output_size),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;
        let (status, body) = read_response(PROVIDER_NAME, response).await?;
        if !status.is_success() {
            return Err(status_error(PROVIDER_NAME, status, &body));
        }
        let candles = parse_daily_series(symbol, &body)?;
        Ok(trim_to_range(candles, range))
    }
}

#[async_trait]
impl MarketDataProvider for AlphaVantageClient {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn fetch_history(&self, symbol: &str, range: HistoryRange) -> Result<Vec<Candle>> {
        retry_operation!(
            format!("Alpha Vantage daily {} {}", symbol, range),
            self.request_daily(symbol, range)
        )
    }

    async fn fetch_event_calendar(&self, symbol: &str) -> Result<EventCalendar> {
        // No calendar endpoint on the free tier.
        Ok(EventCalendar::empty(symbol))
    }
}

fn output_size_for(range: HistoryRange) -> &'static str {
    match range {
        HistoryRange::FiveDays | HistoryRange::OneMonth | HistoryRange::ThreeMonths => "compact",
        _ => "full",
    }
}

fn field_f64(bar: &Map<String, Value>, key: &str) -> Option<f64> {
    bar.get(key)
        .and_then(Value::as_str)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
}

pub(crate) fn parse_daily_series(symbol: &str, body: &str) -> Result<Vec<Candle>> {
    let payload: Value = serde_json::from_str(body)?;

    if payload.get("Error Message").is_some() {
        return Err(MarketError::InvalidSymbol(symbol.to_string()));
    }
    if payload.get("Note").is_some() || payload.get("Information").is_some() {
        return Err(MarketError::RateLimited {
            provider: PROVIDER_NAME.to_string(),
        });
    }

    let series = payload
        .get(TIME_SERIES_KEY)
        .and_then(Value::as_object)
        .ok_or_else(|| MarketError::data_unavailable(symbol, "response had no daily series"))?;

    let mut candles = Vec::with_capacity(series.len());
    for (raw_date, bar) in series {
        let Ok(day) = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d") else {
            log::warn!("Skipping Alpha Vantage bar with bad date '{}'", raw_date);
            continue;
        };
        let Some(bar) = bar.as_object() else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            field_f64(bar, "1. open"),
            field_f64(bar, "2. high"),
            field_f64(bar, "3. low"),
            field_f64(bar, "4. close"),
        ) else {
            continue;
        };
        let Some(midnight) = day.and_hms_opt(0, 0, 0) else {
            continue;
        };
        candles.push(Candle {
            symbol: symbol.to_string(),
            date: Utc.from_utc_datetime(&midnight),
            open,
            high,
            low,
            close,
            adj_close: None,
            volume: field_f64(bar, "5. volume")
                .filter(|v| *v > 0.0)
                .map(|v| v.round() as u64)
                .unwrap_or(0),
        });
    }

    let candles = clean_candles(candles);
    if candles.is_empty() {
        return Err(MarketError::data_unavailable(symbol, "no usable daily bars"));
    }
    Ok(candles)
}
