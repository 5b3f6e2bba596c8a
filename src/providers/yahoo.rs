use crate::error::{MarketError, Result};
use crate::models::{Candle, EventCalendar, HistoryRange};
use crate::provider::{clean_candles, read_response, status_error, MarketDataProvider};
use crate::retry::retry_operation;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

const PROVIDER_NAME: &str = "yahoo";
const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

pub struct YahooClient {
    http: Client,
    base_url: String,
}

impl YahooClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn request_chart(&self, symbol: &str, range: HistoryRange) -> Result<Vec<Candle>> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol);
        log::debug!("GET {} range={}", url, range);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("range", range.as_str()),
                ("interval", "1d"),
                ("includeAdjustedClose", "true"),
            ])
            .send()
            .await?;
        let (status, body) = read_response(PROVIDER_NAME, response).await?;

        // Unknown symbols come back as 404 with a chart error payload.
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(status_error(PROVIDER_NAME, status, &body));
        }
        parse_chart(symbol, &body)
    }

    async fn request_calendar(&self, symbol: &str) -> Result<EventCalendar> {
        let url = format!("{}/v10/finance/quoteSummary/{}", self.base_url, symbol);
        log::debug!("GET {} modules=calendarEvents", url);
        let response = self
            .http
            .get(&url)
            .query(&[("modules", "calendarEvents")])
            .send()
            .await?;
        let (status, body) = read_response(PROVIDER_NAME, response).await?;

        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(status_error(PROVIDER_NAME, status, &body));
        }
        parse_calendar(symbol, &body)
    }
}

#[async_trait]
impl MarketDataProvider for YahooClient {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn fetch_history(&self, symbol: &str, range: HistoryRange) -> Result<Vec<Candle>> {
        retry_operation!(
            format!("Yahoo chart {} {}", symbol, range),
            self.request_chart(symbol, range)
        )
    }

    async fn fetch_event_calendar(&self, symbol: &str) -> Result<EventCalendar> {
        retry_operation!(
            format!("Yahoo calendar {}", symbol),
            self.request_calendar(symbol)
        )
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl ApiError {
    fn into_market_error(self, symbol: &str) -> MarketError {
        let code = self.code.unwrap_or_default();
        let description = self.description.unwrap_or_else(|| code.clone());
        if code.eq_ignore_ascii_case("Not Found") {
            MarketError::InvalidSymbol(symbol.to_string())
        } else {
            MarketError::provider(PROVIDER_NAME, format!("{}: {}", code, description))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
    #[serde(default)]
    adjclose: Option<Vec<AdjCloseSeries>>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseSeries {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

pub(crate) fn parse_chart(symbol: &str, body: &str) -> Result<Vec<Candle>> {
    let envelope: ChartEnvelope = serde_json::from_str(body)?;
    if let Some(error) = envelope.chart.error {
        return Err(error.into_market_error(symbol));
    }
    let result = envelope
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| MarketError::data_unavailable(symbol, "chart response had no result"))?;

    let timestamps = result.timestamp.unwrap_or_default();
    if timestamps.is_empty() {
        return Err(MarketError::data_unavailable(symbol, "no price history returned"));
    }

    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let adjclose = result
        .indicators
        .adjclose
        .and_then(|series| series.into_iter().next())
        .map(|series| series.adjclose)
        .unwrap_or_default();

    let value_at = |series: &[Option<f64>], idx: usize| series.get(idx).copied().flatten();
    let mut candles = Vec::with_capacity(timestamps.len());
    for (idx, ts) in timestamps.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(*ts, 0) else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            value_at(&quote.open, idx),
            value_at(&quote.high, idx),
            value_at(&quote.low, idx),
            value_at(&quote.close, idx),
        ) else {
            continue;
        };
        candles.push(Candle {
            symbol: symbol.to_string(),
            date,
            open,
            high,
            low,
            close,
            adj_close: value_at(&adjclose, idx),
            volume: value_at(&quote.volume, idx)
                .filter(|v| v.is_finite() && *v > 0.0)
                .map(|v| v.round() as u64)
                .unwrap_or(0),
        });
    }

    let candles = clean_candles(candles);
    if candles.is_empty() {
        return Err(MarketError::data_unavailable(symbol, "every returned bar was incomplete"));
    }
    Ok(candles)
}

#[derive(Debug, Deserialize)]
struct SummaryEnvelope {
    #[serde(rename = "quoteSummary")]
    quote_summary: SummaryBody,
}

#[derive(Debug, Deserialize)]
struct SummaryBody {
    #[serde(default)]
    result: Option<Vec<SummaryResult>>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct SummaryResult {
    #[serde(rename = "calendarEvents", default)]
    calendar_events: Option<CalendarEvents>,
}

#[derive(Debug, Default, Deserialize)]
struct CalendarEvents {
    #[serde(default)]
    earnings: Option<EarningsEvents>,
    #[serde(rename = "exDividendDate", default)]
    ex_dividend_date: Option<RawTimestamp>,
    #[serde(rename = "dividendDate", default)]
    dividend_date: Option<RawTimestamp>,
}

#[derive(Debug, Deserialize)]
struct EarningsEvents {
    #[serde(rename = "earningsDate", default)]
    earnings_date: Vec<RawTimestamp>,
}

#[derive(Debug, Deserialize)]
struct RawTimestamp {
    #[serde(default)]
    raw: Option<i64>,
}

impl RawTimestamp {
    fn date(&self) -> Option<NaiveDate> {
        self.raw
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.date_naive())
    }
}

pub(crate) fn parse_calendar(symbol: &str, body: &str) -> Result<EventCalendar> {
    let envelope: SummaryEnvelope = serde_json::from_str(body)?;
    if let Some(error) = envelope.quote_summary.error {
        return Err(error.into_market_error(symbol));
    }
    let events = envelope
        .quote_summary
        .result
        .and_then(|results| results.into_iter().next())
        .and_then(|result| result.calendar_events)
        .unwrap_or_default();

    let mut earnings_dates: Vec<NaiveDate> = events
        .earnings
        .map(|earnings| {
            earnings
                .earnings_date
                .iter()
                .filter_map(RawTimestamp::date)
                .collect()
        })
        .unwrap_or_default();
    earnings_dates.sort();
    earnings_dates.dedup();

    Ok(EventCalendar {
        symbol: symbol.to_string(),
        earnings_dates,
        ex_dividend_date: events.ex_dividend_date.as_ref().and_then(RawTimestamp::date),
        dividend_date: events.dividend_date.as_ref().and_then(RawTimestamp::date),
    })
}
