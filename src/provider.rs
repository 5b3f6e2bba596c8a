use crate::config::{ProviderKind, ServiceSettings};
use crate::error::{MarketError, Result};
use crate::models::{Candle, EventCalendar, HistoryRange};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[path = "providers/yahoo.rs"]
pub mod yahoo;
pub use yahoo::YahooClient;

#[path = "providers/alpha_vantage.rs"]
pub mod alpha_vantage;
pub use alpha_vantage::AlphaVantageClient;

#[path = "providers/static_provider.rs"]
pub mod static_provider;
pub use static_provider::StaticProvider;

const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; market-desk/",
    env!("CARGO_PKG_VERSION"),
    ")"
);
const MAX_SYMBOL_LEN: usize = 15;

/// Source of daily bars and corporate event dates.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Daily candles ascending by date, invalid rows removed.
    async fn fetch_history(&self, symbol: &str, range: HistoryRange) -> Result<Vec<Candle>>;

    async fn fetch_event_calendar(&self, symbol: &str) -> Result<EventCalendar>;
}

pub fn create_provider(settings: &ServiceSettings) -> Result<Arc<dyn MarketDataProvider>> {
    let http = build_http_client(settings.http_timeout)?;
    let provider: Arc<dyn MarketDataProvider> = match settings.provider {
        ProviderKind::Yahoo => Arc::new(YahooClient::new(http)),
        ProviderKind::AlphaVantage => {
            let api_key = settings.alpha_vantage_api_key.clone().ok_or_else(|| {
                MarketError::Config("ALPHA_VANTAGE_API_KEY is not set".to_string())
            })?;
            Arc::new(AlphaVantageClient::new(http, api_key))
        }
    };
    log::info!("Using {} market data provider", provider.name());
    Ok(provider)
}

pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(MarketError::from)
}

pub fn normalize_symbol(raw: &str) -> Result<String> {
    let symbol = raw.trim().to_ascii_uppercase();
    let valid_chars = symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '^' | '=' | '-'));
    if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN || !valid_chars {
        return Err(MarketError::InvalidSymbol(raw.trim().to_string()));
    }
    Ok(symbol)
}

/// Sort ascending, drop unusable rows and keep the last bar seen for each calendar day.
pub fn clean_candles(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.retain(Candle::is_valid);
    candles.sort_by_key(|candle| candle.date);

    let mut seen = HashSet::with_capacity(candles.len());
    let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles.into_iter().rev() {
        if seen.insert(candle.date.date_naive()) {
            deduped.push(candle);
        }
    }
    deduped.reverse();
    deduped
}

/// Keep only candles inside `range`, measured back from the newest candle.
pub fn trim_to_range(candles: Vec<Candle>, range: HistoryRange) -> Vec<Candle> {
    let (Some(days), Some(last)) = (range.approx_days(), candles.last()) else {
        return candles;
    };
    let cutoff = last.date - ChronoDuration::days(days);
    candles
        .into_iter()
        .filter(|candle| candle.date >= cutoff)
        .collect()
}

pub(crate) async fn read_response(
    provider: &str,
    response: reqwest::Response,
) -> Result<(reqwest::StatusCode, String)> {
    let status = response.status();
    let body = response.text().await?;
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(MarketError::RateLimited {
            provider: provider.to_string(),
        });
    }
    Ok((status, body))
}

pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> MarketError {
    let snippet: String = body.chars().take(200).collect();
    MarketError::Provider {
        provider: provider.to_string(),
        message: format!("HTTP {}: {}", status.as_u16(), snippet),
        status: Some(status.as_u16()),
    }
}
