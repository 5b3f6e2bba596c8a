use crate::error::{MarketError, Result};
use crate::models::{Candle, EventCalendar, HistoryRange};
use crate::provider::{clean_candles, trim_to_range, MarketDataProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory provider for offline runs and tests.
#[derive(Default)]
pub struct StaticProvider {
    history: HashMap<String, Vec<Candle>>,
    calendars: HashMap<String, EventCalendar>,
    history_requests: AtomicUsize,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(mut self, symbol: &str, candles: Vec<Candle>) -> Self {
        self.history
            .insert(symbol.to_ascii_uppercase(), clean_candles(candles));
        self
    }

    pub fn with_calendar(mut self, calendar: EventCalendar) -> Self {
        self.calendars
            .insert(calendar.symbol.to_ascii_uppercase(), calendar);
        self
    }

    pub fn from_series<I>(series: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<Candle>)>,
    {
        series
            .into_iter()
            .fold(Self::new(), |provider, (symbol, candles)| {
                provider.with_history(&symbol, candles)
            })
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.history.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Number of `fetch_history` calls served so far.
    pub fn history_requests(&self) -> usize {
        self.history_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MarketDataProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch_history(&self, symbol: &str, range: HistoryRange) -> Result<Vec<Candle>> {
        self.history_requests.fetch_add(1, Ordering::Relaxed);
        let candles = self
            .history
            .get(symbol)
            .filter(|candles| !candles.is_empty())
            .ok_or_else(|| MarketError::data_unavailable(symbol, "symbol not loaded"))?;
        Ok(trim_to_range(candles.clone(), range))
    }

    async fn fetch_event_calendar(&self, symbol: &str) -> Result<EventCalendar> {
        Ok(self
            .calendars
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| EventCalendar::empty(symbol)))
    }
}
