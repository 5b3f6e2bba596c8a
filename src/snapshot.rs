use crate::models::Candle;
use crate::provider::{clean_candles, normalize_symbol, StaticProvider};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const HISTORY_SNAPSHOT_VERSION: u32 = 1;

/// Daily history for a set of symbols, written to disk so backtests can run
/// without touching a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    series: BTreeMap<String, Vec<Candle>>,
}

impl Default for HistorySnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl HistorySnapshot {
    pub fn new() -> Self {
        Self {
            version: HISTORY_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            series: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, symbol: &str, candles: Vec<Candle>) {
        self.series
            .insert(symbol.to_ascii_uppercase(), clean_candles(candles));
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn symbols(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn candles(&self, symbol: &str) -> Option<&[Candle]> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.series.get(&symbol).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn total_candles(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    pub fn into_provider(self) -> StaticProvider {
        StaticProvider::from_series(self.series)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open history snapshot at {}", path.display()))?;
        let snapshot: HistorySnapshot = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("History snapshot decode failed for {}", path.display()))?;

        if snapshot.version != HISTORY_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "History snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                HISTORY_SNAPSHOT_VERSION
            ));
        }
        log::info!(
            "Loaded history snapshot from {} ({} symbols, {} candles, generated {})",
            path.display(),
            snapshot.len(),
            snapshot.total_candles(),
            snapshot.generated_at
        );
        Ok(snapshot)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path)
            .with_context(|| format!("Unable to create history snapshot at {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)
            .context("Failed to serialize history snapshot")?;
        writer
            .flush()
            .context("Failed to flush history snapshot to disk")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::candles_from_closes;
    use crate::models::HistoryRange;
    use crate::provider::MarketDataProvider;

    #[tokio::test]
    async fn save_load_and_serve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots").join("history.bin");

        let mut snapshot = HistorySnapshot::new();
        snapshot.insert("aaa", candles_from_closes("AAA", &[10.0, 11.0, 12.0]));
        snapshot.insert("BBB", candles_from_closes("BBB", &[5.0, 4.0]));
        snapshot.save_to_file(&path).unwrap();

        let loaded = HistorySnapshot::load_from_file(&path).unwrap();
        assert_eq!(loaded.symbols(), vec!["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(loaded.total_candles(), 5);
        assert_eq!(loaded.candles("aaa").unwrap()[2].close, 12.0);

        let provider = loaded.into_provider();
        let bars = provider.fetch_history("BBB", HistoryRange::Max).await.unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[test]
    fn rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.bin");
        let mut snapshot = HistorySnapshot::new();
        snapshot.version = HISTORY_SNAPSHOT_VERSION + 1;
        snapshot.save_to_file(&path).unwrap();

        let err = HistorySnapshot::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = HistorySnapshot::load_from_file("/nonexistent/history.bin").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/history.bin"));
    }
}
