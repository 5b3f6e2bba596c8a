use crate::context::AppContext;
use crate::models::HistoryRange;
use crate::snapshot::HistorySnapshot;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

pub async fn run(
    app: &AppContext,
    symbols: &[String],
    range: HistoryRange,
    output_path: &Path,
) -> Result<()> {
    info!(
        "Exporting {} history for {} symbols to {}",
        range,
        symbols.len(),
        output_path.display()
    );

    let mut snapshot = HistorySnapshot::new();
    for symbol in symbols {
        let candles = app
            .history(symbol, range)
            .await
            .with_context(|| format!("Failed to fetch history for {}", symbol))?;
        info!("{}: {} candles", symbol, candles.len());
        snapshot.insert(symbol, candles.as_ref().clone());
    }

    snapshot.save_to_file(output_path)?;
    info!(
        "History snapshot written to {} ({} candles)",
        output_path.display(),
        snapshot.total_candles()
    );
    Ok(())
}
