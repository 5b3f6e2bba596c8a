use crate::context::{AppContext, BacktestRequest, BatchBacktestRequest};
use crate::models::HistoryRange;
use crate::param_utils::parse_param_pairs;
use crate::snapshot::HistorySnapshot;
use anyhow::{anyhow, Result};
use log::info;
use std::path::Path;
use std::sync::Arc;

pub async fn run(
    app: &AppContext,
    symbols: &[String],
    strategy: &str,
    range: Option<HistoryRange>,
    data_file: Option<&Path>,
    params: &[String],
) -> Result<()> {
    if symbols.is_empty() {
        return Err(anyhow!("At least one symbol is required"));
    }
    let parameters = parse_param_pairs(params)?;

    // Offline runs replay the whole snapshot unless a range is given.
    let (app, range) = match data_file {
        Some(path) => {
            let snapshot = HistorySnapshot::load_from_file(path)?;
            info!(
                "Backtesting against snapshot {} ({} symbols)",
                path.display(),
                snapshot.len()
            );
            let offline = app.with_provider(Arc::new(snapshot.into_provider()));
            (offline, range.unwrap_or(HistoryRange::Max))
        }
        None => (app.clone(), range.unwrap_or_default()),
    };

    if let [symbol] = symbols {
        let report = app
            .backtest(BacktestRequest {
                symbol: symbol.clone(),
                strategy: strategy.to_string(),
                parameters,
                range: Some(range),
            })
            .await?;
        return super::print_json(&report);
    }

    let items = app
        .backtest_batch(BatchBacktestRequest {
            symbols: symbols.to_vec(),
            strategies: vec![strategy.to_string()],
            parameters,
            range: Some(range),
        })
        .await?;
    let failed = items.iter().filter(|item| item.failure.is_some()).count();
    info!("Completed {} backtests ({} failed)", items.len(), failed);
    super::print_json(&items)
}
