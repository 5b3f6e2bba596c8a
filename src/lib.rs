pub mod backtester;
pub mod cache;
pub mod config;
pub mod context;
pub mod database;
pub mod ensemble;
pub mod error;
pub mod event_risk;
pub mod gap_monitor;
pub mod indicators;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod provider;
pub mod retry;
pub mod server;
pub mod snapshot;
pub mod strategy;
pub mod strategy_utils;
pub mod trading_rules;

pub mod commands {
    pub mod backtest;
    pub mod evaluate_predictions;
    pub mod export_history;
    pub mod gap;
    pub mod indicators;
    pub mod predict;
    pub mod quote;
    pub mod risk;
    pub mod serve;

    pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

pub use context::AppContext;
pub use error::{MarketError, Result};
