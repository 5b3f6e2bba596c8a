use crate::config::BacktestConfig;
use crate::error::{MarketError, Result};
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::strategy::{create_strategy, Strategy};
use crate::trading_rules::{
    apply_entry_slippage, apply_exit_slippage, determine_position_size, stop_loss_exit_price,
    stop_loss_level, take_profit_exit_price, take_profit_level,
};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Raw output of one simulation before performance statistics are attached.
#[derive(Debug, Clone)]
pub struct BacktestRun {
    pub symbol: String,
    pub strategy_id: String,
    pub initial_capital: f64,
    pub final_value: f64,
    pub trades: Vec<Trade>,
    pub daily_snapshots: Vec<BacktestDataPoint>,
    pub buy_and_hold_return_percent: f64,
}

impl BacktestRun {
    pub fn into_result(
        self,
        parameters: HashMap<String, f64>,
        risk_free_rate: f64,
    ) -> Result<BacktestResult> {
        let (Some(first), Some(last)) = (self.daily_snapshots.first(), self.daily_snapshots.last())
        else {
            return Err(MarketError::Internal(
                "backtest produced no daily snapshots".to_string(),
            ));
        };
        let (start_date, end_date) = (first.date, last.date);

        let performance = PerformanceCalculator::calculate(
            &self.trades,
            &self.daily_snapshots,
            self.initial_capital,
            self.final_value,
            self.buy_and_hold_return_percent,
            risk_free_rate,
        );

        Ok(BacktestResult {
            id: Uuid::new_v4().to_string(),
            symbol: self.symbol,
            strategy_id: self.strategy_id,
            parameters,
            start_date,
            end_date,
            initial_capital: self.initial_capital,
            final_value: self.final_value,
            trades: self.trades,
            daily_snapshots: self.daily_snapshots,
            performance,
            created_at: Utc::now(),
        })
    }
}

struct OpenPosition {
    trade: Trade,
    entry_index: usize,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
}

pub struct Backtester {
    config: BacktestConfig,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn run(
        &self,
        symbol: &str,
        candles: &[Candle],
        strategy: &dyn Strategy,
    ) -> Result<BacktestRun> {
        let start_index = strategy.min_data_points();
        if candles.len() <= start_index {
            return Err(MarketError::InvalidRequest(format!(
                "{} needs more than {} candles for {} (got {})",
                strategy.template_id(),
                start_index,
                symbol,
                candles.len()
            )));
        }

        let mut cash = self.config.initial_capital;
        let mut position: Option<OpenPosition> = None;
        let mut trades: Vec<Trade> = Vec::new();
        let mut daily_snapshots = Vec::with_capacity(candles.len() - start_index);

        for (index, candle) in candles.iter().enumerate().skip(start_index) {
            // Protective exits use the bar's range, never on the entry bar itself.
            if let Some(open) = position.as_ref().filter(|p| p.entry_index < index) {
                let stop_fill = open
                    .stop_loss
                    .and_then(|level| stop_loss_exit_price(candle, level));
                let target_fill = open
                    .take_profit
                    .and_then(|level| take_profit_exit_price(candle, level));
                let exit = match (stop_fill, target_fill) {
                    (Some(price), _) => Some((price, ExitReason::StopLoss)),
                    (None, Some(price)) => Some((price, ExitReason::TakeProfit)),
                    (None, None) => None,
                };
                if let Some((price, reason)) = exit {
                    if let Some(open) = position.take() {
                        trades.push(self.close_position(open, price, candle, reason, &mut cash));
                    }
                }
            }

            let signal = strategy.generate_signal(candles, index);
            match signal.action {
                SignalAction::Buy if position.is_none() => {
                    position = self.open_position(symbol, candle, index, &mut cash);
                }
                SignalAction::Sell => {
                    if let Some(open) = position.take() {
                        let price = apply_exit_slippage(candle.close, self.config.slippage_rate);
                        trades.push(self.close_position(
                            open,
                            price,
                            candle,
                            ExitReason::Signal,
                            &mut cash,
                        ));
                    }
                }
                _ => {}
            }

            let position_value = position
                .as_ref()
                .map(|p| p.trade.quantity as f64 * candle.close)
                .unwrap_or(0.0);
            daily_snapshots.push(BacktestDataPoint {
                date: candle.date,
                portfolio_value: cash + position_value,
                cash,
                position_value,
            });
        }

        if let (Some(open), Some(last_candle)) = (position.take(), candles.last()) {
            trades.push(self.close_position(
                open,
                last_candle.close,
                last_candle,
                ExitReason::EndOfData,
                &mut cash,
            ));
            if let Some(last_snapshot) = daily_snapshots.last_mut() {
                last_snapshot.cash = cash;
                last_snapshot.position_value = 0.0;
                last_snapshot.portfolio_value = cash;
            }
        }

        let first_close = candles[start_index].close;
        let last_close = candles[candles.len() - 1].close;
        let buy_and_hold_return_percent = if first_close > 0.0 {
            (last_close / first_close - 1.0) * 100.0
        } else {
            0.0
        };

        Ok(BacktestRun {
            symbol: symbol.to_string(),
            strategy_id: strategy.template_id().to_string(),
            initial_capital: self.config.initial_capital,
            final_value: cash,
            trades,
            daily_snapshots,
            buy_and_hold_return_percent,
        })
    }

    fn open_position(
        &self,
        symbol: &str,
        candle: &Candle,
        index: usize,
        cash: &mut f64,
    ) -> Option<OpenPosition> {
        let fill = apply_entry_slippage(candle.close, self.config.slippage_rate);
        let quantity = determine_position_size(
            fill,
            *cash,
            self.config.position_size_ratio,
            self.config.fee_rate,
        );
        if quantity == 0 {
            log::debug!(
                "Skipping buy for {} on {}: cash {:.2} is too small",
                symbol,
                candle.date.date_naive(),
                cash
            );
            return None;
        }

        let notional = fill * quantity as f64;
        let entry_fee = notional * self.config.fee_rate;
        *cash -= notional + entry_fee;

        Some(OpenPosition {
            trade: Trade {
                id: Uuid::new_v4().to_string(),
                symbol: symbol.to_string(),
                quantity,
                entry_price: fill,
                entry_date: candle.date,
                exit_price: None,
                exit_date: None,
                pnl: None,
                fees: entry_fee,
                exit_reason: None,
            },
            entry_index: index,
            stop_loss: stop_loss_level(fill, self.config.stop_loss_ratio),
            take_profit: take_profit_level(fill, self.config.take_profit_ratio),
        })
    }

    fn close_position(
        &self,
        open: OpenPosition,
        exit_price: f64,
        candle: &Candle,
        reason: ExitReason,
        cash: &mut f64,
    ) -> Trade {
        let mut trade = open.trade;
        let quantity = trade.quantity as f64;
        let proceeds = exit_price * quantity;
        let exit_fee = proceeds * self.config.fee_rate;
        *cash += proceeds - exit_fee;

        trade.fees += exit_fee;
        trade.exit_price = Some(exit_price);
        trade.exit_date = Some(candle.date);
        trade.pnl = Some((exit_price - trade.entry_price) * quantity - trade.fees);
        trade.exit_reason = Some(reason);
        trade
    }
}

/// One unit of work for `run_batch`.
#[derive(Debug, Clone)]
pub struct BacktestJob {
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: HashMap<String, f64>,
    pub candles: Arc<Vec<Candle>>,
}

pub fn run_job(job: &BacktestJob, risk_free_rate: f64) -> Result<BacktestResult> {
    let config = BacktestConfig::from_parameters(&job.parameters)?;
    let strategy = create_strategy(&job.strategy_id, job.parameters.clone())?;
    let run = Backtester::new(config).run(&job.symbol, &job.candles, strategy.as_ref())?;
    run.into_result(job.parameters.clone(), risk_free_rate)
}

/// Run jobs on a dedicated pool; results keep job order and fail independently.
pub fn run_batch(
    jobs: &[BacktestJob],
    workers: usize,
    risk_free_rate: f64,
) -> Result<Vec<Result<BacktestResult>>> {
    let num_workers = std::cmp::min(jobs.len().max(1), workers.max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .thread_name(|idx| format!("backtest-{}", idx))
        .build()
        .map_err(|err| MarketError::Internal(format!("failed to build backtest pool: {}", err)))?;

    let started = Instant::now();
    let results: Vec<Result<BacktestResult>> = pool.install(|| {
        jobs.par_iter()
            .map(|job| run_job(job, risk_free_rate))
            .collect()
    });

    let failed = results.iter().filter(|r| r.is_err()).count();
    log::info!(
        "Ran {} backtests on {} workers in {:.2}s ({} failed)",
        jobs.len(),
        num_workers,
        started.elapsed().as_secs_f64(),
        failed
    );
    Ok(results)
}
