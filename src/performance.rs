use crate::indicators::TRADING_DAYS_PER_YEAR;
use crate::models::*;
use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;

pub struct PerformanceCalculator;

struct DrawdownInfo {
    max_drawdown: f64,
    max_drawdown_percent: f64,
}

impl PerformanceCalculator {
    pub fn calculate(
        trades: &[Trade],
        daily_snapshots: &[BacktestDataPoint],
        initial_capital: f64,
        final_portfolio_value: f64,
        buy_and_hold_return_percent: f64,
        risk_free_rate: f64,
    ) -> StrategyPerformance {
        let closed: Vec<&Trade> = trades.iter().filter(|t| t.is_closed()).collect();
        let total_trades = closed.len() as u32;

        let trade_pnls: Vec<f64> = closed.iter().map(|t| t.pnl.unwrap_or(0.0)).collect();
        let winning_pnls: Vec<f64> = trade_pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losing_pnls: Vec<f64> = trade_pnls.iter().copied().filter(|p| *p < 0.0).collect();
        let winning_trades = winning_pnls.len() as u32;
        let losing_trades = losing_pnls.len() as u32;
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        let final_portfolio_value = if final_portfolio_value.is_finite() {
            final_portfolio_value
        } else {
            daily_snapshots
                .last()
                .map(|s| s.portfolio_value)
                .unwrap_or(initial_capital)
        };
        let total_return = final_portfolio_value - initial_capital;
        let total_return_percent = if initial_capital > 0.0 {
            total_return / initial_capital * 100.0
        } else {
            0.0
        };

        let (start_date, end_date) = match (daily_snapshots.first(), daily_snapshots.last()) {
            (Some(first), Some(last)) => (first.date, last.date),
            _ => {
                let now = Utc::now();
                (now, now)
            }
        };
        let cagr =
            Self::calculate_cagr(initial_capital, final_portfolio_value, start_date, end_date);

        let returns = Self::daily_returns(daily_snapshots);
        let sharpe_ratio = Self::calculate_sharpe_ratio(&returns, risk_free_rate);
        let sortino_ratio = Self::calculate_sortino_ratio(&returns, risk_free_rate);
        let drawdown_info = Self::calculate_max_drawdown(daily_snapshots);

        let gross_profit: f64 = winning_pnls.iter().sum();
        let gross_loss: f64 = -losing_pnls.iter().sum::<f64>();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            gross_profit
        };

        let best_trade = trade_pnls
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let worst_trade = trade_pnls.iter().copied().fold(f64::INFINITY, f64::min);

        let trade_returns: Vec<f64> = closed.iter().filter_map(|t| t.pnl_percent()).collect();

        let durations: Vec<f64> = closed
            .iter()
            .filter_map(|t| t.duration_days())
            .map(|days| days as f64)
            .collect();

        let exposure_percent = if daily_snapshots.is_empty() {
            0.0
        } else {
            let exposed = daily_snapshots
                .iter()
                .filter(|s| s.position_value > 0.0)
                .count();
            exposed as f64 / daily_snapshots.len() as f64 * 100.0
        };

        StrategyPerformance {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            total_return,
            total_return_percent,
            cagr,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown: drawdown_info.max_drawdown,
            max_drawdown_percent: drawdown_info.max_drawdown_percent,
            profit_factor,
            avg_win: Self::average(&winning_pnls),
            avg_loss: Self::average(&losing_pnls),
            avg_trade_return_percent: Self::average(&trade_returns),
            best_trade: if best_trade.is_finite() { best_trade } else { 0.0 },
            worst_trade: if worst_trade.is_finite() { worst_trade } else { 0.0 },
            avg_trade_duration_days: Self::average(&durations),
            exposure_percent,
            buy_and_hold_return_percent,
        }
    }

    fn calculate_cagr(
        initial_capital: f64,
        final_portfolio_value: f64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> f64 {
        if initial_capital <= 0.0 || !final_portfolio_value.is_finite() {
            return 0.0;
        }

        if end_date <= start_date {
            return 0.0;
        }

        let duration = end_date - start_date;
        let years = duration.num_seconds() as f64 / (365.25_f64 * 24.0 * 60.0 * 60.0);

        if years <= 0.0 {
            return 0.0;
        }

        let total_return_ratio = final_portfolio_value / initial_capital;
        if total_return_ratio <= 0.0 {
            return -1.0;
        }

        total_return_ratio.powf(1.0 / years) - 1.0
    }

    fn average(values: &[f64]) -> f64 {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            0.0
        } else {
            finite.mean()
        }
    }

    fn daily_returns(daily_snapshots: &[BacktestDataPoint]) -> Vec<f64> {
        daily_snapshots
            .windows(2)
            .map(|window| {
                let prev_value = window[0].portfolio_value;
                let curr_value = window[1].portfolio_value;
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect()
    }

    pub fn calculate_sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }

        let mean_return = returns.mean();
        let std_dev = returns.std_dev();

        if !std_dev.is_finite() || std_dev == 0.0 {
            return 0.0;
        }

        let annualized_return = mean_return * TRADING_DAYS_PER_YEAR;
        let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();

        (annualized_return - risk_free_rate) / annualized_volatility
    }

    /// Like Sharpe, but only penalises returns below zero.
    pub fn calculate_sortino_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }

        let downside_squares: Vec<f64> = returns.iter().map(|r| r.min(0.0).powi(2)).collect();
        let downside_deviation = downside_squares.mean().sqrt();
        if !downside_deviation.is_finite() || downside_deviation == 0.0 {
            return 0.0;
        }

        let annualized_return = returns.mean() * TRADING_DAYS_PER_YEAR;
        (annualized_return - risk_free_rate) / (downside_deviation * TRADING_DAYS_PER_YEAR.sqrt())
    }

    fn calculate_max_drawdown(daily_snapshots: &[BacktestDataPoint]) -> DrawdownInfo {
        if daily_snapshots.is_empty() {
            return DrawdownInfo {
                max_drawdown: 0.0,
                max_drawdown_percent: 0.0,
            };
        }

        let mut max_drawdown = 0.0;
        let mut max_drawdown_percent = 0.0;
        let mut peak_value = daily_snapshots[0].portfolio_value;

        for snapshot in daily_snapshots {
            if snapshot.portfolio_value > peak_value {
                peak_value = snapshot.portfolio_value;
            } else {
                let drawdown = peak_value - snapshot.portfolio_value;
                let drawdown_percent = if peak_value > 0.0 {
                    (drawdown / peak_value) * 100.0
                } else {
                    0.0
                };

                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
                if drawdown_percent > max_drawdown_percent {
                    max_drawdown_percent = drawdown_percent;
                }
            }
        }

        DrawdownInfo {
            max_drawdown,
            max_drawdown_percent,
        }
    }
}
