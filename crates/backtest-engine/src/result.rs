//! Performance metrics assembly: returns, risk-adjusted ratios, drawdown,
//! trade statistics, and exposure, computed from the closed bar loop's
//! trades and snapshots. A thin orchestrator, not a product surface;
//! callers serialize and visualize elsewhere.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::{Bar, BenchmarkComparison, PerformanceMetrics, PortfolioSnapshot, Trade};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub fn compute_metrics(
    trades: &[Trade],
    snapshots: &[PortfolioSnapshot],
    initial_capital: Decimal,
    risk_free_rate: f64,
) -> PerformanceMetrics {
    let equity: Vec<f64> = snapshots.iter().map(|s| s.equity.to_f64().unwrap_or(0.0)).collect();
    let initial = initial_capital.to_f64().unwrap_or(0.0);
    let final_equity = equity.last().copied().unwrap_or(initial);

    let total_return_pct = if initial > 0.0 {
        (final_equity - initial) / initial * 100.0
    } else {
        0.0
    };

    let trading_days = equity.len().max(1) as f64;
    let years = trading_days / TRADING_DAYS_PER_YEAR;
    let annualized_return_pct = if years > 0.0 && initial > 0.0 && final_equity > 0.0 {
        ((final_equity / initial).powf(1.0 / years) - 1.0) * 100.0
    } else {
        0.0
    };

    let daily_returns = daily_returns(&equity);
    let (sharpe_ratio, sortino_ratio) = risk_adjusted_ratios(&daily_returns, risk_free_rate);

    let (max_drawdown_pct, recovery_factor) = drawdown_and_recovery(&equity, final_equity - initial);
    let calmar_ratio = if max_drawdown_pct > 0.0 {
        annualized_return_pct / max_drawdown_pct
    } else {
        0.0
    };

    let closed: Vec<&Trade> = trades.iter().filter(|t| !t.is_open).collect();
    let (win_rate_pct, profit_factor, avg_win, avg_loss, max_consecutive_wins, max_consecutive_losses) =
        trade_statistics(&closed);

    let exposure_time_pct = if snapshots.is_empty() {
        0.0
    } else {
        let exposed = snapshots.iter().filter(|s| s.positions_value > Decimal::ZERO).count();
        exposed as f64 / snapshots.len() as f64 * 100.0
    };

    PerformanceMetrics {
        total_return_pct,
        annualized_return_pct,
        sharpe_ratio,
        sortino_ratio,
        calmar_ratio,
        max_drawdown_pct,
        win_rate_pct,
        profit_factor,
        avg_win,
        avg_loss,
        max_consecutive_wins,
        max_consecutive_losses,
        exposure_time_pct,
        recovery_factor,
    }
}

fn daily_returns(equity: &[f64]) -> Vec<f64> {
    if equity.len() < 2 {
        return Vec::new();
    }
    equity
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

fn risk_adjusted_ratios(daily_returns: &[f64], risk_free_rate: f64) -> (f64, f64) {
    if daily_returns.len() < 2 {
        return (0.0, 0.0);
    }
    let mean = daily_returns.iter().sum::<f64>() / daily_returns.len() as f64;
    let variance = daily_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / daily_returns.len() as f64;
    let volatility_annualized = variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt();

    let downside: Vec<f64> = daily_returns.iter().copied().filter(|&r| r < 0.0).collect();
    let downside_deviation_annualized = if downside.is_empty() {
        0.0
    } else {
        let downside_mean = downside.iter().sum::<f64>() / downside.len() as f64;
        let downside_var = downside.iter().map(|r| (r - downside_mean).powi(2)).sum::<f64>() / downside.len() as f64;
        downside_var.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
    };

    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let avg_excess_return = mean - daily_rf;

    let sharpe_ratio = if volatility_annualized > 0.0 {
        (avg_excess_return * TRADING_DAYS_PER_YEAR) / volatility_annualized
    } else {
        0.0
    };
    let sortino_ratio = if downside_deviation_annualized > 0.0 {
        (avg_excess_return * TRADING_DAYS_PER_YEAR) / downside_deviation_annualized
    } else {
        0.0
    };

    (sharpe_ratio, sortino_ratio)
}

fn drawdown_and_recovery(equity: &[f64], net_profit: f64) -> (f64, f64) {
    if equity.is_empty() {
        return (0.0, 0.0);
    }
    let mut running_max = equity[0];
    let mut max_drawdown_pct = 0.0_f64;
    let mut max_drawdown_abs = 0.0_f64;
    for &point in equity {
        running_max = running_max.max(point);
        if running_max > 0.0 {
            let drawdown = running_max - point;
            let drawdown_pct = drawdown / running_max * 100.0;
            max_drawdown_pct = max_drawdown_pct.max(drawdown_pct);
            max_drawdown_abs = max_drawdown_abs.max(drawdown);
        }
    }
    let recovery_factor = if max_drawdown_abs > 0.0 { net_profit / max_drawdown_abs } else { 0.0 };
    (max_drawdown_pct, recovery_factor)
}

#[allow(clippy::type_complexity)]
fn trade_statistics(closed: &[&Trade]) -> (f64, f64, Decimal, Decimal, u32, u32) {
    if closed.is_empty() {
        return (0.0, 0.0, Decimal::ZERO, Decimal::ZERO, 0, 0);
    }

    let total = closed.len() as f64;
    let wins: Vec<Decimal> = closed.iter().filter_map(|t| t.pnl).filter(|&p| p > Decimal::ZERO).collect();
    let losses: Vec<Decimal> = closed.iter().filter_map(|t| t.pnl).filter(|&p| p < Decimal::ZERO).collect();

    let win_rate_pct = wins.len() as f64 / total * 100.0;

    let gross_profit: Decimal = wins.iter().sum();
    let gross_loss: Decimal = losses.iter().sum::<Decimal>().abs();
    let profit_factor = if gross_loss > Decimal::ZERO {
        (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
    } else if gross_profit > Decimal::ZERO {
        f64::INFINITY
    } else {
        0.0
    };

    let avg_win = if wins.is_empty() { Decimal::ZERO } else { gross_profit / Decimal::from(wins.len() as u64) };
    let avg_loss = if losses.is_empty() { Decimal::ZERO } else { gross_loss / Decimal::from(losses.len() as u64) };

    let mut max_consecutive_wins = 0u32;
    let mut max_consecutive_losses = 0u32;
    let mut current_wins = 0u32;
    let mut current_losses = 0u32;
    for trade in closed {
        match trade.pnl {
            Some(pnl) if pnl > Decimal::ZERO => {
                current_wins += 1;
                current_losses = 0;
                max_consecutive_wins = max_consecutive_wins.max(current_wins);
            }
            Some(pnl) if pnl < Decimal::ZERO => {
                current_losses += 1;
                current_wins = 0;
                max_consecutive_losses = max_consecutive_losses.max(current_losses);
            }
            _ => {
                current_wins = 0;
                current_losses = 0;
            }
        }
    }

    (win_rate_pct, profit_factor, avg_win, avg_loss, max_consecutive_wins, max_consecutive_losses)
}

/// Buy-and-hold comparison over the same bar range: one share bought at
/// the first close and marked at the last, commission- and slippage-free.
pub fn compute_benchmark(bars: &[Bar], symbol: &str, strategy_return_pct: f64) -> Option<BenchmarkComparison> {
    let first = bars.first()?.close.to_f64().unwrap_or(0.0);
    let last = bars.last()?.close.to_f64().unwrap_or(0.0);
    if first <= 0.0 {
        return None;
    }
    let benchmark_return_pct = (last - first) / first * 100.0;
    Some(BenchmarkComparison {
        benchmark_symbol: symbol.to_string(),
        benchmark_return_pct,
        strategy_return_pct,
        alpha_pct: strategy_return_pct - benchmark_return_pct,
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::models::Direction;

    fn snapshot(day: u32, equity: Decimal, positions_value: Decimal) -> PortfolioSnapshot {
        PortfolioSnapshot {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            cash: equity - positions_value,
            positions_value,
            equity,
            drawdown: Decimal::ZERO,
            drawdown_pct: 0.0,
        }
    }

    fn closed_trade(pnl: Decimal) -> Trade {
        Trade {
            symbol: "AAA".to_string(),
            direction: Direction::Long,
            entry_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            entry_price: dec!(100),
            qty: dec!(1),
            exit_date: Some(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            exit_price: Some(dec!(100) + pnl),
            commission: Decimal::ZERO,
            slippage: Decimal::ZERO,
            pnl: Some(pnl),
            is_open: false,
            entry_reason: "test".to_string(),
            exit_reason: Some("test".to_string()),
        }
    }

    #[test]
    fn total_return_reflects_equity_growth() {
        let snapshots = vec![snapshot(1, dec!(1000), Decimal::ZERO), snapshot(2, dec!(1100), Decimal::ZERO)];
        let metrics = compute_metrics(&[], &snapshots, dec!(1000), 0.0);
        assert!((metrics.total_return_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn max_drawdown_tracks_peak_to_trough_decline() {
        let snapshots = vec![
            snapshot(1, dec!(1000), Decimal::ZERO),
            snapshot(2, dec!(1200), Decimal::ZERO),
            snapshot(3, dec!(900), Decimal::ZERO),
            snapshot(4, dec!(1000), Decimal::ZERO),
        ];
        let metrics = compute_metrics(&[], &snapshots, dec!(1000), 0.0);
        // peak 1200, trough 900 -> 300/1200 * 100 = 25%
        assert!((metrics.max_drawdown_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn win_rate_and_profit_factor_from_closed_trades() {
        let trades = vec![closed_trade(dec!(100)), closed_trade(dec!(-50)), closed_trade(dec!(50))];
        let snapshots = vec![snapshot(1, dec!(1000), Decimal::ZERO)];
        let metrics = compute_metrics(&trades, &snapshots, dec!(1000), 0.0);
        assert!((metrics.win_rate_pct - (2.0 / 3.0 * 100.0)).abs() < 1e-9);
        assert!((metrics.profit_factor - 3.0).abs() < 1e-9); // 150 gross profit / 50 gross loss
        assert_eq!(metrics.avg_win, dec!(75));
        assert_eq!(metrics.avg_loss, dec!(50));
    }

    #[test]
    fn open_trades_are_excluded_from_trade_statistics() {
        let mut open_trade = closed_trade(dec!(1000));
        open_trade.is_open = true;
        open_trade.pnl = None;
        let trades = vec![closed_trade(dec!(10)), open_trade];
        let snapshots = vec![snapshot(1, dec!(1000), Decimal::ZERO)];
        let metrics = compute_metrics(&trades, &snapshots, dec!(1000), 0.0);
        assert!((metrics.win_rate_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn consecutive_streaks_reset_on_alternating_outcomes() {
        let trades = vec![
            closed_trade(dec!(10)),
            closed_trade(dec!(10)),
            closed_trade(dec!(-5)),
            closed_trade(dec!(10)),
            closed_trade(dec!(10)),
            closed_trade(dec!(10)),
        ];
        let snapshots = vec![snapshot(1, dec!(1000), Decimal::ZERO)];
        let metrics = compute_metrics(&trades, &snapshots, dec!(1000), 0.0);
        assert_eq!(metrics.max_consecutive_wins, 3);
        assert_eq!(metrics.max_consecutive_losses, 1);
    }

    #[test]
    fn exposure_time_counts_snapshots_with_open_positions() {
        let snapshots = vec![
            snapshot(1, dec!(1000), dec!(500)),
            snapshot(2, dec!(1000), Decimal::ZERO),
            snapshot(3, dec!(1000), dec!(500)),
            snapshot(4, dec!(1000), Decimal::ZERO),
        ];
        let metrics = compute_metrics(&[], &snapshots, dec!(1000), 0.0);
        assert!((metrics.exposure_time_pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_profit_factor_without_any_wins() {
        let trades = vec![closed_trade(dec!(-10)), closed_trade(dec!(-20))];
        let snapshots = vec![snapshot(1, dec!(1000), Decimal::ZERO)];
        let metrics = compute_metrics(&trades, &snapshots, dec!(1000), 0.0);
        assert_eq!(metrics.profit_factor, 0.0);
    }

    #[test]
    fn benchmark_alpha_is_strategy_return_minus_buy_and_hold() {
        let bars = vec![
            Bar {
                timestamp: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                open: dec!(100),
                high: dec!(100),
                low: dec!(100),
                close: dec!(100),
                volume: 0.0,
            },
            Bar {
                timestamp: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                open: dec!(110),
                high: dec!(110),
                low: dec!(110),
                close: dec!(110),
                volume: 0.0,
            },
        ];
        let comparison = compute_benchmark(&bars, "AAA", 20.0).unwrap();
        assert!((comparison.benchmark_return_pct - 10.0).abs() < 1e-9);
        assert!((comparison.alpha_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn benchmark_is_none_for_empty_bars() {
        assert!(compute_benchmark(&[], "AAA", 5.0).is_none());
    }
}
