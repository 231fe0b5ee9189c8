//! Bar loop for a single symbol.
//!
//! Per-bar phase order is update → rule actions → protective exits →
//! snapshot, matching the multi-symbol runner rather than the source's
//! original exits-before-actions ordering for this path, a deliberate
//! unification (see DESIGN.md).

use std::collections::HashMap;

use chrono::NaiveDate;
use indicator_registry::{IndicatorRegistry, ParamValue};
use rust_decimal::Decimal;

use crate::actions::apply_trade_action;
use crate::data_quality;
use crate::error::BacktestError;
use crate::evaluator::{condition_depends_on_portfolio, ConditionEvaluator, EvalContext, PortfolioView, SignalEvaluator};
use crate::executor::{BacktestExecutor, Executor};
use crate::models::{
    Action, Bar, BacktestConfig, BacktestResult, EquityPoint, PortfolioSnapshot, SizingSpec, StrategyTree,
};
use crate::result;
use crate::sizing;

/// Precomputed per-rule boolean series, or `None` when the rule's
/// condition touches portfolio state and must be evaluated bar by bar.
enum RuleSeries {
    Precomputed(Vec<bool>),
    Deferred,
}

pub fn run(
    strategy: &StrategyTree,
    symbol: &str,
    bars: &[Bar],
    config: &BacktestConfig,
    parameter_overrides: &HashMap<String, ParamValue>,
    registry: &dyn IndicatorRegistry,
) -> Result<BacktestResult, BacktestError> {
    data_quality::scan(symbol, bars)?;
    tracing::info!(strategy_id = %strategy.info.id, symbol, bars = bars.len(), "starting single-symbol run");

    let mut parameters = strategy.parameters.clone();
    parameters.extend(parameter_overrides.clone());

    let event_dates = HashMap::new();
    let fundamentals = HashMap::new();
    let external = HashMap::new();
    let ctx = EvalContext {
        bars,
        registry,
        parameters: &parameters,
        signals_library: &strategy.signals,
        conditions_library: &strategy.conditions,
        event_dates: &event_dates,
        fundamentals: &fundamentals,
        external: &external,
    };

    let mut signal_eval = SignalEvaluator::new();
    let mut rule_series = Vec::with_capacity(strategy.rules.len());
    for rule in &strategy.rules {
        if condition_depends_on_portfolio(&rule.when, &ctx) {
            rule_series.push(RuleSeries::Deferred);
        } else {
            let mut cond_eval = ConditionEvaluator::new(&mut signal_eval);
            let series = cond_eval.evaluate(&rule.when, &ctx).unwrap_or_else(|err| {
                tracing::warn!(rule = %rule.name, error = %err, "rule evaluation failed, forcing false for this run");
                vec![false; bars.len()]
            });
            rule_series.push(RuleSeries::Precomputed(series));
        }
    }

    let atr_series: HashMap<usize, Vec<f64>> = sizing::atr_lookbacks(&strategy.rules)
        .into_iter()
        .map(|period| (period, sizing::compute_atr_series(bars, period, registry)))
        .collect();

    let executor = BacktestExecutor::new(
        config.lot_size,
        config.commission_rate,
        config.slippage_rate,
        config.tiered_commission.clone(),
    );
    let mut bookkeeper = crate::portfolio::PortfolioBookkeeper::new(config.initial_capital);

    for (i, bar) in bars.iter().enumerate() {
        let date = bar.timestamp;
        let mut prices = HashMap::new();
        prices.insert(symbol.to_string(), bar.close);

        let prior_snapshot = bookkeeper.snapshots.last().copied().unwrap_or(PortfolioSnapshot {
            date,
            cash: config.initial_capital,
            positions_value: Decimal::ZERO,
            equity: config.initial_capital,
            drawdown: Decimal::ZERO,
            drawdown_pct: 0.0,
        });
        let prior_position = bookkeeper.positions.get(symbol).cloned();

        bookkeeper.update(&prices);

        for (rule, series) in strategy.rules.iter().zip(rule_series.iter_mut()) {
            if !rule.enabled {
                continue;
            }
            let fires = match series {
                RuleSeries::Precomputed(values) => values.get(i).copied().unwrap_or(false),
                RuleSeries::Deferred => {
                    let view = PortfolioView {
                        snapshot: &prior_snapshot,
                        position: prior_position.as_ref(),
                        open_position_count: usize::from(prior_position.is_some()),
                    };
                    let mut cond_eval = ConditionEvaluator::new(&mut signal_eval);
                    cond_eval.evaluate_at(&rule.when, &ctx, i, Some(&view)).unwrap_or_else(|err| {
                        tracing::warn!(rule = %rule.name, error = %err, "rule evaluation failed, forcing false for this bar");
                        false
                    })
                }
            };

            if !fires {
                continue;
            }

            match &rule.then {
                Action::Trade { direction, sizing: sizing_spec, reason } => {
                    let reason = reason.clone().unwrap_or_else(|| rule.name.clone());
                    let open_count = usize::from(bookkeeper.positions.contains_key(symbol));
                    let atr = match sizing_spec {
                        SizingSpec::VolatilityAdjusted { lookback, .. } => atr_series
                            .get(lookback)
                            .and_then(|series| series.get(i).copied())
                            .filter(|v| v.is_finite()),
                        _ => None,
                    };
                    apply_trade_action(
                        &mut bookkeeper,
                        &executor,
                        symbol,
                        bar.close,
                        date,
                        *direction,
                        sizing_spec,
                        &reason,
                        &strategy.constraints,
                        &prices,
                        atr,
                        open_count,
                    );
                }
                Action::Alert { message, level } => {
                    tracing::info!(rule = %rule.name, level = ?level, "{message}");
                }
                Action::Hold => {}
            }
        }

        bookkeeper.check_exits(&prices, date, &strategy.constraints);
        bookkeeper.record(date, &prices);
    }

    if let Some(last_bar) = bars.last() {
        if let Some(position) = bookkeeper.positions.get(symbol) {
            let order = crate::models::OrderRequest {
                symbol: symbol.to_string(),
                direction: match position.direction {
                    crate::models::Direction::Long => crate::models::TradeDirection::Sell,
                    crate::models::Direction::Short => crate::models::TradeDirection::Cover,
                },
                quantity: position.qty,
                price: last_bar.close,
                order_type: crate::models::OrderType::Market,
            };
            if let Some(fill) = executor.execute(&order) {
                bookkeeper.close(
                    symbol,
                    fill.fill_price,
                    last_bar.timestamp,
                    "end_of_backtest",
                    fill.commission,
                    fill.slippage,
                );
            }
        }
    }

    let equity_curve: Vec<EquityPoint> = bookkeeper
        .snapshots
        .iter()
        .map(|s| EquityPoint { date: s.date, equity: s.equity })
        .collect();

    let final_equity = bookkeeper.cash;
    let metrics = result::compute_metrics(&bookkeeper.trades, &bookkeeper.snapshots, config.initial_capital, config.risk_free_rate);
    let benchmark = result::compute_benchmark(bars, symbol, metrics.total_return_pct);
    tracing::info!(strategy_id = %strategy.info.id, symbol, final_equity = %final_equity, "run complete");

    Ok(BacktestResult {
        strategy_id: strategy.info.id.clone(),
        symbol: symbol.to_string(),
        start_date: bars.first().map(|b| b.timestamp).unwrap_or_else(|| default_date()),
        end_date: bars.last().map(|b| b.timestamp).unwrap_or_else(|| default_date()),
        initial_capital: config.initial_capital,
        final_equity,
        trades: bookkeeper.trades,
        snapshots: bookkeeper.snapshots,
        equity_curve,
        parameters,
        metrics,
        benchmark,
    })
}

fn default_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch date")
}
