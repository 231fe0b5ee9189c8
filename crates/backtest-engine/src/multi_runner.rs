//! Bar loop for N symbols with a weight scheme and rebalance cadence.
//!
//! Per-symbol rule pre-evaluation runs in parallel with rayon before the
//! loop starts; the loop itself stays sequential. Phase order per unified
//! date: update → rebalance? → rule actions → protective exits → snapshot.

use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate};
use indicator_registry::{IndicatorRegistry, ParamValue};
use rayon::prelude::*;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::actions::apply_trade_action;
use crate::data_quality;
use crate::error::BacktestError;
use crate::evaluator::{condition_depends_on_portfolio, ConditionEvaluator, EvalContext, PortfolioView, SignalEvaluator};
use crate::executor::{BacktestExecutor, Executor};
use crate::models::{
    Action, Bar, BacktestConfig, Direction, EquityPoint, OrderRequest, OrderType, PortfolioResult,
    PortfolioSnapshot, RebalanceFrequency, SizingSpec, StrategyTree, SymbolResult, TradeDirection, WeightSchemeKind,
};
use crate::portfolio::PortfolioBookkeeper;
use crate::result;
use crate::sizing;
use crate::universe::UniverseResolver;
use crate::weights;

enum RuleSeries {
    Precomputed(Vec<bool>),
    Deferred,
}

pub fn run(
    strategy: &StrategyTree,
    bars_by_symbol: &HashMap<String, Vec<Bar>>,
    config: &BacktestConfig,
    parameter_overrides: &HashMap<String, ParamValue>,
    registry: &dyn IndicatorRegistry,
) -> Result<PortfolioResult, BacktestError> {
    let mut parameters = strategy.parameters.clone();
    parameters.extend(parameter_overrides.clone());

    let universe_resolver = UniverseResolver {
        bars_by_symbol,
        registry,
        parameters: &parameters,
    };
    let symbols = universe_resolver.resolve(&strategy.universe)?;
    tracing::info!(strategy_id = %strategy.info.id, symbols = symbols.len(), "starting multi-symbol run");

    for symbol in &symbols {
        data_quality::scan(symbol, &bars_by_symbol[symbol])?;
    }

    let date_index: HashMap<String, HashMap<NaiveDate, usize>> = symbols
        .iter()
        .map(|s| {
            let idx = bars_by_symbol[s]
                .iter()
                .enumerate()
                .map(|(i, b)| (b.timestamp, i))
                .collect();
            (s.clone(), idx)
        })
        .collect();

    let mut all_dates: BTreeSet<NaiveDate> = BTreeSet::new();
    for symbol in &symbols {
        for bar in &bars_by_symbol[symbol] {
            all_dates.insert(bar.timestamp);
        }
    }
    let all_dates: Vec<NaiveDate> = all_dates.into_iter().collect();

    let empty_events = HashMap::new();
    let empty_fundamentals = HashMap::new();
    let empty_external = HashMap::new();

    let atr_lookbacks = sizing::atr_lookbacks(&strategy.rules);
    let atr_series_by_symbol: HashMap<String, HashMap<usize, Vec<f64>>> = symbols
        .iter()
        .map(|symbol| {
            let bars = &bars_by_symbol[symbol];
            let series = atr_lookbacks
                .iter()
                .map(|&period| (period, sizing::compute_atr_series(bars, period, registry)))
                .collect();
            (symbol.clone(), series)
        })
        .collect();

    let precomputed: Vec<Result<(String, Vec<RuleSeries>), BacktestError>> = symbols
        .par_iter()
        .map(|symbol| {
            let bars = &bars_by_symbol[symbol];
            let ctx = EvalContext {
                bars,
                registry,
                parameters: &parameters,
                signals_library: &strategy.signals,
                conditions_library: &strategy.conditions,
                event_dates: &empty_events,
                fundamentals: &empty_fundamentals,
                external: &empty_external,
            };
            let mut evaluator = SignalEvaluator::new();
            let mut series = Vec::with_capacity(strategy.rules.len());
            for rule in &strategy.rules {
                if condition_depends_on_portfolio(&rule.when, &ctx) {
                    series.push(RuleSeries::Deferred);
                } else {
                    let mut cond_eval = ConditionEvaluator::new(&mut evaluator);
                    let evaluated = cond_eval.evaluate(&rule.when, &ctx).unwrap_or_else(|err| {
                        tracing::warn!(rule = %rule.name, symbol = %symbol, error = %err, "rule evaluation failed, forcing false for this run");
                        vec![false; bars.len()]
                    });
                    series.push(RuleSeries::Precomputed(evaluated));
                }
            }
            Ok((symbol.clone(), series))
        })
        .collect();

    let mut rule_series_by_symbol: HashMap<String, Vec<RuleSeries>> = HashMap::new();
    for result in precomputed {
        let (symbol, series) = result?;
        rule_series_by_symbol.insert(symbol, series);
    }

    let scheme = weights::build_scheme(
        config.weight_scheme.unwrap_or(WeightSchemeKind::Equal),
        config.fixed_weights.clone(),
    );
    let executor = BacktestExecutor::new(
        config.lot_size,
        config.commission_rate,
        config.slippage_rate,
        config.tiered_commission.clone(),
    );
    let mut bookkeeper = PortfolioBookkeeper::new(config.initial_capital);

    let mut rebalance_count: u32 = 0;
    let mut turnover_events: Vec<f64> = Vec::new();
    let mut portfolio_weights: Vec<(NaiveDate, HashMap<String, f64>)> = Vec::new();
    let mut prev_date: Option<NaiveDate> = None;

    for (i, &date) in all_dates.iter().enumerate() {
        let mut prices: HashMap<String, Decimal> = HashMap::new();
        for symbol in &symbols {
            if let Some(&idx) = date_index[symbol].get(&date) {
                prices.insert(symbol.clone(), bars_by_symbol[symbol][idx].close);
            }
        }

        let prior_snapshot = bookkeeper.snapshots.last().copied().unwrap_or(PortfolioSnapshot {
            date,
            cash: config.initial_capital,
            positions_value: Decimal::ZERO,
            equity: config.initial_capital,
            drawdown: Decimal::ZERO,
            drawdown_pct: 0.0,
        });
        let prior_positions = bookkeeper.positions.clone();

        bookkeeper.update(&prices);

        let symbols_with_data: Vec<String> = symbols.iter().filter(|s| prices.contains_key(*s)).cloned().collect();
        let equity = bookkeeper.equity(&prices);

        let cadence_trigger = i == 0 || cadence_fires(&config.rebalance_frequency, date, prev_date);
        let drift_trigger = matches!(config.rebalance_frequency, RebalanceFrequency::OnDrift { threshold_pct }
            if drift_exceeds(&bookkeeper, &symbols_with_data, &prices, equity, scheme.as_ref(), bars_by_symbol, date, threshold_pct));

        if cadence_trigger || drift_trigger {
            let targets = scheme.calculate(&symbols_with_data, bars_by_symbol, date);
            let mut event_turnover = 0.0;
            for symbol in &symbols_with_data {
                let price = prices[symbol];
                if price <= Decimal::ZERO {
                    continue;
                }
                let target_w = targets.get(symbol).copied().unwrap_or(0.0);
                let target_value = equity * Decimal::from_f64(target_w).unwrap_or(Decimal::ZERO);
                let target_qty = target_value / price;
                let current_qty = bookkeeper.positions.get(symbol).map(|p| p.qty).unwrap_or(Decimal::ZERO);
                let delta = target_qty - current_qty;
                if delta.abs() < Decimal::new(1, 2) {
                    continue;
                }

                let order_direction = if delta > Decimal::ZERO { TradeDirection::Buy } else { TradeDirection::Sell };
                let order = OrderRequest {
                    symbol: symbol.clone(),
                    direction: order_direction,
                    quantity: delta.abs(),
                    price,
                    order_type: OrderType::Market,
                };
                if let Some(fill) = executor.execute(&order) {
                    let signed_qty = if delta > Decimal::ZERO { fill.quantity } else { -fill.quantity };
                    bookkeeper.rebalance_adjust(symbol, signed_qty, fill.fill_price, date, fill.commission, fill.slippage, "rebalance");
                    if equity > Decimal::ZERO {
                        use rust_decimal::prelude::ToPrimitive;
                        event_turnover += ((fill.quantity * fill.fill_price) / equity).to_f64().unwrap_or(0.0);
                    }
                }
            }
            rebalance_count += 1;
            tracing::info!(date = %date, turnover = event_turnover, "rebalanced");
            turnover_events.push(event_turnover);
            portfolio_weights.push((date, targets));
        }

        for symbol in &symbols_with_data {
            let Some(&idx) = date_index[symbol].get(&date) else { continue };
            let Some(series) = rule_series_by_symbol.get_mut(symbol) else { continue };
            let price = prices[symbol];

            for (rule, rule_state) in strategy.rules.iter().zip(series.iter_mut()) {
                if !rule.enabled {
                    continue;
                }
                let fires = match rule_state {
                    RuleSeries::Precomputed(values) => values.get(idx).copied().unwrap_or(false),
                    RuleSeries::Deferred => {
                        let bars = &bars_by_symbol[symbol];
                        let ctx = EvalContext {
                            bars,
                            registry,
                            parameters: &parameters,
                            signals_library: &strategy.signals,
                            conditions_library: &strategy.conditions,
                            event_dates: &empty_events,
                            fundamentals: &empty_fundamentals,
                            external: &empty_external,
                        };
                        let view = PortfolioView {
                            snapshot: &prior_snapshot,
                            position: prior_positions.get(symbol),
                            open_position_count: prior_positions.len(),
                        };
                        let mut evaluator = SignalEvaluator::new();
                        let mut cond_eval = ConditionEvaluator::new(&mut evaluator);
                        cond_eval.evaluate_at(&rule.when, &ctx, idx, Some(&view)).unwrap_or_else(|err| {
                            tracing::warn!(rule = %rule.name, symbol = %symbol, error = %err, "rule evaluation failed, forcing false for this bar");
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
                        let open_count = bookkeeper.positions.len();
                        let atr = match sizing_spec {
                            SizingSpec::VolatilityAdjusted { lookback, .. } => atr_series_by_symbol
                                .get(symbol)
                                .and_then(|series| series.get(lookback))
                                .and_then(|series| series.get(idx).copied())
                                .filter(|v| v.is_finite()),
                            _ => None,
                        };
                        apply_trade_action(
                            &mut bookkeeper,
                            &executor,
                            symbol,
                            price,
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
                        tracing::info!(rule = %rule.name, symbol = %symbol, level = ?level, "{message}");
                    }
                    Action::Hold => {}
                }
            }
        }

        bookkeeper.check_exits(&prices, date, &strategy.constraints);
        bookkeeper.record(date, &prices);
        prev_date = Some(date);
    }

    if let Some(&last_date) = all_dates.last() {
        let mut final_prices = HashMap::new();
        for symbol in &symbols {
            if let Some(&idx) = date_index[symbol].get(&last_date) {
                final_prices.insert(symbol.clone(), bars_by_symbol[symbol][idx].close);
            }
        }
        let open_symbols: Vec<String> = bookkeeper.positions.keys().cloned().collect();
        for symbol in open_symbols {
            let Some(&price) = final_prices.get(&symbol).or_else(|| {
                bars_by_symbol.get(&symbol).and_then(|b| b.last()).map(|b| &b.close)
            }) else {
                continue;
            };
            let position = bookkeeper.positions.get(&symbol).expect("just listed");
            let direction = match position.direction {
                Direction::Long => TradeDirection::Sell,
                Direction::Short => TradeDirection::Cover,
            };
            let order = OrderRequest {
                symbol: symbol.clone(),
                direction,
                quantity: position.qty,
                price,
                order_type: OrderType::Market,
            };
            if let Some(fill) = executor.execute(&order) {
                bookkeeper.close(&symbol, fill.fill_price, last_date, "end_of_backtest", fill.commission, fill.slippage);
            }
        }
    }

    let equity_curve: Vec<EquityPoint> = bookkeeper
        .snapshots
        .iter()
        .map(|s| EquityPoint { date: s.date, equity: s.equity })
        .collect();
    let final_equity = bookkeeper.cash;

    let mut per_symbol_results: HashMap<String, SymbolResult> = HashMap::new();
    for symbol in &symbols {
        let trades: Vec<_> = bookkeeper.trades.iter().filter(|t| &t.symbol == symbol).cloned().collect();
        let realized_pnl: Decimal = trades.iter().filter_map(|t| t.pnl).sum();
        per_symbol_results.insert(
            symbol.clone(),
            SymbolResult {
                symbol: symbol.clone(),
                trades,
                realized_pnl,
            },
        );
    }

    let average_turnover = if turnover_events.is_empty() {
        0.0
    } else {
        turnover_events.iter().sum::<f64>() / turnover_events.len() as f64
    };

    let metrics = result::compute_metrics(&bookkeeper.trades, &bookkeeper.snapshots, config.initial_capital, config.risk_free_rate);
    tracing::info!(strategy_id = %strategy.info.id, final_equity = %final_equity, rebalance_count, "run complete");

    Ok(PortfolioResult {
        strategy_id: strategy.info.id.clone(),
        symbols: symbols.clone(),
        start_date: all_dates.first().copied().unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        end_date: all_dates.last().copied().unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        initial_capital: config.initial_capital,
        final_equity,
        snapshots: bookkeeper.snapshots,
        equity_curve,
        per_symbol_results,
        portfolio_weights,
        rebalance_count,
        average_turnover,
        weight_scheme: config.weight_scheme.unwrap_or(WeightSchemeKind::Equal),
        rebalance_frequency: config.rebalance_frequency.clone(),
        metrics,
    })
}

fn cadence_fires(frequency: &RebalanceFrequency, date: NaiveDate, prev_date: Option<NaiveDate>) -> bool {
    match frequency {
        RebalanceFrequency::Never => false,
        RebalanceFrequency::Monthly => match prev_date {
            None => true,
            Some(prev) => prev.month() != date.month() || prev.year() != date.year(),
        },
        RebalanceFrequency::Weekly { day } => match day {
            Some(target) => date.weekday().num_days_from_monday() == *target,
            None => match prev_date {
                None => true,
                Some(prev) => prev.iso_week().week() != date.iso_week().week() || prev.year() != date.year(),
            },
        },
        RebalanceFrequency::OnDrift { .. } => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn drift_exceeds(
    bookkeeper: &PortfolioBookkeeper,
    symbols_with_data: &[String],
    prices: &HashMap<String, Decimal>,
    equity: Decimal,
    scheme: &dyn weights::WeightScheme,
    bars_by_symbol: &HashMap<String, Vec<Bar>>,
    date: NaiveDate,
    threshold_pct: f64,
) -> bool {
    use rust_decimal::prelude::ToPrimitive;
    if equity <= Decimal::ZERO {
        return false;
    }
    let targets = scheme.calculate(symbols_with_data, bars_by_symbol, date);
    for symbol in symbols_with_data {
        let price = prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let current_value = bookkeeper.positions.get(symbol).map(|p| p.qty * price).unwrap_or(Decimal::ZERO);
        let current_weight = (current_value / equity).to_f64().unwrap_or(0.0);
        let target_weight = targets.get(symbol).copied().unwrap_or(0.0);
        if (current_weight - target_weight).abs() * 100.0 > threshold_pct {
            return true;
        }
    }
    false
}
