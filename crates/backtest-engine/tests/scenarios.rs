//! End-to-end scenarios exercising the full bar loop, not just individual
//! components. Numbers are chosen to be hand-checkable.

use std::collections::HashMap;

use backtest_engine::{
    Action, Bar, BacktestConfig, CommissionTier, Condition, Constraints, RebalanceFrequency, Rule,
    SizingSpec, StrategyInfo, StrategyTree, TradeDirection, Universe, WeightSchemeKind,
};
use chrono::{Duration, NaiveDate};
use indicator_registry::DefaultIndicatorRegistry;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn flat_bar(date: NaiveDate, close: Decimal) -> Bar {
    Bar { timestamp: date, open: close, high: close, low: close, close, volume: 0.0 }
}

fn daily_bars(start: NaiveDate, closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| flat_bar(start + Duration::days(i as i64), Decimal::try_from(c).unwrap()))
        .collect()
}

fn always_buy_strategy(universe: Universe, sizing: SizingSpec, constraints: Constraints) -> StrategyTree {
    StrategyTree {
        info: StrategyInfo { id: "test".to_string(), name: "test".to_string(), version: "1".to_string() },
        universe,
        signals: HashMap::new(),
        conditions: HashMap::new(),
        parameters: HashMap::new(),
        rules: vec![Rule {
            name: "enter".to_string(),
            when: Condition::Always,
            then: Action::Trade { direction: TradeDirection::Buy, sizing, reason: None },
            enabled: true,
        }],
        constraints,
    }
}

#[test]
fn buy_and_hold_zero_fees() {
    let bars = daily_bars(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0, 107.0, 108.0, 109.0],
    );
    let strategy = always_buy_strategy(
        Universe::Static { symbols: vec!["AAA".to_string()] },
        SizingSpec::PercentOfEquity { pct: 1.0 },
        Constraints::default(),
    );
    let config = BacktestConfig { initial_capital: dec!(1000), lot_size: dec!(1), ..Default::default() };
    let registry = DefaultIndicatorRegistry::new();

    let result = backtest_engine::single_runner::run(&strategy, "AAA", &bars, &config, &HashMap::new(), &registry).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.entry_price, dec!(100));
    assert_eq!(trade.qty, dec!(10));
    assert_eq!(trade.exit_price, Some(dec!(109)));
    assert_eq!(trade.pnl, Some(dec!(90)));
    assert_eq!(result.final_equity, dec!(1090));
    assert_eq!(result.snapshots.len(), 10);
}

#[test]
fn stop_loss_triggers_on_adverse_move() {
    let bars = daily_bars(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), &[100.0, 98.0, 95.0, 94.0]);
    let constraints = Constraints { stop_loss: Some(3.0), ..Default::default() };
    let strategy = always_buy_strategy(
        Universe::Static { symbols: vec!["AAA".to_string()] },
        SizingSpec::PercentOfEquity { pct: 1.0 },
        constraints,
    );
    let config = BacktestConfig { initial_capital: dec!(1000), lot_size: dec!(1), ..Default::default() };
    let registry = DefaultIndicatorRegistry::new();

    let result = backtest_engine::single_runner::run(&strategy, "AAA", &bars, &config, &HashMap::new(), &registry).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_price, Some(dec!(95)));
    assert_eq!(trade.exit_reason.as_deref(), Some("stop_loss"));
    assert_eq!(trade.pnl, Some(dec!(-50)));
}

#[test]
fn lot_size_rounds_quantity_down() {
    let bars = daily_bars(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), &[37.0, 37.0]);
    let strategy = always_buy_strategy(
        Universe::Static { symbols: vec!["AAA".to_string()] },
        SizingSpec::PercentOfEquity { pct: 1.0 },
        Constraints::default(),
    );
    let config = BacktestConfig { initial_capital: dec!(10000), lot_size: dec!(100), ..Default::default() };
    let registry = DefaultIndicatorRegistry::new();

    let result = backtest_engine::single_runner::run(&strategy, "AAA", &bars, &config, &HashMap::new(), &registry).unwrap();

    // raw request is 10000 / 37 ~= 270.27 shares, rounded down to the
    // nearest multiple of the 100-share lot.
    assert_eq!(result.trades[0].qty, dec!(200));
}

#[test]
fn tiered_commission_picks_the_bracket_at_trade_value() {
    let tiers = vec![
        CommissionTier { up_to: Some(dec!(50000)), above: None, fee: dec!(55) },
        CommissionTier { up_to: Some(dec!(100000)), above: None, fee: dec!(99) },
        CommissionTier { up_to: None, above: Some(dec!(100000)), fee: dec!(115) },
    ];
    let fee = backtest_engine::executor::compute_tiered_commission(&tiers, dec!(20000));
    assert_eq!(fee, dec!(55));
}

#[test]
fn multi_symbol_equal_weight_rebalances_monthly() {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let closes: Vec<f64> = (0..90).map(|_| 100.0).collect();
    let mut bars_by_symbol = HashMap::new();
    bars_by_symbol.insert("AAA".to_string(), daily_bars(start, &closes));
    bars_by_symbol.insert("BBB".to_string(), daily_bars(start, &closes));

    let strategy = StrategyTree {
        info: StrategyInfo { id: "rebalance-test".to_string(), name: "test".to_string(), version: "1".to_string() },
        universe: Universe::Static { symbols: vec!["AAA".to_string(), "BBB".to_string()] },
        signals: HashMap::new(),
        conditions: HashMap::new(),
        parameters: HashMap::new(),
        rules: vec![],
        constraints: Constraints::default(),
    };
    let config = BacktestConfig {
        initial_capital: dec!(100000),
        weight_scheme: Some(WeightSchemeKind::Equal),
        rebalance_frequency: RebalanceFrequency::Monthly,
        ..Default::default()
    };
    let registry = DefaultIndicatorRegistry::new();

    let result = backtest_engine::multi_runner::run(&strategy, &bars_by_symbol, &config, &HashMap::new(), &registry).unwrap();

    // Jan 1 (initial), Feb 1, and Mar 1 each cross a month boundary.
    assert_eq!(result.rebalance_count, 3);
    for (_, weights) in &result.portfolio_weights {
        assert!((weights["AAA"] - 0.5).abs() < 1e-9);
        assert!((weights["BBB"] - 0.5).abs() < 1e-9);
    }
}

#[test]
fn always_hold_strategy_produces_no_trades() {
    let bars = daily_bars(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), &[100.0, 100.0, 100.0]);
    let strategy = StrategyTree {
        info: StrategyInfo { id: "hold-only".to_string(), name: "test".to_string(), version: "1".to_string() },
        universe: Universe::Static { symbols: vec!["AAA".to_string()] },
        signals: HashMap::new(),
        conditions: HashMap::new(),
        parameters: HashMap::new(),
        rules: vec![Rule { name: "noop".to_string(), when: Condition::Always, then: Action::Hold, enabled: true }],
        constraints: Constraints::default(),
    };
    let config = BacktestConfig { initial_capital: dec!(1000), ..Default::default() };
    let registry = DefaultIndicatorRegistry::new();

    let result = backtest_engine::single_runner::run(&strategy, "AAA", &bars, &config, &HashMap::new(), &registry).unwrap();

    assert!(result.trades.is_empty());
    assert_eq!(result.final_equity, dec!(1000));
}

#[test]
fn empty_bar_frame_is_a_data_error() {
    let strategy = always_buy_strategy(
        Universe::Static { symbols: vec!["AAA".to_string()] },
        SizingSpec::PercentOfEquity { pct: 1.0 },
        Constraints::default(),
    );
    let config = BacktestConfig::default();
    let registry = DefaultIndicatorRegistry::new();

    let result = backtest_engine::single_runner::run(&strategy, "AAA", &[], &config, &HashMap::new(), &registry);
    assert!(result.is_err());
}
