//! Maps a sizing specification to a desired order quantity.

use std::collections::{HashMap, HashSet};

use indicator_registry::{Bar as IndicatorBar, IndicatorRegistry, ParamValue};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::models::{Action, Bar, Position, Rule, SizingSpec, Trade};

/// Distinct ATR lookback periods a strategy's trade rules ask for.
pub fn atr_lookbacks(rules: &[Rule]) -> HashSet<usize> {
    rules
        .iter()
        .filter_map(|rule| match &rule.then {
            Action::Trade { sizing: SizingSpec::VolatilityAdjusted { lookback, .. }, .. } => Some(*lookback),
            _ => None,
        })
        .collect()
}

/// Full-series ATR for `period`, one value per bar index of `bars`. Bars
/// before the indicator's warm-up window closes read as `NaN`.
pub fn compute_atr_series(bars: &[Bar], period: usize, registry: &dyn IndicatorRegistry) -> Vec<f64> {
    if bars.len() < period {
        return vec![f64::NAN; bars.len()];
    }
    let indicator_bars: Vec<IndicatorBar> = bars
        .iter()
        .map(|b| IndicatorBar {
            open: b.open.to_f64().unwrap_or(f64::NAN),
            high: b.high.to_f64().unwrap_or(f64::NAN),
            low: b.low.to_f64().unwrap_or(f64::NAN),
            close: b.close.to_f64().unwrap_or(f64::NAN),
            volume: b.volume,
        })
        .collect();
    let mut params = HashMap::new();
    params.insert("period".to_string(), ParamValue::Integer(period as i64));
    registry
        .compute("ATR", &indicator_bars, &params)
        .ok()
        .and_then(|output| output.component("atr").map(|s| s.to_vec()))
        .unwrap_or_else(|| vec![f64::NAN; bars.len()])
}

pub struct SizingContext<'a> {
    pub price: Decimal,
    pub equity: Decimal,
    pub cash: Decimal,
    pub position: Option<&'a Position>,
    pub closed_trades: &'a [Trade],
    pub atr: Option<f64>,
}

const KELLY_MIN_TRADES: usize = 10;
const KELLY_CAP: f64 = 0.25;
const FALLBACK_PCT: f64 = 0.02;

pub fn size(spec: &SizingSpec, ctx: &SizingContext) -> Decimal {
    if ctx.price <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    match spec {
        SizingSpec::FixedAmount { amount } => amount / ctx.price,
        SizingSpec::FixedQuantity { quantity } => *quantity,
        SizingSpec::PercentOfEquity { pct } => ctx.equity * pct_decimal(*pct) / ctx.price,
        SizingSpec::PercentOfCash { pct } => ctx.cash * pct_decimal(*pct) / ctx.price,
        SizingSpec::PercentOfPosition { pct } => ctx
            .position
            .map(|p| p.qty * pct_decimal(*pct))
            .unwrap_or(Decimal::ZERO),
        SizingSpec::RiskBased { risk_pct, stop_distance_pct } => {
            if *stop_distance_pct <= 0.0 {
                return Decimal::ZERO;
            }
            let risk_amount = ctx.equity * pct_decimal(*risk_pct);
            let stop_distance = ctx.price * pct_decimal(*stop_distance_pct);
            if stop_distance <= Decimal::ZERO {
                Decimal::ZERO
            } else {
                risk_amount / stop_distance
            }
        }
        SizingSpec::Kelly { multiplier } => kelly_size(*multiplier, ctx),
        SizingSpec::VolatilityAdjusted { target_risk, lookback: _ } => {
            let atr = ctx.atr.filter(|a| *a > 0.0).unwrap_or_else(|| {
                ctx.price.to_f64().unwrap_or(0.0) * FALLBACK_PCT
            });
            if atr <= 0.0 {
                Decimal::ZERO
            } else {
                Decimal::from_f64(target_risk / atr).unwrap_or(Decimal::ZERO)
            }
        }
    }
}

fn pct_decimal(pct: f64) -> Decimal {
    Decimal::from_f64(pct).unwrap_or(Decimal::ZERO)
}

fn kelly_size(multiplier: f64, ctx: &SizingContext) -> Decimal {
    let closed: Vec<&Trade> = ctx.closed_trades.iter().filter(|t| !t.is_open).collect();
    if closed.len() < KELLY_MIN_TRADES {
        return ctx.equity * pct_decimal(FALLBACK_PCT) / ctx.price;
    }

    let wins: Vec<f64> = closed
        .iter()
        .filter_map(|t| t.pnl)
        .filter(|pnl| *pnl > Decimal::ZERO)
        .map(|pnl| pnl.to_f64().unwrap_or(0.0))
        .collect();
    let losses: Vec<f64> = closed
        .iter()
        .filter_map(|t| t.pnl)
        .filter(|pnl| *pnl < Decimal::ZERO)
        .map(|pnl| pnl.to_f64().unwrap_or(0.0).abs())
        .collect();

    let win_prob = wins.len() as f64 / closed.len() as f64;
    let loss_prob = 1.0 - win_prob;
    let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().sum::<f64>() / wins.len() as f64 };
    let avg_loss = if losses.is_empty() { 0.0 } else { losses.iter().sum::<f64>() / losses.len() as f64 };

    if avg_loss <= 0.0 {
        return ctx.equity * pct_decimal(FALLBACK_PCT) / ctx.price;
    }

    let b = avg_win / avg_loss;
    if b <= 0.0 {
        return ctx.equity * pct_decimal(FALLBACK_PCT) / ctx.price;
    }

    let kelly_fraction = (multiplier * (b * win_prob - loss_prob) / b).clamp(0.0, KELLY_CAP);
    ctx.equity * pct_decimal(kelly_fraction) / ctx.price
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::models::Direction;

    fn ctx(price: Decimal, equity: Decimal) -> SizingContext<'static> {
        SizingContext {
            price,
            equity,
            cash: equity,
            position: None,
            closed_trades: &[],
            atr: None,
        }
    }

    #[test]
    fn percent_of_equity_divides_by_price() {
        let c = ctx(dec!(50), dec!(10000));
        let qty = size(&SizingSpec::PercentOfEquity { pct: 0.10 }, &c);
        assert_eq!(qty, dec!(20));
    }

    #[test]
    fn risk_based_uses_stop_distance() {
        let c = ctx(dec!(100), dec!(10000));
        let qty = size(&SizingSpec::RiskBased { risk_pct: 0.01, stop_distance_pct: 0.05 }, &c);
        // risk_amount = 100, stop_distance = 5 -> 20 shares
        assert_eq!(qty, dec!(20));
    }

    #[test]
    fn kelly_falls_back_below_minimum_trade_count() {
        let c = ctx(dec!(100), dec!(10000));
        let qty = size(&SizingSpec::Kelly { multiplier: 1.0 }, &c);
        assert_eq!(qty, dec!(10000) * dec!(0.02) / dec!(100));
    }

    #[test]
    fn kelly_sizes_from_empirical_win_loss_once_gated() {
        let mut trades = Vec::new();
        for i in 0..12 {
            let pnl = if i % 2 == 0 { dec!(20) } else { dec!(-10) };
            trades.push(Trade {
                symbol: "AAA".to_string(),
                direction: Direction::Long,
                entry_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                entry_price: dec!(100),
                qty: dec!(1),
                exit_date: Some(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
                exit_price: Some(dec!(100)),
                commission: Decimal::ZERO,
                slippage: Decimal::ZERO,
                pnl: Some(pnl),
                is_open: false,
                entry_reason: "rule".to_string(),
                exit_reason: Some("rule".to_string()),
            });
        }
        let c = SizingContext {
            price: dec!(100),
            equity: dec!(10000),
            cash: dec!(10000),
            position: None,
            closed_trades: &trades,
            atr: None,
        };
        let qty = size(&SizingSpec::Kelly { multiplier: 1.0 }, &c);
        assert!(qty > Decimal::ZERO);
    }

    #[test]
    fn volatility_adjusted_falls_back_to_price_pct_without_atr() {
        let c = ctx(dec!(100), dec!(10000));
        let qty = size(&SizingSpec::VolatilityAdjusted { target_risk: 1.0, lookback: 14 }, &c);
        // fallback atr = 100 * 0.02 = 2 -> qty = 1 / 2 = 0.5
        assert_eq!(qty, dec!(0.5));
    }

    #[test]
    fn non_positive_price_returns_zero() {
        let c = ctx(Decimal::ZERO, dec!(10000));
        assert_eq!(size(&SizingSpec::FixedQuantity { quantity: dec!(5) }, &c), Decimal::ZERO);
    }

    #[test]
    fn volatility_adjusted_sizes_from_real_atr_once_supplied() {
        let c = SizingContext { atr: Some(4.0), ..ctx(dec!(100), dec!(10000)) };
        let qty = size(&SizingSpec::VolatilityAdjusted { target_risk: 20.0, lookback: 14 }, &c);
        assert_eq!(qty, dec!(5)); // target_risk / atr = 20 / 4
    }

    fn flat_bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: Decimal::try_from(c).unwrap(),
                high: Decimal::try_from(c + 1.0).unwrap(),
                low: Decimal::try_from(c - 1.0).unwrap(),
                close: Decimal::try_from(c).unwrap(),
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn compute_atr_series_reads_through_the_registry() {
        let registry = indicator_registry::DefaultIndicatorRegistry::new();
        let bars = flat_bars(&(1..=20).map(|i| i as f64).collect::<Vec<_>>());
        let series = compute_atr_series(&bars, 5, &registry);
        assert_eq!(series.len(), bars.len());
        assert!(series.last().unwrap().is_finite());
        assert!(series.last().unwrap() > &0.0);
    }

    #[test]
    fn compute_atr_series_is_nan_when_bars_are_shorter_than_the_period() {
        let registry = indicator_registry::DefaultIndicatorRegistry::new();
        let bars = flat_bars(&[1.0, 2.0]);
        let series = compute_atr_series(&bars, 14, &registry);
        assert!(series.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_lookbacks_collects_distinct_periods_from_trade_rules() {
        use crate::models::{Condition, Rule};

        let rules = vec![
            Rule {
                name: "a".to_string(),
                when: Condition::Always,
                then: Action::Trade {
                    direction: crate::models::TradeDirection::Buy,
                    sizing: SizingSpec::VolatilityAdjusted { target_risk: 1.0, lookback: 14 },
                    reason: None,
                },
                enabled: true,
            },
            Rule {
                name: "b".to_string(),
                when: Condition::Always,
                then: Action::Trade {
                    direction: crate::models::TradeDirection::Buy,
                    sizing: SizingSpec::PercentOfEquity { pct: 0.1 },
                    reason: None,
                },
                enabled: true,
            },
        ];
        let lookbacks = atr_lookbacks(&rules);
        assert_eq!(lookbacks, [14].into_iter().collect());
    }
}
