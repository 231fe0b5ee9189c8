//! Signal and condition evaluation over a primary bar series.
//!
//! Non-portfolio signals are memoized by a structural key and evaluated as
//! full series before the bar loop starts. Portfolio signals read bookkeeper
//! state as of the previous bar's close and are therefore evaluated lazily,
//! one bar at a time, from inside the loop (see `evaluate_signal_at`).

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use indicator_registry::{Bar as IndicatorBar, IndicatorRegistry, ParamValue};
use rust_decimal::prelude::ToPrimitive;

use crate::error::{BacktestError, ValidationError};
use crate::expr;
use crate::models::{Bar, ComparisonOp, Condition, Position, PortfolioSnapshot, Signal};

pub struct EvalContext<'a> {
    pub bars: &'a [Bar],
    pub registry: &'a dyn IndicatorRegistry,
    pub parameters: &'a HashMap<String, ParamValue>,
    pub signals_library: &'a HashMap<String, Signal>,
    pub conditions_library: &'a HashMap<String, Condition>,
    pub event_dates: &'a HashMap<String, Vec<NaiveDate>>,
    pub fundamentals: &'a HashMap<String, Vec<f64>>,
    pub external: &'a HashMap<String, Vec<f64>>,
}

/// A read-only view into bookkeeper state, as it stood at the end of the
/// previous bar, for evaluating `portfolio` signals.
pub struct PortfolioView<'a> {
    pub snapshot: &'a PortfolioSnapshot,
    pub position: Option<&'a Position>,
    pub open_position_count: usize,
}

pub struct SignalEvaluator {
    cache: HashMap<String, Vec<f64>>,
}

impl Default for SignalEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalEvaluator {
    pub fn new() -> Self {
        SignalEvaluator { cache: HashMap::new() }
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }

    fn structural_key(signal: &Signal) -> String {
        serde_json::to_string(signal).unwrap_or_default()
    }

    /// Evaluates a signal to a full series. Must not be called (directly or
    /// transitively) on a signal containing a `portfolio` node; use
    /// `evaluate_at` for those.
    pub fn evaluate(&mut self, signal: &Signal, ctx: &EvalContext) -> Result<Vec<f64>, BacktestError> {
        let key = Self::structural_key(signal);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        let series = self.evaluate_uncached(signal, ctx, &mut HashSet::new())?;
        self.cache.insert(key, series.clone());
        Ok(series)
    }

    fn evaluate_uncached(
        &mut self,
        signal: &Signal,
        ctx: &EvalContext,
        visiting: &mut HashSet<String>,
    ) -> Result<Vec<f64>, BacktestError> {
        let n = ctx.bars.len();
        match signal {
            Signal::Price { field, offset } => {
                let series = price_column(ctx.bars, field)
                    .ok_or_else(|| ValidationError::UnknownSignalType(format!("price field `{field}`")))?;
                Ok(shift_series(&series, *offset))
            }
            Signal::Indicator { indicator, params, component, offset } => {
                let resolved = resolve_params(params, ctx.parameters)?;
                let indicator_bars = to_indicator_bars(ctx.bars);
                let output = ctx.registry.compute(indicator, &indicator_bars, &resolved)?;
                let spec = ctx
                    .registry
                    .spec(indicator)
                    .ok_or_else(|| indicator_registry::IndicatorError::UnknownIndicator(indicator.clone()))?;
                let component_name = component.clone().unwrap_or_else(|| spec.default_component.to_string());
                let series = output
                    .component(&component_name)
                    .ok_or_else(|| indicator_registry::IndicatorError::UnknownComponent {
                        indicator: indicator.clone(),
                        component: component_name.clone(),
                    })?
                    .to_vec();
                Ok(shift_series(&series, *offset))
            }
            Signal::Constant { value } => Ok(vec![*value; n]),
            Signal::ParamRef { name } => {
                let value = ctx
                    .parameters
                    .get(name)
                    .and_then(ParamValue::as_f64)
                    .ok_or_else(|| crate::error::ParameterError::Unresolved(name.clone()))?;
                Ok(vec![value; n])
            }
            Signal::Calendar { field } => Ok(calendar_series(ctx.bars, field)),
            Signal::Event { event_type, days_before, days_after } => {
                let dates = ctx.event_dates.get(event_type).cloned().unwrap_or_default();
                Ok(event_series(ctx.bars, &dates, *days_before, *days_after))
            }
            Signal::Portfolio { .. } => Err(ValidationError::UnknownSignalType(
                "portfolio signals must be evaluated with evaluate_at".to_string(),
            )
            .into()),
            Signal::Fundamental { metric, .. } => Ok(ctx
                .fundamentals
                .get(metric)
                .cloned()
                .unwrap_or_else(|| vec![f64::NAN; n])),
            Signal::External { source, key, default } => {
                let cache_key = format!("{source}:{key}");
                Ok(ctx.external.get(&cache_key).cloned().unwrap_or_else(|| vec![*default; n]))
            }
            Signal::Expr { formula } => expr::eval_formula(formula, ctx.bars, ctx.registry)
                .map_err(BacktestError::from),
            Signal::Ref { path } => {
                if !visiting.insert(path.clone()) {
                    return Err(ValidationError::CyclicRef(path.clone()).into());
                }
                let name = path.strip_prefix("#/signals/").unwrap_or(path);
                let referenced = ctx
                    .signals_library
                    .get(name)
                    .ok_or_else(|| ValidationError::UnresolvedRef(path.clone()))?;
                let result = self.evaluate_uncached(referenced, ctx, visiting);
                visiting.remove(path);
                result
            }
        }
    }

    /// Evaluates a signal at a single bar index, with `portfolio` view
    /// available for nodes that need it. Non-portfolio sub-expressions fall
    /// back to the memoized full-series path.
    pub fn evaluate_at(
        &mut self,
        signal: &Signal,
        ctx: &EvalContext,
        index: usize,
        portfolio: Option<&PortfolioView>,
    ) -> Result<f64, BacktestError> {
        match signal {
            Signal::Portfolio { field, symbol: _ } => {
                let view = portfolio.ok_or_else(|| {
                    ValidationError::UnknownSignalType("portfolio view unavailable".to_string())
                })?;
                Ok(portfolio_field(view, field))
            }
            Signal::Ref { path } => {
                let name = path.strip_prefix("#/signals/").unwrap_or(path);
                let referenced = ctx
                    .signals_library
                    .get(name)
                    .ok_or_else(|| ValidationError::UnresolvedRef(path.clone()))?
                    .clone();
                self.evaluate_at(&referenced, ctx, index, portfolio)
            }
            _ => {
                let series = self.evaluate(signal, ctx)?;
                Ok(series.get(index).copied().unwrap_or(f64::NAN))
            }
        }
    }
}

pub struct ConditionEvaluator<'s> {
    signals: &'s mut SignalEvaluator,
}

impl<'s> ConditionEvaluator<'s> {
    pub fn new(signals: &'s mut SignalEvaluator) -> Self {
        ConditionEvaluator { signals }
    }

    pub fn evaluate(&mut self, condition: &Condition, ctx: &EvalContext) -> Result<Vec<bool>, BacktestError> {
        self.evaluate_inner(condition, ctx, &mut HashSet::new())
    }

    fn evaluate_inner(
        &mut self,
        condition: &Condition,
        ctx: &EvalContext,
        visiting: &mut HashSet<String>,
    ) -> Result<Vec<bool>, BacktestError> {
        let n = ctx.bars.len();
        match condition {
            Condition::Comparison { left, op, right } => {
                let l = self.signals.evaluate(left, ctx)?;
                let r = self.signals.evaluate(right, ctx)?;
                Ok(l.iter()
                    .zip(r.iter())
                    .map(|(&a, &b)| compare(a, *op, b))
                    .collect())
            }
            Condition::And { terms } => {
                let mut result = vec![true; n];
                for term in terms {
                    let evaluated = self.evaluate_inner(term, ctx, visiting)?;
                    for i in 0..n {
                        result[i] = result[i] && evaluated.get(i).copied().unwrap_or(false);
                    }
                }
                Ok(result)
            }
            Condition::Or { terms } => {
                let mut result = vec![false; n];
                for term in terms {
                    let evaluated = self.evaluate_inner(term, ctx, visiting)?;
                    for i in 0..n {
                        result[i] = result[i] || evaluated.get(i).copied().unwrap_or(false);
                    }
                }
                Ok(result)
            }
            Condition::Not { term } => {
                let evaluated = self.evaluate_inner(term, ctx, visiting)?;
                Ok(evaluated.into_iter().map(|b| !b).collect())
            }
            Condition::Expr { formula } => expr::eval_formula_bool(formula, ctx.bars, ctx.registry)
                .map_err(BacktestError::from),
            Condition::Always => Ok(vec![true; n]),
            Condition::Ref { path } => {
                if !visiting.insert(path.clone()) {
                    return Err(ValidationError::CyclicRef(path.clone()).into());
                }
                let name = path.strip_prefix("#/conditions/").unwrap_or(path);
                let referenced = ctx
                    .conditions_library
                    .get(name)
                    .ok_or_else(|| ValidationError::UnresolvedRef(path.clone()))?
                    .clone();
                let result = self.evaluate_inner(&referenced, ctx, visiting);
                visiting.remove(path);
                result
            }
        }
    }

    pub fn evaluate_at(
        &mut self,
        condition: &Condition,
        ctx: &EvalContext,
        index: usize,
        portfolio: Option<&PortfolioView>,
    ) -> Result<bool, BacktestError> {
        self.evaluate_at_inner(condition, ctx, index, portfolio, &mut HashSet::new())
    }

    fn evaluate_at_inner(
        &mut self,
        condition: &Condition,
        ctx: &EvalContext,
        index: usize,
        portfolio: Option<&PortfolioView>,
        visiting: &mut HashSet<String>,
    ) -> Result<bool, BacktestError> {
        match condition {
            Condition::Comparison { left, op, right } => {
                let a = self.signals.evaluate_at(left, ctx, index, portfolio)?;
                let b = self.signals.evaluate_at(right, ctx, index, portfolio)?;
                Ok(compare(a, *op, b))
            }
            Condition::And { terms } => {
                for term in terms {
                    if !self.evaluate_at_inner(term, ctx, index, portfolio, visiting)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or { terms } => {
                for term in terms {
                    if self.evaluate_at_inner(term, ctx, index, portfolio, visiting)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { term } => Ok(!self.evaluate_at_inner(term, ctx, index, portfolio, visiting)?),
            Condition::Always => Ok(true),
            Condition::Expr { .. } => {
                let series = self.evaluate(condition, ctx)?;
                Ok(series.get(index).copied().unwrap_or(false))
            }
            Condition::Ref { path } => {
                if !visiting.insert(path.clone()) {
                    return Err(ValidationError::CyclicRef(path.clone()).into());
                }
                let name = path.strip_prefix("#/conditions/").unwrap_or(path);
                let referenced = ctx
                    .conditions_library
                    .get(name)
                    .ok_or_else(|| ValidationError::UnresolvedRef(path.clone()))?
                    .clone();
                let result = self.evaluate_at_inner(&referenced, ctx, index, portfolio, visiting);
                visiting.remove(path);
                result
            }
        }
    }
}

/// True if a condition transitively references a `portfolio` signal;
/// rules that do must be deferred to per-bar evaluation rather than
/// pre-computed.
pub fn condition_depends_on_portfolio(condition: &Condition, ctx: &EvalContext) -> bool {
    condition_depends_on_portfolio_inner(condition, ctx, &mut HashSet::new())
}

fn condition_depends_on_portfolio_inner(
    condition: &Condition,
    ctx: &EvalContext,
    visiting: &mut HashSet<String>,
) -> bool {
    match condition {
        Condition::Comparison { left, right, .. } => {
            signal_depends_on_portfolio(left, ctx) || signal_depends_on_portfolio(right, ctx)
        }
        Condition::And { terms } | Condition::Or { terms } => {
            terms.iter().any(|t| condition_depends_on_portfolio_inner(t, ctx, visiting))
        }
        Condition::Not { term } => condition_depends_on_portfolio_inner(term, ctx, visiting),
        Condition::Expr { .. } | Condition::Always => false,
        Condition::Ref { path } => {
            if !visiting.insert(path.clone()) {
                // Cyclic reference: evaluation will fail with `CyclicRef`
                // elsewhere, so there is no series to defer computation of.
                return false;
            }
            let name = path.strip_prefix("#/conditions/").unwrap_or(path);
            let result = ctx
                .conditions_library
                .get(name)
                .map(|c| condition_depends_on_portfolio_inner(c, ctx, visiting))
                .unwrap_or(false);
            visiting.remove(path);
            result
        }
    }
}

fn signal_depends_on_portfolio(signal: &Signal, ctx: &EvalContext) -> bool {
    signal_depends_on_portfolio_inner(signal, ctx, &mut HashSet::new())
}

fn signal_depends_on_portfolio_inner(signal: &Signal, ctx: &EvalContext, visiting: &mut HashSet<String>) -> bool {
    match signal {
        Signal::Portfolio { .. } => true,
        Signal::Ref { path } => {
            if !visiting.insert(path.clone()) {
                return false;
            }
            let name = path.strip_prefix("#/signals/").unwrap_or(path);
            let result = ctx
                .signals_library
                .get(name)
                .map(|s| signal_depends_on_portfolio_inner(s, ctx, visiting))
                .unwrap_or(false);
            visiting.remove(path);
            result
        }
        _ => false,
    }
}

fn compare(a: f64, op: ComparisonOp, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    match op {
        ComparisonOp::Lt => a < b,
        ComparisonOp::Le => a <= b,
        ComparisonOp::Eq => (a - b).abs() < f64::EPSILON,
        ComparisonOp::Ge => a >= b,
        ComparisonOp::Gt => a > b,
        ComparisonOp::Ne => (a - b).abs() >= f64::EPSILON,
    }
}

fn shift_series(series: &[f64], offset: i64) -> Vec<f64> {
    if offset <= 0 {
        return series.to_vec();
    }
    let k = offset as usize;
    let n = series.len();
    let mut out = vec![f64::NAN; n];
    for i in k..n {
        out[i] = series[i - k];
    }
    out
}

fn price_column(bars: &[Bar], field: &str) -> Option<Vec<f64>> {
    let f = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
    let series = match field {
        "close" => bars.iter().map(|b| f(b.close)).collect(),
        "open" => bars.iter().map(|b| f(b.open)).collect(),
        "high" => bars.iter().map(|b| f(b.high)).collect(),
        "low" => bars.iter().map(|b| f(b.low)).collect(),
        "volume" => bars.iter().map(|b| b.volume).collect(),
        "hl2" => bars.iter().map(|b| (f(b.high) + f(b.low)) / 2.0).collect(),
        "hlc3" => bars.iter().map(|b| (f(b.high) + f(b.low) + f(b.close)) / 3.0).collect(),
        "ohlc4" => bars
            .iter()
            .map(|b| (f(b.open) + f(b.high) + f(b.low) + f(b.close)) / 4.0)
            .collect(),
        _ => return None,
    };
    Some(series)
}

fn to_indicator_bars(bars: &[Bar]) -> Vec<IndicatorBar> {
    let f = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
    bars.iter()
        .map(|b| IndicatorBar {
            open: f(b.open),
            high: f(b.high),
            low: f(b.low),
            close: f(b.close),
            volume: b.volume,
        })
        .collect()
}

fn resolve_params(
    params: &HashMap<String, ParamValue>,
    run_parameters: &HashMap<String, ParamValue>,
) -> Result<HashMap<String, ParamValue>, BacktestError> {
    let mut resolved = HashMap::with_capacity(params.len());
    for (key, value) in params {
        if let ParamValue::String(s) = value {
            if let Some(name) = s.strip_prefix("$param.") {
                let resolved_value = run_parameters
                    .get(name)
                    .cloned()
                    .ok_or_else(|| crate::error::ParameterError::Unresolved(name.to_string()))?;
                resolved.insert(key.clone(), resolved_value);
                continue;
            }
        }
        resolved.insert(key.clone(), value.clone());
    }
    Ok(resolved)
}

fn calendar_series(bars: &[Bar], field: &str) -> Vec<f64> {
    let is_month_boundary = |idx: usize, last: bool| -> bool {
        let d = bars[idx].timestamp;
        if last {
            idx + 1 == bars.len() || bars[idx + 1].timestamp.month() != d.month()
        } else {
            idx == 0 || bars[idx - 1].timestamp.month() != d.month()
        }
    };
    let is_quarter_end = |idx: usize| -> bool {
        let d = bars[idx].timestamp;
        matches!(d.month(), 3 | 6 | 9 | 12) && is_month_boundary(idx, true)
    };

    bars.iter()
        .enumerate()
        .map(|(i, b)| match field {
            "dayofweek" => b.timestamp.weekday().num_days_from_monday() as f64,
            "day" => b.timestamp.day() as f64,
            "month" => b.timestamp.month() as f64,
            "week" => b.timestamp.iso_week().week() as f64,
            "is_month_start" => {
                if is_month_boundary(i, false) { 1.0 } else { 0.0 }
            }
            "is_month_end" => {
                if is_month_boundary(i, true) { 1.0 } else { 0.0 }
            }
            "is_quarter_end" => {
                if is_quarter_end(i) { 1.0 } else { 0.0 }
            }
            _ => f64::NAN,
        })
        .collect()
}

fn event_series(bars: &[Bar], dates: &[NaiveDate], days_before: i64, days_after: i64) -> Vec<f64> {
    bars.iter()
        .map(|b| {
            let hit = dates.iter().any(|&event_date| {
                let lower = event_date - chrono::Duration::days(days_after);
                let upper = event_date + chrono::Duration::days(days_before);
                b.timestamp >= lower && b.timestamp <= upper
            });
            if hit { 1.0 } else { 0.0 }
        })
        .collect()
}

fn portfolio_field(view: &PortfolioView, field: &str) -> f64 {
    match field {
        "cash" => view.snapshot.cash.to_f64().unwrap_or(0.0),
        "equity" => view.snapshot.equity.to_f64().unwrap_or(0.0),
        "positions_value" => view.snapshot.positions_value.to_f64().unwrap_or(0.0),
        "drawdown_pct" => view.snapshot.drawdown_pct,
        "num_positions" => view.open_position_count as f64,
        "unrealized_pnl" => view
            .position
            .map(|p| p.unrealized_pnl.to_f64().unwrap_or(0.0))
            .unwrap_or(0.0),
        "position_qty" => view.position.map(|p| p.qty.to_f64().unwrap_or(0.0)).unwrap_or(0.0),
        "days_held" => view.position.map(|p| p.days_held as f64).unwrap_or(0.0),
        "exposure_pct" => {
            let equity = view.snapshot.equity.to_f64().unwrap_or(0.0);
            if equity.abs() < 1e-9 {
                0.0
            } else {
                view.snapshot.positions_value.to_f64().unwrap_or(0.0) / equity * 100.0
            }
        }
        _ => f64::NAN,
    }
}
