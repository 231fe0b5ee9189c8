//! Weight schemes: pluggable `calculate(symbols, bars, date) -> weight map`.
//! Built-ins are interchangeable and callers may supply their own.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::models::{Bar, WeightSchemeKind};

pub trait WeightScheme: Send + Sync {
    fn calculate(&self, symbols: &[String], bars: &HashMap<String, Vec<Bar>>, as_of: NaiveDate) -> HashMap<String, f64>;
}

pub struct EqualWeight;

impl WeightScheme for EqualWeight {
    fn calculate(&self, symbols: &[String], _bars: &HashMap<String, Vec<Bar>>, _as_of: NaiveDate) -> HashMap<String, f64> {
        if symbols.is_empty() {
            return HashMap::new();
        }
        let w = 1.0 / symbols.len() as f64;
        symbols.iter().map(|s| (s.clone(), w)).collect()
    }
}

pub struct InverseVolatility {
    pub lookback: usize,
}

impl WeightScheme for InverseVolatility {
    fn calculate(&self, symbols: &[String], bars: &HashMap<String, Vec<Bar>>, as_of: NaiveDate) -> HashMap<String, f64> {
        let inv_vols: HashMap<String, f64> = symbols
            .iter()
            .map(|s| {
                let vol = realized_volatility(bars.get(s), as_of, self.lookback).max(1e-6);
                (s.clone(), 1.0 / vol)
            })
            .collect();
        normalize(inv_vols)
    }
}

pub struct RiskParity {
    pub lookback: usize,
}

impl WeightScheme for RiskParity {
    fn calculate(&self, symbols: &[String], bars: &HashMap<String, Vec<Bar>>, as_of: NaiveDate) -> HashMap<String, f64> {
        // Naive risk parity: inverse-variance, which coincides with true
        // risk parity when correlations are ignored.
        let inv_var: HashMap<String, f64> = symbols
            .iter()
            .map(|s| {
                let vol = realized_volatility(bars.get(s), as_of, self.lookback).max(1e-6);
                (s.clone(), 1.0 / (vol * vol))
            })
            .collect();
        normalize(inv_var)
    }
}

pub struct FixedTarget {
    pub weights: HashMap<String, f64>,
}

impl WeightScheme for FixedTarget {
    fn calculate(&self, symbols: &[String], _bars: &HashMap<String, Vec<Bar>>, _as_of: NaiveDate) -> HashMap<String, f64> {
        symbols
            .iter()
            .map(|s| (s.clone(), self.weights.get(s).copied().unwrap_or(0.0)))
            .collect()
    }
}

fn normalize(raw: HashMap<String, f64>) -> HashMap<String, f64> {
    let total: f64 = raw.values().sum();
    if total <= 0.0 {
        return raw;
    }
    raw.into_iter().map(|(k, v)| (k, v / total)).collect()
}

fn realized_volatility(bars: Option<&Vec<Bar>>, as_of: NaiveDate, lookback: usize) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    let Some(bars) = bars else { return 0.0 };
    let closes: Vec<f64> = bars
        .iter()
        .filter(|b| b.timestamp <= as_of)
        .rev()
        .take(lookback + 1)
        .map(|b| b.close.to_f64().unwrap_or(0.0))
        .collect();
    if closes.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = closes.windows(2).map(|w| (w[0] - w[1]) / w[1]).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len().max(1) as f64;
    var.sqrt()
}

pub fn build_scheme(kind: WeightSchemeKind, fixed_weights: HashMap<String, f64>) -> Box<dyn WeightScheme> {
    match kind {
        WeightSchemeKind::Equal => Box::new(EqualWeight),
        WeightSchemeKind::InverseVol => Box::new(InverseVolatility { lookback: 20 }),
        WeightSchemeKind::RiskParity => Box::new(RiskParity { lookback: 20 }),
        WeightSchemeKind::FixedTarget => Box::new(FixedTarget { weights: fixed_weights }),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn bars_with_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: rust_decimal::Decimal::try_from(c).unwrap(),
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn equal_weight_splits_evenly() {
        let symbols = vec!["AAA".to_string(), "BBB".to_string()];
        let bars = HashMap::new();
        let as_of = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let w = EqualWeight.calculate(&symbols, &bars, as_of);
        assert_eq!(w["AAA"], 0.5);
        assert_eq!(w["BBB"], 0.5);
    }

    #[test]
    fn equal_weight_handles_empty_universe() {
        let w = EqualWeight.calculate(&[], &HashMap::new(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert!(w.is_empty());
    }

    #[test]
    fn inverse_volatility_favors_calmer_symbol() {
        let symbols = vec!["CALM".to_string(), "WILD".to_string()];
        let mut bars = HashMap::new();
        bars.insert("CALM".to_string(), bars_with_closes(&[100.0, 100.5, 100.0, 100.5, 100.0, 100.5]));
        bars.insert("WILD".to_string(), bars_with_closes(&[100.0, 120.0, 90.0, 130.0, 80.0, 140.0]));
        let as_of = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        let w = InverseVolatility { lookback: 20 }.calculate(&symbols, &bars, as_of);
        assert!(w["CALM"] > w["WILD"]);
        assert!((w["CALM"] + w["WILD"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn risk_parity_weights_sum_to_one() {
        let symbols = vec!["AAA".to_string(), "BBB".to_string()];
        let mut bars = HashMap::new();
        bars.insert("AAA".to_string(), bars_with_closes(&[100.0, 101.0, 99.0, 102.0]));
        bars.insert("BBB".to_string(), bars_with_closes(&[50.0, 52.0, 48.0, 53.0]));
        let as_of = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();
        let w = RiskParity { lookback: 20 }.calculate(&symbols, &bars, as_of);
        let total: f64 = w.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_target_defaults_missing_symbols_to_zero() {
        let mut weights = HashMap::new();
        weights.insert("AAA".to_string(), 0.7);
        let symbols = vec!["AAA".to_string(), "BBB".to_string()];
        let w = FixedTarget { weights }.calculate(&symbols, &HashMap::new(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(w["AAA"], 0.7);
        assert_eq!(w["BBB"], 0.0);
    }

    #[test]
    fn build_scheme_dispatches_on_kind() {
        let scheme = build_scheme(WeightSchemeKind::Equal, HashMap::new());
        let symbols = vec!["AAA".to_string()];
        let w = scheme.calculate(&symbols, &HashMap::new(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(w["AAA"], 1.0);
    }
}
