//! Resolves a universe specification to a concrete set of tradable symbols.

use std::collections::HashMap;

use indicator_registry::{IndicatorRegistry, ParamValue};

use crate::error::{BacktestError, ValidationError};
use crate::evaluator::{ConditionEvaluator, EvalContext, SignalEvaluator};
use crate::models::{Bar, Universe};

/// Sample constituent lists for named indices. A production deployment
/// would source these from a data provider; this is the static fallback.
fn index_constituents(index: &str) -> Option<Vec<String>> {
    match index {
        "DOW30" => Some(
            [
                "AAPL", "AMGN", "AXP", "BA", "CAT", "CRM", "CSCO", "CVX", "DIS", "DOW", "GS", "HD",
                "HON", "IBM", "INTC", "JNJ", "JPM", "KO", "MCD", "MMM", "MRK", "MSFT", "NKE", "PG",
                "TRV", "UNH", "V", "VZ", "WBA", "WMT",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        ),
        "NIKKEI225_SAMPLE" => Some(
            ["7203", "6758", "9984", "8306", "6861", "9432", "8035", "4063", "6501", "7267"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        ),
        _ => None,
    }
}

pub struct UniverseResolver<'a> {
    pub bars_by_symbol: &'a HashMap<String, Vec<Bar>>,
    pub registry: &'a dyn IndicatorRegistry,
    pub parameters: &'a HashMap<String, ParamValue>,
}

impl<'a> UniverseResolver<'a> {
    pub fn resolve(&self, universe: &Universe) -> Result<Vec<String>, BacktestError> {
        match universe {
            Universe::Static { symbols } => {
                if symbols.is_empty() {
                    return Err(ValidationError::EmptyUniverse.into());
                }
                Ok(symbols.clone())
            }
            Universe::Index { index } => {
                index_constituents(index).ok_or_else(|| ValidationError::UnknownIndex(index.clone()).into())
            }
            Universe::Screener { base, filters, rank_by, rank_desc, limit } => {
                let mut candidates = self.resolve(base)?;
                candidates.retain(|s| self.bars_by_symbol.contains_key(s));

                for filter in filters {
                    let mut survivors = Vec::new();
                    for symbol in &candidates {
                        if self.symbol_passes(symbol, filter)? {
                            survivors.push(symbol.clone());
                        }
                    }
                    candidates = survivors;
                }

                if let Some(signal) = rank_by {
                    let mut scored: Vec<(String, f64)> = Vec::with_capacity(candidates.len());
                    for symbol in &candidates {
                        let value = self.symbol_last_value(symbol, signal)?;
                        scored.push((symbol.clone(), value));
                    }
                    scored.sort_by(|a, b| {
                        let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                        if *rank_desc {
                            ord.reverse()
                        } else {
                            ord
                        }
                    });
                    candidates = scored.into_iter().map(|(s, _)| s).collect();
                }

                if let Some(limit) = limit {
                    candidates.truncate(*limit);
                }

                Ok(candidates)
            }
            Universe::Dual { long, short } => {
                let mut long_symbols = self.resolve(long)?;
                let short_symbols = self.resolve(short)?;
                for s in short_symbols {
                    if !long_symbols.contains(&s) {
                        long_symbols.push(s);
                    }
                }
                Ok(long_symbols)
            }
        }
    }

    fn symbol_passes(&self, symbol: &str, filter: &crate::models::Condition) -> Result<bool, BacktestError> {
        let bars = match self.bars_by_symbol.get(symbol) {
            Some(b) if !b.is_empty() => b,
            _ => return Ok(false),
        };
        let empty_signals = HashMap::new();
        let empty_conditions = HashMap::new();
        let empty_events = HashMap::new();
        let empty_fundamentals = HashMap::new();
        let empty_external = HashMap::new();
        let ctx = EvalContext {
            bars,
            registry: self.registry,
            parameters: self.parameters,
            signals_library: &empty_signals,
            conditions_library: &empty_conditions,
            event_dates: &empty_events,
            fundamentals: &empty_fundamentals,
            external: &empty_external,
        };
        let mut evaluator = SignalEvaluator::new();
        let mut cond_eval = ConditionEvaluator::new(&mut evaluator);
        let series = cond_eval.evaluate(filter, &ctx)?;
        Ok(series.last().copied().unwrap_or(false))
    }

    fn symbol_last_value(&self, symbol: &str, signal: &crate::models::Signal) -> Result<f64, BacktestError> {
        let bars = match self.bars_by_symbol.get(symbol) {
            Some(b) if !b.is_empty() => b,
            _ => return Ok(f64::NAN),
        };
        let empty_signals = HashMap::new();
        let empty_conditions = HashMap::new();
        let empty_events = HashMap::new();
        let empty_fundamentals = HashMap::new();
        let empty_external = HashMap::new();
        let ctx = EvalContext {
            bars,
            registry: self.registry,
            parameters: self.parameters,
            signals_library: &empty_signals,
            conditions_library: &empty_conditions,
            event_dates: &empty_events,
            fundamentals: &empty_fundamentals,
            external: &empty_external,
        };
        let mut evaluator = SignalEvaluator::new();
        let series = evaluator.evaluate(signal, &ctx)?;
        Ok(series.last().copied().unwrap_or(f64::NAN))
    }
}
