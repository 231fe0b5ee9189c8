use std::collections::HashMap;

use crate::builtins;
use crate::registry::{DefaultIndicatorRegistry, IndicatorError, IndicatorRegistry};
use crate::series::Bar;

fn flat_bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .map(|&c| Bar {
            open: c,
            high: c,
            low: c,
            close: c,
            volume: 1_000.0,
        })
        .collect()
}

#[test]
fn sma_pads_warmup_with_nan_and_preserves_length() {
    let values: Vec<f64> = (1..=10).map(|i| i as f64).collect();
    let out = builtins::sma(&values, 3);
    assert_eq!(out.len(), values.len());
    assert!(out[0].is_nan());
    assert!(out[1].is_nan());
    assert_eq!(out[2], 2.0);
    assert_eq!(out[9], 9.0);
}

#[test]
fn ema_seeds_from_sma_of_first_period() {
    let values: Vec<f64> = (1..=10).map(|i| i as f64).collect();
    let out = builtins::ema(&values, 3);
    assert!(out[0].is_nan() && out[1].is_nan());
    assert_eq!(out[2], 2.0);
    assert!((out[3] - 3.5).abs() < 1e-9);
}

#[test]
fn rsi_is_100_when_all_gains() {
    let values: Vec<f64> = (1..=20).map(|i| i as f64).collect();
    let result = builtins::rsi(&values, 14);
    assert!((result.rsi[14] - 100.0).abs() < 1e-9);
}

#[test]
fn stochastic_flat_range_reports_midpoint() {
    let bars = flat_bars(&[10.0; 20]);
    let result = builtins::stochastic(&bars, 14, 3);
    assert!((result.k[13] - 50.0).abs() < 1e-9);
}

#[test]
fn registry_rejects_unknown_indicator() {
    let registry = DefaultIndicatorRegistry::new();
    let bars = flat_bars(&[1.0, 2.0, 3.0]);
    let err = registry.compute("NOPE", &bars, &HashMap::new()).unwrap_err();
    assert_eq!(err, IndicatorError::UnknownIndicator("NOPE".to_string()));
}

#[test]
fn registry_reports_insufficient_data() {
    let registry = DefaultIndicatorRegistry::new();
    let bars = flat_bars(&[1.0, 2.0]);
    let err = registry.compute("SMA", &bars, &HashMap::new()).unwrap_err();
    assert!(matches!(err, IndicatorError::InsufficientData(_, 20, 2)));
}

#[test]
fn macd_output_length_matches_input() {
    let registry = DefaultIndicatorRegistry::new();
    let closes: Vec<f64> = (1..=60).map(|i| i as f64).collect();
    let bars = flat_bars(&closes);
    let out = registry.compute("MACD", &bars, &HashMap::new()).unwrap();
    assert_eq!(out.component("macd").unwrap().len(), bars.len());
    assert_eq!(out.component("histogram").unwrap().len(), bars.len());
}
