use std::collections::HashMap;

use thiserror::Error;

use crate::builtins;
use crate::series::Bar;
use crate::spec::{BarInput, IndicatorParam, IndicatorSpec, ParamType, ParamValue};

#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("unknown indicator: {0}")]
    UnknownIndicator(String),
    #[error("invalid parameter `{param}` for indicator `{indicator}`: {reason}")]
    InvalidParameter {
        indicator: String,
        param: String,
        reason: String,
    },
    #[error("indicator `{0}` requires at least {1} bars, got {2}")]
    InsufficientData(String, usize, usize),
    #[error("indicator `{indicator}` has no component `{component}`")]
    UnknownComponent { indicator: String, component: String },
}

/// A computed indicator result. Single-output indicators populate one
/// component under their `default_component` name.
#[derive(Debug, Clone)]
pub struct IndicatorOutput {
    pub components: HashMap<String, Vec<f64>>,
    pub default_component: String,
}

impl IndicatorOutput {
    fn single(name: &str, values: Vec<f64>) -> Self {
        let mut components = HashMap::new();
        components.insert(name.to_string(), values);
        IndicatorOutput {
            components,
            default_component: name.to_string(),
        }
    }

    pub fn default_series(&self) -> &[f64] {
        self.components
            .get(&self.default_component)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn component(&self, name: &str) -> Option<&[f64]> {
        self.components.get(name).map(|v| v.as_slice())
    }
}

pub trait IndicatorRegistry: Send + Sync {
    fn spec(&self, name: &str) -> Option<&IndicatorSpec>;

    fn compute(
        &self,
        name: &str,
        bars: &[Bar],
        params: &HashMap<String, ParamValue>,
    ) -> Result<IndicatorOutput, IndicatorError>;
}

/// The built-in indicator set: SMA, EMA, RSI, MACD, Bollinger Bands, ATR,
/// Stochastic, OBV, STDDEV.
pub struct DefaultIndicatorRegistry {
    specs: HashMap<&'static str, IndicatorSpec>,
}

impl Default for DefaultIndicatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn int_param(name: &'static str, default: i64) -> IndicatorParam {
    IndicatorParam {
        name,
        kind: ParamType::Integer,
        default: ParamValue::Integer(default),
    }
}

fn float_param(name: &'static str, default: f64) -> IndicatorParam {
    IndicatorParam {
        name,
        kind: ParamType::Float,
        default: ParamValue::Float(default),
    }
}

impl DefaultIndicatorRegistry {
    pub fn new() -> Self {
        let mut specs = HashMap::new();

        specs.insert(
            "SMA",
            IndicatorSpec {
                name: "SMA",
                params: vec![int_param("period", 20)],
                input: BarInput::Source,
                components: vec!["sma"],
                default_component: "sma",
            },
        );
        specs.insert(
            "EMA",
            IndicatorSpec {
                name: "EMA",
                params: vec![int_param("period", 20)],
                input: BarInput::Source,
                components: vec!["ema"],
                default_component: "ema",
            },
        );
        specs.insert(
            "RSI",
            IndicatorSpec {
                name: "RSI",
                params: vec![int_param("period", 14)],
                input: BarInput::Source,
                components: vec!["rsi"],
                default_component: "rsi",
            },
        );
        specs.insert(
            "MACD",
            IndicatorSpec {
                name: "MACD",
                params: vec![int_param("fast", 12), int_param("slow", 26), int_param("signal", 9)],
                input: BarInput::Source,
                components: vec!["macd", "signal", "histogram"],
                default_component: "macd",
            },
        );
        specs.insert(
            "BB",
            IndicatorSpec {
                name: "BB",
                params: vec![int_param("period", 20), float_param("num_std", 2.0)],
                input: BarInput::Source,
                components: vec!["upper", "middle", "lower"],
                default_component: "middle",
            },
        );
        specs.insert(
            "ATR",
            IndicatorSpec {
                name: "ATR",
                params: vec![int_param("period", 14)],
                input: BarInput::Hlc,
                components: vec!["atr"],
                default_component: "atr",
            },
        );
        specs.insert(
            "STOCH",
            IndicatorSpec {
                name: "STOCH",
                params: vec![int_param("k_period", 14), int_param("d_period", 3)],
                input: BarInput::Hlc,
                components: vec!["k", "d"],
                default_component: "k",
            },
        );
        specs.insert(
            "OBV",
            IndicatorSpec {
                name: "OBV",
                params: vec![],
                input: BarInput::Cv,
                components: vec!["obv"],
                default_component: "obv",
            },
        );
        specs.insert(
            "STDDEV",
            IndicatorSpec {
                name: "STDDEV",
                params: vec![int_param("period", 20)],
                input: BarInput::Source,
                components: vec!["stddev"],
                default_component: "stddev",
            },
        );

        DefaultIndicatorRegistry { specs }
    }

    fn close_series(bars: &[Bar]) -> Vec<f64> {
        bars.iter().map(|b| b.close).collect()
    }

    fn require_period(
        indicator: &str,
        params: &HashMap<String, ParamValue>,
        spec: &IndicatorSpec,
    ) -> Result<usize, IndicatorError> {
        let resolved = spec.resolve_params(params);
        let period = resolved
            .get("period")
            .and_then(ParamValue::as_usize)
            .ok_or_else(|| IndicatorError::InvalidParameter {
                indicator: indicator.to_string(),
                param: "period".to_string(),
                reason: "must be a positive integer".to_string(),
            })?;
        if period == 0 {
            return Err(IndicatorError::InvalidParameter {
                indicator: indicator.to_string(),
                param: "period".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }
        Ok(period)
    }
}

impl IndicatorRegistry for DefaultIndicatorRegistry {
    fn spec(&self, name: &str) -> Option<&IndicatorSpec> {
        self.specs.get(name)
    }

    fn compute(
        &self,
        name: &str,
        bars: &[Bar],
        params: &HashMap<String, ParamValue>,
    ) -> Result<IndicatorOutput, IndicatorError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| IndicatorError::UnknownIndicator(name.to_string()))?;

        match name {
            "SMA" => {
                let period = Self::require_period(name, params, spec)?;
                check_len(name, bars.len(), period)?;
                Ok(IndicatorOutput::single("sma", builtins::sma(&Self::close_series(bars), period)))
            }
            "EMA" => {
                let period = Self::require_period(name, params, spec)?;
                check_len(name, bars.len(), period)?;
                Ok(IndicatorOutput::single("ema", builtins::ema(&Self::close_series(bars), period)))
            }
            "RSI" => {
                let period = Self::require_period(name, params, spec)?;
                check_len(name, bars.len(), period + 1)?;
                let result = builtins::rsi(&Self::close_series(bars), period);
                Ok(IndicatorOutput::single("rsi", result.rsi))
            }
            "MACD" => {
                let resolved = spec.resolve_params(params);
                let fast = resolved.get("fast").and_then(ParamValue::as_usize).unwrap_or(12);
                let slow = resolved.get("slow").and_then(ParamValue::as_usize).unwrap_or(26);
                let signal = resolved.get("signal").and_then(ParamValue::as_usize).unwrap_or(9);
                check_len(name, bars.len(), slow + signal)?;
                let result = builtins::macd(&Self::close_series(bars), fast, slow, signal);
                let mut components = HashMap::new();
                components.insert("macd".to_string(), result.macd_line);
                components.insert("signal".to_string(), result.signal_line);
                components.insert("histogram".to_string(), result.histogram);
                Ok(IndicatorOutput {
                    components,
                    default_component: "macd".to_string(),
                })
            }
            "BB" => {
                let resolved = spec.resolve_params(params);
                let period = resolved
                    .get("period")
                    .and_then(ParamValue::as_usize)
                    .ok_or_else(|| IndicatorError::InvalidParameter {
                        indicator: name.to_string(),
                        param: "period".to_string(),
                        reason: "must be a positive integer".to_string(),
                    })?;
                let num_std = resolved.get("num_std").and_then(ParamValue::as_f64).unwrap_or(2.0);
                check_len(name, bars.len(), period)?;
                let result = builtins::bollinger_bands(&Self::close_series(bars), period, num_std);
                let mut components = HashMap::new();
                components.insert("upper".to_string(), result.upper);
                components.insert("middle".to_string(), result.middle);
                components.insert("lower".to_string(), result.lower);
                Ok(IndicatorOutput {
                    components,
                    default_component: "middle".to_string(),
                })
            }
            "ATR" => {
                let period = Self::require_period(name, params, spec)?;
                check_len(name, bars.len(), period)?;
                Ok(IndicatorOutput::single("atr", builtins::atr(bars, period)))
            }
            "STOCH" => {
                let resolved = spec.resolve_params(params);
                let k_period = resolved.get("k_period").and_then(ParamValue::as_usize).unwrap_or(14);
                let d_period = resolved.get("d_period").and_then(ParamValue::as_usize).unwrap_or(3);
                check_len(name, bars.len(), k_period)?;
                let result = builtins::stochastic(bars, k_period, d_period);
                let mut components = HashMap::new();
                components.insert("k".to_string(), result.k);
                components.insert("d".to_string(), result.d);
                Ok(IndicatorOutput {
                    components,
                    default_component: "k".to_string(),
                })
            }
            "OBV" => Ok(IndicatorOutput::single("obv", builtins::obv(bars))),
            "STDDEV" => {
                let period = Self::require_period(name, params, spec)?;
                check_len(name, bars.len(), period)?;
                Ok(IndicatorOutput::single(
                    "stddev",
                    builtins::stddev(&Self::close_series(bars), period),
                ))
            }
            _ => Err(IndicatorError::UnknownIndicator(name.to_string())),
        }
    }
}

fn check_len(indicator: &str, len: usize, required: usize) -> Result<(), IndicatorError> {
    if len < required {
        Err(IndicatorError::InsufficientData(indicator.to_string(), required, len))
    } else {
        Ok(())
    }
}
