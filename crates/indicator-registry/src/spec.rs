use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What bar fields an indicator consumes, used by callers that need to know
/// before slicing data for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarInput {
    /// A single price series (close, or whatever `source` param selects).
    Source,
    /// High, low, close.
    Hlc,
    /// High, low, close, volume.
    Hlcv,
    /// High, low.
    Hl,
    /// Close, volume.
    Cv,
    /// No bar data required (constant-style indicators).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    Integer,
    Float,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    String(String),
}

impl ParamValue {
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ParamValue::Integer(i) if *i >= 0 => Some(*i as usize),
            ParamValue::Float(f) if *f >= 0.0 => Some(*f as usize),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParam {
    pub name: &'static str,
    pub kind: ParamType,
    pub default: ParamValue,
}

/// Static metadata for one registered indicator.
///
/// `components` lists the named outputs for multi-output indicators
/// (e.g. MACD's `macd`, `signal`, `histogram`); single-output indicators
/// report one component equal to `default_component`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: &'static str,
    pub params: Vec<IndicatorParam>,
    pub input: BarInput,
    pub components: Vec<&'static str>,
    pub default_component: &'static str,
}

impl IndicatorSpec {
    pub fn resolve_params(&self, overrides: &HashMap<String, ParamValue>) -> HashMap<String, ParamValue> {
        let mut resolved = HashMap::with_capacity(self.params.len());
        for p in &self.params {
            let value = overrides.get(p.name).cloned().unwrap_or_else(|| p.default.clone());
            resolved.insert(p.name.to_string(), value);
        }
        resolved
    }
}
