use chrono::NaiveDate;
use thiserror::Error;

use indicator_registry::IndicatorError;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("strategy `{0}` has no rules")]
    NoRules(String),
    #[error("unknown signal type: {0}")]
    UnknownSignalType(String),
    #[error("unknown condition type: {0}")]
    UnknownConditionType(String),
    #[error("reference path not found: {0}")]
    UnresolvedRef(String),
    #[error("cyclic $ref detected at: {0}")]
    CyclicRef(String),
    #[error("static universe must not be empty")]
    EmptyUniverse,
    #[error("unknown index: {0}")]
    UnknownIndex(String),
}

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("unresolved parameter: {0}")]
    Unresolved(String),
    #[error("parameter `{0}` has the wrong type")]
    TypeMismatch(String),
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("bar frame for `{0}` is empty")]
    EmptyBars(String),
    #[error("bar timestamps for `{0}` are not strictly increasing at index {1}")]
    NonMonotonicTimestamps(String, usize),
    #[error("all dates filtered out for `{0}`")]
    AllDatesFiltered(String),
    #[error("bar for `{0}` on {1} has inconsistent OHLC (high below low, or open/close outside the high/low range)")]
    InvalidOhlc(String, NaiveDate),
}

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("unexpected character `{ch}` at line {line}, column {column}")]
    UnexpectedChar { ch: char, line: usize, column: usize },
    #[error("unexpected end of expression")]
    UnexpectedEof,
    #[error("expected token `{expected}` at line {line}, column {column}")]
    ExpectedToken {
        expected: String,
        line: usize,
        column: usize,
    },
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),
    #[error("indicator error in expression: {0}")]
    Indicator(#[from] IndicatorError),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order rejected: quantity rounds to zero at lot size {0}")]
    QuantityRoundsToZero(rust_decimal::Decimal),
    #[error("order rejected: non-positive price")]
    NonPositivePrice,
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error(transparent)]
    Indicator(#[from] IndicatorError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
