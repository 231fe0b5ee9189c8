pub mod actions;
pub mod data_quality;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod expr;
pub mod models;
pub mod multi_runner;
pub mod portfolio;
pub mod protective_exit;
pub mod result;
pub mod single_runner;
pub mod sizing;
pub mod universe;
pub mod weights;

pub use error::{BacktestError, DataError, ExecutionError, ExpressionError, ParameterError, ValidationError};
pub use models::{
    Action, Bar, BacktestConfig, BacktestResult, CommissionTier, Condition, Constraints,
    Direction, Fill, OrderRequest, OrderType, PerformanceMetrics, PortfolioResult,
    PortfolioSnapshot, Position, RebalanceFrequency, Rule, Signal, SizingSpec, StrategyInfo,
    StrategyTree, SymbolResult, Trade, TradeDirection, Universe, WeightSchemeKind,
};
