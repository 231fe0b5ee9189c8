use std::collections::HashMap;

use chrono::NaiveDate;
use indicator_registry::ParamValue;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV record for a symbol. Bars for a symbol form an ordered
/// sequence indexed by strictly-increasing `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Buy,
    Sell,
    Short,
    Cover,
    Close,
}

// ---------------------------------------------------------------------
// Strategy tree
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub id: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Universe {
    Static {
        symbols: Vec<String>,
    },
    Index {
        index: String,
    },
    Screener {
        base: Box<Universe>,
        #[serde(default)]
        filters: Vec<Condition>,
        #[serde(default)]
        rank_by: Option<Signal>,
        #[serde(default)]
        rank_desc: bool,
        #[serde(default)]
        limit: Option<usize>,
    },
    Dual {
        long: Box<Universe>,
        short: Box<Universe>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Price {
        field: String,
        #[serde(default)]
        offset: i64,
    },
    Indicator {
        indicator: String,
        #[serde(default)]
        params: HashMap<String, ParamValue>,
        #[serde(default)]
        component: Option<String>,
        #[serde(default)]
        offset: i64,
    },
    Constant {
        value: f64,
    },
    ParamRef {
        name: String,
    },
    Calendar {
        field: String,
    },
    Event {
        event_type: String,
        #[serde(default)]
        days_before: i64,
        #[serde(default)]
        days_after: i64,
    },
    Portfolio {
        field: String,
        #[serde(default)]
        symbol: Option<String>,
    },
    Fundamental {
        metric: String,
        #[serde(default)]
        symbol: Option<String>,
    },
    External {
        source: String,
        key: String,
        default: f64,
    },
    Expr {
        formula: String,
    },
    Ref {
        #[serde(rename = "$ref")]
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Comparison {
        left: Signal,
        op: ComparisonOp,
        right: Signal,
    },
    And {
        terms: Vec<Condition>,
    },
    Or {
        terms: Vec<Condition>,
    },
    Not {
        term: Box<Condition>,
    },
    Expr {
        formula: String,
    },
    Always,
    Ref {
        #[serde(rename = "$ref")]
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SizingSpec {
    FixedAmount { amount: Decimal },
    FixedQuantity { quantity: Decimal },
    PercentOfEquity { pct: f64 },
    PercentOfCash { pct: f64 },
    PercentOfPosition { pct: f64 },
    RiskBased { risk_pct: f64, stop_distance_pct: f64 },
    Kelly { multiplier: f64 },
    VolatilityAdjusted { target_risk: f64, lookback: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Trade {
        direction: TradeDirection,
        sizing: SizingSpec,
        #[serde(default)]
        reason: Option<String>,
    },
    Alert {
        message: String,
        #[serde(default)]
        level: Option<String>,
    },
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub when: Condition,
    pub then: Action,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub max_positions: Option<usize>,
    #[serde(default)]
    pub no_shorting: bool,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub trailing_stop: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTree {
    pub info: StrategyInfo,
    pub universe: Universe,
    #[serde(default)]
    pub signals: HashMap<String, Signal>,
    #[serde(default)]
    pub conditions: HashMap<String, Condition>,
    #[serde(default)]
    pub parameters: HashMap<String, ParamValue>,
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub constraints: Constraints,
}

impl Default for Universe {
    fn default() -> Self {
        Universe::Static { symbols: vec![] }
    }
}

// ---------------------------------------------------------------------
// Portfolio state
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub direction: Direction,
    pub entry_date: NaiveDate,
    pub unrealized_pnl: Decimal,
    pub days_held: u32,
    /// Most favorable close seen since entry (highest for longs, lowest
    /// for shorts). Basis for the trailing-stop peak, tracked separately
    /// from `unrealized_pnl` since the latter reflects only today's mark.
    pub peak_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub direction: Direction,
    pub entry_date: NaiveDate,
    pub entry_price: Decimal,
    pub qty: Decimal,
    pub exit_date: Option<NaiveDate>,
    pub exit_price: Option<Decimal>,
    pub commission: Decimal,
    pub slippage: Decimal,
    pub pnl: Option<Decimal>,
    pub is_open: bool,
    pub entry_reason: String,
    pub exit_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: TradeDirection,
    pub quantity: Decimal,
    pub price: Decimal,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub direction: TradeDirection,
    pub quantity: Decimal,
    pub fill_price: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub date: NaiveDate,
    pub cash: Decimal,
    pub positions_value: Decimal,
    pub equity: Decimal,
    pub drawdown: Decimal,
    pub drawdown_pct: f64,
}

// ---------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionTier {
    #[serde(default)]
    pub up_to: Option<Decimal>,
    #[serde(default)]
    pub above: Option<Decimal>,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WeightSchemeKind {
    Equal,
    InverseVol,
    RiskParity,
    FixedTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RebalanceFrequency {
    Never,
    Weekly { #[serde(default)] day: Option<u32> },
    Monthly,
    OnDrift { threshold_pct: f64 },
}

impl Default for RebalanceFrequency {
    fn default() -> Self {
        RebalanceFrequency::Never
    }
}

fn default_lot_size() -> Decimal {
    Decimal::ONE
}

fn default_risk_free_rate() -> f64 {
    0.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    #[serde(default)]
    pub commission_rate: f64,
    #[serde(default)]
    pub slippage_rate: f64,
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    #[serde(default)]
    pub tiered_commission: Vec<CommissionTier>,
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    #[serde(default)]
    pub weight_scheme: Option<WeightSchemeKind>,
    #[serde(default)]
    pub fixed_weights: HashMap<String, f64>,
    #[serde(default)]
    pub rebalance_frequency: RebalanceFrequency,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_capital: Decimal::new(100_000, 0),
            commission_rate: 0.0,
            slippage_rate: 0.0,
            lot_size: Decimal::ONE,
            tiered_commission: vec![],
            risk_free_rate: 0.0,
            weight_scheme: None,
            fixed_weights: HashMap::new(),
            rebalance_frequency: RebalanceFrequency::Never,
        }
    }
}

// ---------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub benchmark_symbol: String,
    pub benchmark_return_pct: f64,
    pub strategy_return_pct: f64,
    pub alpha_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown_pct: f64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub exposure_time_pct: f64,
    pub recovery_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_id: String,
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub trades: Vec<Trade>,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub equity_curve: Vec<EquityPoint>,
    pub parameters: HashMap<String, ParamValue>,
    pub metrics: PerformanceMetrics,
    #[serde(default)]
    pub benchmark: Option<BenchmarkComparison>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolResult {
    pub symbol: String,
    pub trades: Vec<Trade>,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioResult {
    pub strategy_id: String,
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub equity_curve: Vec<EquityPoint>,
    pub per_symbol_results: HashMap<String, SymbolResult>,
    pub portfolio_weights: Vec<(NaiveDate, HashMap<String, f64>)>,
    pub rebalance_count: u32,
    pub average_turnover: f64,
    pub weight_scheme: WeightSchemeKind,
    pub rebalance_frequency: RebalanceFrequency,
    pub metrics: PerformanceMetrics,
}
