//! Applies a firing rule's `trade` action: constraint checks, sizing,
//! execution, and the resulting bookkeeper mutation. Shared by the
//! single-symbol and multi-symbol runners.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::executor::Executor;
use crate::models::{Constraints, Direction, OrderRequest, OrderType, SizingSpec, Trade, TradeDirection};
use crate::portfolio::PortfolioBookkeeper;
use crate::sizing::{self, SizingContext};

#[allow(clippy::too_many_arguments)]
pub fn apply_trade_action(
    bookkeeper: &mut PortfolioBookkeeper,
    executor: &dyn Executor,
    symbol: &str,
    price: Decimal,
    date: NaiveDate,
    direction: TradeDirection,
    sizing_spec: &SizingSpec,
    reason: &str,
    constraints: &Constraints,
    prices_for_equity: &HashMap<String, Decimal>,
    atr: Option<f64>,
    open_position_count: usize,
) {
    let equity = bookkeeper.equity(prices_for_equity);

    match direction {
        TradeDirection::Sell => close_if_direction(bookkeeper, executor, symbol, price, date, reason, Direction::Long),
        TradeDirection::Cover => close_if_direction(bookkeeper, executor, symbol, price, date, reason, Direction::Short),
        TradeDirection::Close => close_any(bookkeeper, executor, symbol, price, date, reason),
        TradeDirection::Buy => {
            if bookkeeper.positions.contains_key(symbol) {
                return;
            }
            if exceeds_max_positions(constraints, open_position_count) {
                return;
            }
            open_with_sizing(
                bookkeeper, executor, symbol, price, date, TradeDirection::Buy, Direction::Long, sizing_spec, reason,
                equity, atr,
            );
        }
        TradeDirection::Short => {
            if constraints.no_shorting {
                return;
            }
            if bookkeeper.positions.contains_key(symbol) {
                return;
            }
            if exceeds_max_positions(constraints, open_position_count) {
                return;
            }
            open_with_sizing(
                bookkeeper, executor, symbol, price, date, TradeDirection::Short, Direction::Short, sizing_spec, reason,
                equity, atr,
            );
        }
    }
}

fn exceeds_max_positions(constraints: &Constraints, open_position_count: usize) -> bool {
    constraints.max_positions.map(|max| open_position_count >= max).unwrap_or(false)
}

fn close_if_direction(
    bookkeeper: &mut PortfolioBookkeeper,
    executor: &dyn Executor,
    symbol: &str,
    price: Decimal,
    date: NaiveDate,
    reason: &str,
    expected: Direction,
) {
    let Some(position) = bookkeeper.positions.get(symbol) else { return };
    if position.direction != expected {
        return;
    }
    close_any(bookkeeper, executor, symbol, price, date, reason);
}

fn close_any(
    bookkeeper: &mut PortfolioBookkeeper,
    executor: &dyn Executor,
    symbol: &str,
    price: Decimal,
    date: NaiveDate,
    reason: &str,
) {
    let Some(position) = bookkeeper.positions.get(symbol) else { return };
    let qty = position.qty;
    let direction = position.direction;
    let order_direction = match direction {
        Direction::Long => TradeDirection::Sell,
        Direction::Short => TradeDirection::Cover,
    };
    let order = OrderRequest {
        symbol: symbol.to_string(),
        direction: order_direction,
        quantity: qty,
        price,
        order_type: OrderType::Market,
    };
    if let Some(fill) = executor.execute(&order) {
        bookkeeper.close(symbol, fill.fill_price, date, reason, fill.commission, fill.slippage);
    }
}

#[allow(clippy::too_many_arguments)]
fn open_with_sizing(
    bookkeeper: &mut PortfolioBookkeeper,
    executor: &dyn Executor,
    symbol: &str,
    price: Decimal,
    date: NaiveDate,
    order_direction: TradeDirection,
    position_direction: Direction,
    sizing_spec: &SizingSpec,
    reason: &str,
    equity: Decimal,
    atr: Option<f64>,
) {
    let ctx = SizingContext {
        price,
        equity,
        cash: bookkeeper.cash,
        position: bookkeeper.positions.get(symbol),
        closed_trades: closed_trades(&bookkeeper.trades, symbol),
        atr,
    };
    let quantity = sizing::size(sizing_spec, &ctx);
    if quantity <= Decimal::ZERO {
        return;
    }

    let order = OrderRequest {
        symbol: symbol.to_string(),
        direction: order_direction,
        quantity,
        price,
        order_type: OrderType::Market,
    };
    if let Some(fill) = executor.execute(&order) {
        bookkeeper.open(
            symbol,
            fill.quantity,
            fill.fill_price,
            position_direction,
            date,
            fill.commission,
            fill.slippage,
            reason,
        );
    }
}

/// Kelly sizing draws its empirical win/loss stats from the whole
/// portfolio's closed-trade history, not just one symbol's.
fn closed_trades<'a>(trades: &'a [Trade], _symbol: &str) -> &'a [Trade] {
    trades
}
