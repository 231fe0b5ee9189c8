//! Owns cash, positions, trades, and snapshots. The sole writer of
//! portfolio state; every other component reads through its queries.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{Constraints, Direction, Position, PortfolioSnapshot, Trade};
use crate::protective_exit;

pub struct PortfolioBookkeeper {
    pub cash: Decimal,
    pub positions: HashMap<String, Position>,
    pub trades: Vec<Trade>,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub peak_equity: Decimal,
}

impl PortfolioBookkeeper {
    pub fn new(initial_capital: Decimal) -> Self {
        PortfolioBookkeeper {
            cash: initial_capital,
            positions: HashMap::new(),
            trades: Vec::new(),
            snapshots: Vec::new(),
            peak_equity: initial_capital,
        }
    }

    /// Opens a position, shrinking `qty` to what cash affords after fees if
    /// necessary. Returns `false` if the open was rejected outright.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
        direction: Direction,
        date: NaiveDate,
        commission: Decimal,
        slippage: Decimal,
        reason: &str,
    ) -> bool {
        if self.positions.contains_key(symbol) || qty <= Decimal::ZERO {
            return false;
        }

        let fees = commission + slippage;
        let (required, margin_fraction) = match direction {
            Direction::Long => (price * qty + fees, Decimal::ONE),
            Direction::Short => (price * qty * dec!(0.5) + fees, dec!(0.5)),
        };

        let qty = if required > self.cash {
            let affordable = ((self.cash - fees) / (price * margin_fraction)).max(Decimal::ZERO);
            let floored = affordable.trunc();
            if floored <= Decimal::ZERO {
                tracing::debug!(symbol, "open rejected: insufficient cash after fees");
                return false;
            }
            floored
        } else {
            qty
        };

        let committed = price * qty * margin_fraction + fees;
        self.cash -= committed;

        self.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                qty,
                avg_price: price,
                direction,
                entry_date: date,
                unrealized_pnl: Decimal::ZERO,
                days_held: 0,
                peak_price: price,
            },
        );

        self.trades.push(Trade {
            symbol: symbol.to_string(),
            direction,
            entry_date: date,
            entry_price: price,
            qty,
            exit_date: None,
            exit_price: None,
            commission,
            slippage,
            pnl: None,
            is_open: true,
            entry_reason: reason.to_string(),
            exit_reason: None,
        });

        true
    }

    /// Closes the open position in `symbol`, if any, returning its pnl.
    pub fn close(
        &mut self,
        symbol: &str,
        price: Decimal,
        date: NaiveDate,
        reason: &str,
        commission: Decimal,
        slippage: Decimal,
    ) -> Option<Decimal> {
        let position = self.positions.remove(symbol)?;
        let fees = commission + slippage;

        let pnl = match position.direction {
            Direction::Long => {
                let proceeds = price * position.qty - fees;
                self.cash += proceeds;
                (price - position.avg_price) * position.qty - fees
            }
            Direction::Short => {
                let margin_released = position.avg_price * position.qty * dec!(0.5);
                let price_pnl = (position.avg_price - price) * position.qty;
                self.cash += margin_released + price_pnl - fees;
                price_pnl - fees
            }
        };

        if let Some(trade) = self
            .trades
            .iter_mut()
            .rev()
            .find(|t| t.symbol == symbol && t.is_open)
        {
            trade.exit_date = Some(date);
            trade.exit_price = Some(price);
            trade.commission += commission;
            trade.slippage += slippage;
            trade.pnl = Some(pnl);
            trade.is_open = false;
            trade.exit_reason = Some(reason.to_string());
        }

        Some(pnl)
    }

    /// Marks every open position to `prices`, recomputing unrealized P&L,
    /// the trailing-stop peak, and days held.
    pub fn update(&mut self, prices: &HashMap<String, Decimal>) {
        for position in self.positions.values_mut() {
            if let Some(&price) = prices.get(&position.symbol) {
                position.unrealized_pnl = match position.direction {
                    Direction::Long => (price - position.avg_price) * position.qty,
                    Direction::Short => (position.avg_price - price) * position.qty,
                };
                position.peak_price = match position.direction {
                    Direction::Long => position.peak_price.max(price),
                    Direction::Short => position.peak_price.min(price),
                };
                position.days_held += 1;
            }
        }
    }

    /// Evaluates stop-loss / take-profit / trailing-stop for every open
    /// position, closing those that trigger. Returns the symbols closed
    /// this bar with their exit reason.
    pub fn check_exits(
        &mut self,
        prices: &HashMap<String, Decimal>,
        date: NaiveDate,
        constraints: &Constraints,
    ) -> Vec<(String, &'static str)> {
        let mut to_close = Vec::new();
        for (symbol, position) in &self.positions {
            if let Some(&price) = prices.get(symbol) {
                if let Some(reason) = protective_exit::check(position, price, constraints) {
                    to_close.push((symbol.clone(), price, reason));
                }
            }
        }

        let mut closed = Vec::new();
        for (symbol, price, reason) in to_close {
            self.close(&symbol, price, date, reason.as_str(), Decimal::ZERO, Decimal::ZERO);
            closed.push((symbol, reason.as_str()));
        }
        closed
    }

    /// Computes equity from `cash` plus every open position valued at
    /// `prices`, updates `peak_equity`, and pushes a snapshot.
    pub fn record(&mut self, date: NaiveDate, prices: &HashMap<String, Decimal>) {
        let positions_value: Decimal = self
            .positions
            .values()
            .map(|p| self.position_value(p, prices))
            .sum();

        let equity = self.cash + positions_value;
        self.peak_equity = self.peak_equity.max(equity);
        let drawdown = (self.peak_equity - equity).max(Decimal::ZERO);
        let drawdown_pct = if self.peak_equity > Decimal::ZERO {
            use rust_decimal::prelude::ToPrimitive;
            (drawdown / self.peak_equity * Decimal::from(100)).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        self.snapshots.push(PortfolioSnapshot {
            date,
            cash: self.cash,
            positions_value,
            equity,
            drawdown,
            drawdown_pct,
        });
    }

    fn position_value(&self, position: &Position, prices: &HashMap<String, Decimal>) -> Decimal {
        match position.direction {
            Direction::Long => {
                let price = prices.get(&position.symbol).copied().unwrap_or(position.avg_price);
                position.qty * price
            }
            Direction::Short => {
                let margin_reserved = position.avg_price * position.qty * dec!(0.5);
                margin_reserved + position.unrealized_pnl
            }
        }
    }

    pub fn equity(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        let positions_value: Decimal = self.positions.values().map(|p| self.position_value(p, prices)).sum();
        self.cash + positions_value
    }

    /// Adjusts a long position toward a rebalance target by `delta_qty`
    /// shares (positive to buy more, negative to sell some). Unlike
    /// `open`/`close`, this mutates an existing position's quantity in
    /// place rather than treating the change as a new trade; the open
    /// trade's average price updates on additions, and partial reductions
    /// realize no pnl until the position fully closes; only a full exit
    /// (via `close`) settles the trade.
    pub fn rebalance_adjust(
        &mut self,
        symbol: &str,
        delta_qty: Decimal,
        price: Decimal,
        date: NaiveDate,
        commission: Decimal,
        slippage: Decimal,
        reason: &str,
    ) {
        if delta_qty == Decimal::ZERO {
            return;
        }

        if !self.positions.contains_key(symbol) {
            if delta_qty > Decimal::ZERO {
                self.open(symbol, delta_qty, price, Direction::Long, date, commission, slippage, reason);
            }
            return;
        }

        let position = self.positions.get(symbol).expect("checked above");
        let new_qty = position.qty + delta_qty;

        if new_qty <= Decimal::ZERO {
            self.close(symbol, price, date, reason, commission, slippage);
            return;
        }

        if delta_qty > Decimal::ZERO {
            let cost = delta_qty * price + commission + slippage;
            self.cash -= cost;
            let position = self.positions.get_mut(symbol).expect("checked above");
            position.avg_price = (position.avg_price * position.qty + price * delta_qty) / new_qty;
            position.qty = new_qty;
        } else {
            let sold = -delta_qty;
            let proceeds = sold * price - commission - slippage;
            self.cash += proceeds;
            let position = self.positions.get_mut(symbol).expect("checked above");
            position.qty = new_qty;
        }

        if let Some(trade) = self.trades.iter_mut().rev().find(|t| t.symbol == symbol && t.is_open) {
            trade.qty = new_qty;
            trade.commission += commission;
            trade.slippage += slippage;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn prices(symbol: &str, price: Decimal) -> HashMap<String, Decimal> {
        let mut m = HashMap::new();
        m.insert(symbol.to_string(), price);
        m
    }

    #[test]
    fn open_deducts_cash_including_fees() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        let opened = book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), dec!(5), dec!(1), "entry");
        assert!(opened);
        assert_eq!(book.cash, dec!(10000) - dec!(1000) - dec!(6));
        assert_eq!(book.positions.len(), 1);
    }

    #[test]
    fn open_shrinks_quantity_when_cash_insufficient() {
        let mut book = PortfolioBookkeeper::new(dec!(500));
        let opened = book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        assert!(opened);
        assert_eq!(book.positions["AAA"].qty, dec!(5));
        assert!(book.cash >= Decimal::ZERO);
    }

    #[test]
    fn cannot_open_second_position_in_same_symbol() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        let second = book.open("AAA", dec!(5), dec!(100), Direction::Long, date(2), Decimal::ZERO, Decimal::ZERO, "entry2");
        assert!(!second);
        assert_eq!(book.positions["AAA"].qty, dec!(10));
    }

    #[test]
    fn close_credits_cash_and_settles_trade_pnl() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        let pnl = book.close("AAA", dec!(110), date(2), "exit", Decimal::ZERO, Decimal::ZERO);
        assert_eq!(pnl, Some(dec!(100)));
        assert!(book.positions.is_empty());
        assert_eq!(book.cash, dec!(10000) + dec!(100));
        let trade = book.trades.last().unwrap();
        assert!(!trade.is_open);
        assert_eq!(trade.pnl, Some(dec!(100)));
    }

    #[test]
    fn update_tracks_peak_price_and_days_held() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        book.update(&prices("AAA", dec!(120)));
        book.update(&prices("AAA", dec!(110)));
        let position = &book.positions["AAA"];
        assert_eq!(position.peak_price, dec!(120));
        assert_eq!(position.days_held, 2);
        assert_eq!(position.unrealized_pnl, dec!(100));
    }

    #[test]
    fn check_exits_closes_triggered_positions() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        let constraints = Constraints { stop_loss: Some(5.0), ..Default::default() };
        let closed = book.check_exits(&prices("AAA", dec!(90)), date(2), &constraints);
        assert_eq!(closed, vec![("AAA".to_string(), "stop_loss")]);
        assert!(book.positions.is_empty());
    }

    #[test]
    fn record_tracks_monotone_peak_equity_and_drawdown() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        book.record(date(1), &prices("AAA", dec!(100)));
        book.update(&prices("AAA", dec!(150)));
        book.record(date(2), &prices("AAA", dec!(150)));
        assert_eq!(book.peak_equity, dec!(10500));
        book.update(&prices("AAA", dec!(120)));
        book.record(date(3), &prices("AAA", dec!(120)));
        assert_eq!(book.peak_equity, dec!(10500));
        let last = book.snapshots.last().unwrap();
        assert_eq!(last.equity, dec!(10200));
        assert!(last.drawdown_pct > 0.0);
    }

    #[test]
    fn rebalance_adjust_opens_new_long_position() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.rebalance_adjust("AAA", dec!(10), dec!(100), date(1), Decimal::ZERO, Decimal::ZERO, "rebalance");
        assert_eq!(book.positions["AAA"].qty, dec!(10));
        assert_eq!(book.cash, dec!(9000));
    }

    #[test]
    fn rebalance_adjust_blends_average_price_on_addition() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        book.rebalance_adjust("AAA", dec!(10), dec!(120), date(2), Decimal::ZERO, Decimal::ZERO, "rebalance");
        let position = &book.positions["AAA"];
        assert_eq!(position.qty, dec!(20));
        assert_eq!(position.avg_price, dec!(110));
    }

    #[test]
    fn rebalance_adjust_closes_position_when_delta_fully_offsets() {
        let mut book = PortfolioBookkeeper::new(dec!(10000));
        book.open("AAA", dec!(10), dec!(100), Direction::Long, date(1), Decimal::ZERO, Decimal::ZERO, "entry");
        book.rebalance_adjust("AAA", dec!(-10), dec!(105), date(2), Decimal::ZERO, Decimal::ZERO, "rebalance");
        assert!(book.positions.is_empty());
    }
}
