//! Per-bar stop-loss / take-profit / trailing-stop enforcement.
//!
//! Checked in a fixed order: stop loss, then take profit, then trailing
//! stop. The first hit wins. `Position::peak_price` is the
//! highest (long) or lowest (short) close seen since entry; `update`
//! refreshes it every bar before this check runs.

use rust_decimal::Decimal;

use crate::models::{Constraints, Direction, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
        }
    }
}

/// Returns the first protective exit that fires for `position` at the
/// current close `price`, or `None` if none do.
pub fn check(position: &Position, price: Decimal, constraints: &Constraints) -> Option<ExitReason> {
    let entry = position.avg_price;
    let is_long = position.direction == Direction::Long;

    if let Some(pct) = constraints.stop_loss {
        let threshold = pct_of(entry, pct);
        let hit = if is_long {
            price <= entry - threshold
        } else {
            price >= entry + threshold
        };
        if hit {
            return Some(ExitReason::StopLoss);
        }
    }

    if let Some(pct) = constraints.take_profit {
        let threshold = pct_of(entry, pct);
        let hit = if is_long {
            price >= entry + threshold
        } else {
            price <= entry - threshold
        };
        if hit {
            return Some(ExitReason::TakeProfit);
        }
    }

    if let Some(pct) = constraints.trailing_stop {
        let favorable = if is_long {
            position.unrealized_pnl > Decimal::ZERO
        } else {
            position.unrealized_pnl > Decimal::ZERO
        };
        if favorable {
            let peak = position.peak_price;
            let threshold = pct_of(peak, pct);
            let hit = if is_long {
                price <= peak - threshold
            } else {
                price >= peak + threshold
            };
            if hit {
                return Some(ExitReason::TrailingStop);
            }
        }
    }

    None
}

fn pct_of(base: Decimal, pct: f64) -> Decimal {
    use rust_decimal::prelude::FromPrimitive;
    base * Decimal::from_f64(pct / 100.0).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use super::*;

    fn long_position(avg_price: Decimal, peak_price: Decimal, unrealized_pnl: Decimal) -> Position {
        Position {
            symbol: "AAA".to_string(),
            qty: dec!(10),
            avg_price,
            direction: Direction::Long,
            entry_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            unrealized_pnl,
            days_held: 3,
            peak_price,
        }
    }

    #[test]
    fn stop_loss_fires_before_take_profit() {
        let position = long_position(dec!(100), dec!(100), Decimal::ZERO);
        let constraints = Constraints {
            stop_loss: Some(5.0),
            take_profit: Some(1.0),
            ..Default::default()
        };
        // Price drops below both thresholds; stop loss wins due to check order.
        assert_eq!(check(&position, dec!(90), &constraints), Some(ExitReason::StopLoss));
    }

    #[test]
    fn take_profit_fires_on_upside() {
        let position = long_position(dec!(100), dec!(100), Decimal::ZERO);
        let constraints = Constraints { take_profit: Some(10.0), ..Default::default() };
        assert_eq!(check(&position, dec!(111), &constraints), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn trailing_stop_requires_favorable_position() {
        let position = long_position(dec!(100), dec!(100), -dec!(1));
        let constraints = Constraints { trailing_stop: Some(5.0), ..Default::default() };
        assert_eq!(check(&position, dec!(90), &constraints), None);
    }

    #[test]
    fn trailing_stop_tracks_peak_not_entry() {
        let position = long_position(dec!(100), dec!(120), dec!(5));
        let constraints = Constraints { trailing_stop: Some(10.0), ..Default::default() };
        // Peak is 120, threshold is 12, so 107 triggers even though entry was 100.
        assert_eq!(check(&position, dec!(107), &constraints), Some(ExitReason::TrailingStop));
        assert_eq!(check(&position, dec!(109), &constraints), None);
    }

    #[test]
    fn no_constraints_never_exits() {
        let position = long_position(dec!(100), dec!(100), Decimal::ZERO);
        assert_eq!(check(&position, dec!(1), &Constraints::default()), None);
    }
}
