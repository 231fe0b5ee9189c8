//! Order execution: lot rounding, slippage, commission.
//!
//! `BacktestExecutor` is one implementation of the `Executor` trait; paper
//! and live adapters would implement the same interface and the engine
//! never branches on which one is in use.

use rust_decimal::Decimal;

use crate::models::{CommissionTier, Fill, OrderRequest, TradeDirection};

pub trait Executor: Send + Sync {
    fn execute(&self, order: &OrderRequest) -> Option<Fill>;
}

pub struct BacktestExecutor {
    pub lot_size: Decimal,
    pub commission_rate: f64,
    pub slippage_rate: f64,
    pub tiered_commission: Vec<CommissionTier>,
}

impl BacktestExecutor {
    pub fn new(
        lot_size: Decimal,
        commission_rate: f64,
        slippage_rate: f64,
        tiered_commission: Vec<CommissionTier>,
    ) -> Self {
        BacktestExecutor {
            lot_size,
            commission_rate,
            slippage_rate,
            tiered_commission,
        }
    }

    fn round_to_lot(&self, quantity: Decimal) -> Decimal {
        if self.lot_size <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.lot_size).trunc() * self.lot_size
    }

    fn apply_slippage(&self, price: Decimal, direction: TradeDirection) -> Decimal {
        use rust_decimal::prelude::FromPrimitive;
        let s = Decimal::from_f64(self.slippage_rate).unwrap_or(Decimal::ZERO);
        match direction {
            TradeDirection::Buy | TradeDirection::Cover => price * (Decimal::ONE + s),
            TradeDirection::Sell | TradeDirection::Short => price * (Decimal::ONE - s),
            TradeDirection::Close => price,
        }
    }

    fn commission(&self, trade_value: Decimal) -> Decimal {
        use rust_decimal::prelude::FromPrimitive;
        if !self.tiered_commission.is_empty() {
            return compute_tiered_commission(&self.tiered_commission, trade_value);
        }
        trade_value * Decimal::from_f64(self.commission_rate).unwrap_or(Decimal::ZERO)
    }
}

/// Walks the tiered schedule in order and returns the first matching tier's
/// fee. Tiers are expected ordered low-to-high by bound.
pub fn compute_tiered_commission(tiers: &[CommissionTier], trade_value: Decimal) -> Decimal {
    for tier in tiers {
        if let Some(up_to) = tier.up_to {
            if trade_value <= up_to {
                return tier.fee;
            }
        } else if let Some(above) = tier.above {
            if trade_value > above {
                return tier.fee;
            }
        }
    }
    Decimal::ZERO
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::models::OrderType;

    fn executor(lot_size: Decimal, commission_rate: f64, slippage_rate: f64) -> BacktestExecutor {
        BacktestExecutor::new(lot_size, commission_rate, slippage_rate, vec![])
    }

    #[test]
    fn rounds_quantity_down_to_lot_size() {
        let e = executor(dec!(100), 0.0, 0.0);
        let order = OrderRequest {
            symbol: "AAA".to_string(),
            direction: TradeDirection::Buy,
            quantity: dec!(4350),
            price: dec!(10),
            order_type: OrderType::Market,
        };
        let fill = e.execute(&order).unwrap();
        assert_eq!(fill.quantity, dec!(4300));
    }

    #[test]
    fn buy_slippage_increases_fill_price() {
        let e = executor(dec!(1), 0.0, 0.01);
        let order = OrderRequest {
            symbol: "AAA".to_string(),
            direction: TradeDirection::Buy,
            quantity: dec!(10),
            price: dec!(100),
            order_type: OrderType::Market,
        };
        let fill = e.execute(&order).unwrap();
        assert_eq!(fill.fill_price, dec!(101));
    }

    #[test]
    fn sell_slippage_decreases_fill_price() {
        let e = executor(dec!(1), 0.0, 0.01);
        let order = OrderRequest {
            symbol: "AAA".to_string(),
            direction: TradeDirection::Sell,
            quantity: dec!(10),
            price: dec!(100),
            order_type: OrderType::Market,
        };
        let fill = e.execute(&order).unwrap();
        assert_eq!(fill.fill_price, dec!(99));
    }

    #[test]
    fn tiered_commission_picks_matching_bracket() {
        let tiers = vec![
            CommissionTier { up_to: Some(dec!(1000)), above: None, fee: dec!(5) },
            CommissionTier { up_to: Some(dec!(10000)), above: None, fee: dec!(20) },
            CommissionTier { up_to: None, above: Some(dec!(10000)), fee: dec!(55) },
        ];
        assert_eq!(compute_tiered_commission(&tiers, dec!(500)), dec!(5));
        assert_eq!(compute_tiered_commission(&tiers, dec!(10000)), dec!(20));
        assert_eq!(compute_tiered_commission(&tiers, dec!(10001)), dec!(55));
    }

    #[test]
    fn quantity_rounding_to_zero_rejects_order() {
        let e = executor(dec!(100), 0.0, 0.0);
        let order = OrderRequest {
            symbol: "AAA".to_string(),
            direction: TradeDirection::Buy,
            quantity: dec!(40),
            price: dec!(10),
            order_type: OrderType::Market,
        };
        assert!(e.execute(&order).is_none());
    }

    #[test]
    fn non_positive_price_rejects_order() {
        let e = executor(dec!(1), 0.0, 0.0);
        let order = OrderRequest {
            symbol: "AAA".to_string(),
            direction: TradeDirection::Buy,
            quantity: dec!(10),
            price: Decimal::ZERO,
            order_type: OrderType::Market,
        };
        assert!(e.execute(&order).is_none());
    }
}

impl Executor for BacktestExecutor {
    fn execute(&self, order: &OrderRequest) -> Option<Fill> {
        if order.price <= Decimal::ZERO {
            tracing::warn!(symbol = %order.symbol, "order rejected: non-positive price");
            return None;
        }

        let quantity = self.round_to_lot(order.quantity);
        if quantity <= Decimal::ZERO {
            tracing::debug!(
                symbol = %order.symbol,
                requested = %order.quantity,
                lot_size = %self.lot_size,
                "order rounds to zero shares, rejected"
            );
            return None;
        }

        let fill_price = self.apply_slippage(order.price, order.direction);
        let trade_value = fill_price * quantity;
        let commission = self.commission(trade_value);
        let slippage = (fill_price - order.price).abs() * quantity;

        Some(Fill {
            symbol: order.symbol.clone(),
            direction: order.direction,
            quantity,
            fill_price,
            commission,
            slippage,
        })
    }
}
