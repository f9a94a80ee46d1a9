use crate::events::Side;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Parameters for risk-based sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Taker fee rate charged on entry and exit.
    pub taker_fee: Decimal,
    /// Smallest tradable quantity.
    pub min_quantity: Decimal,
    /// Smallest tradable notional (quantity × entry).
    pub min_notional: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            taker_fee: dec!(0.001),
            min_quantity: dec!(0.001),
            min_notional: dec!(10),
        }
    }
}

/// Converts a risk budget into a position quantity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    #[must_use]
    pub const fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Quantity such that hitting the stop loses `equity × risk_pct`,
    /// including round-trip fee erosion.
    ///
    /// Returns zero instead of failing when an input is non-positive, the
    /// stop sits on the wrong side of entry, or the result falls below the
    /// minimum quantity or notional.
    #[must_use]
    pub fn calculate(
        &self,
        equity: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        risk_pct: Decimal,
        side: Side,
    ) -> Decimal {
        if equity <= Decimal::ZERO || entry_price <= Decimal::ZERO || stop_loss <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        if !stop_on_protective_side(side, entry_price, stop_loss) {
            debug!(%side, %entry_price, %stop_loss, "Stop on wrong side of entry");
            return Decimal::ZERO;
        }

        let risk_amount = equity * risk_pct;
        let risk_per_unit = (entry_price - stop_loss).abs();
        let effective_risk_per_unit = risk_per_unit + entry_price * self.config.taker_fee;
        if effective_risk_per_unit <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let quantity = risk_amount / effective_risk_per_unit;
        if self.meets_minimums(quantity, entry_price) {
            quantity
        } else {
            debug!(%quantity, %entry_price, "Sized quantity below exchange minimums");
            Decimal::ZERO
        }
    }

    #[must_use]
    pub fn meets_minimums(&self, quantity: Decimal, price: Decimal) -> bool {
        quantity >= self.config.min_quantity && quantity * price >= self.config.min_notional
    }
}

/// Long stops sit below entry, short stops above.
#[must_use]
pub fn stop_on_protective_side(side: Side, entry_price: Decimal, stop_loss: Decimal) -> bool {
    match side {
        Side::Buy => stop_loss < entry_price,
        Side::Sell => stop_loss > entry_price,
    }
}

/// Margin locked for a position of `position_value` at `leverage`.
#[must_use]
pub fn calculate_required_margin(position_value: Decimal, leverage: u32) -> Decimal {
    if leverage == 0 {
        return position_value;
    }
    position_value / Decimal::from(leverage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_adjusted_sizing() {
        let sizer = PositionSizer::default();
        let quantity = sizer.calculate(dec!(10000), dec!(50000), dec!(49000), dec!(0.002), Side::Buy);

        // $20 risk over $1000 stop distance plus $50 fee erosion per unit
        assert_eq!(quantity, dec!(20) / dec!(1050));
        assert!((quantity - dec!(0.019048)).abs() < dec!(0.000001));
        assert!((quantity * dec!(50000) - dec!(952.4)).abs() < dec!(0.01));
    }

    #[test]
    fn test_short_sizing_mirrors_long() {
        let sizer = PositionSizer::default();
        let quantity = sizer.calculate(dec!(10000), dec!(50000), dec!(51000), dec!(0.002), Side::Sell);
        assert_eq!(quantity, dec!(20) / dec!(1050));
    }

    #[test]
    fn test_invalid_inputs_return_zero() {
        let sizer = PositionSizer::default();
        assert_eq!(sizer.calculate(dec!(0), dec!(100), dec!(90), dec!(0.01), Side::Buy), Decimal::ZERO);
        assert_eq!(sizer.calculate(dec!(1000), dec!(0), dec!(90), dec!(0.01), Side::Buy), Decimal::ZERO);
        assert_eq!(sizer.calculate(dec!(1000), dec!(100), dec!(0), dec!(0.01), Side::Buy), Decimal::ZERO);
        // wrong-side stops
        assert_eq!(sizer.calculate(dec!(1000), dec!(100), dec!(110), dec!(0.01), Side::Buy), Decimal::ZERO);
        assert_eq!(sizer.calculate(dec!(1000), dec!(100), dec!(90), dec!(0.01), Side::Sell), Decimal::ZERO);
        assert_eq!(sizer.calculate(dec!(1000), dec!(100), dec!(100), dec!(0.01), Side::Buy), Decimal::ZERO);
    }

    #[test]
    fn test_minimum_notional_floor() {
        let sizer = PositionSizer::default();
        // $1 risk, $10 stop distance -> ~0.0999 units at $100 = ~$9.99 notional
        let quantity = sizer.calculate(dec!(100), dec!(100), dec!(90), dec!(0.01), Side::Buy);
        assert_eq!(quantity, Decimal::ZERO);
    }

    #[test]
    fn test_minimum_quantity_floor() {
        let sizer = PositionSizer::new(SizingConfig {
            min_notional: Decimal::ZERO,
            ..SizingConfig::default()
        });
        let quantity = sizer.calculate(dec!(1000), dec!(60000), dec!(50000), dec!(0.002), Side::Buy);
        assert_eq!(quantity, Decimal::ZERO);
    }

    #[test]
    fn test_required_margin() {
        assert_eq!(calculate_required_margin(dec!(5000), 10), dec!(500));
        assert_eq!(calculate_required_margin(dec!(5000), 0), dec!(5000));
    }
}
