use analysis_core::{FilterViolation, PipelineError, PipelineResult, SymbolFilters};
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How much capital one trade commits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum SizingMode {
    /// Fixed quote-currency amount per trade (capped at the balance)
    FixedNotional(f64),
    /// Percentage of the current balance (e.g. 10.0 = 10%)
    PercentOfBalance(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub mode: SizingMode,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            mode: SizingMode::PercentOfBalance(10.0),
        }
    }
}

impl SizingConfig {
    pub fn fixed(notional: f64) -> Self {
        Self {
            mode: SizingMode::FixedNotional(notional),
        }
    }

    pub fn percent(percent: f64) -> Self {
        Self {
            mode: SizingMode::PercentOfBalance(percent),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        match self.mode {
            SizingMode::FixedNotional(v) if !(v.is_finite() && v > 0.0) => Err(
                PipelineError::config(format!("fixed notional must be positive, got {}", v)),
            ),
            SizingMode::PercentOfBalance(p) if !(p > 0.0 && p <= 100.0) => Err(
                PipelineError::config(format!("position percent must be in (0, 100], got {}", p)),
            ),
            _ => Ok(()),
        }
    }
}

/// Why no order quantity could be produced
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingRejection {
    #[error("invalid sizing input: {0}")]
    InvalidInput(String),

    #[error("raw quantity {raw_quantity} rounds to zero at step size {step_size}")]
    ZeroAfterRounding {
        raw_quantity: Decimal,
        step_size: Decimal,
    },

    #[error("quantity {quantity} below minimum quantity {min_qty}")]
    BelowMinQuantity { quantity: Decimal, min_qty: Decimal },

    #[error("notional {notional} of quantity {quantity} below minimum notional {min_notional}")]
    BelowMinNotional {
        quantity: Decimal,
        notional: Decimal,
        min_notional: Decimal,
    },
}

impl From<SizingRejection> for PipelineError {
    fn from(rejection: SizingRejection) -> Self {
        PipelineError::Validation(rejection.to_string())
    }
}

/// Exchange-valid order size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    /// Step-rounded quantity to order
    pub quantity: Decimal,

    /// Quantity before rounding
    pub raw_quantity: Decimal,

    /// Capital committed before leverage
    pub capital: Decimal,

    /// Capital times leverage
    pub buying_power: Decimal,

    /// quantity * price
    pub notional: Decimal,

    pub reasoning: String,
}

pub struct PositionSizer;

fn to_decimal(name: &str, value: f64) -> Result<Decimal, SizingRejection> {
    if !value.is_finite() {
        return Err(SizingRejection::InvalidInput(format!("{} is not finite", name)));
    }
    Decimal::try_from(value)
        .map_err(|e| SizingRejection::InvalidInput(format!("{} {}: {}", name, value, e)))
}

fn overflow(what: &str) -> SizingRejection {
    SizingRejection::InvalidInput(format!("{} overflows decimal range", what))
}

impl PositionSizer {
    /// Size one entry. Raw quantity is `capital * leverage / price`, rounded
    /// down to the step size and checked against the symbol minimums. Never
    /// rounds up and never falls back to another mode.
    pub fn calculate_position_size(
        balance: f64,
        price: f64,
        leverage: f64,
        config: &SizingConfig,
        filters: &SymbolFilters,
    ) -> Result<PositionSize, SizingRejection> {
        if !(balance.is_finite() && balance > 0.0) {
            return Err(SizingRejection::InvalidInput(format!(
                "balance must be positive, got {}",
                balance
            )));
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(SizingRejection::InvalidInput(format!(
                "price must be positive, got {}",
                price
            )));
        }
        if !(leverage.is_finite() && leverage >= 1.0) {
            return Err(SizingRejection::InvalidInput(format!(
                "leverage must be at least 1, got {}",
                leverage
            )));
        }
        config
            .validate()
            .map_err(|e| SizingRejection::InvalidInput(e.to_string()))?;

        let balance_d = to_decimal("balance", balance)?;
        let price_d = to_decimal("price", price)?;
        let leverage_d = to_decimal("leverage", leverage)?;
        if price_d.is_zero() {
            return Err(SizingRejection::InvalidInput(format!(
                "price {} is below decimal precision",
                price
            )));
        }

        let (capital, basis) = match config.mode {
            SizingMode::FixedNotional(notional) => {
                let notional = to_decimal("fixed notional", notional)?;
                if notional > balance_d {
                    debug!("Fixed notional {} capped at balance {}", notional, balance_d);
                }
                (notional.min(balance_d), format!("fixed ${}", notional))
            }
            SizingMode::PercentOfBalance(percent) => {
                let percent_d = to_decimal("position percent", percent)?;
                let capital = balance_d
                    .checked_mul(percent_d)
                    .map(|v| v / Decimal::ONE_HUNDRED)
                    .ok_or_else(|| overflow("capital"))?;
                (capital, format!("{}% of ${}", percent, balance_d))
            }
        };

        let buying_power = capital
            .checked_mul(leverage_d)
            .ok_or_else(|| overflow("buying power"))?;
        let raw_quantity = buying_power
            .checked_div(price_d)
            .ok_or_else(|| overflow("raw quantity"))?;
        let quantity = filters
            .round_down(raw_quantity)
            .ok_or_else(|| overflow("step-rounded quantity"))?;

        debug!(
            "Sizing: capital {} x{} = {} / {} -> raw {} -> {} (step {})",
            capital, leverage_d, buying_power, price_d, raw_quantity, quantity, filters.step_size
        );

        filters
            .validate(quantity, price_d)
            .map_err(|violation| match violation {
                FilterViolation::ZeroAfterRounding { step_size } => {
                    SizingRejection::ZeroAfterRounding {
                        raw_quantity,
                        step_size,
                    }
                }
                FilterViolation::BelowMinQuantity { quantity, min_qty } => {
                    SizingRejection::BelowMinQuantity { quantity, min_qty }
                }
                FilterViolation::BelowMinNotional {
                    notional,
                    min_notional,
                } => SizingRejection::BelowMinNotional {
                    quantity,
                    notional,
                    min_notional,
                },
            })?;

        let notional = quantity * price_d;
        let reasoning = format!(
            "{} = ${} x{} leverage = ${} buying power, {} units at ${}",
            basis,
            capital.normalize(),
            leverage_d.normalize(),
            buying_power.normalize(),
            quantity,
            price_d.normalize()
        );

        Ok(PositionSize {
            quantity,
            raw_quantity,
            capital,
            buying_power,
            notional,
            reasoning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal_macros::dec;

    fn filters(step: Decimal, min_notional: Decimal) -> SymbolFilters {
        SymbolFilters::new(step, step, min_notional)
    }

    #[test]
    fn test_scenario_b_percent_of_balance_with_leverage() {
        let config = SizingConfig::percent(10.0);

        let coarse = PositionSizer::calculate_position_size(
            100.0,
            70_000.0,
            10.0,
            &config,
            &filters(dec!(0.001), dec!(5)),
        )
        .unwrap();

        assert_eq!(coarse.capital, dec!(10));
        assert_eq!(coarse.buying_power, dec!(100));
        assert_relative_eq!(coarse.raw_quantity.to_f64().unwrap(), 0.0014286, epsilon = 1e-7);
        assert_eq!(coarse.quantity, dec!(0.001));
        assert_eq!(coarse.notional, dec!(70));

        let fine = PositionSizer::calculate_position_size(
            100.0,
            70_000.0,
            10.0,
            &config,
            &filters(dec!(0.0001), dec!(5)),
        )
        .unwrap();
        assert_eq!(fine.quantity, dec!(0.0014));
    }

    #[test]
    fn test_rejects_below_min_notional_instead_of_upsizing() {
        let result = PositionSizer::calculate_position_size(
            100.0,
            70_000.0,
            10.0,
            &SizingConfig::percent(10.0),
            &filters(dec!(0.001), dec!(100)),
        );

        match result {
            Err(SizingRejection::BelowMinNotional {
                quantity,
                notional,
                min_notional,
            }) => {
                assert_eq!(quantity, dec!(0.001));
                assert_eq!(notional, dec!(70));
                assert_eq!(min_notional, dec!(100));
            }
            other => panic!("expected BelowMinNotional, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_after_rounding() {
        let result = PositionSizer::calculate_position_size(
            10.0,
            70_000.0,
            1.0,
            &SizingConfig::percent(10.0),
            &filters(dec!(0.001), dec!(5)),
        );
        assert!(matches!(result, Err(SizingRejection::ZeroAfterRounding { .. })));
    }

    #[test]
    fn test_rejects_below_min_quantity() {
        let filters = SymbolFilters::new(dec!(0.001), dec!(0.01), dec!(5));
        let result = PositionSizer::calculate_position_size(
            1000.0,
            70_000.0,
            1.0,
            &SizingConfig::percent(50.0),
            &filters,
        );
        assert!(matches!(result, Err(SizingRejection::BelowMinQuantity { .. })));
    }

    #[test]
    fn test_fixed_notional_is_capped_at_balance() {
        let size = PositionSizer::calculate_position_size(
            50.0,
            2.5,
            2.0,
            &SizingConfig::fixed(100.0),
            &filters(dec!(1), dec!(1)),
        )
        .unwrap();

        assert_eq!(size.capital, dec!(50));
        assert_eq!(size.quantity, dec!(40));
    }

    #[test]
    fn test_quantity_never_exceeds_buying_power() {
        let config = SizingConfig::percent(100.0);
        for price in [0.37, 13.1, 2_345.67, 69_999.99] {
            let size = PositionSizer::calculate_position_size(
                1000.0,
                price,
                3.0,
                &config,
                &filters(dec!(0.0001), dec!(0)),
            )
            .unwrap();

            let max = 1000.0 * 3.0 / price;
            assert!(size.quantity.to_f64().unwrap() <= max);
            assert_eq!(size.quantity % dec!(0.0001), Decimal::ZERO);
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let f = filters(dec!(0.001), dec!(5));
        let config = SizingConfig::default();
        assert!(matches!(
            PositionSizer::calculate_position_size(0.0, 100.0, 1.0, &config, &f),
            Err(SizingRejection::InvalidInput(_))
        ));
        assert!(matches!(
            PositionSizer::calculate_position_size(100.0, 100.0, 0.5, &config, &f),
            Err(SizingRejection::InvalidInput(_))
        ));
        assert!(matches!(
            PositionSizer::calculate_position_size(100.0, f64::NAN, 1.0, &config, &f),
            Err(SizingRejection::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sub_precision_price_is_rejected() {
        let result = PositionSizer::calculate_position_size(
            100.0,
            1e-30,
            1.0,
            &SizingConfig::percent(10.0),
            &filters(dec!(1), dec!(0)),
        );
        assert!(matches!(result, Err(SizingRejection::InvalidInput(_))));
    }

    #[test]
    fn test_overflowing_quantity_is_rejected() {
        let result = PositionSizer::calculate_position_size(
            1e9,
            1e-20,
            100.0,
            &SizingConfig::percent(100.0),
            &filters(dec!(0.000001), dec!(0)),
        );
        assert!(matches!(result, Err(SizingRejection::InvalidInput(_))));
    }

    #[test]
    fn test_config_validation() {
        assert!(SizingConfig::percent(10.0).validate().is_ok());
        assert!(SizingConfig::percent(0.0).validate().is_err());
        assert!(SizingConfig::percent(150.0).validate().is_err());
        assert!(SizingConfig::fixed(-5.0).validate().is_err());
    }

    #[test]
    fn test_rejection_converts_to_validation_error() {
        let err: PipelineError = SizingRejection::InvalidInput("x".into()).into();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
