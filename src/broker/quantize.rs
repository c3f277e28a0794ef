// =============================================================================
// Lot-size / min-notional quantization
// =============================================================================
//
// Mirrors the exchange's exact rounding and minimum-order-value rules:
//   1. Reject outright if the raw (unrounded) notional is below the minimum.
//   2. Round the quantity down to a multiple of the step size.
//   3. If rounding down pushed the notional back under the minimum, try
//      rounding *up* to the smallest step-size multiple that clears it.
//   4. If that still doesn't clear the minimum, the lot size is
//      unsatisfiable for this price/quantity and the order is rejected.
// =============================================================================

use crate::errors::{BrokerError, BrokerResult};

/// Conservative fallback used when a symbol has no entry in the static
/// table: a fine step size and a $10 minimum notional.
const DEFAULT_STEP_SIZE: f64 = 0.00001;
const DEFAULT_MIN_NOTIONAL: f64 = 10.0;

fn lot_table(symbol: &str) -> (f64, f64) {
    match symbol.to_uppercase().as_str() {
        "BTC" => (0.00001, 10.0),
        "ETH" => (0.0001, 10.0),
        "SOL" => (0.01, 10.0),
        "BNB" => (0.001, 10.0),
        "XRP" => (1.0, 10.0),
        "DOGE" => (1.0, 10.0),
        _ => (DEFAULT_STEP_SIZE, DEFAULT_MIN_NOTIONAL),
    }
}

/// Whether `symbol` is a traded pair the exchange actually lists. Backed by
/// the same table `lot_table` uses, minus its unknown-symbol fallback —
/// callers that need to fail closed on an unrecognized symbol (C1's
/// `execute_order`/`map_symbol_to_pair`) check this before touching
/// `quantize_order`, whose fallback exists for a different purpose: never
/// blocking *quantization* just because a symbol isn't in the table yet.
pub fn is_known_symbol(symbol: &str) -> bool {
    matches!(symbol.to_uppercase().as_str(), "BTC" | "ETH" | "SOL" | "BNB" | "XRP" | "DOGE")
}

/// Quantize `quantity` for `symbol` at reference `price`, returning the
/// adjusted quantity that satisfies both the step-size and min-notional
/// constraints, or the specific `BrokerError` that explains why it can't.
pub fn quantize_order(symbol: &str, quantity: f64, price: f64) -> BrokerResult<f64> {
    let (step_size, min_notional) = lot_table(symbol);

    let estimated_notional = quantity * price;
    if estimated_notional < min_notional {
        return Err(BrokerError::NotionalBelowMin {
            symbol: symbol.to_string(),
            notional: estimated_notional,
            min_notional,
        });
    }

    let mut adjusted = (quantity / step_size).floor() * step_size;
    if adjusted <= 0.0 {
        return Err(BrokerError::LotSizeUnsatisfiable {
            symbol: symbol.to_string(),
        });
    }

    let adjusted_notional = adjusted * price;
    if adjusted_notional < min_notional {
        let mut min_quantity_needed = (min_notional / price / step_size).floor() * step_size;
        min_quantity_needed += step_size;
        if min_quantity_needed * price >= min_notional {
            adjusted = min_quantity_needed;
        } else {
            return Err(BrokerError::LotSizeUnsatisfiable {
                symbol: symbol.to_string(),
            });
        }
    }

    Ok(adjusted)
}

/// Format a quantity/price as a decimal string without scientific notation
/// or trailing zeros, matching the exchange's expected numeric format.
pub fn format_decimal(value: f64, precision: usize) -> String {
    let s = format!("{:.*}", precision, value);
    let trimmed = s.trim_end_matches('0');
    let trimmed = trimmed.trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_below_min_notional_before_rounding() {
        let err = quantize_order("BTC", 0.0001, 50_000.0).unwrap_err();
        assert!(matches!(err, BrokerError::NotionalBelowMin { .. }));
    }

    #[test]
    fn rounds_down_to_step_size_when_notional_still_clears_minimum() {
        let adjusted = quantize_order("BTC", 0.000199, 100_000.0).unwrap();
        assert!((adjusted - 0.00019).abs() < 1e-12);
    }

    #[test]
    fn rounds_up_when_floor_drops_below_minimum_notional() {
        // price=9.9, qty=1.05 -> raw notional 10.395 clears the $10 minimum,
        // but flooring to the nearest 1.0 step (XRP) drops qty to 1.0 and
        // notional to 9.9, which is back under the minimum -> round up to 2.0.
        let adjusted = quantize_order("XRP", 1.05, 9.9).unwrap();
        assert!((adjusted - 2.0).abs() < 1e-9);
    }

    #[test]
    fn xrp_below_minimum_pre_rounding_is_rejected() {
        let err = quantize_order("XRP", 1.4, 6.0).unwrap_err();
        assert!(matches!(err, BrokerError::NotionalBelowMin { .. }));
    }

    #[test]
    fn unknown_symbol_uses_conservative_defaults() {
        let adjusted = quantize_order("UNKNOWN", 0.001, 50_000.0).unwrap();
        assert!(adjusted > 0.0);
    }

    #[test]
    fn format_decimal_trims_trailing_zeros_and_point() {
        assert_eq!(format_decimal(1.5, 8), "1.5");
        assert_eq!(format_decimal(2.0, 8), "2");
        assert_eq!(format_decimal(0.00012300, 8), "0.000123");
    }
}
