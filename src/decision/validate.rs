// =============================================================================
// Semantic validation (part of C5)
// =============================================================================
//
// A decision that parsed as JSON is not automatically actionable: the
// operation must be one of the four known values, the symbol (when
// required) must be one this engine trades, and the portion must sit in
// the allowed range for its operation. Failing any of these is *not* a
// hard error — the caller still writes a `DecisionLog` row with
// `executed = false`, distinct from an oracle transport/parse failure
// which is abandoned with no row at all.
// =============================================================================

use serde_json::Value;

use crate::errors::DecisionError;
use crate::types::Operation;

#[derive(Debug, Clone)]
pub struct ValidatedDecision {
    pub operation: Operation,
    pub symbol: Option<String>,
    pub target_portion: f64,
    pub reason: String,
    pub trading_strategy: String,
}

/// Validate a parsed decision `Value` against the closed operation set and
/// the engine's supported symbols. `hold` needs no symbol and its portion is
/// forced to `0.0` regardless of what the oracle sent.
pub fn validate_decision(raw: &Value, supported_symbols: &[String]) -> Result<ValidatedDecision, DecisionError> {
    let operation_str = raw
        .get("operation")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DecisionError("missing operation field".to_string()))?;
    let operation: Operation = operation_str
        .parse()
        .map_err(|_| DecisionError(format!("unrecognized operation '{operation_str}'")))?;

    let symbol = raw.get("symbol").and_then(|v| v.as_str()).map(|s| s.to_uppercase());
    let reason = raw.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let trading_strategy = raw.get("trading_strategy").and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let mut target_portion = raw
        .get("target_portion_of_balance")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    if operation == Operation::Hold {
        return Ok(ValidatedDecision {
            operation,
            symbol: None,
            target_portion: 0.0,
            reason,
            trading_strategy,
        });
    }

    let symbol = symbol.ok_or_else(|| DecisionError(format!("operation '{operation}' requires a symbol")))?;
    if !supported_symbols.iter().any(|s| s.eq_ignore_ascii_case(&symbol)) {
        return Err(DecisionError(format!("symbol '{symbol}' is not supported")));
    }

    if operation == Operation::Close && target_portion == 0.0 {
        target_portion = 1.0;
    }

    if !(target_portion > 0.0 && target_portion <= 1.0) {
        return Err(DecisionError(format!(
            "target_portion_of_balance {target_portion} out of range (0, 1] for operation '{operation}'"
        )));
    }

    Ok(ValidatedDecision {
        operation,
        symbol: Some(symbol),
        target_portion,
        reason,
        trading_strategy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn symbols() -> Vec<String> {
        vec!["BTC", "ETH", "SOL", "BNB", "XRP", "DOGE"].into_iter().map(String::from).collect()
    }

    #[test]
    fn hold_needs_no_symbol_and_forces_zero_portion() {
        let raw = json!({"operation": "hold", "symbol": null, "target_portion_of_balance": 0.3, "reason": "wait"});
        let d = validate_decision(&raw, &symbols()).unwrap();
        assert_eq!(d.operation, Operation::Hold);
        assert_eq!(d.target_portion, 0.0);
        assert!(d.symbol.is_none());
    }

    #[test]
    fn buy_requires_a_supported_symbol() {
        let raw = json!({"operation": "buy", "symbol": "DOGE", "target_portion_of_balance": 0.2, "reason": "r"});
        let d = validate_decision(&raw, &symbols()).unwrap();
        assert_eq!(d.symbol.as_deref(), Some("DOGE"));
    }

    #[test]
    fn unsupported_symbol_is_rejected() {
        let raw = json!({"operation": "buy", "symbol": "SHIB", "target_portion_of_balance": 0.2, "reason": "r"});
        assert!(validate_decision(&raw, &symbols()).is_err());
    }

    #[test]
    fn portion_out_of_range_is_rejected() {
        let raw = json!({"operation": "sell", "symbol": "BTC", "target_portion_of_balance": 1.5, "reason": "r"});
        assert!(validate_decision(&raw, &symbols()).is_err());
    }

    #[test]
    fn close_with_zero_portion_is_clamped_to_full() {
        let raw = json!({"operation": "close", "symbol": "ETH", "target_portion_of_balance": 0, "reason": "flatten"});
        let d = validate_decision(&raw, &symbols()).unwrap();
        assert_eq!(d.target_portion, 1.0);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let raw = json!({"operation": "short", "symbol": "BTC", "target_portion_of_balance": 0.2, "reason": "r"});
        assert!(validate_decision(&raw, &symbols()).is_err());
    }
}
