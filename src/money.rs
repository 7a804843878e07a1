//! Cash amounts at fixed scale.
//!
//! All drawer arithmetic runs on `rust_decimal::Decimal` pinned to two
//! fractional digits, so variance identities hold exactly across any number
//! of sessions. SQLite stores the canonical text form; JSON payloads may
//! carry amounts as strings (exact) or numbers (rounded to cash scale on
//! entry). Binary floating point never participates in the arithmetic.

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Fractional digits carried by every cash amount.
pub const CASH_SCALE: u32 = 2;

/// Normalize to the canonical cash scale (half-away-from-zero).
pub fn to_cash(value: Decimal) -> Decimal {
    let mut cash = value.round_dp_with_strategy(CASH_SCALE, RoundingStrategy::MidpointAwayFromZero);
    cash.rescale(CASH_SCALE);
    cash
}

/// `0.00`
pub fn zero() -> Decimal {
    Decimal::new(0, CASH_SCALE)
}

/// Canonical text form written to the store and to wire payloads.
pub fn cash_text(value: Decimal) -> String {
    to_cash(value).to_string()
}

/// Parse an amount persisted by [`cash_text`]. A malformed stored amount is
/// a storage-layer fault, not caller error.
pub fn cash_from_db(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map(to_cash)
        .map_err(|e| EngineError::StorageUnavailable(format!("corrupt cash amount {raw:?}: {e}")))
}

/// Parse a cash amount out of a JSON payload value.
fn parse_cash(raw: &Value) -> Result<Decimal> {
    match raw {
        Value::String(s) => Decimal::from_str(s.trim())
            .map(to_cash)
            .map_err(|e| EngineError::Validation(format!("invalid cash amount {s:?}: {e}"))),
        Value::Number(n) => {
            let f = n
                .as_f64()
                .ok_or_else(|| EngineError::Validation(format!("invalid cash amount {n}")))?;
            Decimal::from_f64_retain(f)
                .map(to_cash)
                .ok_or_else(|| EngineError::Validation(format!("cash amount out of range: {n}")))
        }
        other => Err(EngineError::Validation(format!(
            "cash amount must be a string or number, got {other}"
        ))),
    }
}

/// Extract a cash amount from a payload, trying each key in order.
/// Returns `Ok(None)` when no key is present; a present-but-malformed value
/// is a validation error, never silently defaulted.
pub fn value_cash(payload: &Value, keys: &[&str]) -> Result<Option<Decimal>> {
    for key in keys {
        if let Some(raw) = payload.get(*key) {
            if raw.is_null() {
                continue;
            }
            return parse_cash(raw).map(Some);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn string_amounts_parse_exactly() {
        let payload = serde_json::json!({ "countedCash": "1699.50" });
        let amount = value_cash(&payload, &["countedCash"]).unwrap().unwrap();
        assert_eq!(amount, dec!(1699.50));
        assert_eq!(cash_text(amount), "1699.50");
    }

    #[test]
    fn number_amounts_round_to_cash_scale() {
        let payload = serde_json::json!({ "amount": 10.005 });
        let amount = value_cash(&payload, &["amount"]).unwrap().unwrap();
        assert_eq!(amount, dec!(10.01));
    }

    #[test]
    fn missing_keys_are_none_but_garbage_is_rejected() {
        let payload = serde_json::json!({ "amount": "ten dollars" });
        assert!(value_cash(&payload, &["openingCash"]).unwrap().is_none());
        assert!(value_cash(&payload, &["amount"]).is_err());
    }

    #[test]
    fn db_round_trip_preserves_scale() {
        let amount = cash_from_db("500").unwrap();
        assert_eq!(cash_text(amount), "500.00");
        assert_eq!(amount, dec!(500.00));
    }

    #[test]
    fn variance_subtraction_is_exact() {
        let counted = to_cash(dec!(1699.50));
        let expected = to_cash(dec!(1700.00));
        assert_eq!(counted - expected, dec!(-0.50));
    }
}
