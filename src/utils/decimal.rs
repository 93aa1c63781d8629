//! Decimal helpers for prices, strikes and loosely-typed gateway numbers.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Round to tick size (e.g., 0.01 for option premiums).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Canonical form of a strike so `595`, `595.0` and `595.00` share a cache key.
pub fn normalize_strike(strike: Decimal) -> Decimal {
    strike.normalize()
}

/// Parse a snapshot field.
///
/// The gateway sends numbers as strings and prefixes stale values with a
/// marker letter (`C` = prior close, `H` = halted). Empty strings, `"N/A"`
/// and non-numeric text all come back as `None`.
pub fn parse_quote_str(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim().trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let trimmed = trimmed.replace(',', "");
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(&trimmed)
        .or_else(|_| Decimal::from_scientific(&trimmed))
        .ok()
}

/// Read a JSON number or numeric string as a decimal.
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            }
        }
        Value::String(s) => parse_quote_str(s),
        _ => None,
    }
}

/// Read a JSON number or numeric string as an `f64` (greeks, IV).
pub fn f64_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim().trim_end_matches('%');
            let trimmed = trimmed.trim_start_matches(|c: char| c.is_ascii_alphabetic());
            trimmed.parse().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(1.234), dec!(0.01)), dec!(1.23));
        assert_eq!(round_to_tick(dec!(1.236), dec!(0.05)), dec!(1.25));
        assert_eq!(round_to_tick(dec!(7.5), Decimal::ZERO), dec!(7.5));
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(50000), dec!(100000)), dec!(0.5));
        assert_eq!(safe_div(dec!(50000), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_normalize_strike() {
        assert_eq!(normalize_strike(dec!(595.00)), normalize_strike(dec!(595)));
        assert_eq!(normalize_strike(dec!(595.50)).to_string(), "595.5");
    }

    #[test]
    fn test_parse_quote_prefixes() {
        assert_eq!(parse_quote_str("1.25"), Some(dec!(1.25)));
        assert_eq!(parse_quote_str("C1.20"), Some(dec!(1.20)));
        assert_eq!(parse_quote_str("H600.12"), Some(dec!(600.12)));
        assert_eq!(parse_quote_str("1,234.5"), Some(dec!(1234.5)));
        assert_eq!(parse_quote_str(""), None);
        assert_eq!(parse_quote_str("N/A"), None);
    }

    #[test]
    fn test_values() {
        assert_eq!(decimal_from_value(&json!(42)), Some(dec!(42)));
        assert_eq!(decimal_from_value(&json!("C3.10")), Some(dec!(3.10)));
        assert_eq!(decimal_from_value(&json!(null)), None);
        assert_eq!(f64_from_value(&json!("-0.45")), Some(-0.45));
        assert_eq!(f64_from_value(&json!("18.2%")), Some(18.2));
        assert_eq!(f64_from_value(&json!(0.03)), Some(0.03));
    }
}
