//! Resource quantity parsing
//!
//! Parses Kubernetes quantity strings ("500m", "1.5Gi", "2e3") into an exact
//! integer count of nano-units so quantities can be compared and summed
//! without going through floating point. Fractions below one nano-unit round
//! up, matching how the API server canonicalises quantities.

use std::fmt;
use std::ops::Add;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

const NANOS_EXP: i32 = 9;

/// An exact quantity stored as a signed count of nano-units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParsedQuantity {
    nanos: i128,
}

impl ParsedQuantity {
    /// Zero
    pub const ZERO: Self = Self { nanos: 0 };

    /// Parse a quantity string, reporting failures against `field`
    pub fn parse(field: &str, raw: &str) -> Result<Self> {
        parse_nanos(raw)
            .map(|nanos| Self { nanos })
            .map_err(|message| Error::malformed(field, format!("{raw:?}: {message}")))
    }

    /// Parse a declared quantity; an empty string means "not declared"
    pub fn parse_declared(field: &str, raw: &str) -> Result<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }
        Self::parse(field, raw).map(Some)
    }

    /// Parse a live API quantity
    pub fn from_quantity(field: &str, q: &Quantity) -> Result<Self> {
        Self::parse(field, &q.0)
    }

    /// Raw nano-unit count
    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    /// Value in milli-units, rounded up
    pub fn millis_ceil(&self) -> i128 {
        div_ceil(self.nanos, 1_000_000)
    }

    /// Value in whole units, rounded up
    pub fn units_ceil(&self) -> i128 {
        div_ceil(self.nanos, 1_000_000_000)
    }

    /// Checked addition
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.nanos.checked_add(other.nanos).map(|nanos| Self { nanos })
    }
}

impl Add for ParsedQuantity {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            nanos: self.nanos.saturating_add(other.nanos),
        }
    }
}

impl fmt::Display for ParsedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.nanos / 1_000_000_000;
        let frac = (self.nanos % 1_000_000_000).abs();
        if frac == 0 {
            write!(f, "{whole}")
        } else if frac % 1_000_000 == 0 {
            write!(f, "{}m", self.millis_ceil())
        } else {
            write!(f, "{}n", self.nanos)
        }
    }
}

/// Compare two live quantities numerically, falling back to string equality
/// when either side does not parse
pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_nanos(&a.0), parse_nanos(&b.0)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.0 == b.0,
    }
}

fn div_ceil(value: i128, divisor: i128) -> i128 {
    let q = value / divisor;
    if value % divisor > 0 {
        q + 1
    } else {
        q
    }
}

enum Scale {
    Decimal(i32),
    Binary(u32),
}

fn parse_suffix(suffix: &str) -> std::result::Result<Scale, String> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        s if s.starts_with('e') || s.starts_with('E') => {
            let exp = &s[1..];
            let valid = !exp.is_empty()
                && exp
                    .trim_start_matches(['+', '-'])
                    .chars()
                    .all(|c| c.is_ascii_digit())
                && exp.len() - exp.trim_start_matches(['+', '-']).len() <= 1;
            if !valid {
                return Err(format!("invalid exponent {s:?}"));
            }
            let exp: i32 = exp
                .parse()
                .map_err(|_| format!("exponent out of range {s:?}"))?;
            Scale::Decimal(exp)
        }
        s => return Err(format!("unknown suffix {s:?}")),
    };
    Ok(scale)
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

fn parse_nanos(raw: &str) -> std::result::Result<i128, String> {
    if raw.is_empty() {
        return Err("empty quantity".to_string());
    }

    let (negative, body) = match raw.as_bytes()[0] {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };

    let number_end = body
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(body.len());
    let (number, suffix) = body.split_at(number_end);

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err("missing digits".to_string());
    }
    if frac_part.contains('.') {
        return Err("more than one decimal point".to_string());
    }

    let overflow = || "value out of range".to_string();

    let mut mantissa: i128 = 0;
    for c in int_part.chars().chain(frac_part.chars()) {
        let digit = i128::from(c as u8 - b'0');
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(digit))
            .ok_or_else(overflow)?;
    }
    let frac_digits = i32::try_from(frac_part.len()).map_err(|_| overflow())?;

    let magnitude = match parse_suffix(suffix)? {
        Scale::Decimal(exp) => {
            let shift = exp
                .checked_add(NANOS_EXP)
                .and_then(|e| e.checked_sub(frac_digits))
                .ok_or_else(overflow)?;
            if shift >= 0 {
                let factor = pow10(shift.unsigned_abs()).ok_or_else(overflow)?;
                mantissa.checked_mul(factor).ok_or_else(overflow)?
            } else {
                match pow10(shift.unsigned_abs()) {
                    Some(divisor) => div_ceil(mantissa, divisor),
                    // Divisor exceeds any representable mantissa
                    None => i128::from(mantissa > 0),
                }
            }
        }
        Scale::Binary(bits) => {
            let scaled = mantissa
                .checked_mul(1i128 << bits)
                .and_then(|m| m.checked_mul(pow10(NANOS_EXP as u32)?))
                .ok_or_else(overflow)?;
            let divisor = pow10(frac_digits.unsigned_abs()).ok_or_else(overflow)?;
            div_ceil(scaled, divisor)
        }
    };

    Ok(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(raw: &str) -> ParsedQuantity {
        ParsedQuantity::parse("test", raw).expect("quantity should parse")
    }

    #[test]
    fn decimal_suffixes_scale_correctly() {
        assert_eq!(q("500m").millis_ceil(), 500);
        assert_eq!(q("1").millis_ceil(), 1000);
        assert_eq!(q("2k").units_ceil(), 2000);
        assert_eq!(q("3M").units_ceil(), 3_000_000);
        assert_eq!(q("250n").nanos(), 250);
        assert_eq!(q("7u").nanos(), 7000);
    }

    #[test]
    fn binary_suffixes_scale_correctly() {
        assert_eq!(q("1Ki").units_ceil(), 1024);
        assert_eq!(q("256Mi").units_ceil(), 256 * 1024 * 1024);
        assert_eq!(q("1.5Gi").units_ceil(), 1_610_612_736);
    }

    #[test]
    fn equivalent_spellings_compare_equal() {
        assert_eq!(q("1"), q("1000m"));
        assert_eq!(q("1k"), q("1e3"));
        assert_eq!(q("0.5"), q("500m"));
        assert_eq!(q("1024Mi"), q("1Gi"));
        assert!(q("10Gi") > q("5Gi"));
        assert!(q("1G") < q("1Gi"));
    }

    #[test]
    fn sub_nano_fractions_round_up() {
        assert_eq!(q("0.0000000001").nanos(), 1);
        assert_eq!(q("1n").millis_ceil(), 1);
        assert_eq!(q("1e-12").nanos(), 1);
        assert_eq!(q("0e-50").nanos(), 0);
    }

    #[test]
    fn signs_are_honoured() {
        assert_eq!(q("-1").nanos(), -1_000_000_000);
        assert_eq!(q("+2m").millis_ceil(), 2);
    }

    #[test]
    fn malformed_values_are_rejected() {
        for raw in ["", "abc", "12Gx", ".", "1..2", "1.2.3", "1e", "1e+-3", "Gi", "1 Gi"] {
            let err = ParsedQuantity::parse("spec.resources.limits.cpu", raw)
                .expect_err(&format!("{raw:?} should not parse"));
            assert!(matches!(err, Error::MalformedInput { .. }), "{raw:?}");
        }
    }

    #[test]
    fn overflow_is_malformed_not_a_panic() {
        assert!(ParsedQuantity::parse("f", "1e40").is_err());
        assert!(ParsedQuantity::parse("f", "99999999999999999999999999999999999999999").is_err());
        assert!(ParsedQuantity::parse("f", "999999999999999999999Ei").is_err());
    }

    #[test]
    fn empty_declared_value_is_absent() {
        assert_eq!(ParsedQuantity::parse_declared("f", "").unwrap(), None);
        assert_eq!(
            ParsedQuantity::parse_declared("f", "100m").unwrap(),
            Some(q("0.1"))
        );
    }

    #[test]
    fn live_quantities_compare_semantically() {
        assert!(quantities_equal(
            &Quantity("1Gi".to_string()),
            &Quantity("1024Mi".to_string())
        ));
        assert!(!quantities_equal(
            &Quantity("1Gi".to_string()),
            &Quantity("1G".to_string())
        ));
        assert!(quantities_equal(
            &Quantity("weird".to_string()),
            &Quantity("weird".to_string())
        ));
    }

    #[test]
    fn display_and_sums() {
        assert_eq!(q("2").to_string(), "2");
        assert_eq!(q("1500m").to_string(), "1500m");
        assert_eq!((q("250m") + q("750m")).to_string(), "1");
        assert_eq!(q("1").checked_add(q("1")), Some(q("2")));
    }
}
