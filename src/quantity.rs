//! Kubernetes resource quantities with exact comparison
//!
//! A [`Quantity`] keeps the text it was written with ("500m", "4Gi", "1e3") so it
//! round-trips unchanged through the API server, and compares by its exact decimal
//! value so that "1000m" and "1" are considered equal.

use std::cmp::Ordering;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of nano-units in one whole unit
const NANO: i128 = 1_000_000_000;

/// A resource quantity such as `500m`, `2`, or `4Gi`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Quantity(pub String);

impl Quantity {
    /// Create a quantity from its textual form
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The quantity as written
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact value in nano-units, or `None` if the text is not a valid quantity
    ///
    /// Fractions smaller than one nano-unit round up, matching how the API server
    /// canonicalises quantities.
    pub fn nano_value(&self) -> Option<i128> {
        parse_nano(self.0.trim())
    }

    /// Returns true if the text parses as a Kubernetes quantity
    pub fn is_valid(&self) -> bool {
        self.nano_value().is_some()
    }

    /// Compare two quantities by value, independent of the suffix used
    ///
    /// Unparseable quantities order after every valid one, and among themselves by
    /// their text, so the ordering stays total.
    pub fn cmp_value(&self, other: &Self) -> Ordering {
        match (self.nano_value(), other.nano_value()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }

    /// Returns true if this quantity is strictly greater than `other` by value
    pub fn exceeds(&self, other: &Self) -> bool {
        self.cmp_value(other) == Ordering::Greater
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Quantity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Serialize for Quantity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Manifests commonly write `cpu: 2` as a bare number
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
            Float(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Int(i) => Self(i.to_string()),
            Raw::Float(f) => Self(f.to_string()),
        })
    }
}

impl JsonSchema for Quantity {
    fn schema_name() -> String {
        "Quantity".to_string()
    }

    fn json_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut extensions = schemars::Map::new();
        extensions.insert(
            "x-kubernetes-int-or-string".to_string(),
            serde_json::Value::Bool(true),
        );
        schemars::schema::Schema::Object(schemars::schema::SchemaObject {
            metadata: Some(Box::new(schemars::schema::Metadata {
                description: Some(
                    "Kubernetes resource quantity, e.g. '500m', '2', or '4Gi'".to_string(),
                ),
                ..Default::default()
            })),
            extensions,
            ..Default::default()
        })
    }
}

/// Multiplier expressed as a power of ten or a power of two
enum Scale {
    Decimal(i32),
    Binary(u32),
}

fn parse_suffix(suffix: &str) -> Option<Scale> {
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
        _ => {
            let exp = suffix.strip_prefix(['e', 'E'])?;
            Scale::Decimal(exp.parse().ok()?)
        }
    };
    Some(scale)
}

fn parse_nano(text: &str) -> Option<i128> {
    let (negative, rest) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };

    let number_len = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(number_len);

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    // Digits as one integer; the fraction shifts the decimal exponent down
    let mut mantissa: i128 = 0;
    for c in whole.chars().chain(fraction.chars()) {
        let digit = i128::from(c.to_digit(10)?);
        mantissa = mantissa.checked_mul(10)?.checked_add(digit)?;
    }
    let fraction_digits = i32::try_from(fraction.len()).ok()?;

    let value = match parse_suffix(suffix)? {
        Scale::Decimal(exp) => scale_decimal(mantissa, exp.checked_add(9)? - fraction_digits)?,
        Scale::Binary(bits) => {
            let scaled = mantissa.checked_mul(1i128.checked_shl(bits)?)?;
            scale_decimal(scaled.checked_mul(NANO)?, -fraction_digits)?
        }
    };

    Some(if negative { -value } else { value })
}

/// Multiply by `10^exp`, rounding up when `exp` is negative
fn scale_decimal(value: i128, exp: i32) -> Option<i128> {
    if exp >= 0 {
        let factor = 10i128.checked_pow(exp.unsigned_abs())?;
        value.checked_mul(factor)
    } else {
        let divisor = match 10i128.checked_pow(exp.unsigned_abs()) {
            Some(d) => d,
            // Anything this small rounds up to a single nano-unit
            None => return Some(i128::from(value > 0)),
        };
        let quotient = value / divisor;
        Some(if value % divisor == 0 {
            quotient
        } else {
            quotient + 1
        })
    }
}
