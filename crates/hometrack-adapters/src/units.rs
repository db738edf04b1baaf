//! Area and price coercion. Areas always come out in square feet.

use serde::{Deserialize, Serialize};

use crate::IntakeError;

const SQFT_PER_SQM: f64 = 10.7639;
const SQFT_PER_ACRE: f64 = 43_560.0;

/// A numeric field as sources send it: a bare number, free text such as
/// `"1,850 sqft"` or `"$1.2M"`, or a value with an explicit unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawQuantity {
    Number(f64),
    Text(String),
    Measured { value: f64, unit: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaUnit {
    SquareFeet,
    SquareMeters,
    Acres,
}

impl AreaUnit {
    pub fn parse(label: &str) -> Option<Self> {
        let squashed: String = label
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '.' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match squashed.as_str() {
            "sqft" | "squarefeet" | "squarefoot" | "sf" | "ft2" => Some(Self::SquareFeet),
            "sqm" | "sqm2" | "m2" | "squaremeters" | "squaremetres" => Some(Self::SquareMeters),
            "acre" | "acres" | "ac" => Some(Self::Acres),
            _ => None,
        }
    }

    pub fn to_sqft(self, value: f64) -> f64 {
        match self {
            Self::SquareFeet => value,
            Self::SquareMeters => value * SQFT_PER_SQM,
            Self::Acres => value * SQFT_PER_ACRE,
        }
    }
}

/// Converts an area to square feet. A bare number is only accepted when the
/// source declares the unit it uses.
pub fn parse_area(
    field: &'static str,
    raw: &RawQuantity,
    default_unit: Option<AreaUnit>,
) -> Result<f64, IntakeError> {
    let unit_error = || IntakeError::Unit {
        field,
        value: describe(raw),
    };
    let (value, unit) = match raw {
        RawQuantity::Number(value) => (*value, default_unit.ok_or_else(unit_error)?),
        RawQuantity::Measured { value, unit } => (*value, AreaUnit::parse(unit).ok_or_else(unit_error)?),
        RawQuantity::Text(text) => {
            let (number, rest) = split_number(text);
            let value = number.ok_or_else(unit_error)?;
            let unit = if rest.is_empty() {
                default_unit
            } else {
                AreaUnit::parse(rest)
            };
            (value, unit.ok_or_else(unit_error)?)
        }
    };
    if !value.is_finite() || value < 0.0 {
        return Err(unit_error());
    }
    Ok(unit.to_sqft(value))
}

/// Accepts `500000`, `"$500,000"`, `"500k"` and `"$1.2M"`.
pub fn parse_price(field: &'static str, raw: &RawQuantity) -> Result<f64, IntakeError> {
    let unit_error = || IntakeError::Unit {
        field,
        value: describe(raw),
    };
    let value = match raw {
        RawQuantity::Number(value) => *value,
        RawQuantity::Measured { .. } => return Err(unit_error()),
        RawQuantity::Text(text) => {
            let trimmed = text.trim().trim_start_matches('$').trim();
            let (number, rest) = split_number(trimmed);
            let number = number.ok_or_else(unit_error)?;
            match rest.to_ascii_lowercase().as_str() {
                "" | "usd" => number,
                "k" => number * 1_000.0,
                "m" | "mm" => number * 1_000_000.0,
                _ => return Err(unit_error()),
            }
        }
    };
    if !value.is_finite() || value < 0.0 {
        return Err(unit_error());
    }
    Ok(value)
}

/// Splits `"1,850 sq ft"` into `(Some(1850.0), "sq ft")`.
fn split_number(text: &str) -> (Option<f64>, &str) {
    let text = text.trim();
    let end = text
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let digits: String = text[..end].chars().filter(|c| *c != ',').collect();
    (digits.parse::<f64>().ok(), text[end..].trim())
}

fn describe(raw: &RawQuantity) -> String {
    match raw {
        RawQuantity::Number(v) => v.to_string(),
        RawQuantity::Text(t) => t.clone(),
        RawQuantity::Measured { value, unit } => format!("{value} {unit}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawQuantity {
        RawQuantity::Text(s.to_string())
    }

    #[test]
    fn areas_are_converted_to_square_feet() {
        assert_eq!(parse_area("area", &text("1,850 sqft"), None).unwrap(), 1_850.0);
        assert_eq!(parse_area("area", &text("2 acres"), None).unwrap(), 87_120.0);
        let sqm = parse_area("area", &text("100 sqm2"), None).unwrap();
        assert!((sqm - 1_076.39).abs() < 1e-6);
        let measured = RawQuantity::Measured { value: 0.5, unit: "Acres".into() };
        assert_eq!(parse_area("lot_area", &measured, None).unwrap(), 21_780.0);
    }

    #[test]
    fn bare_numbers_need_a_declared_unit() {
        let bare = RawQuantity::Number(1_200.0);
        assert!(matches!(
            parse_area("area", &bare, None),
            Err(IntakeError::Unit { field: "area", .. })
        ));
        assert_eq!(parse_area("area", &bare, Some(AreaUnit::SquareFeet)).unwrap(), 1_200.0);
    }

    #[test]
    fn unknown_area_units_are_rejected() {
        assert!(parse_area("area", &text("12 hectares"), None).is_err());
        assert!(parse_area("area", &text("big"), None).is_err());
        assert!(parse_area("area", &text("-4 sqft"), None).is_err());
    }

    #[test]
    fn prices_accept_common_shorthands() {
        assert_eq!(parse_price("price", &text("$500,000")).unwrap(), 500_000.0);
        assert_eq!(parse_price("price", &text("500k")).unwrap(), 500_000.0);
        assert_eq!(parse_price("price", &text("$1.2M")).unwrap(), 1_200_000.0);
        assert_eq!(parse_price("price", &RawQuantity::Number(480_000.0)).unwrap(), 480_000.0);
        assert!(parse_price("price", &text("call for price")).is_err());
        assert!(parse_price("price", &RawQuantity::Number(-1.0)).is_err());
    }
}
