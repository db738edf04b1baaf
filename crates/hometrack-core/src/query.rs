//! Search predicates over the current state and the derived history of a property.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{DerivedHistory, Property, PropertyId, PropertyStatus, PropertyType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unknown query parameter {0:?}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("{field}: lower bound {min} is greater than upper bound {max}")]
    InvertedRange { field: &'static str, min: String, max: String },
    #[error("parameter {0:?} given more than once")]
    Repeated(String),
}

/// Inclusive numeric bounds. A property without the value never matches a bounded range.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct NumericRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NumericRange {
    pub fn contains(&self, value: Option<f64>) -> bool {
        match value {
            Some(v) => self.min.map_or(true, |m| v >= m) && self.max.map_or(true, |m| v <= m),
            None => self.min.is_none() && self.max.is_none(),
        }
    }
}

/// Inclusive time bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TimeInterval {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    PropertyType { any_of: Vec<PropertyType> },
    Status { any_of: Vec<PropertyStatus> },
    Bedrooms(NumericRange),
    Bathrooms(NumericRange),
    LivingArea(NumericRange),
    LotArea(NumericRange),
    Price(NumericRange),
    City(String),
    Zip(String),
    PriceDecreased(bool),
    ListedWithin(TimeInterval),
    PendingWithin(TimeInterval),
    SoldWithin(TimeInterval),
    SoldAboveList(bool),
}

impl Predicate {
    pub fn matches(&self, property: &Property, history: &DerivedHistory) -> bool {
        match self {
            Predicate::PropertyType { any_of } => any_of.contains(&property.property_type),
            Predicate::Status { any_of } => any_of.contains(&property.status),
            Predicate::Bedrooms(r) => r.contains(property.bedrooms),
            Predicate::Bathrooms(r) => r.contains(property.bathrooms),
            Predicate::LivingArea(r) => r.contains(property.living_area_sqft),
            Predicate::LotArea(r) => r.contains(property.lot_area_sqft),
            Predicate::Price(r) => r.contains(property.price),
            Predicate::City(city) => property.address.city.eq_ignore_ascii_case(city),
            Predicate::Zip(zip) => property.address.zip == *zip,
            Predicate::PriceDecreased(want) => history.price_decreased == *want,
            Predicate::ListedWithin(i) => history.listed_within(i.from, i.to),
            Predicate::PendingWithin(i) => history.pending_within(i.from, i.to),
            Predicate::SoldWithin(i) => history.sold_within(i.from, i.to),
            Predicate::SoldAboveList(want) => history.sold_above_list() == *want,
        }
    }
}

/// A conjunction of predicates plus paging.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SearchQuery {
    pub predicates: Vec<Predicate>,
    pub limit: Option<usize>,
    pub after: Option<PropertyId>,
}

const RANGE_KEYS: &[(&str, &str, &str)] = &[
    ("beds", "min_beds", "max_beds"),
    ("baths", "min_baths", "max_baths"),
    ("area", "min_area", "max_area"),
    ("lot", "min_lot", "max_lot"),
    ("price", "min_price", "max_price"),
];

const INTERVAL_KEYS: &[(&str, &str, &str)] = &[
    ("listed", "listed_from", "listed_to"),
    ("pending", "pending_from", "pending_to"),
    ("sold", "sold_from", "sold_to"),
];

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn matches(&self, property: &Property, history: &DerivedHistory) -> bool {
        self.predicates.iter().all(|p| p.matches(property, history))
    }

    /// Parses query-string style pairs. `type` and `status` take comma separated
    /// lists; every other key may appear once. Empty values are ignored.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, QueryError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = SearchQuery::new();
        let mut types: Vec<PropertyType> = Vec::new();
        let mut statuses: Vec<PropertyStatus> = Vec::new();
        let mut scalars: BTreeMap<String, String> = BTreeMap::new();

        for (key, value) in pairs {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            match key {
                "type" | "property_type" => {
                    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                        let parsed = part.parse().map_err(|_| invalid(key, part, "a property type"))?;
                        if !types.contains(&parsed) {
                            types.push(parsed);
                        }
                    }
                }
                "status" => {
                    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                        let parsed = part.parse().map_err(|_| invalid(key, part, "a listing status"))?;
                        if !statuses.contains(&parsed) {
                            statuses.push(parsed);
                        }
                    }
                }
                _ if is_scalar_key(key) => {
                    if scalars.insert(key.to_string(), value.to_string()).is_some() {
                        return Err(QueryError::Repeated(key.to_string()));
                    }
                }
                _ => return Err(QueryError::UnknownKey(key.to_string())),
            }
        }

        if !types.is_empty() {
            query.predicates.push(Predicate::PropertyType { any_of: types });
        }
        if !statuses.is_empty() {
            query.predicates.push(Predicate::Status { any_of: statuses });
        }

        for (field, min_key, max_key) in RANGE_KEYS {
            let min = scalars.get(*min_key).map(|v| parse_number(min_key, v)).transpose()?;
            let max = scalars.get(*max_key).map(|v| parse_number(max_key, v)).transpose()?;
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    return Err(QueryError::InvertedRange {
                        field: *field,
                        min: lo.to_string(),
                        max: hi.to_string(),
                    });
                }
            }
            if min.is_none() && max.is_none() {
                continue;
            }
            let range = NumericRange { min, max };
            query.predicates.push(match *field {
                "beds" => Predicate::Bedrooms(range),
                "baths" => Predicate::Bathrooms(range),
                "area" => Predicate::LivingArea(range),
                "lot" => Predicate::LotArea(range),
                _ => Predicate::Price(range),
            });
        }

        if let Some(city) = scalars.get("city") {
            query.predicates.push(Predicate::City(collapse_whitespace(city)));
        }
        if let Some(zip) = scalars.get("zip") {
            if zip.len() != 5 || !zip.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid("zip", zip, "a 5-digit ZIP code"));
            }
            query.predicates.push(Predicate::Zip(zip.clone()));
        }
        if let Some(v) = scalars.get("price_decreased") {
            query.predicates.push(Predicate::PriceDecreased(parse_bool("price_decreased", v)?));
        }
        if let Some(v) = scalars.get("sold_above_list") {
            query.predicates.push(Predicate::SoldAboveList(parse_bool("sold_above_list", v)?));
        }

        for (field, from_key, to_key) in INTERVAL_KEYS {
            let from = scalars.get(*from_key).map(|v| parse_time(from_key, v, false)).transpose()?;
            let to = scalars.get(*to_key).map(|v| parse_time(to_key, v, true)).transpose()?;
            if let (Some(lo), Some(hi)) = (from, to) {
                if lo > hi {
                    return Err(QueryError::InvertedRange {
                        field: *field,
                        min: lo.to_rfc3339(),
                        max: hi.to_rfc3339(),
                    });
                }
            }
            if from.is_none() && to.is_none() {
                continue;
            }
            let interval = TimeInterval { from, to };
            query.predicates.push(match *field {
                "listed" => Predicate::ListedWithin(interval),
                "pending" => Predicate::PendingWithin(interval),
                _ => Predicate::SoldWithin(interval),
            });
        }

        if let Some(v) = scalars.get("limit") {
            let limit: usize = v.parse().map_err(|_| invalid("limit", v, "a positive integer"))?;
            if limit == 0 {
                return Err(invalid("limit", v, "a positive integer"));
            }
            query.limit = Some(limit);
        }
        if let Some(v) = scalars.get("after") {
            query.after = Some(PropertyId::parse(v).ok_or_else(|| invalid("after", v, "a property id"))?);
        }

        Ok(query)
    }
}

fn is_scalar_key(key: &str) -> bool {
    const OTHER: &[&str] = &["city", "zip", "price_decreased", "sold_above_list", "limit", "after"];
    OTHER.contains(&key)
        || RANGE_KEYS.iter().any(|(_, lo, hi)| *lo == key || *hi == key)
        || INTERVAL_KEYS.iter().any(|(_, lo, hi)| *lo == key || *hi == key)
}

fn invalid(key: &str, value: &str, expected: &'static str) -> QueryError {
    QueryError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64, QueryError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| invalid(key, value, "a non-negative number"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, QueryError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value, "true or false")),
    }
}

/// RFC 3339 timestamps or plain dates. A plain date used as an upper bound
/// covers the whole day.
fn parse_time(key: &str, value: &str, upper: bool) -> Result<DateTime<Utc>, QueryError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| invalid(key, value, "an RFC 3339 timestamp or YYYY-MM-DD date"))?;
    let time = if upper {
        NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| invalid(key, value, "a valid date"))?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resolve, RawAddress};

    fn property(beds: f64, price: f64) -> Property {
        let resolved = resolve(&RawAddress::line("123 Main St, Seattle, WA 98101")).unwrap();
        Property {
            id: resolved.id,
            address: resolved.address,
            property_type: PropertyType::SingleFamily,
            living_area_sqft: Some(1_800.0),
            lot_area_sqft: None,
            bedrooms: Some(beds),
            bathrooms: Some(2.5),
            year_built: Some(1990),
            status: PropertyStatus::Active,
            price: Some(price),
            last_updated: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            sources: vec![],
        }
    }

    #[test]
    fn parses_ranges_lists_and_paging() {
        let query = SearchQuery::from_pairs([
            ("type", "single-family,condo"),
            ("min_beds", "3"),
            ("max_price", "600000"),
            ("city", "  Seattle "),
            ("limit", "10"),
        ])
        .unwrap();
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.predicates.len(), 4);
        assert!(query.predicates.contains(&Predicate::City("Seattle".into())));

        let history = DerivedHistory::default();
        assert!(query.matches(&property(3.0, 550_000.0), &history));
        assert!(!query.matches(&property(2.0, 550_000.0), &history));
        assert!(!query.matches(&property(4.0, 650_000.0), &history));
    }

    #[test]
    fn invalid_property_type_is_a_query_error() {
        let err = SearchQuery::from_pairs([("type", "castle")]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidValue { ref key, .. } if key == "type"));
    }

    #[test]
    fn rejects_unknown_keys_inverted_ranges_and_bad_dates() {
        assert_eq!(
            SearchQuery::from_pairs([("colour", "red")]).unwrap_err(),
            QueryError::UnknownKey("colour".into())
        );
        assert!(matches!(
            SearchQuery::from_pairs([("min_beds", "4"), ("max_beds", "2")]).unwrap_err(),
            QueryError::InvertedRange { field: "beds", .. }
        ));
        assert!(SearchQuery::from_pairs([("sold_from", "last tuesday")]).is_err());
        assert!(SearchQuery::from_pairs([("min_price", "-5")]).is_err());
        assert!(SearchQuery::from_pairs([("limit", "0")]).is_err());
    }

    #[test]
    fn plain_date_upper_bound_covers_the_whole_day() {
        let query = SearchQuery::from_pairs([("sold_from", "2024-01-10"), ("sold_to", "2024-01-10")]).unwrap();
        let Predicate::SoldWithin(interval) = &query.predicates[0] else {
            panic!("expected a sold interval");
        };
        let evening = Utc.with_ymd_and_hms(2024, 1, 10, 18, 30, 0).single().unwrap();
        let history = DerivedHistory {
            sold_at: vec![evening],
            ..Default::default()
        };
        assert!(history.sold_within(interval.from, interval.to));
    }

    #[test]
    fn city_matching_ignores_case_and_missing_values_fail_bounded_ranges() {
        let query = SearchQuery::new()
            .with(Predicate::City("SEATTLE".into()))
            .with(Predicate::LotArea(NumericRange { min: Some(1.0), max: None }));
        assert!(!query.matches(&property(3.0, 1.0), &DerivedHistory::default()));
        let city_only = SearchQuery::new().with(Predicate::City("SEATTLE".into()));
        assert!(city_only.matches(&property(3.0, 1.0), &DerivedHistory::default()));
    }
}
