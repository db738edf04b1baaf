//! Core domain model for HomeTrack: properties, immutable history events,
//! conflict records and the source snapshots that feed them.

pub mod address;
pub mod history;
pub mod query;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use address::{resolve, Address, IdentityError, RawAddress, ResolvedAddress};
pub use history::{CurrentState, DerivedHistory, HistoryLog};
pub use query::{NumericRange, Predicate, QueryError, SearchQuery, TimeInterval};

pub const CRATE_NAME: &str = "hometrack-core";

const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a55_4b7e_9d1a_53c4_0be2_71a1);
const CONFLICT_NAMESPACE: Uuid = Uuid::from_u128(0x0d7e_94b2_11c3_4f08_a6f2_c58e_7730_19d4);

/// Stable identifier of a physical property: SHA-256 over the canonical address string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(String);

impl PropertyId {
    pub fn from_canonical(canonical: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Accepts an identifier previously produced by [`PropertyId::from_canonical`].
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(trimmed.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub Uuid);

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! kebab_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| ParseEnumError { kind: $kind, value: s.to_string() })
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyType {
    SingleFamily,
    Condo,
    Townhouse,
    MultiFamily,
    Land,
    #[default]
    Other,
}

kebab_enum!(PropertyType, "property type", {
    SingleFamily => "single-family",
    Condo => "condo",
    Townhouse => "townhouse",
    MultiFamily => "multi-family",
    Land => "land",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyStatus {
    Active,
    Pending,
    Sold,
    OffMarket,
    #[default]
    Unknown,
}

kebab_enum!(PropertyStatus, "property status", {
    Active => "active",
    Pending => "pending",
    Sold => "sold",
    OffMarket => "off-market",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryEventType {
    Listed,
    PriceChange,
    StatusChange,
    Pending,
    Sold,
    Delisted,
    DataCorrection,
}

kebab_enum!(HistoryEventType, "history event type", {
    Listed => "listed",
    PriceChange => "price-change",
    StatusChange => "status-change",
    Pending => "pending",
    Sold => "sold",
    Delisted => "delisted",
    DataCorrection => "data-correction",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    MissingHistory,
    ValueMismatch,
    IdentityCollision,
}

kebab_enum!(ConflictKind, "conflict kind", {
    MissingHistory => "missing-history",
    ValueMismatch => "value-mismatch",
    IdentityCollision => "identity-collision",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStatus {
    #[default]
    Open,
    AutoResolved,
    ManuallyResolved,
}

kebab_enum!(ConflictStatus, "conflict status", {
    Open => "open",
    AutoResolved => "auto-resolved",
    ManuallyResolved => "manually-resolved",
});

/// Descriptive facts about a property. Every field is optional because
/// sources routinely omit fields on inactive listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyFacts {
    pub property_type: Option<PropertyType>,
    pub living_area_sqft: Option<f64>,
    pub lot_area_sqft: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub year_built: Option<i32>,
}

impl PropertyFacts {
    /// Fields present in `newer` replace the ones in `self`; absent fields are kept.
    pub fn overlay(&self, newer: &PropertyFacts) -> PropertyFacts {
        PropertyFacts {
            property_type: newer.property_type.or(self.property_type),
            living_area_sqft: newer.living_area_sqft.or(self.living_area_sqft),
            lot_area_sqft: newer.lot_area_sqft.or(self.lot_area_sqft),
            bedrooms: newer.bedrooms.or(self.bedrooms),
            bathrooms: newer.bathrooms.or(self.bathrooms),
            year_built: newer.year_built.or(self.year_built),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == PropertyFacts::default()
    }
}

/// What a correction event does to the event (or fact set) it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Revision {
    /// The referenced event's price was restated by its source.
    Price { price: Option<f64> },
    /// The referenced event was withdrawn by its source.
    Retracted,
    /// New descriptive facts as observed by the source.
    Facts { facts: PropertyFacts },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub corrects: Option<EventId>,
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "kebab-case")]
pub enum EventPayload {
    Listed { price: Option<f64> },
    PriceChange { old_price: Option<f64>, new_price: f64 },
    StatusChange { from: PropertyStatus, to: PropertyStatus },
    Pending,
    Sold { price: Option<f64> },
    Delisted,
    DataCorrection(Correction),
}

impl EventPayload {
    pub fn event_type(&self) -> HistoryEventType {
        match self {
            EventPayload::Listed { .. } => HistoryEventType::Listed,
            EventPayload::PriceChange { .. } => HistoryEventType::PriceChange,
            EventPayload::StatusChange { .. } => HistoryEventType::StatusChange,
            EventPayload::Pending => HistoryEventType::Pending,
            EventPayload::Sold { .. } => HistoryEventType::Sold,
            EventPayload::Delisted => HistoryEventType::Delisted,
            EventPayload::DataCorrection(_) => HistoryEventType::DataCorrection,
        }
    }

    /// The value two sources can disagree about for the same event, if any.
    /// `None` means the event carries nothing comparable (or the source left it blank).
    pub fn comparable_value(&self) -> Option<serde_json::Value> {
        match self {
            EventPayload::Listed { price } | EventPayload::Sold { price } => {
                price.map(serde_json::Value::from)
            }
            EventPayload::PriceChange { new_price, .. } => Some(serde_json::Value::from(*new_price)),
            EventPayload::StatusChange { to, .. } => Some(serde_json::Value::from(to.as_str())),
            EventPayload::Pending | EventPayload::Delisted | EventPayload::DataCorrection(_) => None,
        }
    }

    /// Whether folding the event sets the property's status.
    pub fn sets_status(&self) -> bool {
        !matches!(self, EventPayload::PriceChange { .. } | EventPayload::DataCorrection(_))
    }

    /// Price carried by the event, used for asking-price and sold-price derivations.
    pub fn price(&self) -> Option<f64> {
        match self {
            EventPayload::Listed { price } | EventPayload::Sold { price } => *price,
            EventPayload::PriceChange { new_price, .. } => Some(*new_price),
            _ => None,
        }
    }

    pub fn with_price(&self, price: Option<f64>) -> EventPayload {
        match self {
            EventPayload::Listed { .. } => EventPayload::Listed { price },
            EventPayload::Sold { .. } => EventPayload::Sold { price },
            EventPayload::PriceChange { old_price, new_price } => EventPayload::PriceChange {
                old_price: *old_price,
                new_price: price.unwrap_or(*new_price),
            },
            other => other.clone(),
        }
    }
}

/// Key under which the same real-world event is recognised across snapshots and sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub event_type: HistoryEventType,
    pub event_at: DateTime<Utc>,
}

/// One immutable fact about a property's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: EventId,
    pub event_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub source_id: String,
    pub payload: EventPayload,
}

impl HistoryEvent {
    /// Builds an event whose id is derived from its content, so replays produce the same id.
    pub fn new(
        property_id: &PropertyId,
        source_id: &str,
        event_at: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        let body = serde_json::to_string(&payload).unwrap_or_default();
        let seed = format!(
            "{}|{}|{}|{}",
            property_id,
            source_id,
            event_at.timestamp_micros(),
            body
        );
        Self {
            id: EventId(Uuid::new_v5(&EVENT_NAMESPACE, seed.as_bytes())),
            event_at,
            ingested_at,
            source_id: source_id.to_string(),
            payload,
        }
    }

    pub fn event_type(&self) -> HistoryEventType {
        self.payload.event_type()
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            event_type: self.event_type(),
            event_at: self.event_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedValue {
    pub source_id: String,
    pub event_id: Option<EventId>,
    pub value: serde_json::Value,
}

/// A recorded disagreement between sources. Status changes are appended as new
/// records that point at the original through `resolves`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub property_id: PropertyId,
    pub kind: ConflictKind,
    pub subject: Option<EventKey>,
    pub sources: Vec<String>,
    pub values: Vec<ReportedValue>,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    pub resolves: Option<ConflictId>,
    pub note: Option<String>,
}

impl ConflictRecord {
    pub fn open(
        property_id: &PropertyId,
        kind: ConflictKind,
        subject: Option<EventKey>,
        mut sources: Vec<String>,
        values: Vec<ReportedValue>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        sources.sort();
        sources.dedup();
        let fingerprint = conflict_fingerprint(kind, subject.as_ref(), &sources, &values);
        let seed = format!("{property_id}|{fingerprint}");
        Self {
            id: ConflictId(Uuid::new_v5(&CONFLICT_NAMESPACE, seed.as_bytes())),
            property_id: property_id.clone(),
            kind,
            subject,
            sources,
            values,
            detected_at,
            status: ConflictStatus::Open,
            resolves: None,
            note: None,
        }
    }

    /// A follow-up record that moves `self` to `status`.
    pub fn resolution(
        &self,
        status: ConflictStatus,
        note: Option<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let seed = format!(
            "{}|resolution|{}|{}",
            self.id,
            status,
            detected_at.timestamp_micros()
        );
        Self {
            id: ConflictId(Uuid::new_v5(&CONFLICT_NAMESPACE, seed.as_bytes())),
            property_id: self.property_id.clone(),
            kind: self.kind,
            subject: self.subject,
            sources: self.sources.clone(),
            values: self.values.clone(),
            detected_at,
            status,
            resolves: Some(self.id),
            note,
        }
    }

    pub fn is_resolution(&self) -> bool {
        self.resolves.is_some()
    }
}

fn conflict_fingerprint(
    kind: ConflictKind,
    subject: Option<&EventKey>,
    sources: &[String],
    values: &[ReportedValue],
) -> String {
    let subject = subject
        .map(|s| format!("{}@{}", s.event_type, s.event_at.timestamp_micros()))
        .unwrap_or_default();
    let values = values
        .iter()
        .map(|v| format!("{}={}", v.source_id, v.value))
        .collect::<Vec<_>>()
        .join(";");
    format!("{kind}|{subject}|{}|{values}", sources.join(","))
}

/// Effective status of every original conflict record in `records`: the status of
/// its latest resolution, or open.
pub fn effective_conflicts(records: &[ConflictRecord]) -> Vec<(ConflictRecord, ConflictStatus)> {
    records
        .iter()
        .filter(|r| !r.is_resolution())
        .map(|original| {
            let status = records
                .iter()
                .filter(|r| r.resolves == Some(original.id))
                .max_by_key(|r| r.detected_at)
                .map(|r| r.status)
                .unwrap_or(ConflictStatus::Open);
            (original.clone(), status)
        })
        .collect()
}

/// One source's involvement with a property, derived from the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub source_id: String,
    pub first_ingested_at: DateTime<Utc>,
    pub last_ingested_at: DateTime<Utc>,
    pub event_count: usize,
}

/// Canonical current-state snapshot. Replaced wholesale on every merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub address: Address,
    pub property_type: PropertyType,
    pub living_area_sqft: Option<f64>,
    pub lot_area_sqft: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub year_built: Option<i32>,
    pub status: PropertyStatus,
    pub price: Option<f64>,
    pub last_updated: DateTime<Utc>,
    pub sources: Vec<DataSource>,
}

/// An event as reported by a source, before it is stamped with ids and ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedEvent {
    pub event_at: DateTime<Utc>,
    pub payload: EventPayload,
}

/// One source's view of a property at one crawl instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source_id: String,
    pub source_url: Option<String>,
    pub crawled_at: DateTime<Utc>,
    pub address: RawAddress,
    pub facts: PropertyFacts,
    pub status: Option<PropertyStatus>,
    pub price: Option<f64>,
    pub events: Vec<ReportedEvent>,
}
