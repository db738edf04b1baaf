//! Raw record intake: per-source adapters that validate crawled records and
//! normalize them into source-tagged snapshots.

pub mod units;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use hometrack_core::{
    EventPayload, HistoryEventType, PropertyFacts, PropertyStatus, PropertyType, RawAddress,
    ReportedEvent, SourceSnapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub use units::{parse_area, parse_price, AreaUnit, RawQuantity};

pub const CRATE_NAME: &str = "hometrack-adapters";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntakeError {
    #[error("{source_id}: {field} {reason}")]
    Validation {
        source_id: String,
        field: &'static str,
        reason: String,
    },
    #[error("cannot interpret {field} value {value:?}")]
    Unit { field: &'static str, value: String },
}

impl IntakeError {
    pub fn kind(&self) -> &'static str {
        match self {
            IntakeError::Validation { .. } => "validation",
            IntakeError::Unit { .. } => "unit",
        }
    }

    pub fn validation(source_id: &str, field: &'static str, reason: impl Into<String>) -> Self {
        IntakeError::Validation {
            source_id: source_id.to_string(),
            field,
            reason: reason.into(),
        }
    }
}

/// Address as crawled: either one free-text line or separate fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAddressInput {
    Line(String),
    Fields(RawAddress),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHistoryEntry {
    pub date: String,
    pub description: String,
    #[serde(default)]
    pub price: Option<RawQuantity>,
    /// Target status for explicit status-change entries.
    #[serde(default)]
    pub status: Option<String>,
}

/// One listing as a crawler emitted it. Field names follow the crawler's
/// camelCase output; common spellings from other crawlers are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListingRecord {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "redfinId", alias = "zpid")]
    pub listing_id: Option<JsonValue>,
    #[serde(default)]
    pub scraped_at: Option<String>,
    #[serde(default)]
    pub address: Option<RawAddressInput>,
    #[serde(default, alias = "livingArea")]
    pub area: Option<RawQuantity>,
    #[serde(default, alias = "lotSize")]
    pub lot_area: Option<RawQuantity>,
    #[serde(default, alias = "homeType")]
    pub property_type: Option<String>,
    #[serde(default, alias = "numberOfBedroom", alias = "beds")]
    pub bedrooms: Option<f64>,
    #[serde(default, alias = "numberOfBathroom", alias = "baths")]
    pub bathrooms: Option<f64>,
    #[serde(default)]
    pub year_built: Option<i32>,
    #[serde(default, alias = "homeStatus")]
    pub status: Option<String>,
    #[serde(default)]
    pub price: Option<RawQuantity>,
    #[serde(default, alias = "priceHistory")]
    pub history: Vec<RawHistoryEntry>,
}

/// One queue message: a batch of raw records from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    pub source_id: String,
    #[serde(default)]
    pub crawled_at: Option<DateTime<Utc>>,
    pub records: Vec<JsonValue>,
}

/// A history label after vocabulary mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLabel {
    Event(HistoryEventType),
    /// Recognised but outside what is tracked (rentals, for example).
    Ignored,
}

/// Label tables for one source. Matching is case-insensitive; event labels
/// match by prefix, first entry wins.
#[derive(Debug)]
pub struct Vocabulary {
    pub statuses: &'static [(&'static str, PropertyStatus)],
    pub property_types: &'static [(&'static str, PropertyType)],
    pub events: &'static [(&'static str, EventLabel)],
    pub date_formats: &'static [&'static str],
    pub default_area_unit: Option<AreaUnit>,
}

impl Vocabulary {
    fn status(&self, label: &str) -> Option<PropertyStatus> {
        let label = label.trim().to_ascii_lowercase();
        self.statuses
            .iter()
            .find(|(k, _)| *k == label)
            .map(|(_, v)| *v)
            .or_else(|| label.parse().ok())
    }

    fn property_type(&self, label: &str) -> PropertyType {
        let label = label.trim().to_ascii_lowercase();
        self.property_types
            .iter()
            .find(|(k, _)| label.starts_with(k))
            .map(|(_, v)| *v)
            .or_else(|| label.parse().ok())
            .unwrap_or(PropertyType::Other)
    }

    fn event(&self, label: &str) -> Option<EventLabel> {
        let label = label.trim().to_ascii_lowercase();
        self.events
            .iter()
            .find(|(k, _)| label.starts_with(k))
            .map(|(_, v)| *v)
            .or_else(|| label.parse().ok().map(EventLabel::Event))
    }
}

use EventLabel::{Event, Ignored};

pub static REDFIN_VOCABULARY: Vocabulary = Vocabulary {
    statuses: &[
        ("active", PropertyStatus::Active),
        ("for sale", PropertyStatus::Active),
        ("coming soon", PropertyStatus::Active),
        ("pending", PropertyStatus::Pending),
        ("contingent", PropertyStatus::Pending),
        ("sold", PropertyStatus::Sold),
        ("off market", PropertyStatus::OffMarket),
        ("delisted", PropertyStatus::OffMarket),
    ],
    property_types: &[
        ("townhome", PropertyType::Townhouse),
        ("townhouse", PropertyType::Townhouse),
        ("condo", PropertyType::Condo),
        ("single-family", PropertyType::SingleFamily),
        ("single family", PropertyType::SingleFamily),
        ("multi-family", PropertyType::MultiFamily),
        ("vacant land", PropertyType::Land),
        ("manufactured", PropertyType::Other),
    ],
    events: &[
        ("listed for rent", Ignored),
        ("rental removed", Ignored),
        ("listed", Event(HistoryEventType::Listed)),
        ("relisted", Event(HistoryEventType::Listed)),
        ("sold", Event(HistoryEventType::Sold)),
        ("price changed", Event(HistoryEventType::PriceChange)),
        ("pending", Event(HistoryEventType::Pending)),
        ("contingent", Event(HistoryEventType::Pending)),
        ("delisted", Event(HistoryEventType::Delisted)),
        ("listing removed", Event(HistoryEventType::Delisted)),
    ],
    date_formats: &["%b %d, %Y"],
    default_area_unit: None,
};

pub static ZILLOW_VOCABULARY: Vocabulary = Vocabulary {
    statuses: &[
        ("for_sale", PropertyStatus::Active),
        ("coming_soon", PropertyStatus::Active),
        ("pending", PropertyStatus::Pending),
        ("under_contract", PropertyStatus::Pending),
        ("sold", PropertyStatus::Sold),
        ("recently_sold", PropertyStatus::Sold),
        ("off_market", PropertyStatus::OffMarket),
    ],
    property_types: &[
        ("single_family", PropertyType::SingleFamily),
        ("condo", PropertyType::Condo),
        ("apartment", PropertyType::Condo),
        ("townhouse", PropertyType::Townhouse),
        ("multi_family", PropertyType::MultiFamily),
        ("lot", PropertyType::Land),
        ("manufactured", PropertyType::Other),
    ],
    events: &[
        ("listed for rent", Ignored),
        ("listing removed (rental)", Ignored),
        ("listed for sale", Event(HistoryEventType::Listed)),
        ("price change", Event(HistoryEventType::PriceChange)),
        ("pending sale", Event(HistoryEventType::Pending)),
        ("sold", Event(HistoryEventType::Sold)),
        ("listing removed", Event(HistoryEventType::Delisted)),
    ],
    date_formats: &["%m/%d/%Y"],
    default_area_unit: Some(AreaUnit::SquareFeet),
};

/// Sources that already speak the canonical vocabulary.
pub static CANONICAL_VOCABULARY: Vocabulary = Vocabulary {
    statuses: &[],
    property_types: &[],
    events: &[],
    date_formats: &[],
    default_area_unit: None,
};

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn vocabulary(&self) -> &Vocabulary;

    /// Validates one raw record and turns it into a snapshot. `crawled_at` is
    /// the message-level crawl time, used when the record carries none.
    fn normalize(
        &self,
        record: &RawListingRecord,
        crawled_at: Option<DateTime<Utc>>,
    ) -> Result<SourceSnapshot, IntakeError> {
        normalize_record(self.source_id(), self.vocabulary(), record, crawled_at)
    }
}

#[derive(Debug, Clone)]
pub struct VocabularyAdapter {
    source_id: String,
    vocabulary: &'static Vocabulary,
}

impl VocabularyAdapter {
    pub fn new(source_id: impl Into<String>, vocabulary: &'static Vocabulary) -> Self {
        Self {
            source_id: source_id.into(),
            vocabulary,
        }
    }
}

impl SourceAdapter for VocabularyAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn vocabulary(&self) -> &Vocabulary {
        self.vocabulary
    }
}

pub fn redfin_adapter() -> impl SourceAdapter {
    VocabularyAdapter::new("redfin", &REDFIN_VOCABULARY)
}

pub fn zillow_adapter() -> impl SourceAdapter {
    VocabularyAdapter::new("zillow", &ZILLOW_VOCABULARY)
}

/// Adapter for a source id. Unknown sources get the canonical vocabulary;
/// whether a source is accepted at all is decided by the source registry.
pub fn adapter_for_source(source_id: &str) -> Box<dyn SourceAdapter> {
    match source_id {
        "redfin" => Box::new(redfin_adapter()),
        "zillow" => Box::new(zillow_adapter()),
        other => Box::new(VocabularyAdapter::new(other, &CANONICAL_VOCABULARY)),
    }
}

/// Decodes one queued record, then normalizes it.
pub fn normalize_value(
    adapter: &dyn SourceAdapter,
    value: &JsonValue,
    crawled_at: Option<DateTime<Utc>>,
) -> Result<SourceSnapshot, IntakeError> {
    let record: RawListingRecord = serde_json::from_value(value.clone())
        .map_err(|e| IntakeError::validation(adapter.source_id(), "record", e.to_string()))?;
    adapter.normalize(&record, crawled_at)
}

pub fn normalize_record(
    source_id: &str,
    vocabulary: &Vocabulary,
    record: &RawListingRecord,
    crawled_at: Option<DateTime<Utc>>,
) -> Result<SourceSnapshot, IntakeError> {
    let address = match &record.address {
        Some(RawAddressInput::Line(line)) if !line.trim().is_empty() => RawAddress::line(line.trim()),
        Some(RawAddressInput::Fields(fields)) if !fields.line.trim().is_empty() => fields.clone(),
        _ => return Err(IntakeError::validation(source_id, "address", "is missing")),
    };

    let crawled_at = match record.scraped_at.as_deref() {
        Some(text) => parse_timestamp(source_id, "scrapedAt", text, &[])?,
        None => crawled_at
            .ok_or_else(|| IntakeError::validation(source_id, "scrapedAt", "is missing"))?,
    };

    let status = record
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|label| {
            vocabulary.status(label).ok_or_else(|| {
                IntakeError::validation(source_id, "status", format!("has unknown value {label:?}"))
            })
        })
        .transpose()?;
    let price = record
        .price
        .as_ref()
        .map(|p| parse_price("price", p))
        .transpose()?;
    let living_area_sqft = record
        .area
        .as_ref()
        .map(|a| parse_area("area", a, vocabulary.default_area_unit))
        .transpose()?;

    if status.is_none() && price.is_none() && living_area_sqft.is_none() {
        return Err(IntakeError::validation(
            source_id,
            "price/status/area",
            "are all missing; at least one is required",
        ));
    }

    let lot_area_sqft = record
        .lot_area
        .as_ref()
        .map(|a| parse_area("lotArea", a, vocabulary.default_area_unit))
        .transpose()?;
    let bedrooms = count("bedrooms", record.bedrooms)?;
    let bathrooms = count("bathrooms", record.bathrooms)?;
    if let Some(year) = record.year_built {
        if !(1600..=2100).contains(&year) {
            return Err(IntakeError::Unit {
                field: "yearBuilt",
                value: year.to_string(),
            });
        }
    }

    let facts = PropertyFacts {
        property_type: record.property_type.as_deref().map(|t| vocabulary.property_type(t)),
        living_area_sqft,
        lot_area_sqft,
        bedrooms,
        bathrooms,
        year_built: record.year_built,
    };

    let events = normalize_history(source_id, vocabulary, &record.history)?;

    Ok(SourceSnapshot {
        source_id: source_id.to_string(),
        source_url: record.url.clone(),
        crawled_at,
        address,
        facts,
        status,
        price,
        events,
    })
}

fn count(field: &'static str, value: Option<f64>) -> Result<Option<f64>, IntakeError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(IntakeError::Unit {
            field,
            value: v.to_string(),
        }),
        other => Ok(other),
    }
}

fn normalize_history(
    source_id: &str,
    vocabulary: &Vocabulary,
    entries: &[RawHistoryEntry],
) -> Result<Vec<ReportedEvent>, IntakeError> {
    let mut dated = Vec::with_capacity(entries.len());
    for entry in entries {
        let event_at = parse_timestamp(source_id, "history.date", &entry.date, vocabulary.date_formats)?;
        let label = vocabulary.event(&entry.description).ok_or_else(|| {
            IntakeError::validation(
                source_id,
                "history.description",
                format!("has unknown event label {:?}", entry.description),
            )
        })?;
        let EventLabel::Event(event_type) = label else {
            continue;
        };
        let price = entry
            .price
            .as_ref()
            .map(|p| parse_price("history.price", p))
            .transpose()?;
        dated.push((event_at, event_type, price, entry));
    }
    dated.sort_by_key(|(at, ..)| *at);

    let mut events = Vec::with_capacity(dated.len());
    let mut asking: Option<f64> = None;
    for (event_at, event_type, price, entry) in dated {
        let payload = match event_type {
            HistoryEventType::Listed => EventPayload::Listed { price },
            HistoryEventType::Sold => EventPayload::Sold { price },
            HistoryEventType::Pending => EventPayload::Pending,
            HistoryEventType::Delisted => EventPayload::Delisted,
            HistoryEventType::PriceChange => match price {
                Some(new_price) => EventPayload::PriceChange {
                    old_price: asking,
                    new_price,
                },
                None => {
                    warn!(source_id, date = %entry.date, "price change without a price; entry skipped");
                    continue;
                }
            },
            HistoryEventType::StatusChange => {
                let to = entry
                    .status
                    .as_deref()
                    .and_then(|s| vocabulary.status(s))
                    .ok_or_else(|| {
                        IntakeError::validation(source_id, "history.status", "is required for status changes")
                    })?;
                EventPayload::StatusChange {
                    from: PropertyStatus::Unknown,
                    to,
                }
            }
            HistoryEventType::DataCorrection => {
                return Err(IntakeError::validation(
                    source_id,
                    "history.description",
                    "data corrections cannot be reported by sources",
                ))
            }
        };
        if matches!(event_type, HistoryEventType::Listed | HistoryEventType::PriceChange) {
            asking = payload.price().or(asking);
        }
        events.push(ReportedEvent { event_at, payload });
    }
    Ok(events)
}

/// RFC 3339, `YYYY-MM-DD`, naive `YYYY-MM-DDTHH:MM:SS`, or one of the source's date formats.
/// Naive values are taken as UTC.
pub fn parse_timestamp(
    source_id: &str,
    field: &'static str,
    text: &str,
    formats: &[&str],
) -> Result<DateTime<Utc>, IntakeError> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    for format in std::iter::once(&"%Y-%m-%d").chain(formats.iter()) {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(Utc.from_utc_datetime(&naive));
            }
        }
    }
    Err(IntakeError::validation(
        source_id,
        field,
        format!("has unparseable timestamp {text:?}"),
    ))
}

/// A queue line that does not decode as a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {error}")]
pub struct MalformedLine {
    /// 1-based line number in the input.
    pub line: usize,
    pub raw: String,
    pub error: String,
}

impl MalformedLine {
    /// The `source_id` the line names, when it is JSON enough to tell.
    pub fn source_hint(&self) -> Option<String> {
        serde_json::from_str::<JsonValue>(&self.raw)
            .ok()?
            .get("source_id")?
            .as_str()
            .map(str::to_string)
    }
}

/// Decoded messages plus every line that failed to decode. One bad line
/// never costs the rest of the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatch {
    pub messages: Vec<IngestMessage>,
    pub malformed: Vec<MalformedLine>,
}

impl MessageBatch {
    pub fn extend(&mut self, other: MessageBatch) {
        self.messages.extend(other.messages);
        self.malformed.extend(other.malformed);
    }
}

/// Reads a JSON-lines file of queue messages. Blank lines are skipped.
pub fn load_messages(path: impl AsRef<Path>) -> Result<MessageBatch> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let batch = parse_messages(&text);
    for bad in &batch.malformed {
        warn!(path = %path.display(), line = bad.line, error = %bad.error, "skipping malformed queue line");
    }
    Ok(batch)
}

pub fn parse_messages(text: &str) -> MessageBatch {
    let mut batch = MessageBatch::default();
    for (no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IngestMessage>(line) {
            Ok(message) => batch.messages.push(message),
            Err(err) => batch.malformed.push(MalformedLine {
                line: no + 1,
                raw: line.to_string(),
                error: err.to_string(),
            }),
        }
    }
    batch
}
