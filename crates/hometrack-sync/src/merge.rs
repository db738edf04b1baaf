//! The history merger: folds one source snapshot into a property's existing
//! history without touching anything already recorded.

use chrono::{DateTime, Utc};
use hometrack_core::{
    ConflictKind, ConflictRecord, Correction, CurrentState, EventPayload, HistoryEvent,
    HistoryLog, Property, PropertyId, ReportedValue, ResolvedAddress, Revision, SourceSnapshot,
};
use hometrack_storage::{CommitBatch, PropertyRecord};
use thiserror::Error;
use tracing::{debug, error};

use crate::conflicts::{self, ConflictCheck};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("snapshot resolved to {found} but was merged into {expected}")]
    WrongProperty { expected: PropertyId, found: PropertyId },
    #[error("{source_id} reported a {event_type} event at {event_at}, after its crawl at {crawled_at}")]
    EventAfterCrawl {
        source_id: String,
        event_type: String,
        event_at: DateTime<Utc>,
        crawled_at: DateTime<Utc>,
    },
    #[error("{source_id} reported a data correction; sources report observations only")]
    SourceCorrection { source_id: String },
    #[error("snapshot from {source_id} carries nothing to record for new property {property_id}")]
    NothingToRecord { property_id: PropertyId, source_id: String },
}

impl MergeError {
    pub fn kind(&self) -> &'static str {
        match self {
            MergeError::WrongProperty { .. } => "wrong-property",
            MergeError::EventAfterCrawl { .. } => "event-after-crawl",
            MergeError::SourceCorrection { .. } => "source-correction",
            MergeError::NothingToRecord { .. } => "nothing-to-record",
        }
    }
}

/// Everything one merge produces. `history` is the full updated log; the
/// new events are already placed in it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub property: Property,
    pub history: HistoryLog,
    pub new_events: Vec<HistoryEvent>,
    pub new_conflicts: Vec<ConflictRecord>,
}

impl MergeOutcome {
    /// True when the snapshot added nothing; committing would only bump the version.
    pub fn is_noop(&self) -> bool {
        self.new_events.is_empty() && self.new_conflicts.is_empty()
    }

    pub fn into_batch(self, expected_version: u64) -> CommitBatch {
        CommitBatch {
            property_id: self.property.id.clone(),
            expected_version,
            property: self.property,
            new_events: self.new_events,
            new_conflicts: self.new_conflicts,
        }
    }
}

/// Merges `snapshot` into `existing` (absent for a property not seen before).
///
/// Reported events the source has not recorded before are added; a restated
/// value for an event it did record becomes a price correction. Facts, status
/// and price the snapshot shows but the source's timeline does not yet imply
/// become a facts correction, a status change and a price change at the crawl
/// instant. Cross-source conflicts are detected on the result, and the
/// property is re-projected from the whole log.
pub fn merge(
    existing: Option<&PropertyRecord>,
    snapshot: &SourceSnapshot,
    resolved: &ResolvedAddress,
    ingested_at: DateTime<Utc>,
) -> Result<MergeOutcome, MergeError> {
    let id = &resolved.id;
    if let Some(record) = existing {
        if record.property.id != *id {
            return Err(MergeError::WrongProperty {
                expected: record.property.id.clone(),
                found: id.clone(),
            });
        }
    }
    validate_events(snapshot)?;

    let source = snapshot.source_id.as_str();
    let crawled_at = snapshot.crawled_at;
    let mut history = existing.map(|r| r.history.clone()).unwrap_or_default();
    let mut new_events = Vec::new();
    let mut push = |history: &mut HistoryLog, event: HistoryEvent| {
        if history.insert(event.clone()).is_some() {
            new_events.push(event);
        }
    };

    // Reported events, matched on type, timestamp and source.
    let effective = history.effective_events();
    for reported in &snapshot.events {
        let key = (reported.payload.event_type(), reported.event_at);
        let stored = history
            .for_source(source)
            .filter(|e| (e.event_type(), e.event_at) == key && !history.is_retracted(e.id))
            .last()
            .cloned();
        match stored {
            None => push(
                &mut history,
                HistoryEvent::new(id, source, reported.event_at, ingested_at, reported.payload.clone()),
            ),
            Some(stored) => {
                let current = effective
                    .iter()
                    .find(|e| e.id == stored.id)
                    .map(|e| e.payload.price())
                    .unwrap_or_else(|| stored.payload.price());
                let restated = reported.payload.price();
                if restated.is_some() && restated != current {
                    debug!(%id, source, event_id = %stored.id, "source restated an event price");
                    push(
                        &mut history,
                        correction(id, source, crawled_at, ingested_at, Some(stored.id), Revision::Price { price: restated }),
                    );
                }
            }
        }
    }

    // Facts, compared with what this source said before.
    let (previous_facts, previous_facts_event) = history.source_facts(source);
    let facts = previous_facts.overlay(&snapshot.facts);
    if facts != previous_facts {
        push(
            &mut history,
            correction(id, source, crawled_at, ingested_at, previous_facts_event, Revision::Facts { facts }),
        );
    }

    // Current status and price, compared with the source's own timeline at crawl time.
    let state = source_state_at(&history, source, crawled_at);
    if let Some(status) = snapshot.status {
        if status != state.status {
            push(
                &mut history,
                HistoryEvent::new(
                    id,
                    source,
                    crawled_at,
                    ingested_at,
                    EventPayload::StatusChange { from: state.status, to: status },
                ),
            );
        }
    }
    if let Some(price) = snapshot.price {
        if Some(price) != state.price {
            push(
                &mut history,
                HistoryEvent::new(
                    id,
                    source,
                    crawled_at,
                    ingested_at,
                    EventPayload::PriceChange { old_price: state.price, new_price: price },
                ),
            );
        }
    }

    if existing.is_none() && new_events.is_empty() {
        return Err(MergeError::NothingToRecord {
            property_id: id.clone(),
            source_id: source.to_string(),
        });
    }

    let recorded = existing.map(|r| r.conflicts.as_slice()).unwrap_or_default();
    let mut new_conflicts = Vec::new();
    if let Some(record) = existing {
        let stored = record.property.address.canonical();
        let incoming = resolved.address.canonical();
        if stored != incoming {
            error!(%id, stored = %stored, incoming = %incoming, source, "identifier collision between distinct addresses");
            let collision = ConflictRecord::open(
                id,
                ConflictKind::IdentityCollision,
                None,
                vec![source.to_string()],
                vec![ReportedValue {
                    source_id: source.to_string(),
                    event_id: None,
                    value: serde_json::Value::from(incoming),
                }],
                ingested_at,
            );
            if !record.has_conflict(collision.id) {
                new_conflicts.push(collision);
            }
        }
    }
    let check = ConflictCheck {
        property_id: id,
        detected_at: ingested_at,
    };
    new_conflicts.extend(conflicts::detect(&check, &history, recorded));

    let address = existing
        .map(|r| r.property.address.clone())
        .unwrap_or_else(|| resolved.address.clone());
    let property = match history.project(id, &address) {
        Some(property) => property,
        None => {
            return Err(MergeError::NothingToRecord {
                property_id: id.clone(),
                source_id: source.to_string(),
            })
        }
    };

    new_events.sort_by(hometrack_core::history::event_order);
    Ok(MergeOutcome {
        property,
        history,
        new_events,
        new_conflicts,
    })
}

fn validate_events(snapshot: &SourceSnapshot) -> Result<(), MergeError> {
    for event in &snapshot.events {
        if matches!(event.payload, EventPayload::DataCorrection(_)) {
            return Err(MergeError::SourceCorrection {
                source_id: snapshot.source_id.clone(),
            });
        }
        if event.event_at > snapshot.crawled_at {
            return Err(MergeError::EventAfterCrawl {
                source_id: snapshot.source_id.clone(),
                event_type: event.payload.event_type().to_string(),
                event_at: event.event_at,
                crawled_at: snapshot.crawled_at,
            });
        }
    }
    Ok(())
}

fn correction(
    id: &PropertyId,
    source: &str,
    at: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
    corrects: Option<hometrack_core::EventId>,
    revision: Revision,
) -> HistoryEvent {
    HistoryEvent::new(
        id,
        source,
        at,
        ingested_at,
        EventPayload::DataCorrection(Correction { corrects, revision }),
    )
}

/// The source's own view of the property as of `at`.
fn source_state_at(history: &HistoryLog, source: &str, at: DateTime<Utc>) -> CurrentState {
    let events: Vec<HistoryEvent> = history
        .effective_events()
        .into_iter()
        .filter(|e| e.source_id == source && e.event_at <= at)
        .collect();
    CurrentState::fold(&events)
}
